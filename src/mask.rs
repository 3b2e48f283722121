//! WebSocket frame masking
//!
//! Client-to-server frames carry a fresh 4-byte key drawn from the operating
//! system's CSPRNG; the payload is XORed with the key repeated over its length.

/// XOR `data` in place with the repeating 4-byte `mask`.
///
/// Masking and unmasking are the same operation.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    if data.is_empty() {
        return;
    }

    // Eight bytes per step; offsets stay aligned to the key period.
    let mask_u64 = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ mask_u64;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Generate a random mask key for an outbound frame.
#[inline]
pub fn generate_mask() -> [u8; 4] {
    let mut buf = [0u8; 4];
    getrandom::getrandom(&mut buf).expect("getrandom failed");
    buf
}
