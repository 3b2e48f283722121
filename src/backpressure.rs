//! Water-mark backpressure for the post-upgrade stream
//!
//! Outbound: once encoded frames waiting for the socket exceed the high water
//! mark, writers are parked until the buffer drains to the low water mark.
//!
//! Inbound needs no state here: the stream only reads from the socket when
//! its consumer polls and every decoded byte has been handed out, so a slow
//! consumer stops socket reads instead of growing a frame queue.

/// Hysteresis gate between two buffer levels
#[derive(Debug, Clone)]
pub struct Backpressure {
    high_water_mark: usize,
    low_water_mark: usize,
    paused: bool,
}

impl Backpressure {
    /// Create a gate; `low` is clamped to `high`
    pub fn new(high_water_mark: usize, low_water_mark: usize) -> Self {
        Self {
            high_water_mark,
            low_water_mark: low_water_mark.min(high_water_mark),
            paused: false,
        }
    }

    /// Record the current buffer level and return whether writers must wait.
    #[inline]
    pub fn observe(&mut self, buffered: usize) -> bool {
        if self.paused {
            if buffered <= self.low_water_mark {
                self.paused = false;
                tracing::trace!(buffered, "backpressure released");
            }
        } else if buffered > self.high_water_mark {
            self.paused = true;
            tracing::trace!(buffered, "backpressure engaged");
        }
        self.paused
    }

    /// Whether writers are currently parked
    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Level the buffer must drain to before writers resume
    #[inline]
    pub fn low_water_mark(&self) -> usize {
        self.low_water_mark
    }

    /// Level above which writers are parked
    #[inline]
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}
