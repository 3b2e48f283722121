//! Connection binding
//!
//! After either negotiator reports an upgrade, [`bind`] wraps the socket in
//! the backpressured frame codec and hands the resulting byte stream to the
//! external connection. The connection learns its channel is live through an
//! [`Activation`] latch instead of a reference back into the pipeline.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::Config;
use crate::codec::Role;
use crate::connection::Connection;
use crate::error::Result;
use crate::shutdown::Lifeline;
use crate::stream::{Channel, WsChannel, WsStream};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ActivationInner {
    fired: AtomicBool,
    notify: Notify,
    callback: Mutex<Option<Callback>>,
}

/// One-shot latch marking a channel active
///
/// Fires at most once. Clones share the latch.
#[derive(Clone, Default)]
pub struct Activation {
    inner: Arc<ActivationInner>,
}

impl Activation {
    /// Create an unfired latch
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` when the latch fires, or now if it already has.
    pub fn on_fire<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self
            .inner
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.inner.fired.load(Ordering::Acquire) {
            drop(slot);
            f();
        } else {
            *slot = Some(Box::new(f));
        }
    }

    /// Fire the latch; returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        let callback = {
            let mut slot = self
                .inner
                .callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.inner.fired.swap(true, Ordering::AcqRel) {
                return false;
            }
            slot.take()
        };

        if let Some(callback) = callback {
            callback();
        }
        self.inner.notify.notify_waiters();
        true
    }

    /// Whether the latch has fired
    #[inline]
    pub fn is_active(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Wait until the latch fires
    pub async fn activated(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_active() {
            return;
        }
        notified.await;
    }
}

impl fmt::Debug for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activation")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Splice the codec under `conn` and start its protocol stack.
///
/// `leftover` holds bytes the handshake read past the HTTP head. Inbound
/// streams carry the listener's `lifeline`; dialed streams pass `None`.
/// [`Connection::channel_active`] runs once, on the first data frame or when
/// `initialize_channel` returns, whichever comes first.
pub async fn bind<C>(
    conn: Arc<C>,
    channel: Channel,
    role: Role,
    leftover: Bytes,
    config: &Config,
    lifeline: Option<Lifeline>,
) -> Result<()>
where
    C: Connection,
{
    let activation = Activation::new();
    let notify = Arc::clone(&conn);
    activation.on_fire(move || notify.channel_active());

    let stream: WsChannel = WsStream::new(channel, role, config)
        .with_leftover(leftover)
        .with_activation(activation.clone())
        .with_lifeline(lifeline);
    tracing::trace!(?role, "frame codec installed");

    conn.initialize_channel(stream).await?;
    activation.fire();
    Ok(())
}
