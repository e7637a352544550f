//! Secondary-stream registration and send path
//!
//! The inbound side is a single replaceable consumer slot per connection. It
//! may be set or cleared from any task while the connection task is
//! delivering; updates are atomic swaps so none are lost, and a delivery that
//! already loaded the old consumer finishes against it.

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Receiver of inbound secondary-stream payloads
pub trait SecondaryConsumer: Send + Sync {
    fn on_secondary(&self, payload: Bytes);
}

impl<F> SecondaryConsumer for F
where
    F: Fn(Bytes) + Send + Sync,
{
    fn on_secondary(&self, payload: Bytes) {
        self(payload)
    }
}

/// A consumer as stored in a [`SecondarySlot`]. Keep the returned `Arc` to
/// clear the slot only if it still holds this registration.
pub struct RegisteredConsumer(Box<dyn SecondaryConsumer>);

impl fmt::Debug for RegisteredConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredConsumer").finish_non_exhaustive()
    }
}

#[derive(Clone, Default)]
pub struct SecondarySlot {
    inner: Arc<ArcSwapOption<RegisteredConsumer>>,
}

impl fmt::Debug for SecondarySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondarySlot")
            .field("registered", &self.is_registered())
            .finish()
    }
}

impl SecondarySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `consumer`, replacing any previous one
    pub fn set<C>(&self, consumer: C) -> Arc<RegisteredConsumer>
    where
        C: SecondaryConsumer + 'static,
    {
        let registered = Arc::new(RegisteredConsumer(Box::new(consumer)));
        self.inner.store(Some(registered.clone()));
        registered
    }

    /// Remove whatever consumer is installed
    pub fn clear(&self) -> Option<Arc<RegisteredConsumer>> {
        self.inner.swap(None)
    }

    /// Remove the consumer only if it is still `expected`
    pub fn clear_if(&self, expected: &Arc<RegisteredConsumer>) -> bool {
        let current = Some(expected.clone());
        let previous = self
            .inner
            .compare_and_swap(&current, None::<Arc<RegisteredConsumer>>);
        match &*previous {
            Some(prev) => Arc::ptr_eq(prev, expected),
            None => false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.inner.load().is_some()
    }

    /// Hand `payload` to the installed consumer. Without one the payload is
    /// dropped and `false` is returned.
    pub fn deliver(&self, payload: Bytes) -> bool {
        let guard = self.inner.load();
        match &*guard {
            Some(consumer) => {
                consumer.0.on_secondary(payload);
                true
            }
            None => false,
        }
    }
}

/// Outbound secondary-stream handle.
///
/// Sends are dropped silently when multiplexing was not negotiated or the
/// connection is gone.
#[derive(Debug, Clone)]
pub struct SecondarySender {
    conn_id: String,
    tx: Option<mpsc::Sender<Bytes>>,
}

impl SecondarySender {
    pub(crate) fn new(conn_id: String, tx: Option<mpsc::Sender<Bytes>>) -> Self {
        Self { conn_id, tx }
    }

    /// A sender for a connection without a secondary stream
    pub fn disabled(conn_id: impl Into<String>) -> Self {
        Self::new(conn_id.into(), None)
    }

    /// True while multiplexing is active and the connection is open
    pub fn is_enabled(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Queue `payload` for the connection. Returns whether it was accepted.
    pub fn send(&self, payload: Bytes) -> bool {
        let Some(tx) = &self.tx else {
            trace!(
                "[{}] Dropping {} secondary bytes, multiplexing is off",
                self.conn_id,
                payload.len()
            );
            return false;
        };

        match tx.try_send(payload) {
            Ok(()) => true,
            Err(e) => {
                trace!("[{}] Dropping secondary payload: {}", self.conn_id, e);
                false
            }
        }
    }
}
