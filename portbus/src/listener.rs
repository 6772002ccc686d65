//! User-registered event handlers.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::envelope::Envelope;

/// The wildcard event name: registering against it receives every non-internal
/// envelope, regardless of its `type`.
pub const WILDCARD_EVENT: &str = "receive";

pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Default)]
pub struct ListenerRegistry {
    handlers: HashMap<String, Vec<Handler>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event: impl Into<String>, handler: Handler) {
        self.handlers.entry(event.into()).or_default().push(handler);
    }

    /// Run every listener registered for `kind`, then every wildcard listener. A
    /// handler that panics is logged and does not take down the router's task.
    pub fn dispatch(&self, kind: &str, envelope: &Envelope) {
        if let Some(handlers) = self.handlers.get(kind) {
            for handler in handlers {
                Self::call(handler, envelope);
            }
        }
        if kind != WILDCARD_EVENT {
            if let Some(handlers) = self.handlers.get(WILDCARD_EVENT) {
                for handler in handlers {
                    Self::call(handler, envelope);
                }
            }
        }
    }

    fn call(handler: &Handler, envelope: &Envelope) {
        if catch_unwind(AssertUnwindSafe(|| handler(envelope))).is_err() {
            tracing::warn!(event = %envelope.kind, "listener panicked, continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn wildcard_fires_alongside_specific_handler() {
        let mut reg = ListenerRegistry::new();
        let specific = Arc::new(AtomicUsize::new(0));
        let wildcard = Arc::new(AtomicUsize::new(0));

        let s = specific.clone();
        reg.register("ping", Arc::new(move |_| { s.fetch_add(1, Ordering::SeqCst); }));
        let w = wildcard.clone();
        reg.register(WILDCARD_EVENT, Arc::new(move |_| { w.fetch_add(1, Ordering::SeqCst); }));

        reg.dispatch("ping", &Envelope::event("ping", serde_json::Value::Null));
        assert_eq!(specific.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_dispatch() {
        let mut reg = ListenerRegistry::new();
        let after = Arc::new(AtomicUsize::new(0));
        reg.register("ping", Arc::new(|_| panic!("boom")));
        let a = after.clone();
        reg.register("ping", Arc::new(move |_| { a.fetch_add(1, Ordering::SeqCst); }));
        reg.dispatch("ping", &Envelope::event("ping", serde_json::Value::Null));
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }
}
