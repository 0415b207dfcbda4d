//! In-process pub/sub used by the notification dispatcher.
//!
//! Each framework handle owns its own bus; there is no process-global
//! registry. Handlers run sequentially in registration order and the first
//! failure aborts the emit, which the dispatcher records as a failed
//! delivery attempt.

use core::fmt;
use std::{
    collections::HashMap,
    error::Error,
    sync::{Arc, RwLock},
};

use error_stack::Report;
use futures::future::BoxFuture;

use crate::model::Projection;

/// A subscriber rejected an event, or no subscriber was registered for it.
#[derive(Debug)]
#[must_use]
pub struct SubscriberError;

impl fmt::Display for SubscriberError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("a subscriber failed to handle the event")
    }
}

impl Error for SubscriberError {}

/// Payload delivered to subscribers when a hook fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEvent {
    pub event: String,
    pub projection: Projection,
    pub notification_id: i32,
    pub attempts: i32,
}

type Handler =
    Arc<dyn Fn(HookEvent) -> BoxFuture<'static, Result<(), Report<SubscriberError>>> + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `event`. Handlers for the same event run in
    /// registration order.
    pub fn subscribe<F, Fut>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
        Fut: core::future::Future<Output = Result<(), Report<SubscriberError>>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload| Box::pin(handler(payload)));
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(event.into())
            .or_default()
            .push(handler);
    }

    /// Awaits every handler registered for the event, sequentially.
    ///
    /// # Errors
    ///
    /// - [`SubscriberError`] from the first failing handler, or if nothing is
    ///   subscribed to the event. Undelivered events stay pending, so a
    ///   missing subscriber is a failure rather than a silent success.
    pub async fn emit(
        &self,
        event: &str,
        payload: &HookEvent,
    ) -> Result<(), Report<SubscriberError>> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(event)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            return Err(Report::new(SubscriberError)
                .attach_printable(format!("no subscribers for event '{event}'")));
        }

        for handler in handlers {
            handler(payload.clone()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use pretty_assertions::assert_eq;

    use super::*;

    fn payload(event: &str) -> HookEvent {
        HookEvent {
            event: event.to_owned(),
            projection: Projection {
                id: 1,
                name: "VAT Rates".to_owned(),
                version: 1,
            },
            notification_id: 10,
            attempts: 0,
        }
    }

    #[tokio::test]
    async fn handlers_run_sequentially_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe("VAT Rate Changed", move |_| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().expect("lock").push(label);
                    Ok(())
                }
            });
        }

        bus.emit("VAT Rate Changed", &payload("VAT Rate Changed"))
            .await
            .expect("all handlers succeed");
        assert_eq!(*order.lock().expect("lock"), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn a_failing_handler_aborts_the_emit() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.subscribe("Any Change", |_| async {
            Err(Report::new(SubscriberError).attach_printable("downstream unavailable"))
        });
        {
            let calls = Arc::clone(&calls);
            bus.subscribe("Any Change", move |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        bus.emit("Any Change", &payload("Any Change"))
            .await
            .expect_err("first handler fails");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn events_without_subscribers_are_not_swallowed() {
        let bus = EventBus::new();
        let report = bus
            .emit("Unheard", &payload("Unheard"))
            .await
            .expect_err("nothing subscribed");
        assert!(format!("{report:?}").contains("no subscribers for event 'Unheard'"));
    }

    #[tokio::test]
    async fn subscriptions_are_scoped_to_their_event() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            bus.subscribe("VAT Rate Changed", move |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        bus.emit("VAT Rate Changed", &payload("VAT Rate Changed"))
            .await
            .expect("handler succeeds");
        bus.emit("Park Changed", &payload("Park Changed"))
            .await
            .expect_err("no subscriber for parks");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
