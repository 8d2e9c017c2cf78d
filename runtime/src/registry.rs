//! Process-wide mapping from event kind to the ordered handlers that react to it.
//!
//! Registration happens once at startup through [`HandlerRegistryBuilder`]; the consumer
//! loop only ever accepts a frozen [`HandlerRegistry`]. This is the type-level enforcement
//! of "the registry is frozen the moment the consumer loop starts" — there is no `register`
//! method on [`HandlerRegistry`] itself, so a call arriving after startup is a compile
//! error, not a runtime check the dispatcher has to perform.

use std::collections::HashMap;
use std::sync::Arc;

use substrate_core::event::EventKind;

use crate::handler::Handler;

/// Builder for a [`HandlerRegistry`]. Collects handlers in registration order per kind.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<EventKind, Vec<Arc<dyn Handler>>>,
}

impl HandlerRegistryBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` to run for every event of `kind`, after any handlers already
    /// registered for that kind.
    #[must_use]
    pub fn register(mut self, kind: EventKind, handler: Arc<dyn Handler>) -> Self {
        self.handlers.entry(kind).or_default().push(handler);
        self
    }

    /// Freeze the builder into a [`HandlerRegistry`] the consumer loop can use.
    #[must_use]
    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

/// An immutable `EventKind -> handlers` mapping.
///
/// Constructed only via [`HandlerRegistryBuilder::build`]; there is no way to mutate one
/// once built.
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Vec<Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    /// The handlers registered for `kind`, in registration order. Empty if none are
    /// registered — the dispatcher treats that as "ack and continue", not an error.
    #[must_use]
    pub fn handlers_for(&self, kind: EventKind) -> &[Arc<dyn Handler>] {
        self.handlers.get(&kind).map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerError;
    use sqlx::{Postgres, Transaction};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use substrate_core::event::Payload;
    use substrate_core::ids::TenantId;

    struct CountingHandler(Arc<AtomicUsize>);

    impl Handler for CountingHandler {
        fn apply<'a>(
            &'a self,
            _tenant_id: TenantId,
            _payload: &'a Payload,
            _tx: &'a mut Transaction<'_, Postgres>,
        ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn unregistered_kind_returns_empty_slice() {
        let registry = HandlerRegistryBuilder::new().build();
        assert!(registry.handlers_for(EventKind::SaleRecorded).is_empty());
    }

    #[test]
    fn handlers_for_a_kind_preserve_registration_order() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistryBuilder::new()
            .register(EventKind::SaleRecorded, Arc::new(CountingHandler(Arc::clone(&counter))))
            .register(EventKind::SaleRecorded, Arc::new(CountingHandler(Arc::clone(&counter))))
            .build();

        assert_eq!(registry.handlers_for(EventKind::SaleRecorded).len(), 2);
        assert!(registry.handlers_for(EventKind::QuoteCreated).is_empty());
    }
}
