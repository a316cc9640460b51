//! Confirm and return callback slots.
//!
//! A backend owns one [`CallbackRegistry`] and reports every broker outcome
//! through it. The registry holds at most one callback per signal, so
//! installing a callback any number of times never makes an outcome fire more
//! than once.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::correlation::{CorrelationToken, ReturnedMessage};

/// Receives broker confirmations.
///
/// Invoked once per publish attempt, on a task chosen by the backend.
#[async_trait]
pub trait ConfirmCallback: Send + Sync {
    /// `token` is `None` when the broker outcome could not be attributed to a
    /// send. `cause` carries the broker's reason on negative outcomes.
    async fn on_confirm(&self, token: Option<CorrelationToken>, ack: bool, cause: Option<String>);
}

/// Receives messages the broker could not route to any queue.
#[async_trait]
pub trait ReturnCallback: Send + Sync {
    async fn on_return(&self, returned: ReturnedMessage);
}

#[derive(Default)]
struct Slots {
    confirm: Option<Arc<dyn ConfirmCallback>>,
    returned: Option<Arc<dyn ReturnCallback>>,
}

/// Shared callback slots of one backend instance.
///
/// Clones share the same slots.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    slots: Arc<RwLock<Slots>>,
}

impl CallbackRegistry {
    /// Install the confirm callback.
    ///
    /// Returns `false` when this exact instance is already installed. A
    /// different instance replaces the previous one.
    pub fn set_confirm_callback(&self, callback: Arc<dyn ConfirmCallback>) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = &slots.confirm {
            if std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(&callback)) {
                return false;
            }
            tracing::debug!("Replacing installed confirm callback");
        }
        slots.confirm = Some(callback);
        true
    }

    /// Install the return callback.
    ///
    /// Returns `false` when this exact instance is already installed. A
    /// different instance replaces the previous one.
    pub fn set_return_callback(&self, callback: Arc<dyn ReturnCallback>) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = &slots.returned {
            if std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(&callback)) {
                return false;
            }
            tracing::debug!("Replacing installed return callback");
        }
        slots.returned = Some(callback);
        true
    }

    fn confirm_callback(&self) -> Option<Arc<dyn ConfirmCallback>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .confirm
            .clone()
    }

    fn return_callback(&self) -> Option<Arc<dyn ReturnCallback>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .returned
            .clone()
    }

    /// Report a confirmation to the installed callback.
    ///
    /// The callback runs on its own task; a panic inside it is logged and
    /// does not reach the caller.
    pub async fn confirm(&self, token: Option<CorrelationToken>, ack: bool, cause: Option<String>) {
        let Some(callback) = self.confirm_callback() else {
            tracing::warn!(
                message_id = token.as_ref().map(CorrelationToken::message_id),
                ack,
                "No confirm callback installed, dropping confirmation"
            );
            return;
        };

        let handle = tokio::spawn(async move { callback.on_confirm(token, ack, cause).await });
        if let Err(error) = handle.await {
            tracing::error!(?error, "Confirm callback failed");
        }
    }

    /// Report a returned message to the installed callback.
    ///
    /// Same isolation as [`confirm`](Self::confirm).
    pub async fn returned(&self, returned: ReturnedMessage) {
        let Some(callback) = self.return_callback() else {
            tracing::warn!(
                exchange = %returned.exchange,
                routing_key = %returned.routing_key,
                "No return callback installed, dropping returned message"
            );
            return;
        };

        let handle = tokio::spawn(async move { callback.on_return(returned).await });
        if let Err(error) = handle.await {
            tracing::error!(?error, "Return callback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::envelope::HeaderMap;

    #[derive(Default)]
    struct Counting {
        confirms: AtomicUsize,
        returns: AtomicUsize,
    }

    #[async_trait]
    impl ConfirmCallback for Counting {
        async fn on_confirm(
            &self,
            _token: Option<CorrelationToken>,
            _ack: bool,
            _cause: Option<String>,
        ) {
            self.confirms.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ReturnCallback for Counting {
        async fn on_return(&self, _returned: ReturnedMessage) {
            self.returns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    #[async_trait]
    impl ConfirmCallback for Panicking {
        async fn on_confirm(
            &self,
            _token: Option<CorrelationToken>,
            _ack: bool,
            _cause: Option<String>,
        ) {
            panic!("callback blew up");
        }
    }

    fn returned() -> ReturnedMessage {
        ReturnedMessage {
            exchange: "ex".into(),
            routing_key: "rk".into(),
            reply_code: 312,
            reply_text: "NO_ROUTE".into(),
            expiration: None,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    #[tokio::test]
    async fn installing_twice_fires_once() {
        let registry = CallbackRegistry::default();
        let counting = Arc::new(Counting::default());

        assert!(registry.set_confirm_callback(counting.clone()));
        assert!(!registry.set_confirm_callback(counting.clone()));
        assert!(registry.set_return_callback(counting.clone()));
        assert!(!registry.set_return_callback(counting.clone()));

        registry.confirm(Some(CorrelationToken::new("m1")), true, None).await;
        registry.returned(returned()).await;

        assert_eq!(counting.confirms.load(Ordering::SeqCst), 1);
        assert_eq!(counting.returns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_new_instance_replaces_the_old_one() {
        let registry = CallbackRegistry::default();
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());

        registry.set_confirm_callback(first.clone());
        assert!(registry.set_confirm_callback(second.clone()));

        registry.confirm(None, false, None).await;

        assert_eq!(first.confirms.load(Ordering::SeqCst), 0);
        assert_eq!(second.confirms.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_without_callbacks_is_a_no_op() {
        let registry = CallbackRegistry::default();

        registry.confirm(Some(CorrelationToken::new("m1")), true, None).await;
        registry.returned(returned()).await;
    }

    #[tokio::test]
    async fn panicking_callback_does_not_escape_dispatch() {
        let registry = CallbackRegistry::default();
        registry.set_confirm_callback(Arc::new(Panicking));

        registry.confirm(Some(CorrelationToken::new("m1")), true, None).await;

        let counting = Arc::new(Counting::default());
        registry.set_confirm_callback(counting.clone());
        registry.confirm(Some(CorrelationToken::new("m2")), true, None).await;
        assert_eq!(counting.confirms.load(Ordering::SeqCst), 1);
    }
}
