use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use gatehouse_protocol::{GenericMessage, LoginMessage, Message, MessageType, OperationResult, RegisterMessage};

/// What a handler returns: a response for the client, nothing, or an error
/// that the main loop reports as a service error.
pub type HandlerResult = anyhow::Result<Option<OperationResult>>;

type LoginHandler = Arc<dyn Fn(&LoginMessage) -> HandlerResult + Send + Sync>;
type RegisterHandler = Arc<dyn Fn(&RegisterMessage) -> HandlerResult + Send + Sync>;
type GenericHandler = Arc<dyn Fn(&GenericMessage) -> HandlerResult + Send + Sync>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handler registered for {0} messages")]
    HandlerNotFound(MessageType),
    #[error("{message_type} handler failed: {reason}")]
    HandlerFailed {
        message_type: MessageType,
        reason: String,
    },
}

#[derive(Default)]
struct Handlers {
    login: Option<LoginHandler>,
    register: Option<RegisterHandler>,
    generic: HashMap<MessageType, GenericHandler>,
}

/// Message type to handler map. One handler per type; registering again
/// replaces the previous one.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<Handlers>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_login(&self, handler: impl Fn(&LoginMessage) -> HandlerResult + Send + Sync + 'static) {
        self.lock().login = Some(Arc::new(handler));
    }

    pub fn on_register(&self, handler: impl Fn(&RegisterMessage) -> HandlerResult + Send + Sync + 'static) {
        self.lock().register = Some(Arc::new(handler));
    }

    /// Handler for a generic message type (logout, query, custom...).
    pub fn on_message(
        &self,
        message_type: MessageType,
        handler: impl Fn(&GenericMessage) -> HandlerResult + Send + Sync + 'static,
    ) {
        self.lock().generic.insert(message_type, Arc::new(handler));
    }

    pub fn unregister(&self, message_type: MessageType) -> bool {
        let mut handlers = self.lock();
        match message_type {
            MessageType::Login => handlers.login.take().is_some(),
            MessageType::Register => handlers.register.take().is_some(),
            other => handlers.generic.remove(&other).is_some(),
        }
    }

    pub fn has_handler(&self, message_type: MessageType) -> bool {
        let handlers = self.lock();
        match message_type {
            MessageType::Login => handlers.login.is_some(),
            MessageType::Register => handlers.register.is_some(),
            other => handlers.generic.contains_key(&other),
        }
    }

    pub fn clear(&self) {
        *self.lock() = Handlers::default();
    }

    /// Run the handler for `message`. The registry lock is released before
    /// the handler runs.
    pub fn handle(&self, message: &Message) -> Result<Option<OperationResult>, DispatchError> {
        let message_type = message.message_type();
        let outcome = match message {
            Message::Login(login) => {
                let handler = self.lock().login.clone();
                handler.map(|h| h(login))
            }
            Message::Register(register) => {
                let handler = self.lock().register.clone();
                handler.map(|h| h(register))
            }
            Message::Generic(generic) => {
                let handler = self.lock().generic.get(&generic.message_type).cloned();
                handler.map(|h| h(generic))
            }
        };

        match outcome {
            None => Err(DispatchError::HandlerNotFound(message_type)),
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(DispatchError::HandlerFailed {
                message_type,
                reason: format!("{:#}", e),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_protocol::ids;

    #[test]
    fn test_routes_by_variant() {
        let registry = HandlerRegistry::new();
        registry.on_login(|m| Ok(Some(OperationResult::success(format!("login {}", m.username)))));
        registry.on_register(|m| Ok(Some(OperationResult::success(format!("register {}", m.email)))));
        registry.on_message(MessageType::Logout, |m| {
            Ok(Some(OperationResult::success(format!("logout {}", m.payload))))
        });

        let login = registry.handle(&Message::login("1", "alice", "pw")).unwrap().unwrap();
        assert_eq!(login.message, "login alice");
        let register = registry.handle(&Message::register("1", "bob", "pw", "b@x")).unwrap().unwrap();
        assert_eq!(register.message, "register b@x");
        let logout = registry.handle(&Message::generic("1", ids::LOGOUT, "carol")).unwrap().unwrap();
        assert_eq!(logout.message, "logout carol");
    }

    #[test]
    fn test_missing_handler() {
        let registry = HandlerRegistry::new();
        let err = registry.handle(&Message::generic("1", ids::UPDATE_DATA, "")).unwrap_err();
        assert!(matches!(err, DispatchError::HandlerNotFound(MessageType::UpdateData)));
        let err = registry.handle(&Message::login("1", "a", "b")).unwrap_err();
        assert!(matches!(err, DispatchError::HandlerNotFound(MessageType::Login)));
    }

    #[test]
    fn test_handler_error_is_reported() {
        let registry = HandlerRegistry::new();
        registry.on_login(|_| Err(anyhow::anyhow!("boom")));
        let err = registry.handle(&Message::login("1", "a", "b")).unwrap_err();
        match err {
            DispatchError::HandlerFailed { message_type, reason } => {
                assert_eq!(message_type, MessageType::Login);
                assert_eq!(reason, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_register_unregister_clear() {
        let registry = HandlerRegistry::new();
        assert!(!registry.has_handler(MessageType::Login));
        registry.on_login(|_| Ok(None));
        registry.on_message(MessageType::Custom, |_| Ok(None));
        assert!(registry.has_handler(MessageType::Login));
        assert!(registry.has_handler(MessageType::Custom));

        assert!(registry.unregister(MessageType::Login));
        assert!(!registry.unregister(MessageType::Login));
        assert!(!registry.has_handler(MessageType::Login));

        registry.clear();
        assert!(!registry.has_handler(MessageType::Custom));
    }

    #[test]
    fn test_handler_may_reenter_registry() {
        let registry = Arc::new(HandlerRegistry::new());
        let inner = Arc::clone(&registry);
        registry.on_login(move |_| {
            assert!(inner.has_handler(MessageType::Login));
            Ok(None)
        });
        assert!(registry.handle(&Message::login("1", "a", "b")).unwrap().is_none());
    }
}
