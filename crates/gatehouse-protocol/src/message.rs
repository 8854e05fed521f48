use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::frame::NetworkMessage;
use crate::ids;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Application-level message kinds. Handlers are registered per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Login = 1,
    Register = 2,
    Logout = 3,
    QueryData = 4,
    UpdateData = 5,
    Custom = 100,
}

impl MessageType {
    /// Kind for a wire message id. Unknown ids map to `Custom`.
    pub fn from_wire(message_id: u32) -> Self {
        match message_id {
            ids::LOGIN => MessageType::Login,
            ids::REGISTER => MessageType::Register,
            ids::LOGOUT => MessageType::Logout,
            ids::QUERY_DATA => MessageType::QueryData,
            ids::UPDATE_DATA => MessageType::UpdateData,
            _ => MessageType::Custom,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Login => "login",
            MessageType::Register => "register",
            MessageType::Logout => "logout",
            MessageType::QueryData => "query_data",
            MessageType::UpdateData => "update_data",
            MessageType::Custom => "custom",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields every message carries regardless of kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMeta {
    pub id: u64,
    /// Socket handle of the originating client, as a string.
    pub client_id: String,
    pub created_at: DateTime<Utc>,
}

impl MessageMeta {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            client_id: client_id.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginMessage {
    pub meta: MessageMeta,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMessage {
    pub meta: MessageMeta,
    pub username: String,
    pub password: String,
    pub email: String,
}

/// Any message without dedicated fields: logout, queries, heartbeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericMessage {
    pub meta: MessageMeta,
    pub message_type: MessageType,
    /// Wire id the message arrived with.
    pub message_id: u32,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Login(LoginMessage),
    Register(RegisterMessage),
    Generic(GenericMessage),
}

impl Message {
    pub fn login(client_id: impl Into<String>, username: &str, password: &str) -> Self {
        Message::Login(LoginMessage {
            meta: MessageMeta::new(client_id),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub fn register(client_id: impl Into<String>, username: &str, password: &str, email: &str) -> Self {
        Message::Register(RegisterMessage {
            meta: MessageMeta::new(client_id),
            username: username.to_string(),
            password: password.to_string(),
            email: email.to_string(),
        })
    }

    pub fn generic(client_id: impl Into<String>, message_id: u32, payload: impl Into<String>) -> Self {
        Message::Generic(GenericMessage {
            meta: MessageMeta::new(client_id),
            message_type: MessageType::from_wire(message_id),
            message_id,
            payload: payload.into(),
        })
    }

    /// Decode a frame received from `client_id`.
    ///
    /// LOGIN bodies are `username|password` and REGISTER bodies are
    /// `username|password|email`. A LOGIN body without a separator yields
    /// empty credentials; missing REGISTER fields are empty.
    pub fn from_network(frame: &NetworkMessage, client_id: impl Into<String>) -> Self {
        let body = frame.body_text();
        match frame.message_id() {
            ids::LOGIN => {
                let (username, password) = body.split_once('|').unwrap_or(("", ""));
                Message::login(client_id, username, password)
            }
            ids::REGISTER => {
                let mut fields = body.splitn(3, '|');
                let username = fields.next().unwrap_or_default();
                let password = fields.next().unwrap_or_default();
                let email = fields.next().unwrap_or_default();
                Message::register(client_id, username, password, email)
            }
            other => Message::generic(client_id, other, body),
        }
    }

    pub fn meta(&self) -> &MessageMeta {
        match self {
            Message::Login(m) => &m.meta,
            Message::Register(m) => &m.meta,
            Message::Generic(m) => &m.meta,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.meta().client_id
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Login(_) => MessageType::Login,
            Message::Register(_) => MessageType::Register,
            Message::Generic(m) => m.message_type,
        }
    }
}
