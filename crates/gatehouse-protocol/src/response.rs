//! Response envelope sent back to clients.
//!
//! ```text
//! RESPONSE:{type}:{message}[:{data}]
//! ```
//!
//! `type` is the numeric [`ResponseType`]. `data` is omitted when empty and
//! may itself contain `:`; it always runs to the end of the envelope.
use std::fmt;

use crate::frame::NetworkMessage;
use crate::ids;

const ENVELOPE_PREFIX: &str = "RESPONSE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseType {
    Success = 0,
    ServiceError = 1,
    NotFound = 2,
    InvalidFormat = 3,
    DatabaseError = 4,
}

impl ResponseType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ResponseType::Success),
            1 => Some(ResponseType::ServiceError),
            2 => Some(ResponseType::NotFound),
            3 => Some(ResponseType::InvalidFormat),
            4 => Some(ResponseType::DatabaseError),
            _ => None,
        }
    }
}

/// Outcome of handling one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub response_type: ResponseType,
    pub message: String,
    pub data: String,
}

impl OperationResult {
    pub fn new(response_type: ResponseType, message: impl Into<String>) -> Self {
        Self {
            response_type,
            message: message.into(),
            data: String::new(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(ResponseType::Success, message)
    }

    pub fn service_error(message: impl Into<String>) -> Self {
        Self::new(ResponseType::ServiceError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ResponseType::NotFound, message)
    }

    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::new(ResponseType::InvalidFormat, message)
    }

    pub fn database_error(message: impl Into<String>) -> Self {
        Self::new(ResponseType::DatabaseError, message)
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.response_type == ResponseType::Success
    }

    pub fn envelope(&self) -> String {
        self.to_string()
    }

    /// Envelope wrapped in a frame: SUCCESS_RESPONSE for successes,
    /// ERROR_RESPONSE otherwise.
    pub fn to_frame(&self) -> NetworkMessage {
        let message_id = if self.is_success() {
            ids::SUCCESS_RESPONSE
        } else {
            ids::ERROR_RESPONSE
        };
        NetworkMessage::new(message_id, self.envelope())
    }

    /// Envelope terminated by a newline, for text clients.
    pub fn to_line(&self) -> String {
        let mut line = self.envelope();
        line.push('\n');
        line
    }

    /// Parse an envelope produced by [`OperationResult::envelope`].
    pub fn parse_envelope(text: &str) -> Option<Self> {
        let text = text.trim_end_matches(['\r', '\n']);
        let mut parts = text.splitn(4, ':');
        if parts.next()? != ENVELOPE_PREFIX {
            return None;
        }
        let response_type = ResponseType::from_code(parts.next()?.parse().ok()?)?;
        let message = parts.next()?.to_string();
        let data = parts.next().unwrap_or_default().to_string();
        Some(Self {
            response_type,
            message,
            data,
        })
    }
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", ENVELOPE_PREFIX, self.response_type.code(), self.message)?;
        if !self.data.is_empty() {
            write!(f, ":{}", self.data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_without_data() {
        assert_eq!(OperationResult::success("Login successful").envelope(), "RESPONSE:0:Login successful");
        assert_eq!(OperationResult::service_error("Invalid credentials").envelope(), "RESPONSE:1:Invalid credentials");
    }

    #[test]
    fn test_envelope_with_data() {
        let result = OperationResult::success("Account found").with_data("{\"id\":1}");
        assert_eq!(result.envelope(), "RESPONSE:0:Account found:{\"id\":1}");

        let parsed = OperationResult::parse_envelope(&result.to_line()).unwrap();
        assert_eq!(parsed, result);
    }

    #[test]
    fn test_frame_ids() {
        assert_eq!(OperationResult::success("ok").to_frame().message_id(), ids::SUCCESS_RESPONSE);
        assert_eq!(OperationResult::database_error("down").to_frame().message_id(), ids::ERROR_RESPONSE);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(OperationResult::parse_envelope("HELLO:0:x").is_none());
        assert!(OperationResult::parse_envelope("RESPONSE:7:x").is_none());
        assert!(OperationResult::parse_envelope("RESPONSE:0").is_none());
    }
}
