/// Binary frame format shared by every TCP client.
///
/// ```text
/// [0..4]   Message id (u32 BE)
/// [4..8]   Body length (u32 BE)
/// [8..]    Body (body length bytes, opaque)
/// ```
///
/// The header does not bound the body length; callers that buffer input
/// enforce their own cap.
use thiserror::Error;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame header needs {HEADER_SIZE} bytes, got {0}")]
    Truncated(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_id: u32,
    pub data_length: u32,
}

impl MessageHeader {
    pub fn new(message_id: u32, data_length: u32) -> Self {
        Self {
            message_id,
            data_length,
        }
    }

    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.message_id.to_be_bytes());
        out[4..8].copy_from_slice(&self.data_length.to_be_bytes());
        out
    }

    /// Decode the first 8 bytes of `bytes`. Trailing bytes are ignored.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Truncated(bytes.len()));
        }
        let message_id = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let data_length = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self {
            message_id,
            data_length,
        })
    }

    /// Header plus body, in bytes.
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.data_length as usize
    }
}

/// One complete frame. The body is owned and never modified after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMessage {
    header: MessageHeader,
    body: Vec<u8>,
}

impl NetworkMessage {
    /// Build a frame around `body`. The header length is derived from it.
    ///
    /// # Panics
    /// Panics if `body` is longer than `u32::MAX` bytes.
    pub fn new(message_id: u32, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        let data_length = u32::try_from(body.len()).expect("frame body exceeds u32::MAX");
        Self {
            header: MessageHeader::new(message_id, data_length),
            body,
        }
    }

    pub fn header(&self) -> MessageHeader {
        self.header
    }

    pub fn message_id(&self) -> u32 {
        self.header.message_id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body decoded as UTF-8, with invalid sequences replaced.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn total_size(&self) -> usize {
        self.header.total_size()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size());
        out.extend_from_slice(&self.header.serialize());
        out.extend_from_slice(&self.body);
        out
    }
}

/// True once `buffer` holds a header and the whole body it announces.
pub fn is_complete_message(buffer: &[u8]) -> bool {
    match MessageHeader::deserialize(buffer) {
        Ok(header) => buffer.len() >= header.total_size(),
        Err(_) => false,
    }
}

/// Copy the leading frame out of `buffer`.
///
/// Returns `None` while the frame is incomplete. The input is left as is;
/// the caller drops `total_size()` bytes once it has taken the frame.
pub fn parse_message(buffer: &[u8]) -> Option<NetworkMessage> {
    let header = MessageHeader::deserialize(buffer).ok()?;
    let end = header.total_size();
    if buffer.len() < end {
        return None;
    }
    Some(NetworkMessage {
        header,
        body: buffer[HEADER_SIZE..end].to_vec(),
    })
}

/// Join text fields into a `|` separated body.
pub fn pack_fields(fields: &[&str]) -> Vec<u8> {
    fields.join("|").into_bytes()
}

/// Split a `|` separated body into its fields.
pub fn split_fields(body: &str) -> Vec<&str> {
    body.split('|').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_big_endian() {
        let header = MessageHeader::new(1001, 12);
        assert_eq!(header.serialize(), [0, 0, 0x03, 0xE9, 0, 0, 0, 12]);
    }

    #[test]
    fn test_round_trip() {
        for (id, body) in [(1001u32, &b"alice|secret"[..]), (9002, &b""[..]), (u32::MAX, &[0xFFu8; 300][..])] {
            let bytes = NetworkMessage::new(id, body.to_vec()).serialize();
            assert_eq!(bytes.len(), HEADER_SIZE + body.len());

            let parsed = parse_message(&bytes).unwrap();
            assert_eq!(parsed.message_id(), id);
            assert_eq!(parsed.body(), body);
        }
    }

    #[test]
    fn test_short_header_rejected() {
        assert_eq!(MessageHeader::deserialize(&[0, 0, 3]), Err(FrameError::Truncated(3)));
        for len in 0..HEADER_SIZE {
            assert!(!is_complete_message(&vec![0u8; len]));
        }
    }

    #[test]
    fn test_completeness_boundary() {
        let bytes = NetworkMessage::new(1002, b"bob|pw|bob@x.com".to_vec()).serialize();
        assert!(is_complete_message(&bytes));
        assert!(!is_complete_message(&bytes[..bytes.len() - 1]));
        assert!(parse_message(&bytes[..bytes.len() - 1]).is_none());
    }

    #[test]
    fn test_parse_leaves_trailing_frames() {
        let mut stream = NetworkMessage::new(1001, b"a|b".to_vec()).serialize();
        stream.extend(NetworkMessage::new(1003, b"a".to_vec()).serialize());

        let first = parse_message(&stream).unwrap();
        assert_eq!(first.message_id(), 1001);
        let rest = &stream[first.total_size()..];
        let second = parse_message(rest).unwrap();
        assert_eq!(second.message_id(), 1003);
        assert_eq!(second.body_text(), "a");
    }

    #[test]
    fn test_field_helpers() {
        let body = pack_fields(&["bob", "pw", "bob@x.com"]);
        assert_eq!(body, b"bob|pw|bob@x.com");
        assert_eq!(split_fields("bob|pw"), vec!["bob", "pw"]);
        assert_eq!(split_fields("nobar"), vec!["nobar"]);
    }
}
