//! Line-based text protocol kept for older clients.
//!
//! ```text
//! LOGIN:username:password
//! REGISTER:username:password:email
//! ```
//!
//! Lines end with `\n`; a trailing `\r` is ignored.
use crate::message::Message;

/// True if `first` looks like the start of a text-protocol line. Binary
/// frames always start with a zero byte for the reserved message ids.
pub fn is_text_start(first: u8) -> bool {
    first.is_ascii_alphabetic()
}

/// Parse one line (without its newline). Returns `None` for anything that
/// is not a well-formed LOGIN or REGISTER command.
pub fn parse_line(line: &str, client_id: &str) -> Option<Message> {
    let line = line.trim_end_matches('\r');
    if let Some(rest) = line.strip_prefix("LOGIN:") {
        let (username, password) = rest.split_once(':')?;
        if username.is_empty() {
            return None;
        }
        return Some(Message::login(client_id, username, password));
    }
    if let Some(rest) = line.strip_prefix("REGISTER:") {
        let mut fields = rest.splitn(3, ':');
        let username = fields.next()?;
        let password = fields.next()?;
        let email = fields.next()?;
        if username.is_empty() {
            return None;
        }
        return Some(Message::register(client_id, username, password, email));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_line() {
        let Some(Message::Login(m)) = parse_line("LOGIN:alice:secret\r", "4") else {
            panic!("expected login");
        };
        assert_eq!(m.username, "alice");
        assert_eq!(m.password, "secret");
    }

    #[test]
    fn test_register_line() {
        let Some(Message::Register(m)) = parse_line("REGISTER:bob:pw:bob@x.com", "4") else {
            panic!("expected register");
        };
        assert_eq!(m.email, "bob@x.com");
    }

    #[test]
    fn test_bad_lines() {
        assert!(parse_line("LOGIN:alice", "4").is_none());
        assert!(parse_line("REGISTER:bob:pw", "4").is_none());
        assert!(parse_line("HELLO", "4").is_none());
        assert!(parse_line("LOGIN::pw", "4").is_none());
    }

    #[test]
    fn test_text_detection() {
        assert!(is_text_start(b'L'));
        assert!(!is_text_start(0));
    }
}
