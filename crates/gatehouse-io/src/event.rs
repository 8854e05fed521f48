use std::fmt;
use std::net::SocketAddr;
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

/// OS socket handle as seen by the backends.
pub type SocketHandle = RawFd;

/// Interest flags, combinable with `|`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IoEventType(u8);

impl IoEventType {
    pub const NONE: IoEventType = IoEventType(0);
    pub const ACCEPT: IoEventType = IoEventType(1);
    pub const READ: IoEventType = IoEventType(2);
    pub const WRITE: IoEventType = IoEventType(4);
    pub const ERROR: IoEventType = IoEventType(8);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: IoEventType) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn without(self, other: IoEventType) -> IoEventType {
        IoEventType(self.0 & !other.0)
    }
}

impl BitOr for IoEventType {
    type Output = IoEventType;

    fn bitor(self, rhs: IoEventType) -> IoEventType {
        IoEventType(self.0 | rhs.0)
    }
}

impl BitOrAssign for IoEventType {
    fn bitor_assign(&mut self, rhs: IoEventType) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for IoEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (flag, name) in [
            (IoEventType::ACCEPT, "ACCEPT"),
            (IoEventType::READ, "READ"),
            (IoEventType::WRITE, "WRITE"),
            (IoEventType::ERROR, "ERROR"),
        ] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        if names.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// What happened on a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoEventKind {
    /// A connection was accepted on a listening socket. The new handle is
    /// non-blocking and owned by the receiver of the event.
    Accept {
        client: SocketHandle,
        peer: Option<SocketAddr>,
    },
    /// Bytes received, in arrival order.
    Read { data: Vec<u8> },
    /// A queued write finished.
    Write { bytes: usize },
    /// The socket is dead. The backend has already dropped its context.
    Error { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoEvent {
    pub socket: SocketHandle,
    pub kind: IoEventKind,
}

impl IoEvent {
    pub fn event_type(&self) -> IoEventType {
        match self.kind {
            IoEventKind::Accept { .. } => IoEventType::ACCEPT,
            IoEventKind::Read { .. } => IoEventType::READ,
            IoEventKind::Write { .. } => IoEventType::WRITE,
            IoEventKind::Error { .. } => IoEventType::ERROR,
        }
    }

    pub(crate) fn error(socket: SocketHandle, reason: impl Into<String>) -> Self {
        Self {
            socket,
            kind: IoEventKind::Error {
                reason: reason.into(),
            },
        }
    }
}

pub type IoCallback = Arc<dyn Fn(IoEvent) + Send + Sync>;

/// Per-socket state owned by a backend.
pub(crate) struct SocketContext {
    pub handle: SocketHandle,
    pub interest: IoEventType,
    pub read_buffer: Vec<u8>,
    pub write_buffer: Vec<u8>,
    pub write_offset: usize,
    /// Single slot; registering again replaces it.
    pub callback: Option<IoCallback>,
}

impl SocketContext {
    pub fn new(handle: SocketHandle, interest: IoEventType) -> Self {
        Self {
            handle,
            interest,
            read_buffer: Vec::new(),
            write_buffer: Vec::new(),
            write_offset: 0,
            callback: None,
        }
    }

    pub fn pending_write(&self) -> &[u8] {
        &self.write_buffer[self.write_offset..]
    }

    pub fn advance_write(&mut self, n: usize) {
        self.write_offset += n;
        if self.write_offset >= self.write_buffer.len() {
            self.write_buffer.clear();
            self.write_offset = 0;
        }
    }
}

/// Run a user callback, containing any panic so the calling event loop
/// thread keeps running.
pub(crate) fn deliver(callback: &IoCallback, event: IoEvent) {
    let socket = event.socket;
    let kind = event.event_type();
    if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        error!(socket, ?kind, "I/O callback panicked");
    }
}

/// Last OS error as text.
pub(crate) fn os_error_text() -> String {
    std::io::Error::last_os_error().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_flags() {
        let interest = IoEventType::READ | IoEventType::ERROR;
        assert!(interest.contains(IoEventType::READ));
        assert!(!interest.contains(IoEventType::WRITE));
        assert!(!interest.contains(IoEventType::NONE));
        assert_eq!(interest.without(IoEventType::READ), IoEventType::ERROR);
        assert_eq!(format!("{:?}", interest), "READ|ERROR");
    }

    #[test]
    fn test_deliver_contains_panics() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let callback: IoCallback = Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            panic!("handler bug");
        });
        deliver(&callback, IoEvent::error(3, "boom"));
        deliver(&callback, IoEvent::error(3, "boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_write_offsets() {
        let mut ctx = SocketContext::new(5, IoEventType::WRITE);
        ctx.write_buffer.extend_from_slice(b"hello");
        ctx.advance_write(2);
        assert_eq!(ctx.pending_write(), b"llo");
        ctx.advance_write(3);
        assert!(ctx.pending_write().is_empty());
        assert_eq!(ctx.write_offset, 0);
    }
}
