use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::event::{IoCallback, IoEventType, SocketHandle};

#[derive(Debug, Error)]
pub enum IoError {
    #[error("backend not initialized")]
    NotInitialized,
    #[error("socket {0} is already registered")]
    AlreadyRegistered(SocketHandle),
    #[error("socket {0} is not registered")]
    UnknownSocket(SocketHandle),
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl IoError {
    pub(crate) fn last_os(op: &'static str) -> Self {
        IoError::Os {
            op,
            source: std::io::Error::last_os_error(),
        }
    }
}

/// Backend tuning.
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// Bytes read per receive call.
    pub read_chunk: usize,
    /// Worker threads for completion backends.
    pub worker_threads: usize,
    /// Ring / event array size.
    pub queue_depth: u32,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            read_chunk: 8192,
            worker_threads: 4,
            queue_depth: 256,
        }
    }
}

/// Socket multiplexer.
///
/// Readiness backends ([`crate::EpollBackend`]) do the I/O themselves when
/// [`AsyncIo::poll`] reports a socket ready and need a driver thread.
/// Completion backends submit operations up front and run their own
/// worker threads between `start_event_loop` and `stop_event_loop`.
///
/// Every socket has one callback slot; `async_read`, `async_write` and
/// `async_accept` all store into it. Callbacks run on backend threads and
/// must not block for long.
pub trait AsyncIo: Send + Sync {
    fn name(&self) -> &'static str;

    fn initialize(&self) -> Result<(), IoError>;

    /// Release every socket context and the OS handle. Idempotent.
    fn shutdown(&self);

    /// Register `handle`. A handle that is already registered is rejected
    /// with [`IoError::AlreadyRegistered`].
    fn add_socket(&self, handle: SocketHandle, interest: IoEventType) -> Result<(), IoError>;

    /// Deregister `handle`. The descriptor itself is left open.
    fn remove_socket(&self, handle: SocketHandle) -> bool;

    fn modify_socket(&self, handle: SocketHandle, interest: IoEventType) -> Result<(), IoError>;

    fn async_read(&self, handle: SocketHandle, callback: IoCallback) -> Result<(), IoError>;

    /// Queue `data` for sending. Writes to one socket complete in order.
    fn async_write(&self, handle: SocketHandle, data: Vec<u8>, callback: IoCallback) -> Result<(), IoError>;

    fn async_accept(&self, listener: SocketHandle, callback: IoCallback) -> Result<(), IoError>;

    fn start_event_loop(&self) -> Result<(), IoError>;

    fn stop_event_loop(&self);

    /// True if someone must call [`AsyncIo::poll`] in a loop.
    fn needs_driver(&self) -> bool;

    /// Wait up to `timeout` for events and dispatch them. Returns the number
    /// of OS events handled.
    fn poll(&self, timeout: Duration) -> Result<usize, IoError>;
}

/// Backend chosen at build time: io_uring with the `io-uring` feature,
/// epoll otherwise.
pub fn create_backend(config: &IoConfig) -> Arc<dyn AsyncIo> {
    #[cfg(feature = "io-uring")]
    {
        Arc::new(crate::uring::IoUringBackend::new(config.clone()))
    }
    #[cfg(not(feature = "io-uring"))]
    {
        Arc::new(crate::epoll::EpollBackend::new(config.clone()))
    }
}
