//! Event-driven socket multiplexing for the account server.
//!
//! [`AsyncIo`] is implemented by a readiness backend on epoll and, with the
//! `io-uring` feature, a completion backend on io_uring. The backend is
//! picked at build time by [`create_backend`]; [`AsyncIoManager`] wraps it
//! and turns raw socket events into accept/read/write/error callbacks.

#[cfg(not(target_os = "linux"))]
compile_error!("gatehouse-io supports Linux only (epoll / io_uring)");

mod backend;
mod epoll;
mod event;
mod manager;
mod sys;
#[cfg(feature = "io-uring")]
mod uring;

pub use backend::{AsyncIo, IoConfig, IoError, create_backend};
pub use epoll::EpollBackend;
pub use event::{IoCallback, IoEvent, IoEventKind, IoEventType, SocketHandle};
pub use manager::AsyncIoManager;
#[cfg(feature = "io-uring")]
pub use uring::IoUringBackend;
