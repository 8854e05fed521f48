//! Readiness backend on Linux epoll.
//!
//! Sockets are registered level-triggered. When `poll` reports one ready,
//! the backend performs the accept, receive or send itself under the
//! context lock, then releases the lock and hands the results to the
//! socket's callback. Callbacks may therefore call back into the backend.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{AsyncIo, IoConfig, IoError};
use crate::event::{IoCallback, IoEvent, IoEventKind, IoEventType, SocketContext, SocketHandle, deliver};
use crate::sys;

/// Events fetched per `epoll_wait`.
const MAX_EVENTS: usize = 64;

/// Upper bound on bytes pulled from one socket per readiness event, so a
/// fast sender cannot starve the rest. Level triggering picks up the rest.
const MAX_READ_PER_EVENT: usize = 256 * 1024;

pub struct EpollBackend {
    config: IoConfig,
    epfd: AtomicI32,
    contexts: Mutex<HashMap<SocketHandle, SocketContext>>,
    running: AtomicBool,
}

impl EpollBackend {
    pub fn new(config: IoConfig) -> Self {
        Self {
            config,
            epfd: AtomicI32::new(-1),
            contexts: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    fn epfd(&self) -> Result<i32, IoError> {
        match self.epfd.load(Ordering::Acquire) {
            fd if fd >= 0 => Ok(fd),
            _ => Err(IoError::NotInitialized),
        }
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<SocketHandle, SocketContext>> {
        self.contexts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ctl(&self, op: libc::c_int, handle: SocketHandle, interest: IoEventType) -> Result<(), IoError> {
        let epfd = self.epfd()?;
        let mut event = libc::epoll_event {
            events: epoll_flags(interest),
            u64: handle as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, op, handle, &mut event) } < 0 {
            return Err(IoError::last_os("epoll_ctl"));
        }
        Ok(())
    }

    /// Add `flag` to the socket's interest and store its callback.
    fn arm(&self, handle: SocketHandle, flag: IoEventType, callback: IoCallback) -> Result<(), IoError> {
        let mut contexts = self.contexts();
        let ctx = contexts.get_mut(&handle).ok_or(IoError::UnknownSocket(handle))?;
        ctx.callback = Some(callback);
        if !ctx.interest.contains(flag) {
            let interest = ctx.interest | flag;
            self.ctl(libc::EPOLL_CTL_MOD, handle, interest)?;
            ctx.interest = interest;
        }
        Ok(())
    }

    /// Perform the I/O a readiness event allows, then deliver the results.
    fn dispatch(&self, handle: SocketHandle, flags: u32) {
        let mut events = Vec::new();
        let callback = {
            let mut contexts = self.contexts();
            let Some(ctx) = contexts.get_mut(&handle) else {
                return;
            };
            let callback = ctx.callback.clone();
            let mut dead: Option<String> = None;

            if ctx.interest.contains(IoEventType::ACCEPT) && flags & libc::EPOLLIN as u32 != 0 {
                accept_pending(handle, &mut events);
            }

            let hangup = flags & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0;
            if ctx.interest.contains(IoEventType::READ) && (flags & libc::EPOLLIN as u32 != 0 || hangup) {
                let (data, closed) = read_available(ctx, self.config.read_chunk);
                if !data.is_empty() {
                    events.push(IoEvent {
                        socket: handle,
                        kind: IoEventKind::Read { data },
                    });
                }
                dead = closed;
            } else if hangup && !ctx.interest.contains(IoEventType::ACCEPT) {
                dead = Some(sys::CONNECTION_CLOSED.to_string());
            }

            if dead.is_none() && ctx.interest.contains(IoEventType::WRITE) && flags & libc::EPOLLOUT as u32 != 0 {
                match flush_writes(ctx) {
                    Ok(written) if ctx.pending_write().is_empty() => {
                        let interest = ctx.interest.without(IoEventType::WRITE);
                        if let Err(e) = self.ctl(libc::EPOLL_CTL_MOD, handle, interest) {
                            warn!(socket = handle, "Failed to drop write interest: {}", e);
                        }
                        ctx.interest = interest;
                        events.push(IoEvent {
                            socket: handle,
                            kind: IoEventKind::Write { bytes: written },
                        });
                    }
                    Ok(_) => {}
                    Err(reason) => dead = Some(reason),
                }
            }

            if dead.is_none() && flags & libc::EPOLLERR as u32 != 0 {
                dead = Some(sys::socket_error(handle));
            }

            if let Some(reason) = dead {
                contexts.remove(&handle);
                let _ = self.ctl(libc::EPOLL_CTL_DEL, handle, IoEventType::NONE);
                debug!(socket = handle, reason = %reason, "Socket context dropped");
                events.push(IoEvent::error(handle, reason));
            }
            callback
        };

        match callback {
            Some(callback) => {
                for event in events {
                    deliver(&callback, event);
                }
            }
            None => {
                for event in events {
                    if let IoEventKind::Accept { client, .. } = event.kind {
                        sys::close(client);
                    }
                }
            }
        }
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl AsyncIo for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn initialize(&self) -> Result<(), IoError> {
        if self.epfd.load(Ordering::Acquire) >= 0 {
            return Ok(());
        }
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(IoError::last_os("epoll_create1"));
        }
        if self.epfd.compare_exchange(-1, fd, Ordering::AcqRel, Ordering::Acquire).is_err() {
            sys::close(fd);
        }
        info!("epoll backend initialized");
        Ok(())
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let fd = self.epfd.swap(-1, Ordering::AcqRel);
        if fd < 0 {
            return;
        }
        let dropped = {
            let mut contexts = self.contexts();
            let n = contexts.len();
            contexts.clear();
            n
        };
        sys::close(fd);
        info!(dropped, "epoll backend shut down");
    }

    fn add_socket(&self, handle: SocketHandle, interest: IoEventType) -> Result<(), IoError> {
        let mut contexts = self.contexts();
        if contexts.contains_key(&handle) {
            return Err(IoError::AlreadyRegistered(handle));
        }
        sys::set_nonblocking(handle)?;
        self.ctl(libc::EPOLL_CTL_ADD, handle, interest)?;
        contexts.insert(handle, SocketContext::new(handle, interest));
        Ok(())
    }

    fn remove_socket(&self, handle: SocketHandle) -> bool {
        let removed = self.contexts().remove(&handle).is_some();
        if removed {
            // The descriptor may already be closed; the kernel drops it then.
            let _ = self.ctl(libc::EPOLL_CTL_DEL, handle, IoEventType::NONE);
        }
        removed
    }

    fn modify_socket(&self, handle: SocketHandle, interest: IoEventType) -> Result<(), IoError> {
        let mut contexts = self.contexts();
        let ctx = contexts.get_mut(&handle).ok_or(IoError::UnknownSocket(handle))?;
        self.ctl(libc::EPOLL_CTL_MOD, handle, interest)?;
        ctx.interest = interest;
        Ok(())
    }

    fn async_read(&self, handle: SocketHandle, callback: IoCallback) -> Result<(), IoError> {
        self.arm(handle, IoEventType::READ, callback)
    }

    fn async_write(&self, handle: SocketHandle, data: Vec<u8>, callback: IoCallback) -> Result<(), IoError> {
        let mut contexts = self.contexts();
        let ctx = contexts.get_mut(&handle).ok_or(IoError::UnknownSocket(handle))?;
        ctx.write_buffer.extend_from_slice(&data);
        ctx.callback = Some(callback);
        if !ctx.interest.contains(IoEventType::WRITE) {
            let interest = ctx.interest | IoEventType::WRITE;
            self.ctl(libc::EPOLL_CTL_MOD, handle, interest)?;
            ctx.interest = interest;
        }
        Ok(())
    }

    fn async_accept(&self, listener: SocketHandle, callback: IoCallback) -> Result<(), IoError> {
        self.arm(listener, IoEventType::ACCEPT, callback)
    }

    fn start_event_loop(&self) -> Result<(), IoError> {
        self.epfd()?;
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop_event_loop(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn needs_driver(&self) -> bool {
        true
    }

    fn poll(&self, timeout: Duration) -> Result<usize, IoError> {
        let epfd = self.epfd()?;
        if !self.running.load(Ordering::Acquire) {
            return Ok(0);
        }
        let mut ready = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let n = unsafe { libc::epoll_wait(epfd, ready.as_mut_ptr(), MAX_EVENTS as libc::c_int, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(IoError::Os {
                op: "epoll_wait",
                source: err,
            });
        }
        for event in ready.iter().take(n as usize).copied() {
            let handle = event.u64 as SocketHandle;
            let flags = event.events;
            self.dispatch(handle, flags);
        }
        Ok(n as usize)
    }
}

fn epoll_flags(interest: IoEventType) -> u32 {
    let mut events = (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;
    if interest.contains(IoEventType::READ) || interest.contains(IoEventType::ACCEPT) {
        events |= libc::EPOLLIN as u32;
    }
    if interest.contains(IoEventType::WRITE) {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn accept_pending(listener: SocketHandle, out: &mut Vec<IoEvent>) {
    loop {
        match sys::accept(listener) {
            Ok((client, peer)) => out.push(IoEvent {
                socket: listener,
                kind: IoEventKind::Accept { client, peer },
            }),
            Err(err) => match err.kind() {
                io::ErrorKind::WouldBlock => break,
                io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted => continue,
                _ => {
                    warn!(socket = listener, "accept failed: {}", err);
                    break;
                }
            },
        }
    }
}

/// Drain the socket. Returns the bytes read and, if the connection is
/// finished, why.
fn read_available(ctx: &mut SocketContext, chunk: usize) -> (Vec<u8>, Option<String>) {
    let mut data = Vec::new();
    ctx.read_buffer.resize(chunk, 0);
    while data.len() < MAX_READ_PER_EVENT {
        let n = unsafe { libc::recv(ctx.handle, ctx.read_buffer.as_mut_ptr().cast(), chunk, 0) };
        if n > 0 {
            data.extend_from_slice(&ctx.read_buffer[..n as usize]);
            continue;
        }
        if n == 0 {
            return (data, Some(sys::CONNECTION_CLOSED.to_string()));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => break,
            io::ErrorKind::Interrupted => continue,
            _ => return (data, Some(err.to_string())),
        }
    }
    (data, None)
}

/// Send as much of the pending write buffer as the socket takes.
fn flush_writes(ctx: &mut SocketContext) -> Result<usize, String> {
    let mut written = 0;
    while !ctx.pending_write().is_empty() {
        let pending = ctx.pending_write();
        let n = unsafe { libc::send(ctx.handle, pending.as_ptr().cast(), pending.len(), libc::MSG_NOSIGNAL) };
        if n >= 0 {
            ctx.advance_write(n as usize);
            written += n as usize;
            continue;
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => break,
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.to_string()),
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::{AsRawFd, FromRawFd};
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::sync::mpsc;

    fn backend() -> EpollBackend {
        let backend = EpollBackend::new(IoConfig::default());
        backend.initialize().unwrap();
        backend.start_event_loop().unwrap();
        backend
    }

    fn channel_callback() -> (IoCallback, mpsc::Receiver<IoEvent>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let callback: IoCallback = Arc::new(move |event| {
            let _ = tx.lock().unwrap().send(event);
        });
        (callback, rx)
    }

    /// Poll until an event shows up on `rx` or the attempts run out.
    fn next_event(backend: &EpollBackend, rx: &mpsc::Receiver<IoEvent>) -> IoEvent {
        for _ in 0..50 {
            if let Ok(event) = rx.try_recv() {
                return event;
            }
            backend.poll(Duration::from_millis(20)).unwrap();
        }
        rx.try_recv().expect("no event delivered")
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let backend = backend();
        let (_a, b) = UnixStream::pair().unwrap();
        backend.add_socket(b.as_raw_fd(), IoEventType::READ).unwrap();
        assert!(matches!(
            backend.add_socket(b.as_raw_fd(), IoEventType::READ),
            Err(IoError::AlreadyRegistered(_))
        ));
        assert!(backend.remove_socket(b.as_raw_fd()));
        assert!(!backend.remove_socket(b.as_raw_fd()));
    }

    #[test]
    fn test_read_then_peer_close() {
        let backend = backend();
        let (mut a, b) = UnixStream::pair().unwrap();
        let (callback, rx) = channel_callback();
        backend.add_socket(b.as_raw_fd(), IoEventType::READ | IoEventType::ERROR).unwrap();
        backend.async_read(b.as_raw_fd(), callback).unwrap();

        a.write_all(b"ping").unwrap();
        let event = next_event(&backend, &rx);
        assert_eq!(event.kind, IoEventKind::Read { data: b"ping".to_vec() });

        drop(a);
        let event = next_event(&backend, &rx);
        assert_eq!(
            event.kind,
            IoEventKind::Error {
                reason: "Connection closed".to_string()
            }
        );
        // Context was dropped with the error.
        assert!(!backend.remove_socket(b.as_raw_fd()));
    }

    #[test]
    fn test_write_completes() {
        let backend = backend();
        let (mut a, b) = UnixStream::pair().unwrap();
        let (callback, rx) = channel_callback();
        backend.add_socket(b.as_raw_fd(), IoEventType::READ).unwrap();
        backend.async_write(b.as_raw_fd(), b"pong".to_vec(), callback).unwrap();

        let event = next_event(&backend, &rx);
        assert_eq!(event.kind, IoEventKind::Write { bytes: 4 });

        let mut buf = [0u8; 4];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_accept() {
        let backend = backend();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (callback, rx) = channel_callback();
        backend.add_socket(listener.as_raw_fd(), IoEventType::ACCEPT).unwrap();
        backend.async_accept(listener.as_raw_fd(), callback).unwrap();

        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let event = next_event(&backend, &rx);
        let IoEventKind::Accept { client: accepted, peer } = event.kind else {
            panic!("expected accept, got {:?}", event.kind);
        };
        assert_eq!(peer, Some(client.local_addr().unwrap()));
        drop(unsafe { TcpStream::from_raw_fd(accepted) });
    }

    #[test]
    fn test_unknown_socket() {
        let backend = backend();
        let (callback, _rx) = channel_callback();
        assert!(matches!(backend.async_read(999_999, callback), Err(IoError::UnknownSocket(_))));
        assert!(!backend.remove_socket(999_999));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let backend = backend();
        backend.shutdown();
        backend.shutdown();
        assert!(matches!(backend.poll(Duration::from_millis(1)), Err(IoError::NotInitialized)));
    }
}
