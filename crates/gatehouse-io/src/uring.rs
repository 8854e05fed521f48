//! Completion backend on io_uring.
//!
//! Operations are submitted as soon as they are requested. An eventfd is
//! registered with the ring; a fixed pool of workers blocks reading it and
//! drains the completion queue when the kernel signals. Each socket has at
//! most one receive, one send and one accept in flight. Receives and
//! accepts re-arm after their callback returns, which keeps per-socket
//! delivery ordered even with several workers.
//!
//! Buffers handed to the kernel live in the pending-op table until the
//! matching completion is reaped, so removing a socket only cancels its
//! operations; the memory is released when the cancellation completes.

use std::collections::{HashMap, HashSet};
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use io_uring::{IoUring, opcode, squeue, types};
use tracing::{debug, error, info, warn};

use crate::backend::{AsyncIo, IoConfig, IoError};
use crate::event::{IoCallback, IoEvent, IoEventKind, IoEventType, SocketContext, SocketHandle, deliver};
use crate::sys;

/// user_data for cancellation requests; their completions are ignored.
const CANCEL_TOKEN: u64 = u64::MAX;

/// Pause before re-arming an accept that ran out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

enum OpKind {
    Read { buf: Vec<u8> },
    Write { buf: Vec<u8>, offset: usize },
    Accept,
}

struct PendingOp {
    handle: SocketHandle,
    generation: u64,
    kind: OpKind,
}

struct Slot {
    ctx: SocketContext,
    /// Distinguishes a reused descriptor from the socket an old op targeted.
    generation: u64,
    read_armed: bool,
    accept_armed: bool,
    write_in_flight: bool,
    tokens: HashSet<u64>,
}

struct Shared {
    config: IoConfig,
    ring: Mutex<Option<IoUring>>,
    eventfd: AtomicI32,
    sockets: Mutex<HashMap<SocketHandle, Slot>>,
    ops: Mutex<HashMap<u64, PendingOp>>,
    next_token: AtomicU64,
    next_generation: AtomicU64,
    running: AtomicBool,
}

pub struct IoUringBackend {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl IoUringBackend {
    pub fn new(config: IoConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                ring: Mutex::new(None),
                eventfd: AtomicI32::new(-1),
                sockets: Mutex::new(HashMap::new()),
                ops: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                running: AtomicBool::new(false),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }
}

impl Shared {
    fn push(&self, sqe: squeue::Entry) -> Result<(), IoError> {
        let mut guard = lock(&self.ring);
        let ring = guard.as_mut().ok_or(IoError::NotInitialized)?;
        if unsafe { ring.submission().push(&sqe) }.is_err() {
            // Queue full: flush what is there and retry once.
            ring.submit().map_err(|source| IoError::Os {
                op: "io_uring_enter",
                source,
            })?;
            unsafe { ring.submission().push(&sqe) }.map_err(|_| IoError::Os {
                op: "io_uring push",
                source: io::Error::from(io::ErrorKind::WouldBlock),
            })?;
        }
        ring.submit().map_err(|source| IoError::Os {
            op: "io_uring_enter",
            source,
        })?;
        Ok(())
    }

    fn submit_op(&self, slot: &mut Slot, kind: OpKind) -> Result<u64, IoError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let handle = slot.ctx.handle;
        let mut op = PendingOp {
            handle,
            generation: slot.generation,
            kind,
        };
        let fd = types::Fd(handle);
        let sqe = match &mut op.kind {
            OpKind::Read { buf } => opcode::Recv::new(fd, buf.as_mut_ptr(), buf.len() as u32).build(),
            OpKind::Write { buf, offset } => {
                let pending = &buf[*offset..];
                opcode::Send::new(fd, pending.as_ptr(), pending.len() as u32)
                    .flags(libc::MSG_NOSIGNAL)
                    .build()
            }
            OpKind::Accept => opcode::Accept::new(fd, ptr::null_mut(), ptr::null_mut())
                .flags(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
                .build(),
        }
        .user_data(token);

        // Heap buffers keep their address when `op` moves into the table.
        lock(&self.ops).insert(token, op);
        if let Err(e) = self.push(sqe) {
            lock(&self.ops).remove(&token);
            return Err(e);
        }
        slot.tokens.insert(token);
        Ok(token)
    }

    fn submit_read(&self, slot: &mut Slot) -> Result<(), IoError> {
        let buf = vec![0u8; self.config.read_chunk];
        self.submit_op(slot, OpKind::Read { buf })?;
        slot.read_armed = true;
        Ok(())
    }

    fn submit_accept(&self, slot: &mut Slot) -> Result<(), IoError> {
        self.submit_op(slot, OpKind::Accept)?;
        slot.accept_armed = true;
        Ok(())
    }

    fn submit_write(&self, slot: &mut Slot, buf: Vec<u8>, offset: usize) -> Result<(), IoError> {
        self.submit_op(slot, OpKind::Write { buf, offset })?;
        slot.write_in_flight = true;
        Ok(())
    }

    fn cancel(&self, tokens: impl IntoIterator<Item = u64>) {
        for token in tokens {
            let sqe = opcode::AsyncCancel::new(token).build().user_data(CANCEL_TOKEN);
            if let Err(e) = self.push(sqe) {
                debug!(token, "cancel not submitted: {}", e);
            }
        }
    }

    /// Drop a socket's slot and cancel its in-flight operations.
    fn evict(&self, sockets: &mut HashMap<SocketHandle, Slot>, handle: SocketHandle) -> Option<Slot> {
        let slot = sockets.remove(&handle)?;
        self.cancel(slot.tokens.iter().copied());
        Some(slot)
    }

    fn reap(&self) -> Vec<(u64, i32)> {
        let mut guard = lock(&self.ring);
        match guard.as_mut() {
            Some(ring) => ring.completion().map(|cqe| (cqe.user_data(), cqe.result())).collect(),
            None => Vec::new(),
        }
    }

    fn complete(&self, token: u64, result: i32) {
        if token == CANCEL_TOKEN {
            return;
        }
        let Some(op) = lock(&self.ops).remove(&token) else {
            return;
        };
        let handle = op.handle;
        let generation = op.generation;

        let mut sockets = lock(&self.sockets);
        let slot = match sockets.get_mut(&handle) {
            Some(slot) if slot.generation == generation => slot,
            // Socket removed or descriptor reused; the buffer drops here.
            _ => return,
        };
        slot.tokens.remove(&token);
        let callback = slot.ctx.callback.clone();

        match op.kind {
            OpKind::Read { buf } => {
                slot.read_armed = false;
                if result > 0 {
                    let data = buf[..result as usize].to_vec();
                    drop(sockets);
                    if let Some(callback) = &callback {
                        deliver(callback, IoEvent {
                            socket: handle,
                            kind: IoEventKind::Read { data },
                        });
                    }
                    self.rearm(handle, generation, IoEventType::READ);
                } else if result == 0 {
                    self.evict(&mut sockets, handle);
                    drop(sockets);
                    notify_error(callback, handle, sys::CONNECTION_CLOSED.to_string());
                } else {
                    self.handle_failure(sockets, callback, handle, generation, -result, IoEventType::READ);
                }
            }
            OpKind::Write { buf, offset } => {
                slot.write_in_flight = false;
                if result < 0 {
                    self.handle_failure(sockets, callback, handle, generation, -result, IoEventType::WRITE);
                    return;
                }
                let offset = offset + result as usize;
                if offset < buf.len() {
                    if let Err(e) = self.submit_write(slot, buf, offset) {
                        warn!(socket = handle, "write resubmit failed: {}", e);
                    }
                    return;
                }
                let bytes = buf.len();
                if !slot.ctx.write_buffer.is_empty() {
                    let next = mem::take(&mut slot.ctx.write_buffer);
                    slot.ctx.write_offset = 0;
                    if let Err(e) = self.submit_write(slot, next, 0) {
                        warn!(socket = handle, "queued write not submitted: {}", e);
                    }
                }
                drop(sockets);
                if let Some(callback) = &callback {
                    deliver(callback, IoEvent {
                        socket: handle,
                        kind: IoEventKind::Write { bytes },
                    });
                }
            }
            OpKind::Accept => {
                slot.accept_armed = false;
                if result < 0 {
                    self.handle_failure(sockets, callback, handle, generation, -result, IoEventType::ACCEPT);
                    return;
                }
                drop(sockets);
                let client = result as SocketHandle;
                match &callback {
                    Some(callback) => deliver(callback, IoEvent {
                        socket: handle,
                        kind: IoEventKind::Accept {
                            client,
                            peer: sys::peer_addr(client),
                        },
                    }),
                    None => sys::close(client),
                }
                self.rearm(handle, generation, IoEventType::ACCEPT);
            }
        }
    }

    /// A completion carried `-errno`.
    fn handle_failure(
        &self,
        mut sockets: MutexGuard<'_, HashMap<SocketHandle, Slot>>,
        callback: Option<IoCallback>,
        handle: SocketHandle,
        generation: u64,
        errno: i32,
        kind: IoEventType,
    ) {
        if kind == IoEventType::ACCEPT {
            self.accept_failed(sockets, callback, handle, generation, errno);
            return;
        }
        match errno {
            libc::ECANCELED => {}
            libc::EAGAIN | libc::EINTR | libc::ECONNABORTED if kind == IoEventType::READ => {
                drop(sockets);
                self.rearm(handle, generation, kind);
            }
            _ => {
                self.evict(&mut sockets, handle);
                drop(sockets);
                notify_error(callback, handle, io::Error::from_raw_os_error(errno).to_string());
            }
        }
    }

    /// Keep the listener armed unless the failure is the listener's own.
    fn accept_failed(
        &self,
        mut sockets: MutexGuard<'_, HashMap<SocketHandle, Slot>>,
        callback: Option<IoCallback>,
        handle: SocketHandle,
        generation: u64,
        errno: i32,
    ) {
        let err = io::Error::from_raw_os_error(errno);
        match accept_recovery(errno) {
            AcceptRecovery::Ignore => {}
            AcceptRecovery::Fatal => {
                self.evict(&mut sockets, handle);
                drop(sockets);
                notify_error(callback, handle, err.to_string());
            }
            AcceptRecovery::Retry => {
                drop(sockets);
                debug!(socket = handle, "accept failed: {}", err);
                self.rearm(handle, generation, IoEventType::ACCEPT);
            }
            AcceptRecovery::Backoff => {
                drop(sockets);
                warn!(socket = handle, backoff = ?ACCEPT_BACKOFF, "accept failed: {}", err);
                thread::sleep(ACCEPT_BACKOFF);
                self.rearm(handle, generation, IoEventType::ACCEPT);
            }
        }
    }

    fn rearm(&self, handle: SocketHandle, generation: u64, kind: IoEventType) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let mut sockets = lock(&self.sockets);
        let Some(slot) = sockets.get_mut(&handle) else {
            return;
        };
        if slot.generation != generation || !slot.ctx.interest.contains(kind) {
            return;
        }
        let result = if kind == IoEventType::READ && !slot.read_armed {
            self.submit_read(slot)
        } else if kind == IoEventType::ACCEPT && !slot.accept_armed {
            self.submit_accept(slot)
        } else {
            Ok(())
        };
        if let Err(e) = result {
            error!(socket = handle, "re-arm failed: {}", e);
        }
    }

    fn worker_loop(&self, index: usize) {
        let efd = self.eventfd.load(Ordering::Acquire);
        let mut counter = [0u8; 8];
        debug!(worker = index, "io_uring worker started");
        loop {
            let n = unsafe { libc::read(efd, counter.as_mut_ptr().cast(), counter.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(worker = index, "eventfd read failed: {}", err);
                break;
            }
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            for (token, result) in self.reap() {
                self.complete(token, result);
            }
        }
        debug!(worker = index, "io_uring worker stopped");
    }
}

/// Next step after a failed accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptRecovery {
    /// Cancelled because the listener was removed.
    Ignore,
    Retry,
    /// Out of descriptors or memory; give the process time to free some.
    Backoff,
    /// The listening socket itself is broken.
    Fatal,
}

fn accept_recovery(errno: i32) -> AcceptRecovery {
    match errno {
        libc::ECANCELED => AcceptRecovery::Ignore,
        libc::EBADF | libc::ENOTSOCK | libc::EINVAL | libc::EOPNOTSUPP => AcceptRecovery::Fatal,
        libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => AcceptRecovery::Backoff,
        _ => AcceptRecovery::Retry,
    }
}

fn notify_error(callback: Option<IoCallback>, handle: SocketHandle, reason: String) {
    debug!(socket = handle, reason = %reason, "Socket context dropped");
    if let Some(callback) = callback {
        deliver(&callback, IoEvent::error(handle, reason));
    }
}

impl Drop for IoUringBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl AsyncIo for IoUringBackend {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn initialize(&self) -> Result<(), IoError> {
        let mut ring_slot = lock(&self.shared.ring);
        if ring_slot.is_some() {
            return Ok(());
        }
        let ring = IoUring::new(self.shared.config.queue_depth).map_err(|source| IoError::Os {
            op: "io_uring_setup",
            source,
        })?;
        let efd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_SEMAPHORE) };
        if efd < 0 {
            return Err(IoError::last_os("eventfd"));
        }
        if let Err(source) = ring.submitter().register_eventfd(efd) {
            sys::close(efd);
            return Err(IoError::Os {
                op: "io_uring_register(eventfd)",
                source,
            });
        }
        self.shared.eventfd.store(efd, Ordering::Release);
        *ring_slot = Some(ring);
        info!(depth = self.shared.config.queue_depth, "io_uring backend initialized");
        Ok(())
    }

    fn shutdown(&self) {
        self.stop_event_loop();
        let Some(ring) = lock(&self.shared.ring).take() else {
            return;
        };
        // Closing the ring ends every outstanding request before the
        // buffers they reference are freed below.
        drop(ring);
        lock(&self.shared.ops).clear();
        let dropped = {
            let mut sockets = lock(&self.shared.sockets);
            let n = sockets.len();
            sockets.clear();
            n
        };
        let efd = self.shared.eventfd.swap(-1, Ordering::AcqRel);
        if efd >= 0 {
            sys::close(efd);
        }
        info!(dropped, "io_uring backend shut down");
    }

    fn add_socket(&self, handle: SocketHandle, interest: IoEventType) -> Result<(), IoError> {
        if lock(&self.shared.ring).is_none() {
            return Err(IoError::NotInitialized);
        }
        let mut sockets = lock(&self.shared.sockets);
        if sockets.contains_key(&handle) {
            return Err(IoError::AlreadyRegistered(handle));
        }
        sockets.insert(handle, Slot {
            ctx: SocketContext::new(handle, interest),
            generation: self.shared.next_generation.fetch_add(1, Ordering::Relaxed),
            read_armed: false,
            accept_armed: false,
            write_in_flight: false,
            tokens: HashSet::new(),
        });
        Ok(())
    }

    fn remove_socket(&self, handle: SocketHandle) -> bool {
        let mut sockets = lock(&self.shared.sockets);
        self.shared.evict(&mut sockets, handle).is_some()
    }

    fn modify_socket(&self, handle: SocketHandle, interest: IoEventType) -> Result<(), IoError> {
        let mut sockets = lock(&self.shared.sockets);
        let slot = sockets.get_mut(&handle).ok_or(IoError::UnknownSocket(handle))?;
        slot.ctx.interest = interest;
        Ok(())
    }

    fn async_read(&self, handle: SocketHandle, callback: IoCallback) -> Result<(), IoError> {
        let mut sockets = lock(&self.shared.sockets);
        let slot = sockets.get_mut(&handle).ok_or(IoError::UnknownSocket(handle))?;
        slot.ctx.callback = Some(callback);
        slot.ctx.interest |= IoEventType::READ;
        if !slot.read_armed {
            self.shared.submit_read(slot)?;
        }
        Ok(())
    }

    fn async_write(&self, handle: SocketHandle, data: Vec<u8>, callback: IoCallback) -> Result<(), IoError> {
        let mut sockets = lock(&self.shared.sockets);
        let slot = sockets.get_mut(&handle).ok_or(IoError::UnknownSocket(handle))?;
        slot.ctx.callback = Some(callback);
        if slot.write_in_flight {
            slot.ctx.write_buffer.extend_from_slice(&data);
            return Ok(());
        }
        self.shared.submit_write(slot, data, 0)
    }

    fn async_accept(&self, listener: SocketHandle, callback: IoCallback) -> Result<(), IoError> {
        let mut sockets = lock(&self.shared.sockets);
        let slot = sockets.get_mut(&listener).ok_or(IoError::UnknownSocket(listener))?;
        slot.ctx.callback = Some(callback);
        slot.ctx.interest |= IoEventType::ACCEPT;
        if !slot.accept_armed {
            self.shared.submit_accept(slot)?;
        }
        Ok(())
    }

    fn start_event_loop(&self) -> Result<(), IoError> {
        if lock(&self.shared.ring).is_none() {
            return Err(IoError::NotInitialized);
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut workers = lock(&self.workers);
        for index in 0..self.shared.config.worker_threads.max(1) {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("io-uring-{}", index))
                .spawn(move || shared.worker_loop(index))
                .map_err(|source| IoError::Os {
                    op: "spawn worker",
                    source,
                })?;
            workers.push(handle);
        }
        info!(workers = workers.len(), "io_uring event loop started");
        Ok(())
    }

    /// Must not be called from a callback; it joins the worker threads.
    fn stop_event_loop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let workers = mem::take(&mut *lock(&self.workers));
        let efd = self.shared.eventfd.load(Ordering::Acquire);
        if efd >= 0 {
            // Semaphore mode: one unit wakes one worker.
            let wake = workers.len() as u64;
            unsafe {
                libc::write(efd, (&wake as *const u64).cast(), mem::size_of::<u64>());
            }
        }
        for worker in workers {
            if worker.join().is_err() {
                error!("io_uring worker panicked");
            }
        }
    }

    fn needs_driver(&self) -> bool {
        false
    }

    fn poll(&self, timeout: Duration) -> Result<usize, IoError> {
        // Workers drain completions; nothing to drive.
        thread::sleep(timeout);
        Ok(0)
    }
}
