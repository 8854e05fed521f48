use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::backend::{AsyncIo, IoConfig, IoError, create_backend};
use crate::event::{IoCallback, IoEvent, IoEventKind, IoEventType, SocketHandle, deliver};

/// How long the driver thread waits in one `poll`.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Callbacks {
    accept: Option<IoCallback>,
    read: Option<IoCallback>,
    write: Option<IoCallback>,
    error: Option<IoCallback>,
}

/// Owns one backend and routes its events to four callback slots by kind.
#[derive(Clone)]
pub struct AsyncIoManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    backend: Arc<dyn AsyncIo>,
    callbacks: RwLock<Callbacks>,
    clients: Mutex<HashSet<SocketHandle>>,
    active: AtomicUsize,
    running: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncIoManager {
    /// Manager over the backend selected at build time.
    pub fn new(config: IoConfig) -> Self {
        Self::with_backend(create_backend(&config))
    }

    pub fn with_backend(backend: Arc<dyn AsyncIo>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                backend,
                callbacks: RwLock::new(Callbacks::default()),
                clients: Mutex::new(HashSet::new()),
                active: AtomicUsize::new(0),
                running: AtomicBool::new(false),
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    pub fn initialize(&self) -> Result<(), IoError> {
        self.inner.backend.initialize()?;
        info!(backend = self.backend_name(), "Async I/O manager initialized");
        Ok(())
    }

    /// Start the backend's event loop, plus a poll driver thread for
    /// readiness backends.
    pub fn start(&self) -> Result<(), IoError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.inner.backend.start_event_loop() {
            self.inner.running.store(false, Ordering::Release);
            return Err(e);
        }
        if self.inner.backend.needs_driver() {
            let inner = Arc::clone(&self.inner);
            let handle = thread::Builder::new()
                .name("io-driver".into())
                .spawn(move || inner.drive())
                .map_err(|source| IoError::Os {
                    op: "spawn driver",
                    source,
                })?;
            *self.inner.driver.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }
        Ok(())
    }

    /// Stop delivering events. Must not be called from an I/O callback.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.backend.stop_event_loop();
        let driver = self.inner.driver.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(driver) = driver {
            if driver.join().is_err() {
                error!("I/O driver thread panicked");
            }
        }
    }

    pub fn shutdown(&self) {
        self.stop();
        self.inner.backend.shutdown();
        let mut clients = self.inner.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.clear();
        self.inner.active.store(0, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Register a listening socket; accepted connections reach the accept
    /// callback.
    pub fn add_listener(&self, listener: SocketHandle) -> Result<(), IoError> {
        self.inner.backend.add_socket(listener, IoEventType::ACCEPT | IoEventType::ERROR)?;
        if let Err(e) = self.inner.backend.async_accept(listener, self.router()) {
            self.inner.backend.remove_socket(listener);
            return Err(e);
        }
        Ok(())
    }

    pub fn remove_listener(&self, listener: SocketHandle) -> bool {
        self.inner.backend.remove_socket(listener)
    }

    /// Register a connected client for reads and count it as active.
    pub fn add_client(&self, handle: SocketHandle) -> Result<(), IoError> {
        self.inner.backend.add_socket(handle, IoEventType::READ | IoEventType::ERROR)?;
        if let Err(e) = self.inner.backend.async_read(handle, self.router()) {
            self.inner.backend.remove_socket(handle);
            return Err(e);
        }
        let mut clients = self.inner.clients.lock().unwrap_or_else(|e| e.into_inner());
        if clients.insert(handle) {
            self.inner.active.fetch_add(1, Ordering::AcqRel);
        }
        debug!(socket = handle, active = clients.len(), "Client registered");
        Ok(())
    }

    /// Deregister a client. Returns false if it was not registered.
    pub fn remove_client(&self, handle: SocketHandle) -> bool {
        // The backend may already have dropped the context after an error.
        self.inner.backend.remove_socket(handle);
        let mut clients = self.inner.clients.lock().unwrap_or_else(|e| e.into_inner());
        if clients.remove(&handle) {
            self.inner.active.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    pub fn async_write(&self, handle: SocketHandle, data: Vec<u8>) -> Result<(), IoError> {
        self.inner.backend.async_write(handle, data, self.router())
    }

    pub fn set_accept_callback(&self, callback: impl Fn(IoEvent) + Send + Sync + 'static) {
        self.callbacks_mut(|cbs| cbs.accept = Some(Arc::new(callback)));
    }

    pub fn set_read_callback(&self, callback: impl Fn(IoEvent) + Send + Sync + 'static) {
        self.callbacks_mut(|cbs| cbs.read = Some(Arc::new(callback)));
    }

    pub fn set_write_callback(&self, callback: impl Fn(IoEvent) + Send + Sync + 'static) {
        self.callbacks_mut(|cbs| cbs.write = Some(Arc::new(callback)));
    }

    pub fn set_error_callback(&self, callback: impl Fn(IoEvent) + Send + Sync + 'static) {
        self.callbacks_mut(|cbs| cbs.error = Some(Arc::new(callback)));
    }

    /// Connected clients. Coarse status only.
    pub fn active_connections(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    fn callbacks_mut(&self, f: impl FnOnce(&mut Callbacks)) {
        let mut callbacks = self.inner.callbacks.write().unwrap_or_else(|e| e.into_inner());
        f(&mut callbacks);
    }

    /// Per-socket callback that forwards into the manager's slots.
    fn router(&self) -> IoCallback {
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.route(event);
            }
        })
    }
}

impl ManagerInner {
    fn route(&self, event: IoEvent) {
        let slot = {
            let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
            match event.kind {
                IoEventKind::Accept { .. } => callbacks.accept.clone(),
                IoEventKind::Read { .. } => callbacks.read.clone(),
                IoEventKind::Write { .. } => callbacks.write.clone(),
                IoEventKind::Error { .. } => callbacks.error.clone(),
            }
        };
        match slot {
            Some(callback) => deliver(&callback, event),
            None => debug!(socket = event.socket, kind = ?event.event_type(), "No callback for event"),
        }
    }

    fn drive(&self) {
        debug!("I/O driver started");
        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.backend.poll(POLL_INTERVAL) {
                warn!("poll failed: {}", e);
                thread::sleep(POLL_INTERVAL);
            }
        }
        debug!("I/O driver stopped");
    }
}

#[cfg(all(test, not(feature = "io-uring")))]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::{AsRawFd, FromRawFd};
    use std::sync::mpsc;

    use crate::epoll::EpollBackend;

    fn manager() -> AsyncIoManager {
        let manager = AsyncIoManager::with_backend(Arc::new(EpollBackend::new(IoConfig::default())));
        manager.initialize().unwrap();
        manager
    }

    #[test]
    fn test_echo_through_callbacks() {
        let manager = manager();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (tx, rx) = mpsc::channel::<String>();
        let tx = Arc::new(Mutex::new(tx));

        let accepted = manager.clone();
        manager.set_accept_callback(move |event| {
            if let IoEventKind::Accept { client, .. } = event.kind {
                accepted.add_client(client).unwrap();
            }
        });
        let echo = manager.clone();
        manager.set_read_callback(move |event| {
            if let IoEventKind::Read { data } = event.kind {
                echo.async_write(event.socket, data).unwrap();
            }
        });
        let errors = tx.clone();
        let closer = manager.clone();
        manager.set_error_callback(move |event| {
            if let IoEventKind::Error { reason } = event.kind {
                closer.remove_client(event.socket);
                drop(unsafe { TcpStream::from_raw_fd(event.socket) });
                let _ = errors.lock().unwrap().send(reason);
            }
        });

        manager.add_listener(listener.as_raw_fd()).unwrap();
        manager.start().unwrap();

        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(manager.active_connections(), 1);

        drop(client);
        let reason = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reason, "Connection closed");
        assert_eq!(manager.active_connections(), 0);

        manager.shutdown();
        assert!(!manager.is_running());
    }

    #[test]
    fn test_remove_unknown_client() {
        let manager = manager();
        assert!(!manager.remove_client(424_242));
        assert_eq!(manager.active_connections(), 0);
    }
}
