use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::{Context, Result, anyhow};
use bytes::{Buf, BytesMut};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, warn};

use gatehouse_io::{AsyncIoManager, IoConfig, IoEvent, IoEventKind, SocketHandle};
use gatehouse_protocol::{Message, MessageHeader, OperationResult, is_complete_message, legacy, parse_message};

use crate::main_loop::ResponseSink;
use crate::queue::{MessageQueue, QueueError};

const LISTEN_BACKLOG: i32 = 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    /// Unparsed bytes a client may leave buffered before it is dropped.
    pub max_client_buffer: usize,
    pub io: IoConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            max_connections: 1000,
            max_client_buffer: 64 * 1024,
            io: IoConfig::default(),
        }
    }
}

/// Which protocol a client speaks. Decided by its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientMode {
    Undetermined,
    Framed,
    Text,
}

struct ClientState {
    socket: Socket,
    peer: Option<SocketAddr>,
    buffer: BytesMut,
    mode: ClientMode,
}

/// What one read produced for a client.
#[derive(Default)]
struct Extracted {
    messages: Vec<Message>,
    rejected_lines: usize,
    overflow: bool,
}

/// TCP front end: accepts clients through the async I/O manager, turns
/// their bytes into [`Message`]s for the queue and writes responses back.
#[derive(Clone)]
pub struct NetworkServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    listener: Socket,
    local_addr: SocketAddr,
    io: AsyncIoManager,
    queue: Arc<MessageQueue>,
    clients: Mutex<HashMap<SocketHandle, ClientState>>,
    stopped: AtomicBool,
}

impl NetworkServer {
    /// Bind, listen and start delivering client messages into `queue`.
    pub fn start(config: ServerConfig, queue: Arc<MessageQueue>) -> Result<Self> {
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .with_context(|| format!("resolving {}:{}", config.host, config.port))?
            .next()
            .ok_or_else(|| anyhow!("no address for {}:{}", config.host, config.port))?;

        let listener = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        listener.set_reuse_address(true)?;
        listener.set_nonblocking(true)?;
        listener
            .bind(&SockAddr::from(addr))
            .with_context(|| format!("binding {}", addr))?;
        listener.listen(LISTEN_BACKLOG).context("listen")?;
        let local_addr = listener
            .local_addr()?
            .as_socket()
            .ok_or_else(|| anyhow!("listener has no inet address"))?;

        let io = AsyncIoManager::new(config.io.clone());
        io.initialize().context("initializing async I/O")?;

        let inner = Arc::new(ServerInner {
            config,
            listener,
            local_addr,
            io: io.clone(),
            queue,
            clients: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        io.set_accept_callback(with_server(&weak, ServerInner::on_accept));
        io.set_read_callback(with_server(&weak, ServerInner::on_read));
        io.set_write_callback(|event| {
            if let IoEventKind::Write { bytes } = event.kind {
                debug!(client = event.socket, bytes, "Write complete");
            }
        });
        io.set_error_callback(with_server(&weak, ServerInner::on_error));

        io.add_listener(inner.listener.as_raw_fd())
            .context("registering listener")?;
        io.start().context("starting I/O event loop")?;

        info!(
            address = %local_addr,
            backend = io.backend_name(),
            max_connections = inner.config.max_connections,
            "Network server listening"
        );
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients().len()
    }

    /// Queue `result` for the client. False if the client is gone.
    pub fn send(&self, client: SocketHandle, result: &OperationResult) -> bool {
        self.inner.send(client, result)
    }

    /// Sink the main loop uses to answer clients. Holds the server weakly.
    pub fn responder(&self) -> Arc<dyn ResponseSink> {
        Arc::new(Responder {
            server: Arc::downgrade(&self.inner),
        })
    }

    /// Stop accepting, stop the event loop and close every client.
    /// Must not be called from an I/O callback.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.io.remove_listener(self.inner.listener.as_raw_fd());
        self.inner.io.shutdown();
        let closed: Vec<ClientState> = self.inner.clients().drain().map(|(_, state)| state).collect();
        info!(clients = closed.len(), "Network server stopped");
    }
}

/// Adapt a `ServerInner` method into an I/O callback that does nothing once
/// the server is gone.
fn with_server(
    weak: &Weak<ServerInner>,
    f: fn(&ServerInner, IoEvent),
) -> impl Fn(IoEvent) + Send + Sync + 'static {
    let weak = weak.clone();
    move |event| {
        if let Some(inner) = weak.upgrade() {
            f(&inner, event);
        }
    }
}

impl ServerInner {
    fn clients(&self) -> MutexGuard<'_, HashMap<SocketHandle, ClientState>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_accept(&self, event: IoEvent) {
        let IoEventKind::Accept { client, peer } = event.kind else {
            return;
        };
        // The accepted descriptor is ours from here on; dropping the socket closes it.
        let socket = unsafe { Socket::from_raw_fd(client) };
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        {
            let mut clients = self.clients();
            if clients.len() >= self.config.max_connections {
                warn!(peer = ?peer, limit = self.config.max_connections, "Connection limit reached, rejecting client");
                return;
            }
            if let Err(e) = socket.set_nodelay(true) {
                debug!(client, "set_nodelay failed: {}", e);
            }
            clients.insert(
                client,
                ClientState {
                    socket,
                    peer,
                    buffer: BytesMut::with_capacity(self.config.io.read_chunk),
                    mode: ClientMode::Undetermined,
                },
            );
        }

        if let Err(e) = self.io.add_client(client) {
            warn!(client, "Failed to register client: {}", e);
            self.clients().remove(&client);
            return;
        }
        info!(client, peer = ?peer, "Client connected");
    }

    fn on_read(&self, event: IoEvent) {
        let IoEventKind::Read { data } = event.kind else {
            return;
        };
        let client = event.socket;
        let extracted = {
            let mut clients = self.clients();
            let Some(state) = clients.get_mut(&client) else {
                return;
            };
            state.buffer.extend_from_slice(&data);
            extract(state, client, self.config.max_client_buffer)
        };

        for _ in 0..extracted.rejected_lines {
            self.send(client, &OperationResult::invalid_format("Invalid request format"));
        }
        for message in extracted.messages {
            match self.queue.push(message) {
                Ok(()) => {}
                Err(QueueError::Full) => {
                    warn!(client, "Message queue full, rejecting request");
                    self.send(client, &OperationResult::service_error("Server busy"));
                }
                Err(QueueError::Shutdown) => {
                    debug!(client, "Message queue shut down, request dropped");
                }
            }
        }
        if extracted.overflow {
            warn!(client, limit = self.config.max_client_buffer, "Client buffer overflow, disconnecting");
            self.disconnect(client, "buffer overflow");
        }
    }

    fn on_error(&self, event: IoEvent) {
        if let IoEventKind::Error { reason } = event.kind {
            self.disconnect(event.socket, &reason);
        }
    }

    fn send(&self, client: SocketHandle, result: &OperationResult) -> bool {
        let mode = match self.clients().get(&client) {
            Some(state) => state.mode,
            None => return false,
        };
        let bytes = match mode {
            ClientMode::Text => result.to_line().into_bytes(),
            ClientMode::Framed | ClientMode::Undetermined => result.to_frame().serialize(),
        };
        match self.io.async_write(client, bytes) {
            Ok(()) => true,
            Err(e) => {
                debug!(client, "Write failed: {}", e);
                false
            }
        }
    }

    fn disconnect(&self, client: SocketHandle, reason: &str) {
        let state = self.clients().remove(&client);
        self.io.remove_client(client);
        if let Some(state) = state {
            info!(client, peer = ?state.peer, reason, "Client disconnected");
            drop(state.socket);
        }
    }
}

/// Pull every complete request out of the client's buffer.
fn extract(state: &mut ClientState, client: SocketHandle, limit: usize) -> Extracted {
    let mut out = Extracted::default();
    if state.mode == ClientMode::Undetermined {
        let Some(&first) = state.buffer.first() else {
            return out;
        };
        state.mode = if legacy::is_text_start(first) {
            ClientMode::Text
        } else {
            ClientMode::Framed
        };
        debug!(client, mode = ?state.mode, "Client protocol detected");
    }

    let client_id = client.to_string();
    match state.mode {
        ClientMode::Framed => {
            while is_complete_message(&state.buffer) {
                let Some(frame) = parse_message(&state.buffer) else {
                    break;
                };
                state.buffer.advance(frame.total_size());
                out.messages.push(Message::from_network(&frame, client_id.as_str()));
            }
            // A header announcing more than the limit can never complete.
            if let Ok(header) = MessageHeader::deserialize(&state.buffer) {
                if header.total_size() > limit {
                    out.overflow = true;
                }
            }
        }
        ClientMode::Text => {
            while let Some(end) = state.buffer.iter().position(|&b| b == b'\n') {
                let line = state.buffer.split_to(end + 1);
                let text = String::from_utf8_lossy(&line[..end]);
                if text.trim().is_empty() {
                    continue;
                }
                match legacy::parse_line(&text, &client_id) {
                    Some(message) => out.messages.push(message),
                    None => out.rejected_lines += 1,
                }
            }
        }
        ClientMode::Undetermined => {}
    }

    if state.buffer.len() > limit {
        out.overflow = true;
    }
    out
}

struct Responder {
    server: Weak<ServerInner>,
}

impl ResponseSink for Responder {
    fn send_response(&self, client_id: &str, result: &OperationResult) -> bool {
        let Ok(client) = client_id.parse::<SocketHandle>() else {
            warn!(client = client_id, "Response for malformed client id dropped");
            return false;
        };
        match self.server.upgrade() {
            Some(server) => server.send(client, result),
            None => false,
        }
    }
}
