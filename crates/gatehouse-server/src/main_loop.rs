use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, error, info, warn};

use gatehouse_protocol::{Message, OperationResult};

use crate::dispatch::{DispatchError, HandlerRegistry};
use crate::queue::MessageQueue;

/// How long one pop waits before re-checking for shutdown.
const POP_INTERVAL: Duration = Duration::from_millis(100);

/// Delivers a handler's result to the client that sent the message.
pub trait ResponseSink: Send + Sync {
    /// False if the client is gone.
    fn send_response(&self, client_id: &str, result: &OperationResult) -> bool;
}

/// Single consumer of the message queue. Runs every handler on one thread
/// named `main-loop`.
#[derive(Clone)]
pub struct MainLoop {
    inner: Arc<LoopInner>,
}

struct LoopInner {
    queue: Arc<MessageQueue>,
    registry: Arc<HandlerRegistry>,
    responder: RwLock<Option<Arc<dyn ResponseSink>>>,
    running: AtomicBool,
    processed: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MainLoop {
    pub fn new(queue: Arc<MessageQueue>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            inner: Arc::new(LoopInner {
                queue,
                registry,
                responder: RwLock::new(None),
                running: AtomicBool::new(false),
                processed: AtomicU64::new(0),
                thread: Mutex::new(None),
            }),
        }
    }

    pub fn set_responder(&self, responder: Arc<dyn ResponseSink>) {
        *self.inner.responder.write().unwrap_or_else(|e| e.into_inner()) = Some(responder);
    }

    /// Spawn the loop thread. A responder must already be set so no
    /// response is produced without somewhere to send it.
    pub fn start(&self) -> Result<()> {
        if self.inner.responder.read().unwrap_or_else(|e| e.into_inner()).is_none() {
            bail!("main loop started without a responder");
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("main-loop".into())
            .spawn(move || inner.run())
            .context("spawning main loop thread")?;
        *self.inner.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!("Main loop started");
        Ok(())
    }

    /// Shut the queue down, let the loop drain what is left, and join it.
    pub fn stop(&self) {
        self.inner.queue.shutdown();
        let handle = self.inner.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Main loop thread panicked");
            }
        }
        if self.inner.running.swap(false, Ordering::AcqRel) {
            info!(processed = self.processed(), "Main loop stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Messages taken off the queue so far.
    pub fn processed(&self) -> u64 {
        self.inner.processed.load(Ordering::Relaxed)
    }
}

impl LoopInner {
    fn run(&self) {
        debug!("Main loop running");
        loop {
            match self.queue.pop_timeout(POP_INTERVAL) {
                Some(message) => self.process(message),
                None if self.queue.is_shutdown() && self.queue.is_empty() => break,
                None => {}
            }
        }
        debug!("Main loop drained");
    }

    fn process(&self, message: Message) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let message_type = message.message_type();
        let client_id = message.client_id();

        let dispatched = panic::catch_unwind(AssertUnwindSafe(|| self.registry.handle(&message)));
        let response = match dispatched {
            Ok(Ok(response)) => response,
            Ok(Err(DispatchError::HandlerNotFound(kind))) => {
                warn!(client = %client_id, "No handler for {} message, dropped", kind);
                None
            }
            Ok(Err(e)) => {
                error!(client = %client_id, "{}", e);
                Some(OperationResult::service_error(format!("Failed to process {}", message_type)))
            }
            Err(_) => {
                error!(client = %client_id, "Handler for {} message panicked", message_type);
                Some(OperationResult::service_error(format!("Failed to process {}", message_type)))
            }
        };

        let Some(response) = response else {
            return;
        };
        let responder = self.responder.read().unwrap_or_else(|e| e.into_inner()).clone();
        match responder {
            Some(sink) => {
                if !sink.send_response(client_id, &response) {
                    debug!(client = %client_id, "Client gone before response");
                }
            }
            None => warn!(client = %client_id, "No responder set, response dropped"),
        }
    }
}
