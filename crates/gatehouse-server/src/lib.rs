//! Account server: configuration, logging, the message queue and main
//! loop, the TCP front end and the wiring that ties them to the account
//! handlers.

pub mod app;
pub mod config;
pub mod dispatch;
pub mod logging;
pub mod main_loop;
pub mod queue;
pub mod server;
pub mod signals;

pub use app::{AccountServer, GAME_POOL};
pub use config::AppConfig;
pub use dispatch::{DispatchError, HandlerRegistry, HandlerResult};
pub use main_loop::{MainLoop, ResponseSink};
pub use queue::{MessageQueue, QueueError};
pub use server::{NetworkServer, ServerConfig};
