use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use gatehouse_api::{ACCOUNT_POOL, AccountHandlers, AccountService};
use gatehouse_db::{ConnectionFactory, DatabaseManager};
use gatehouse_io::IoConfig;
use gatehouse_protocol::{MessageType, ids};

use crate::config::AppConfig;
use crate::dispatch::HandlerRegistry;
use crate::main_loop::MainLoop;
use crate::queue::MessageQueue;
use crate::server::{NetworkServer, ServerConfig};

pub const GAME_POOL: &str = "game";

/// The assembled account server: database pools, handlers, main loop and
/// network front end, started in dependency order.
pub struct AccountServer {
    db: Arc<DatabaseManager>,
    accounts: Arc<AccountService>,
    main_loop: MainLoop,
    network: NetworkServer,
}

impl AccountServer {
    pub fn start(config: &AppConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        let db = Arc::new(DatabaseManager::initialize(
            &[
                (ACCOUNT_POOL.to_string(), config.account_db.clone()),
                (GAME_POOL.to_string(), config.game_db.clone()),
            ],
            factory,
        ));
        if !db.has_pool(ACCOUNT_POOL) {
            db.shutdown();
            bail!("account database pool failed to initialize");
        }
        if !db.has_pool(GAME_POOL) {
            info!("Running without a game database pool");
        }

        let accounts = Arc::new(AccountService::new(Arc::clone(&db)));
        if let Err(e) = accounts.ensure_schema() {
            db.shutdown();
            return Err(e.context("preparing account schema"));
        }

        let handlers = AccountHandlers::new(Arc::clone(&accounts), config.security);
        let registry = Arc::new(HandlerRegistry::new());
        register_handlers(&registry, handlers);

        let queue = Arc::new(MessageQueue::new(config.performance.queue_capacity));
        let server_config = ServerConfig {
            host: config.server.host.clone(),
            port: config.server.port,
            max_connections: config.server.max_connections,
            max_client_buffer: config.performance.max_client_buffer,
            io: IoConfig {
                read_chunk: config.performance.receive_buffer_size,
                worker_threads: config.performance.thread_pool_size,
                ..IoConfig::default()
            },
        };
        let network = match NetworkServer::start(server_config, Arc::clone(&queue)).context("starting network server") {
            Ok(network) => network,
            Err(e) => {
                db.shutdown();
                return Err(e);
            }
        };

        // Requests accepted before the loop starts wait in the queue.
        let main_loop = MainLoop::new(queue, registry);
        main_loop.set_responder(network.responder());
        if let Err(e) = main_loop.start() {
            network.stop();
            db.shutdown();
            return Err(e);
        }

        info!(
            name = %config.server.server_name,
            address = %network.local_addr(),
            "Account server started"
        );
        Ok(Self {
            db,
            accounts,
            main_loop,
            network,
        })
    }

    pub fn accounts(&self) -> &Arc<AccountService> {
        &self.accounts
    }

    pub fn database(&self) -> &Arc<DatabaseManager> {
        &self.db
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.network.local_addr()
    }

    /// Close the listener and every client, drain the main loop, then close
    /// the pools. Responses for drained requests go nowhere.
    pub fn stop(&self) {
        self.network.stop();
        self.main_loop.stop();
        for stats in self.db.stats() {
            info!("{}", stats);
        }
        self.db.shutdown();
        info!(processed = self.main_loop.processed(), "Account server stopped");
    }
}

fn register_handlers(registry: &HandlerRegistry, handlers: AccountHandlers) {
    let h = handlers.clone();
    registry.on_login(move |m| Ok(Some(h.login(m))));
    let h = handlers.clone();
    registry.on_register(move |m| Ok(Some(h.register(m))));
    let h = handlers.clone();
    registry.on_message(MessageType::Logout, move |m| Ok(Some(h.logout(m))));
    let h = handlers.clone();
    registry.on_message(MessageType::QueryData, move |m| Ok(Some(h.query_data(m))));
    registry.on_message(MessageType::Custom, move |m| {
        if m.message_id == ids::HEARTBEAT {
            return Ok(Some(handlers.heartbeat(m)));
        }
        debug!(client = %m.meta.client_id, id = m.message_id, "Ignoring unknown message id");
        Ok(None)
    });
}
