//! Process bootstrap: open backends, seed the shared store, start the hub
//! tasks and serve HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{Authenticator, TokenAuthenticator};
use crate::bootstrap::seed_shared_store;
use crate::config::ServerConfig;
use crate::connection::ConnectionSettings;
use crate::db::SqlitePersistence;
use crate::hub::{Hub, HubState, Registry, listener, refresh};
use crate::membership::MembershipService;
use crate::persistence::Persistence;
use crate::store::{EventBus, MembershipStore, MemoryStore, RedisStore};
use crate::types::InstanceId;
use crate::web::{AppState, router};

/// Shared store, event bus and persistence used by one server.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn MembershipStore>,
    pub bus: Arc<dyn EventBus>,
    pub persistence: Arc<dyn Persistence>,
}

impl Backends {
    /// Open what the configuration names. Redis when `--redis-url` is set,
    /// otherwise an in-process store that only this instance sees.
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        tracing::info!("Opening database: {}", config.db_path);
        let persistence = if config.db_path == ":memory:" {
            SqlitePersistence::open_memory()
        } else {
            SqlitePersistence::open(&config.db_path)
        }
        .context("Failed to open database")?;
        let persistence: Arc<dyn Persistence> = Arc::new(persistence);

        match &config.redis_url {
            Some(url) => {
                let redis = Arc::new(
                    RedisStore::connect(url)
                        .await
                        .context("Failed to connect to Redis")?,
                );
                Ok(Self {
                    store: redis.clone(),
                    bus: redis,
                    persistence,
                })
            }
            None => {
                tracing::warn!("No --redis-url given; running single-instance with an in-process store");
                let memory = Arc::new(MemoryStore::new());
                Ok(Self {
                    store: memory.clone(),
                    bus: memory,
                    persistence,
                })
            }
        }
    }
}

/// A started server.
pub struct Running {
    pub addr: SocketAddr,
    pub hub: Hub,
    pub backends: Backends,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<Result<()>>,
}

impl Running {
    /// Stop every background task and wait for the HTTP server to exit.
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.handle.await.context("HTTP task panicked")?
    }
}

pub struct Server {
    config: ServerConfig,
    backends: Option<Backends>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config, backends: None }
    }

    /// Create a server over existing backends (for testing several
    /// instances against one store).
    pub fn with_backends(config: ServerConfig, backends: Backends) -> Self {
        Self {
            config,
            backends: Some(backends),
        }
    }

    /// Run the server until the HTTP listener fails.
    pub async fn run(self) -> Result<()> {
        let running = self.start().await?;
        running.handle.await.context("HTTP task panicked")?
    }

    /// Start every task and return the bound address plus handles.
    pub async fn start(self) -> Result<Running> {
        let config = self.config;
        let backends = match self.backends {
            Some(backends) => backends,
            None => Backends::connect(&config).await?,
        };

        seed_shared_store(backends.persistence.as_ref(), backends.store.as_ref()).await?;

        // Subscribe before serving so no event published after startup is missed.
        let frames = backends
            .bus
            .subscribe()
            .await
            .context("Failed to subscribe to the event bus")?;

        let instance = config.instance_id.unwrap_or_else(InstanceId::new);
        let (hub, hub_loop) = Hub::new(
            HubState {
                instance,
                store: Arc::clone(&backends.store),
                bus: Arc::clone(&backends.bus),
                persistence: Arc::clone(&backends.persistence),
                registry: Arc::new(Registry::new()),
                ownership_ttl: config.ownership_ttl(),
            },
            config.hub_queue,
        );

        let shutdown = CancellationToken::new();
        tokio::spawn(hub_loop.run(shutdown.clone()));
        tokio::spawn(listener::run(Arc::clone(hub.state()), frames, shutdown.clone()));
        tokio::spawn(refresh::run(
            Arc::clone(hub.state()),
            config.refresh_interval(),
            shutdown.clone(),
        ));

        if config.token_secret.is_empty() {
            tracing::warn!("Token secret is empty; bearer tokens are trivially forgeable");
        }
        let auth: Arc<dyn Authenticator> = Arc::new(TokenAuthenticator::new(&config.token_secret));
        let app = Arc::new(AppState {
            membership: MembershipService::new(
                Arc::clone(&backends.persistence),
                Arc::clone(&backends.store),
                hub.clone(),
            ),
            hub: hub.clone(),
            auth,
            settings: ConnectionSettings::from(&config),
            max_frame_bytes: config.max_frame_bytes,
        });

        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
        let addr = listener.local_addr()?;
        tracing::info!(%instance, "HTTP/WebSocket listener on {addr}");

        let serve_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router(app))
                .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
                .await
                .context("HTTP server error")
        });

        Ok(Running {
            addr,
            hub,
            backends,
            shutdown,
            handle,
        })
    }
}
