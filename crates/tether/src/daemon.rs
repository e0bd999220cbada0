//! Daemon wiring: builds every component from [`AppConfig`] and tears them
//! down again.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tether_protocol::state::DaemonConfigInfo;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentEngine, build_engine};
use crate::api::{self, AppState};
use crate::config::{AppConfig, DaemonPaths};
use crate::db::Database;
use crate::events::DaemonEvent;
use crate::hub::{
    InProcessHub, InProcessTransport, MessageHub, Transport, Unsubscribe, WebSocketServerTransport,
};
use crate::pairs::PairRepository;
use crate::rpc::{self, RpcContext};
use crate::session::{
    CharRatioEstimator, CompactionPolicy, MessageRepository, SessionManager, SessionOptions,
    SessionRepository, SessionServices,
};
use crate::settings::SettingsRepository;
use crate::state::StateManager;
use crate::worktree::WorktreeManager;

const WEBSOCKET_TRANSPORT: &str = "websocket";

/// Owns the hubs, repositories, managers and background tasks.
pub struct DaemonContext {
    pub config: AppConfig,
    pub db: Database,
    pub hub: MessageHub,
    pub events: InProcessHub<DaemonEvent>,
    pub sessions: Arc<SessionManager>,
    pub state: Arc<StateManager>,
    pub worktrees: Arc<WorktreeManager>,
    pub ws: Arc<WebSocketServerTransport>,
    registrations: Mutex<Vec<Unsubscribe>>,
    sweep: CancellationToken,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl DaemonContext {
    /// Open the database under `paths` and build the daemon with the
    /// configured agent engine.
    pub async fn open(config: AppConfig, paths: &DaemonPaths) -> Result<Arc<Self>> {
        let db = Database::new(&paths.database()).await?;
        let engine = build_engine(&config.agent);
        Self::build(config, db, &paths.worktree_dir, engine).await
    }

    pub async fn build(
        config: AppConfig,
        db: Database,
        worktree_dir: &Path,
        engine: Arc<dyn AgentEngine>,
    ) -> Result<Arc<Self>> {
        let pool = db.pool().clone();

        let events = InProcessHub::new();
        events
            .initialize()
            .context("starting in-process event hub")?;

        let settings = SettingsRepository::new(pool.clone());
        let worktrees = Arc::new(WorktreeManager::new(worktree_dir));
        let services = Arc::new(SessionServices {
            pool: pool.clone(),
            sessions: SessionRepository::new(pool.clone()),
            messages: MessageRepository::new(pool.clone()),
            settings: settings.clone(),
            worktrees: Arc::clone(&worktrees),
            engine,
            events: events.clone(),
            estimator: Arc::new(CharRatioEstimator::new(config.context.chars_per_token)),
            options: session_options(&config),
        });
        let sessions = Arc::new(SessionManager::new(services));

        let hub = MessageHub::new(config.hub.request_timeout());
        let state = StateManager::new(
            hub.clone(),
            Arc::clone(&sessions),
            settings.clone(),
            config_info(&config),
            config.state.delta_log_capacity,
        );
        state.start(&events);

        let ws = WebSocketServerTransport::new(WEBSOCKET_TRANSPORT);
        let mut registrations =
            vec![hub.register_transport(ws.clone(), WEBSOCKET_TRANSPORT, true)];
        ws.initialize()
            .await
            .context("starting WebSocket transport")?;

        let rpc_context = RpcContext {
            hub: hub.clone(),
            sessions: Arc::clone(&sessions),
            state: Arc::clone(&state),
            settings,
            pairs: PairRepository::new(pool),
            worktrees: Arc::clone(&worktrees),
            events: events.clone(),
        };
        registrations.extend(rpc::register_all(&hub, &rpc_context));

        let daemon = Arc::new(Self {
            config,
            db,
            hub,
            events,
            sessions,
            state,
            worktrees,
            ws,
            registrations: Mutex::new(registrations),
            sweep: CancellationToken::new(),
            sweep_task: Mutex::new(None),
        });
        daemon.start_orphan_sweep();
        info!("Daemon context ready");
        Ok(daemon)
    }

    /// HTTP router serving `/ws` and `/health`.
    pub fn router(&self) -> axum::Router {
        api::create_router(AppState {
            ws: Arc::clone(&self.ws),
            state: Arc::clone(&self.state),
        })
    }

    /// A client hub wired to the daemon hub through an in-process transport.
    /// The daemon sees it as connection `name`.
    pub async fn connect_in_process(&self, name: &str) -> Result<MessageHub> {
        let (server_end, client_end) = InProcessTransport::pair(&format!("daemon:{name}"), name);
        let registration = self
            .hub
            .register_transport(server_end.clone(), &format!("in-process:{name}"), false);
        self.lock_registrations().push(registration);

        let client = MessageHub::new(self.config.hub.request_timeout());
        let _ = client.register_transport(client_end.clone(), "in-process", true);
        server_end.initialize().await?;
        client_end.initialize().await?;
        debug!(connection = %name, "Connected in-process client");
        Ok(client)
    }

    fn lock_registrations(&self) -> std::sync::MutexGuard<'_, Vec<Unsubscribe>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn start_orphan_sweep(self: &Arc<Self>) {
        if !self.config.worktree.enabled || self.config.worktree.sweep_interval_secs == 0 {
            return;
        }
        let period = Duration::from_secs(self.config.worktree.sweep_interval_secs);
        let sessions = Arc::clone(&self.sessions);
        let worktrees = Arc::clone(&self.worktrees);
        let cancel = self.sweep.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => sweep_orphans(&sessions, &worktrees).await,
                    _ = cancel.cancelled() => break,
                }
            }
            debug!("Orphan sweep stopped");
        });
        *self
            .sweep_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Close the hub and its transports, then destroy live sessions and stop
    /// background work.
    pub async fn cleanup(&self) {
        info!("Cleaning up daemon context");
        self.hub.cleanup().await;
        let registrations = std::mem::take(&mut *self.lock_registrations());
        registrations.into_iter().for_each(Unsubscribe::unsubscribe);

        self.sessions.cleanup_all().await;

        self.sweep.cancel();
        let task = self
            .sweep_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.state.stop();
        self.events.close();
        info!("Daemon context cleaned up");
    }
}

async fn sweep_orphans(sessions: &SessionManager, worktrees: &WorktreeManager) {
    let repos = match sessions.services().sessions.worktree_repositories().await {
        Ok(repos) => repos,
        Err(e) => {
            warn!(error = %e, "Failed to list repositories for orphan sweep");
            return;
        }
    };
    for repo in repos {
        if let Err(e) = worktrees
            .cleanup_orphaned_worktrees(&PathBuf::from(&repo))
            .await
        {
            warn!(repo = %repo, error = %format!("{e:#}"), "Orphan sweep failed");
        }
    }
}

fn session_options(config: &AppConfig) -> SessionOptions {
    SessionOptions {
        default_model: config.agent.default_model.clone(),
        context_capacity: config.agent.context_capacity,
        compaction: CompactionPolicy {
            token_limit: config.context.token_limit,
            keep_recent: config.context.keep_recent,
        },
        worktrees_enabled: config.worktree.enabled,
        ..Default::default()
    }
}

fn config_info(config: &AppConfig) -> DaemonConfigInfo {
    DaemonConfigInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        default_model: config.agent.default_model.clone(),
        engine: config.agent.engine.clone(),
        auth_method: config.agent.auth_method.clone(),
        context_capacity: config.agent.context_capacity,
        worktrees_enabled: config.worktree.enabled,
    }
}
