use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::require_admin_key,
    client::{AuthClient, ClientConfig},
    engine::{LinkEngine, DEFAULT_BOOT_WAIT},
    events::EventBus,
    gate::{Gate, GateSettings},
    handlers::{health, link, list_modules, reload_modules, status, unlink},
    host::{fs::DirectoryRegistry, main_queue, MainContext, MainLoop},
    store::{crypto, Store},
    tracker::ModuleTracker,
    AppState,
};

/// Lowest acceptable validation period, in multiples of the request timeout.
pub const MIN_PERIOD_TO_TIMEOUT_RATIO: u32 = 20;

pub struct GateConfig {
    pub auth_url: Option<String>,
    pub auth_key: String,
    pub admin_key: Option<String>,
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    pub modules_dir: Option<PathBuf>,
    /// Dependency name that marks a module as a dependent of the gate.
    pub host_module: String,
    pub server_name: String,
    pub host_version: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub initial_delay: Duration,
    pub validation_period: Duration,
    pub boot_wait: Duration,
    /// Persisted as `cache.validation-ttl` when set.
    pub validation_ttl: Option<Duration>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            auth_url: std::env::var("GATEKEEP_AUTH_URL").ok(),
            auth_key: std::env::var("GATEKEEP_AUTH_KEY").unwrap_or_default(),
            admin_key: std::env::var("GATEKEEP_ADMIN_KEY").ok(),
            host: std::env::var("GATEKEEP_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: std::env::var("GATEKEEP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(39990),
            data_dir: std::env::var("GATEKEEP_DATA_DIR").ok().map(PathBuf::from),
            modules_dir: std::env::var("GATEKEEP_MODULES_DIR").ok().map(PathBuf::from),
            host_module: std::env::var("GATEKEEP_HOST_MODULE")
                .unwrap_or_else(|_| "gatekeep".into()),
            server_name: std::env::var("GATEKEEP_SERVER_NAME")
                .unwrap_or_else(|_| "gatekeep-server".into()),
            host_version: std::env::var("GATEKEEP_HOST_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").into()),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            initial_delay: Duration::from_secs(1),
            validation_period: Duration::from_secs(300),
            boot_wait: DEFAULT_BOOT_WAIT,
            validation_ttl: None,
        }
    }
}

impl GateConfig {
    pub fn client_config(&self) -> Result<ClientConfig> {
        let base_url = self
            .auth_url
            .clone()
            .context("GATEKEEP_AUTH_URL is not set")?;
        Ok(ClientConfig {
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            ..ClientConfig::new(base_url, self.auth_key.clone())
        })
    }

    pub fn gate_settings(&self) -> GateSettings {
        GateSettings {
            server_name: self.server_name.clone(),
            host_version: self.host_version.clone(),
            initial_delay: self.initial_delay,
            validation_period: self.validation_period,
        }
    }

    /// Complaint about the timing knobs, if any.
    pub fn timing_warning(&self) -> Option<String> {
        let floor = self.request_timeout * MIN_PERIOD_TO_TIMEOUT_RATIO;
        (self.validation_period < floor).then(|| {
            format!(
                "validation period {:?} is under {}x the request timeout {:?}; periodic checks may overlap",
                self.validation_period, MIN_PERIOD_TO_TIMEOUT_RATIO, self.request_timeout
            )
        })
    }
}

/// Resolve the data directory, creating it if needed.
pub fn resolve_data_dir(configured: Option<&PathBuf>) -> Result<PathBuf> {
    match configured {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

/// Open `gatekeep.db` in `data_dir`, sealing with the key in `gatekeep.key`.
pub fn open_store(data_dir: &Path) -> Result<Store> {
    let key = load_or_create_key(data_dir)?;
    Store::open(&data_dir.join("gatekeep.db"), key).context("open store")
}

fn load_or_create_key(data_dir: &Path) -> Result<crypto::EncryptionKey> {
    let key_path = data_dir.join("gatekeep.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("read gatekeep.key")?;
        crypto::load_key(&bytes).ok_or_else(|| {
            anyhow::anyhow!(
                "gatekeep.key is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let key = crypto::generate_key();
        std::fs::write(&key_path, key.as_bytes()).context("write gatekeep.key")?;
        info!("generated new storage key");
        Ok(key)
    }
}

/// Wire the store, client, engine, module registry and tracker into a
/// [`Gate`]. The returned [`MainLoop`] must be driven by the caller's main
/// context.
pub fn build(cfg: &GateConfig) -> Result<(Arc<Gate>, MainLoop)> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let store = open_store(&data_dir)?;
    let client = AuthClient::new(cfg.client_config()?)?;
    let events = EventBus::new();

    let engine = LinkEngine::new(client, store)?
        .with_events(events.clone())
        .with_boot_wait(cfg.boot_wait);
    if let Some(ttl) = cfg.validation_ttl {
        engine.set_validation_ttl(ttl)?;
    }
    let engine = Arc::new(engine);

    let modules_dir = cfg
        .modules_dir
        .clone()
        .unwrap_or_else(|| data_dir.join("modules"));
    let registry = Arc::new(DirectoryRegistry::load(modules_dir)?);

    let (queue, main_loop) = main_queue();
    let main: Arc<dyn MainContext> = Arc::new(queue);

    let tracker = Arc::new(
        ModuleTracker::new(
            cfg.host_module.clone(),
            registry,
            Arc::clone(&engine),
            Arc::clone(&main),
        )
        .with_events(events.clone()),
    );

    if let Some(warning) = cfg.timing_warning() {
        warn!("{warning}");
    }

    let gate = Arc::new(Gate::new(engine, tracker, main, events, cfg.gate_settings()));
    Ok((gate, main_loop))
}

pub fn router(state: AppState) -> Router {
    // Public routes (no auth required).
    let public = Router::new().route("/health", get(health));

    // Operator routes (admin key required if configured).
    let protected = Router::new()
        .route("/status", get(status))
        .route("/link", post(link))
        .route("/unlink", post(unlink))
        .route("/modules", get(list_modules))
        .route("/modules/reload", post(reload_modules))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_key,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the operator API until `shutdown` resolves.
pub async fn run(
    cfg: &GateConfig,
    gate: Arc<Gate>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let state = AppState {
        gate,
        admin_key: cfg.admin_key.clone(),
    };
    if state.admin_key.is_none() {
        warn!("GATEKEEP_ADMIN_KEY is not set; operator routes are unauthenticated");
    }

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "gatekeep operator api listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")
}
