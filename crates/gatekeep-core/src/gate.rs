//! Lifecycle and operator surface over the engine and the tracker.
//!
//! The binary builds one [`Gate`] and hands `Arc<Gate>` to everything that
//! needs it; there is no process-wide accessor.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::client::LinkOutcome;
use crate::engine::LinkEngine;
use crate::error::{GateError, GateResult};
use crate::events::{EventBus, GateEvent};
use crate::fingerprint::content_identity;
use crate::host::{HostModule, MainContext};
use crate::scheduler::{spawn_after, spawn_periodic, ScheduledTask};
use crate::tracker::{run_blocking, ModuleTracker, ScanMode, ValidationSummary};

#[derive(Debug, Clone)]
pub struct GateSettings {
    /// Reported to the authorization service when linking.
    pub server_name: String,
    pub host_version: String,
    /// Delay before the first post-boot scan and validation.
    pub initial_delay: Duration,
    pub validation_period: Duration,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            server_name: "gatekeep-server".into(),
            host_version: env!("CARGO_PKG_VERSION").into(),
            initial_delay: Duration::from_secs(1),
            validation_period: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleEntry {
    pub name: String,
    pub identity: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModuleStatus {
    pub authorized: Vec<ModuleEntry>,
    pub unauthorized: Vec<ModuleEntry>,
}

pub struct Gate {
    engine: Arc<LinkEngine>,
    tracker: Arc<ModuleTracker>,
    main: Arc<dyn MainContext>,
    events: EventBus,
    settings: GateSettings,
    startup: Mutex<Option<ScheduledTask>>,
    periodic: Mutex<Option<ScheduledTask>>,
}

impl Gate {
    pub fn new(
        engine: Arc<LinkEngine>,
        tracker: Arc<ModuleTracker>,
        main: Arc<dyn MainContext>,
        events: EventBus,
        settings: GateSettings,
    ) -> Self {
        Self {
            engine,
            tracker,
            main,
            events,
            settings,
            startup: Mutex::new(None),
            periodic: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<LinkEngine> {
        &self.engine
    }

    pub fn tracker(&self) -> &Arc<ModuleTracker> {
        &self.tracker
    }

    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.events.subscribe()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Boot phase, before the async runtime exists. Confirms a persisted
    /// link with a blocking validation, then blocks on startup-phase
    /// modules. An unreachable service keeps the persisted link.
    pub fn on_load(&self) {
        if !self.engine.is_linked() {
            warn!("installation is not linked; modules requiring the gate may fail to load");
            warn!("link it with: gatekeepd link <token>");
            return;
        }

        match self.engine.validate_server_link_sync() {
            Ok(true) => info!("installation validated at boot"),
            Ok(false) => {
                error!("installation link was rejected; re-link with: gatekeepd link <token>");
                return;
            }
            Err(e) => warn!(error = %e, "could not validate installation at boot; keeping current state"),
        }

        info!("pre-validating startup modules");
        let authorized = self.tracker.scan_and_validate_startup_modules();
        info!(authorized, "startup modules validated");
    }

    /// Schedule the first scan after `initial_delay` and the periodic
    /// re-validation. Must run inside the runtime.
    pub fn on_enable(self: &Arc<Self>) {
        let gate = Arc::clone(self);
        let startup = spawn_after(self.settings.initial_delay, async move {
            gate.initial_pass().await;
        });

        let gate = Arc::clone(self);
        let period = self.settings.validation_period;
        let periodic = spawn_periodic(period, period, move || {
            let gate = Arc::clone(&gate);
            async move {
                gate.periodic_pass().await;
            }
        });

        replace_task(&self.startup, startup);
        replace_task(&self.periodic, periodic);
        info!(period_secs = period.as_secs(), "gate enabled");
    }

    /// Stop scheduled work and drop cached verdicts.
    pub fn on_disable(&self) {
        for slot in [&self.startup, &self.periodic] {
            if let Some(task) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                task.cancel();
            }
        }
        self.engine.clear_cache();
        info!("gate disabled");
    }

    /// Merge-scan, then validate the link and, when valid, the dependents.
    pub async fn initial_pass(&self) {
        self.tracker.scan_async(ScanMode::Merge).await;

        if !self.engine.is_linked() {
            warn!("installation is not linked; use `gatekeepd link <token>` to link it");
            return;
        }

        info!("installation is linked; validating");
        match self.engine.validate_server_link().await {
            Ok(true) => {
                info!("installation validated");
                self.tracker.validate_dependent_modules().await;
            }
            Ok(false) => warn!("installation validation failed; please re-link"),
            Err(e) => warn!(error = %e, "could not validate installation; keeping current state"),
        }
    }

    /// One periodic tick. Returns the dependents summary when the link
    /// validated.
    pub async fn periodic_pass(&self) -> Option<ValidationSummary> {
        if !self.engine.is_linked() {
            return None;
        }
        match self.engine.validate_server_link().await {
            Ok(true) => Some(self.tracker.validate_dependent_modules().await),
            Ok(false) => {
                warn!("installation is no longer linked");
                None
            }
            Err(e) => {
                warn!(error = %e, "periodic validation skipped");
                None
            }
        }
    }

    // ── Operator commands ───────────────────────────────────────────────────

    /// Link the installation; on success, validate dependents right away.
    pub async fn link(&self, token: &str) -> GateResult<LinkOutcome> {
        let outcome = self
            .engine
            .link_server(token, &self.settings.server_name, &self.settings.host_version)
            .await?;
        if outcome.ok() {
            self.tracker.scan_async(ScanMode::Merge).await;
            self.tracker.validate_dependent_modules().await;
        }
        Ok(outcome)
    }

    pub fn unlink(&self) -> GateResult<()> {
        self.engine.unlink()
    }

    /// Clear-then-rebuild the module table and re-check everything.
    pub async fn reload_modules(&self) -> ValidationSummary {
        let found = self.tracker.scan_async(ScanMode::Rebuild).await;
        info!(found, "module table rebuilt");
        if self.engine.is_linked() {
            self.tracker.validate_dependent_modules().await
        } else {
            ValidationSummary::default()
        }
    }

    /// Authorized and unauthorized modules by name; an identity with no live
    /// module is listed under the identity itself.
    pub async fn module_status(&self) -> ModuleStatus {
        let live = self.tracker.live_identities_async().await;
        let mut status = ModuleStatus::default();
        for (identity, record) in self.tracker.all_records() {
            let entry = ModuleEntry {
                name: live.get(&identity).cloned().unwrap_or_else(|| identity.clone()),
                identity,
            };
            if record.authorized {
                status.authorized.push(entry);
            } else {
                status.unauthorized.push(entry);
            }
        }
        status
    }

    // ── API for dependent modules ───────────────────────────────────────────

    pub fn is_server_linked(&self) -> bool {
        self.engine.is_linked()
    }

    pub async fn is_module_authorized_by_identity(&self, identity: &str) -> bool {
        self.engine.is_plugin_authorized(identity).await
    }

    pub async fn validate_server(&self) -> GateResult<bool> {
        self.engine.validate_server_link().await
    }

    /// Self-check for a dependent module: after `delay`, disable it unless
    /// the installation is linked and the module's identity is entitled.
    pub fn require_authorization(
        self: &Arc<Self>,
        module: Arc<dyn HostModule>,
        delay: Duration,
    ) -> ScheduledTask {
        let gate = Arc::clone(self);
        spawn_after(delay, async move {
            info!(module = %module.name(), "starting authorization check");

            if !gate.is_server_linked() {
                error!(module = %module.name(), "installation is not linked; this module cannot run on unlinked installations");
                gate.disable_on_main(module);
                return;
            }

            let hashed = Arc::clone(&module);
            let identity = match run_blocking("fingerprint", move || content_identity(hashed.as_ref()))
                .await
                .unwrap_or_else(|| Err(GateError::Integrity("fingerprint task failed".into())))
            {
                Ok(id) => id,
                Err(e) => {
                    error!(module = %module.name(), error = %e, "failed to fingerprint module");
                    gate.disable_on_main(module);
                    return;
                }
            };

            if gate.engine.is_plugin_authorized(&identity).await {
                info!(module = %module.name(), "module authorized");
            } else {
                error!(module = %module.name(), "module is NOT authorized; it has not been purchased");
                gate.disable_on_main(module);
            }
        })
    }

    fn disable_on_main(&self, module: Arc<dyn HostModule>) {
        self.main.run_on_main(Box::new(move || {
            if module.is_enabled() {
                module.disable();
            }
        }));
    }
}

fn replace_task(slot: &Mutex<Option<ScheduledTask>>, task: ScheduledTask) {
    let previous = slot
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(task);
    if let Some(previous) = previous {
        previous.cancel();
    }
}
