//! Module authorization tracker.
//!
//! Finds modules that declare a (hard or soft) dependency on the host
//! module, keys them by content identity, asks the [`LinkEngine`] whether
//! each identity is entitled, and disables denied modules through the
//! host's main context.
//!
//! Modules shipping byte-identical packages share one identity and so one
//! record. Reverse lookup from identity to live module rehashes every
//! registry entry; fine for tens of modules, not for thousands.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::engine::LinkEngine;
use crate::events::{EventBus, GateEvent};
use crate::fingerprint::{content_identity, short};
use crate::host::{HostModule, LoadPhase, MainContext, ModuleRegistry};

/// Tracked state of one dependent module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleRecord {
    pub identity: String,
    /// Name of the module the identity was first seen on.
    pub name: String,
    /// `false` until a positive verdict arrives.
    pub authorized: bool,
}

/// How [`ModuleTracker::scan`] treats records already in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Keep existing records and their verdicts; only add new identities.
    Merge,
    /// Drop every record first, then rescan. Forces fresh verdicts.
    Rebuild,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub checked: usize,
    pub authorized: usize,
    pub denied: usize,
    /// Records skipped because they were already authorized.
    pub skipped: usize,
    /// Disablements handed to the main context.
    pub disabled: usize,
}

pub struct ModuleTracker {
    host_module: String,
    registry: Arc<dyn ModuleRegistry>,
    engine: Arc<LinkEngine>,
    main: Arc<dyn MainContext>,
    events: EventBus,
    records: DashMap<String, ModuleRecord>,
}

impl ModuleTracker {
    pub fn new(
        host_module: impl Into<String>,
        registry: Arc<dyn ModuleRegistry>,
        engine: Arc<LinkEngine>,
        main: Arc<dyn MainContext>,
    ) -> Self {
        Self {
            host_module: host_module.into(),
            registry,
            engine,
            main,
            events: EventBus::new(),
            records: DashMap::new(),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn host_module(&self) -> &str {
        &self.host_module
    }

    // ── Discovery ───────────────────────────────────────────────────────────

    /// Track every dependent module. Returns how many new records were added.
    pub fn scan(&self, mode: ScanMode) -> usize {
        if mode == ScanMode::Rebuild {
            self.records.clear();
        }

        let mut added = 0;
        for module in self.dependents() {
            let identity = match content_identity(module.as_ref()) {
                Ok(id) => id,
                Err(e) => {
                    error!(module = %module.name(), error = %e, "failed to fingerprint dependent module; skipping");
                    continue;
                }
            };

            if let Entry::Vacant(slot) = self.records.entry(identity.clone()) {
                slot.insert(ModuleRecord {
                    identity: identity.clone(),
                    name: module.name().to_owned(),
                    authorized: false,
                });
                added += 1;
                info!(module = %module.name(), identity = %short(&identity), "found dependent module");
            }
        }
        added
    }

    /// Clear-then-rebuild scan.
    pub fn reload(&self) -> usize {
        self.scan(ScanMode::Rebuild)
    }

    /// [`scan`](Self::scan) on the blocking pool, for async callers.
    pub async fn scan_async(self: &Arc<Self>, mode: ScanMode) -> usize {
        let tracker = Arc::clone(self);
        run_blocking("scan", move || tracker.scan(mode))
            .await
            .unwrap_or(0)
    }

    /// Scan startup-phase dependents and check each one with a blocking
    /// call, before the host initializes them. Failures and denials mark the
    /// record unauthorized; nothing is disabled here because the host cannot
    /// disable modules during its own load. Returns how many were authorized.
    pub fn scan_and_validate_startup_modules(&self) -> usize {
        let mut authorized_count = 0;

        for module in self.dependents() {
            if module.load_phase() != LoadPhase::Startup {
                continue;
            }

            let identity = match content_identity(module.as_ref()) {
                Ok(id) => id,
                Err(e) => {
                    error!(module = %module.name(), error = %e, "failed to fingerprint startup module; skipping");
                    continue;
                }
            };
            info!(module = %module.name(), identity = %short(&identity), "validating startup module");

            let authorized = match self.engine.is_plugin_authorized_sync(&identity) {
                Ok(true) => {
                    info!(module = %module.name(), "startup module authorized");
                    true
                }
                Ok(false) => {
                    error!(module = %module.name(), "startup module is NOT authorized; purchase it to run it");
                    false
                }
                Err(e) => {
                    error!(module = %module.name(), error = %e, "failed to validate startup module");
                    false
                }
            };

            if authorized {
                authorized_count += 1;
            }
            self.records.insert(
                identity.clone(),
                ModuleRecord {
                    identity: identity.clone(),
                    name: module.name().to_owned(),
                    authorized,
                },
            );
            self.events.emit(GateEvent::ModuleValidated {
                name: module.name().to_owned(),
                identity,
                authorized,
            });
        }

        authorized_count
    }

    // ── Enforcement ─────────────────────────────────────────────────────────

    /// Check every tracked record that is not yet authorized, concurrently.
    /// Denied modules that are still enabled get disabled on the main context.
    pub async fn validate_dependent_modules(&self) -> ValidationSummary {
        let mut summary = ValidationSummary::default();

        if self.records.is_empty() {
            info!("no dependent modules to validate");
            return summary;
        }

        let pending: Vec<String> = self
            .records
            .iter()
            .filter(|r| !r.authorized)
            .map(|r| r.key().clone())
            .collect();
        summary.skipped = self.records.len().saturating_sub(pending.len());
        info!(
            pending = pending.len(),
            skipped = summary.skipped,
            "validating dependent modules"
        );

        let mut checks = JoinSet::new();
        let mut verdicts = Vec::with_capacity(pending.len());
        for identity in pending {
            let engine = Arc::clone(&self.engine);
            checks.spawn(async move {
                let authorized = engine.is_plugin_authorized(&identity).await;
                (identity, authorized)
            });
        }

        while let Some(joined) = checks.join_next().await {
            let (identity, authorized) = match joined {
                Ok(v) => v,
                Err(e) => {
                    error!(error = %e, "entitlement check task failed");
                    continue;
                }
            };
            verdicts.push((identity, authorized));
        }

        // Package hashing blocks; only pay for it when something was denied.
        let live = if verdicts.iter().any(|(_, authorized)| !authorized) {
            let registry = Arc::clone(&self.registry);
            run_blocking("registry index", move || index_by_identity(registry.as_ref()))
                .await
                .unwrap_or_default()
        } else {
            HashMap::new()
        };

        for (identity, authorized) in verdicts {
            summary.checked += 1;
            if authorized {
                summary.authorized += 1;
            } else {
                summary.denied += 1;
            }
            if self.apply_verdict(&identity, authorized, &live) {
                summary.disabled += 1;
            }
        }

        summary
    }

    /// Record a verdict. Returns true if a disablement was scheduled.
    fn apply_verdict(
        &self,
        identity: &str,
        authorized: bool,
        live: &HashMap<String, Arc<dyn HostModule>>,
    ) -> bool {
        let name = match self.records.get_mut(identity) {
            Some(mut record) => {
                record.authorized = authorized;
                record.name.clone()
            }
            None => {
                debug!(identity = %short(identity), "record dropped while its check was in flight");
                return false;
            }
        };

        self.events.emit(GateEvent::ModuleValidated {
            name: name.clone(),
            identity: identity.to_owned(),
            authorized,
        });

        if authorized {
            info!(module = %name, "module authorized");
            return false;
        }

        error!(module = %name, identity = %short(identity), "module is NOT authorized; make sure it has been purchased");

        match live.get(identity).cloned() {
            Some(module) if module.is_enabled() => {
                self.main.run_on_main(Box::new(move || {
                    if module.is_enabled() {
                        module.disable();
                        warn!(module = %module.name(), "disabled module: installation not authorized");
                    }
                }));
                true
            }
            Some(_) => false,
            None => {
                error!(identity = %short(identity), "no loaded module matches identity; nothing to disable");
                false
            }
        }
    }

    /// Linear scan over the registry, rehashing each module.
    pub fn find_module_by_identity(&self, identity: &str) -> Option<Arc<dyn HostModule>> {
        self.registry.modules().into_iter().find(|module| {
            match content_identity(module.as_ref()) {
                Ok(id) => id == identity,
                Err(e) => {
                    debug!(module = %module.name(), error = %e, "cannot fingerprint module during lookup");
                    false
                }
            }
        })
    }

    /// Identity → name for every live module that can be fingerprinted.
    pub fn live_identities(&self) -> HashMap<String, String> {
        index_by_identity(self.registry.as_ref())
            .into_iter()
            .map(|(id, m)| (id, m.name().to_owned()))
            .collect()
    }

    /// [`live_identities`](Self::live_identities) on the blocking pool.
    pub async fn live_identities_async(self: &Arc<Self>) -> HashMap<String, String> {
        let tracker = Arc::clone(self);
        run_blocking("live identities", move || tracker.live_identities())
            .await
            .unwrap_or_default()
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub fn is_authorized(&self, identity: &str) -> bool {
        self.records
            .get(identity)
            .map(|r| r.authorized)
            .unwrap_or(false)
    }

    pub fn list_authorized(&self) -> BTreeSet<String> {
        self.identities_where(true)
    }

    pub fn list_unauthorized(&self) -> BTreeSet<String> {
        self.identities_where(false)
    }

    pub fn all_records(&self) -> BTreeMap<String, ModuleRecord> {
        self.records
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    fn identities_where(&self, authorized: bool) -> BTreeSet<String> {
        self.records
            .iter()
            .filter(|r| r.authorized == authorized)
            .map(|r| r.key().clone())
            .collect()
    }

    fn dependents(&self) -> Vec<Arc<dyn HostModule>> {
        self.registry
            .modules()
            .into_iter()
            .filter(|m| m.name() != self.host_module && m.depends_on(&self.host_module))
            .collect()
    }
}

/// Identity → first live module with that identity.
fn index_by_identity(registry: &dyn ModuleRegistry) -> HashMap<String, Arc<dyn HostModule>> {
    let mut index = HashMap::new();
    for module in registry.modules() {
        match content_identity(module.as_ref()) {
            Ok(id) => {
                index.entry(id).or_insert(module);
            }
            Err(e) => {
                debug!(module = %module.name(), error = %e, "cannot fingerprint module during lookup");
            }
        }
    }
    index
}

/// Run package reads and hashing on the blocking pool.
pub(crate) async fn run_blocking<T, F>(what: &'static str, f: F) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(v) => Some(v),
        Err(e) => {
            error!(task = what, error = %e, "blocking registry task failed");
            None
        }
    }
}
