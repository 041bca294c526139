//! Link & validation engine.
//!
//! Owns the installation's linked/unlinked state, mirrors it to the
//! persisted [`Store`], and memoizes positive validation verdicts in a
//! [`ValidationCache`] so periodic checks do not hit the remote service on
//! every tick.
//!
//! State machine over `linked`:
//!
//! ```text
//!   Unlinked ──link ok──────────────▶ Linked
//!   Linked ───validate ok───────────▶ Linked   (cache re-stamped)
//!   Linked ───validate denied───────▶ Unlinked (cache entry purged)
//!   any ──────unlink────────────────▶ Unlinked (state, cache, token cleared)
//! ```
//!
//! A transport failure never changes state: `validate_server_link` returns
//! [`GateError::Transport`] and the caller decides what to do with it.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cache::ValidationCache;
use crate::client::{AuthClient, Disposition, LinkMetadata, LinkOutcome};
use crate::clock::{Clock, SystemClock};
use crate::error::{GateError, GateResult};
use crate::events::{EventBus, GateEvent};
use crate::fingerprint::short;
use crate::store::{LinkRecord, Store};

pub const DEFAULT_BOOT_WAIT: Duration = Duration::from_secs(20);

/// Read-only snapshot of the installation's link.
#[derive(Clone, Default, Serialize)]
pub struct LinkState {
    pub installation_id: Option<String>,
    pub linked: bool,
    pub owner_identity: Option<String>,
    #[serde(skip_serializing)]
    pub verification_token: Option<String>,
    pub entitlement_set: Option<BTreeSet<String>>,
    /// Epoch millis of the last positive verification of this installation.
    pub last_validated_at: Option<i64>,
}

impl fmt::Debug for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkState")
            .field("installation_id", &self.installation_id)
            .field("linked", &self.linked)
            .field("owner_identity", &self.owner_identity)
            .field(
                "verification_token",
                &self.verification_token.as_ref().map(|_| "<redacted>"),
            )
            .field("entitlement_set", &self.entitlement_set)
            .field("last_validated_at", &self.last_validated_at)
            .finish()
    }
}

pub struct LinkEngine {
    client: AuthClient,
    store: Store,
    cache: ValidationCache,
    clock: Arc<dyn Clock>,
    events: EventBus,
    record: RwLock<LinkRecord>,
    /// Bumped on every link and unlink, under the record lock.
    generation: AtomicU64,
    entitlements: RwLock<Option<BTreeSet<String>>>,
    ttl_secs: AtomicU64,
    boot_wait: Duration,
}

impl LinkEngine {
    /// Load the persisted link state and TTL from `store`.
    pub fn new(client: AuthClient, store: Store) -> GateResult<Self> {
        let record = store.load_link_record()?;
        let ttl = store.validation_ttl()?;

        if !record.is_consistent() {
            warn!("persisted link state holds credentials while unlinked; ignoring them");
        }
        debug!(linked = record.linked, ttl_secs = ttl.as_secs(), "loaded link state");

        Ok(Self {
            client,
            store,
            cache: ValidationCache::new(),
            clock: Arc::new(SystemClock),
            events: EventBus::new(),
            record: RwLock::new(record),
            generation: AtomicU64::new(0),
            entitlements: RwLock::new(None),
            ttl_secs: AtomicU64::new(ttl.as_secs()),
            boot_wait: DEFAULT_BOOT_WAIT,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Upper bound for the blocking `*_sync` variants.
    pub fn with_boot_wait(mut self, boot_wait: Duration) -> Self {
        self.boot_wait = boot_wait;
        self
    }

    // ── Link ────────────────────────────────────────────────────────────────

    /// Exchange a one-time `token` for a link. Generates and persists the
    /// installation id first if there is none. A failed link leaves the
    /// state as it was.
    pub async fn link_server(
        &self,
        token: &str,
        server_name: &str,
        version: &str,
    ) -> GateResult<LinkOutcome> {
        let installation_id = self.ensure_installation_id()?;
        let metadata = LinkMetadata {
            server_name: server_name.to_owned(),
            host_version: version.to_owned(),
        };

        let outcome = self
            .client
            .link(token, &installation_id, &metadata)
            .await;

        if !outcome.ok() {
            warn!(
                disposition = ?outcome.disposition,
                message = %outcome.message,
                "server link failed"
            );
            return Ok(outcome);
        }

        {
            let mut record = self.write_record();
            let mut next = record.clone();
            next.linked = true;
            next.server_id = installation_id.clone();
            next.owner_uuid = outcome.owner_identity.clone();
            next.verification_token = outcome.verification_token.clone();
            self.store.save_link_record(&next)?;
            *record = next;
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        self.cache
            .mark_verified(&installation_id, self.clock.now_millis());
        if outcome.entitlements.is_some() {
            *self.write_entitlements() = outcome.entitlements.clone();
        }

        info!(installation_id = %installation_id, "server linked");
        self.events.emit(GateEvent::ServerLinked {
            installation_id,
            owner_identity: outcome.owner_identity.clone(),
        });
        Ok(outcome)
    }

    /// Whether the link is still valid. Unlinked answers `false` and a fresh
    /// cached verdict answers `true`, both without a network call.
    pub async fn validate_server_link(&self) -> GateResult<bool> {
        let Some((installation_id, generation)) = self.linked_snapshot() else {
            return Ok(false);
        };

        let now = self.clock.now_millis();
        if self.cache.is_fresh(&installation_id, now, self.validation_ttl()) {
            debug!(installation_id = %installation_id, "link verdict cached");
            return Ok(true);
        }

        let outcome = self.client.validate(&installation_id).await;
        match outcome.disposition {
            Disposition::Granted => {
                self.cache.mark_verified(&installation_id, now);
                if outcome.entitlements.is_some() {
                    *self.write_entitlements() = outcome.entitlements;
                }
                debug!(installation_id = %installation_id, "link validated");
                Ok(true)
            }
            Disposition::Denied => {
                if self.demote(&installation_id, generation)? {
                    warn!(
                        installation_id = %installation_id,
                        message = %outcome.message,
                        "authorization service rejected this installation; unlinked"
                    );
                } else {
                    debug!(installation_id = %installation_id, "denial arrived after a relink or unlink; ignoring it");
                }
                Ok(false)
            }
            Disposition::Unreachable => Err(GateError::Transport(outcome.message)),
        }
    }

    /// Blocking [`validate_server_link`](Self::validate_server_link) for boot
    /// code that runs before the async runtime exists. [`Gate::on_load`]
    /// calls it to confirm a persisted link before checking startup modules.
    ///
    /// [`Gate::on_load`]: crate::gate::Gate::on_load
    pub fn validate_server_link_sync(&self) -> GateResult<bool> {
        self.block_on_bounded(self.validate_server_link())?
    }

    // ── Entitlements ────────────────────────────────────────────────────────

    /// Whether the linked account owns the module with `module_identity`.
    /// Not cached: purchases must show up promptly.
    pub async fn is_plugin_authorized(&self, module_identity: &str) -> bool {
        let Some(installation_id) = self.linked_installation_id() else {
            return false;
        };
        let authorized = self
            .client
            .check_entitlement(&installation_id, module_identity)
            .await;
        debug!(identity = %short(module_identity), authorized, "entitlement checked");
        authorized
    }

    /// Blocking [`is_plugin_authorized`](Self::is_plugin_authorized) for
    /// startup-phase modules.
    pub fn is_plugin_authorized_sync(&self, module_identity: &str) -> GateResult<bool> {
        self.block_on_bounded(self.is_plugin_authorized(module_identity))
    }

    // ── State ───────────────────────────────────────────────────────────────

    pub fn get_current_link_state(&self) -> LinkState {
        let record = self.read_record();
        let last_validated_at = record
            .server_uuid
            .as_deref()
            .and_then(|id| self.cache.verified_at(id));
        LinkState {
            installation_id: record.server_uuid.clone(),
            linked: record.linked,
            owner_identity: record.owner_uuid.clone().filter(|_| record.linked),
            verification_token: record.verification_token.clone().filter(|_| record.linked),
            entitlement_set: self
                .entitlements
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            last_validated_at,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.read_record().linked
    }

    pub fn installation_id(&self) -> Option<String> {
        self.read_record().server_uuid.clone()
    }

    pub fn validation_ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.load(Ordering::Relaxed))
    }

    pub fn set_validation_ttl(&self, ttl: Duration) -> GateResult<()> {
        self.store.set_validation_ttl(ttl)?;
        self.ttl_secs.store(ttl.as_secs(), Ordering::Relaxed);
        Ok(())
    }

    pub fn cache(&self) -> &ValidationCache {
        &self.cache
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Forget the link: state, cached verdicts and the stored token.
    pub fn unlink(&self) -> GateResult<()> {
        {
            let mut record = self.write_record();
            let mut next = record.clone();
            next.clear_link();
            self.store.save_link_record(&next)?;
            *record = next;
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        *self.write_entitlements() = None;
        self.clear_cache();
        info!("server unlinked");
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────────

    /// Unlink after a denial of the link seen at `generation`. Returns
    /// false, changing nothing, if the link was replaced or dropped since.
    fn demote(&self, installation_id: &str, generation: u64) -> GateResult<bool> {
        let mut record = self.write_record();
        if self.generation.load(Ordering::SeqCst) != generation || !record.linked {
            return Ok(false);
        }
        let mut next = record.clone();
        next.clear_link();
        // Memory follows the remote verdict even if persisting fails.
        let persisted = self.store.save_link_record(&next);
        *record = next;
        self.generation.fetch_add(1, Ordering::SeqCst);
        drop(record);

        self.cache.remove(installation_id);
        *self.write_entitlements() = None;
        persisted.map(|()| true).map_err(|e| {
            error!(error = %e, "failed to persist unlinked state");
            GateError::Storage(e)
        })
    }

    fn linked_installation_id(&self) -> Option<String> {
        self.linked_snapshot().map(|(id, _)| id)
    }

    fn linked_snapshot(&self) -> Option<(String, u64)> {
        let record = self.read_record();
        if !record.linked {
            return None;
        }
        let id = record.server_uuid.clone()?;
        Some((id, self.generation.load(Ordering::SeqCst)))
    }

    fn ensure_installation_id(&self) -> GateResult<String> {
        let mut record = self.write_record();
        if let Some(id) = &record.server_uuid {
            return Ok(id.clone());
        }
        let id = uuid::Uuid::new_v4().to_string();
        let mut next = record.clone();
        next.server_uuid = Some(id.clone());
        self.store.save_link_record(&next)?;
        *record = next;
        info!(installation_id = %id, "generated installation id");
        Ok(id)
    }

    /// Drive `fut` to completion on a private current-thread runtime, giving
    /// up after `boot_wait`. Refuses to run inside an existing runtime.
    fn block_on_bounded<F: Future>(&self, fut: F) -> GateResult<F::Output> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(GateError::Runtime(std::io::Error::other(
                "blocking check called from inside an async runtime",
            )));
        }
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let wait = self.boot_wait;
        rt.block_on(async move { tokio::time::timeout(wait, fut).await })
            .map_err(|_| GateError::Timeout(wait))
    }

    fn read_record(&self) -> RwLockReadGuard<'_, LinkRecord> {
        self.record.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_record(&self) -> RwLockWriteGuard<'_, LinkRecord> {
        self.record.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entitlements(&self) -> RwLockWriteGuard<'_, Option<BTreeSet<String>>> {
        self.entitlements
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for LinkEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkEngine")
            .field("client", &self.client)
            .field("linked", &self.is_linked())
            .field("ttl", &self.validation_ttl())
            .finish_non_exhaustive()
    }
}
