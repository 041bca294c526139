#![allow(dead_code)]

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use gatekeep_core::fingerprint::fingerprint_reader;
use gatekeep_core::host::{HostModule, LoadPhase, ModuleRegistry};
use gatekeep_core::store::{crypto, LinkRecord, Store};
use gatekeep_core::{AuthClient, ClientConfig, LinkEngine};
use tempfile::TempDir;

pub const HOST: &str = "gatekeep";
pub const ANON_KEY: &str = "anon-test-key";
pub const INSTALLATION_ID: &str = "3f7c1a52-9b0e-4d61-8a2f-5c0e7d9b1a44";

// ── Fake host ────────────────────────────────────────────────────────────────

pub struct FakeModule {
    name: String,
    depend: Vec<String>,
    softdepend: Vec<String>,
    load: LoadPhase,
    package: Vec<u8>,
    readable: bool,
    enabled: AtomicBool,
    disable_calls: AtomicUsize,
    disabled_on: Mutex<Option<ThreadId>>,
}

impl FakeModule {
    pub fn new(name: &str, package: &[u8]) -> Self {
        Self {
            name: name.to_owned(),
            depend: vec![HOST.to_owned()],
            softdepend: Vec::new(),
            load: LoadPhase::PostWorld,
            package: package.to_vec(),
            readable: true,
            enabled: AtomicBool::new(true),
            disable_calls: AtomicUsize::new(0),
            disabled_on: Mutex::new(None),
        }
    }

    pub fn soft(mut self) -> Self {
        self.softdepend = std::mem::take(&mut self.depend);
        self
    }

    pub fn independent(mut self) -> Self {
        self.depend.clear();
        self.softdepend.clear();
        self
    }

    pub fn startup(mut self) -> Self {
        self.load = LoadPhase::Startup;
        self
    }

    pub fn unreadable(mut self) -> Self {
        self.readable = false;
        self
    }

    pub fn identity(&self) -> String {
        identity_of(&self.package)
    }

    pub fn disable_calls(&self) -> usize {
        self.disable_calls.load(Ordering::SeqCst)
    }

    pub fn disabled_on(&self) -> Option<ThreadId> {
        *self.disabled_on.lock().unwrap()
    }
}

impl HostModule for FakeModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn hard_dependencies(&self) -> &[String] {
        &self.depend
    }

    fn soft_dependencies(&self) -> &[String] {
        &self.softdepend
    }

    fn load_phase(&self) -> LoadPhase {
        self.load
    }

    fn open_package(&self) -> io::Result<Box<dyn Read + Send>> {
        if !self.readable {
            return Err(io::Error::new(io::ErrorKind::NotFound, "package missing"));
        }
        Ok(Box::new(io::Cursor::new(self.package.clone())))
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn disable(&self) {
        self.disable_calls.fetch_add(1, Ordering::SeqCst);
        *self.disabled_on.lock().unwrap() = Some(std::thread::current().id());
        self.enabled.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    modules: Mutex<Vec<Arc<FakeModule>>>,
}

impl FakeRegistry {
    pub fn with(modules: Vec<Arc<FakeModule>>) -> Arc<Self> {
        Arc::new(Self {
            modules: Mutex::new(modules),
        })
    }

    pub fn push(&self, module: Arc<FakeModule>) {
        self.modules.lock().unwrap().push(module);
    }

    pub fn remove(&self, name: &str) {
        self.modules.lock().unwrap().retain(|m| m.name != name);
    }
}

impl ModuleRegistry for FakeRegistry {
    fn modules(&self) -> Vec<Arc<dyn HostModule>> {
        self.modules
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.clone() as Arc<dyn HostModule>)
            .collect()
    }
}

pub fn identity_of(bytes: &[u8]) -> String {
    fingerprint_reader(bytes).unwrap()
}

// ── Engine wiring ────────────────────────────────────────────────────────────

pub fn client_for(base_url: &str) -> AuthClient {
    let config = ClientConfig {
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        ..ClientConfig::new(base_url, ANON_KEY)
    };
    AuthClient::new(config).unwrap()
}

/// Same key every time so a store can be reopened after the engine drops it.
pub fn open_store(dir: &TempDir) -> Store {
    let key = crypto::load_key(&[7u8; 32]).unwrap();
    Store::open(&dir.path().join("gatekeep.db"), key).unwrap()
}

/// Persist a linked record so the engine boots already linked.
pub fn seed_linked(store: &Store) {
    store
        .save_link_record(&LinkRecord {
            linked: true,
            server_id: INSTALLATION_ID.into(),
            owner_uuid: Some("owner-1".into()),
            server_uuid: Some(INSTALLATION_ID.into()),
            verification_token: Some("vt-1".into()),
        })
        .unwrap();
}

pub fn unlinked_engine(base_url: &str, dir: &TempDir) -> LinkEngine {
    LinkEngine::new(client_for(base_url), open_store(dir)).unwrap()
}

pub fn linked_engine(base_url: &str, dir: &TempDir) -> LinkEngine {
    let store = open_store(dir);
    seed_linked(&store);
    LinkEngine::new(client_for(base_url), store).unwrap()
}
