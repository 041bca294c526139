//! Directory-backed module registry.
//!
//! Every `<name>.module.json` manifest in the modules directory describes one
//! loaded module; its `package` path (relative to the directory) is the
//! installed package that gets fingerprinted. Enable state lives in memory.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use super::{HostModule, LoadPhase, ModuleRegistry};

pub const MANIFEST_SUFFIX: &str = ".module.json";

#[derive(Debug, Deserialize)]
struct Manifest {
    name: String,
    #[serde(default)]
    depend: Vec<String>,
    #[serde(default)]
    softdepend: Vec<String>,
    #[serde(default)]
    load: LoadPhase,
    package: PathBuf,
}

#[derive(Debug)]
pub struct DirectoryModule {
    name: String,
    depend: Vec<String>,
    softdepend: Vec<String>,
    load: LoadPhase,
    package_path: PathBuf,
    enabled: AtomicBool,
}

impl DirectoryModule {
    pub fn package_path(&self) -> &Path {
        &self.package_path
    }
}

impl HostModule for DirectoryModule {
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
        Ok(Box::new(File::open(&self.package_path)?))
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn disable(&self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            info!(module = %self.name, "module disabled");
        }
    }
}

pub struct DirectoryRegistry {
    dir: PathBuf,
    modules: Vec<Arc<DirectoryModule>>,
}

impl DirectoryRegistry {
    /// Read every manifest in `dir`. Unparseable manifests are skipped with a
    /// warning; a missing directory yields an empty registry.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut modules = Vec::new();

        if !dir.exists() {
            warn!(dir = %dir.display(), "modules directory does not exist; no modules loaded");
            return Ok(Self { dir, modules });
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_context(|| format!("read modules dir {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX))
            })
            .collect();
        paths.sort();

        for path in paths {
            match read_manifest(&path) {
                Ok(manifest) => modules.push(Arc::new(DirectoryModule {
                    package_path: dir.join(&manifest.package),
                    name: manifest.name,
                    depend: manifest.depend,
                    softdepend: manifest.softdepend,
                    load: manifest.load,
                    enabled: AtomicBool::new(true),
                })),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping bad module manifest"),
            }
        }

        info!(dir = %dir.display(), count = modules.len(), "loaded module manifests");
        Ok(Self { dir, modules })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, name: &str) -> Option<Arc<DirectoryModule>> {
        self.modules.iter().find(|m| m.name == name).cloned()
    }
}

impl ModuleRegistry for DirectoryRegistry {
    fn modules(&self) -> Vec<Arc<dyn HostModule>> {
        self.modules
            .iter()
            .map(|m| m.clone() as Arc<dyn HostModule>)
            .collect()
    }
}

fn read_manifest(path: &Path) -> Result<Manifest> {
    let bytes = std::fs::read(path).context("read manifest")?;
    serde_json::from_slice(&bytes).context("parse manifest")
}
