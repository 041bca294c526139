//! Seams to the application that embeds the gate.
//!
//! The host owns the loaded modules, their enable state, and a single
//! "main" execution context on which host-visible mutations must happen.
//! Everything here is a trait so a real host can plug in; [`fs`] is the
//! directory-backed host used by the daemon and the tests.

pub mod fs;

use std::io::{self, Read};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

/// When a module initializes relative to the host's own load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoadPhase {
    /// Initializes before the world loads; cannot be corrected afterwards.
    Startup,
    #[default]
    PostWorld,
}

/// One loaded add-on module.
pub trait HostModule: Send + Sync {
    fn name(&self) -> &str;
    fn hard_dependencies(&self) -> &[String];
    fn soft_dependencies(&self) -> &[String];
    fn load_phase(&self) -> LoadPhase;
    /// Open the module's installed package for reading.
    fn open_package(&self) -> io::Result<Box<dyn Read + Send>>;
    fn is_enabled(&self) -> bool;
    /// Disable the module. Only call from the main context.
    fn disable(&self);

    /// True when `host` appears among the hard or soft dependencies.
    fn depends_on(&self, host: &str) -> bool {
        self.hard_dependencies().iter().any(|d| d == host)
            || self.soft_dependencies().iter().any(|d| d == host)
    }
}

/// Enumerable set of loaded modules.
pub trait ModuleRegistry: Send + Sync {
    fn modules(&self) -> Vec<Arc<dyn HostModule>>;
}

pub type MainTask = Box<dyn FnOnce() + Send + 'static>;

/// Marshals work onto the host's single-threaded main context.
pub trait MainContext: Send + Sync {
    fn run_on_main(&self, task: MainTask);
}

// ── MainQueue ────────────────────────────────────────────────────────────────

/// FIFO hand-off to whoever drives the paired [`MainLoop`].
#[derive(Clone)]
pub struct MainQueue {
    tx: mpsc::UnboundedSender<MainTask>,
}

/// Receiving end of a [`MainQueue`]. Tasks run one at a time, in order, on
/// the task or thread that drives it.
pub struct MainLoop {
    rx: mpsc::UnboundedReceiver<MainTask>,
}

pub fn main_queue() -> (MainQueue, MainLoop) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MainQueue { tx }, MainLoop { rx })
}

impl MainContext for MainQueue {
    fn run_on_main(&self, task: MainTask) {
        if self.tx.send(task).is_err() {
            warn!("main context has shut down; dropping task");
        }
    }
}

impl MainLoop {
    /// Run tasks until every [`MainQueue`] handle is dropped.
    pub async fn run(mut self) {
        while let Some(task) = self.rx.recv().await {
            task();
        }
    }

    /// Run whatever is queued right now and return how many tasks ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn main_queue_runs_in_submission_order() {
        let (queue, mut main) = main_queue();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            queue.run_on_main(Box::new(move || seen.lock().unwrap().push(i)));
        }
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(main.run_pending(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn submitting_after_loop_dropped_does_not_panic() {
        let (queue, main) = main_queue();
        drop(main);
        queue.run_on_main(Box::new(|| {}));
    }

    #[test]
    fn load_phase_parses_uppercase() {
        let phase: LoadPhase = serde_json::from_str("\"STARTUP\"").unwrap();
        assert_eq!(phase, LoadPhase::Startup);
        assert_eq!(LoadPhase::default(), LoadPhase::PostWorld);
    }
}
