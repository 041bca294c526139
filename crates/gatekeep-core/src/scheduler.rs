use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to a scheduled background task. Dropping it does not stop the
/// task; call [`ScheduledTask::cancel`].
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Run `fut` once after `delay`.
pub fn spawn_after<F>(delay: Duration, fut: F) -> ScheduledTask
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        fut.await;
    });
    ScheduledTask { handle }
}

/// Call `tick` every `period`, first after `first_delay`. Each tick's future
/// is awaited before the next one is scheduled; late ticks are delayed, not
/// bunched up.
pub fn spawn_periodic<F, Fut>(first_delay: Duration, period: Duration, mut tick: F) -> ScheduledTask
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + first_delay;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            tick().await;
        }
    });
    ScheduledTask { handle }
}
