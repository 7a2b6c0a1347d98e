//! staleness backstop
//!
//! push events are the primary update path. if they stop arriving (dropped
//! socket, missed event) the view would silently show old numbers, so a
//! periodic check compares the last accepted reading against a threshold and
//! asks for a full reload when it is too old.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

pub const DEFAULT_STALE_CHECK_SECS: u64 = 60;
pub const DEFAULT_STALE_THRESHOLD_SECS: u64 = 60;

/// nothing accepted yet counts as stale
pub fn is_stale(last_updated: Option<Instant>, now: Instant, threshold: Duration) -> bool {
    match last_updated {
        Some(at) => now.saturating_duration_since(at) > threshold,
        None => true,
    }
}

/// owns the periodic check task of the active garden
#[derive(Default)]
pub struct StalenessMonitor {
    task: Option<JoinHandle<()>>,
}

impl StalenessMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// (re)start the periodic check; any previous one is stopped first
    ///
    /// `check` runs once per `every`, the first time one full period after
    /// arming. returning false ends the task.
    pub fn arm<F, Fut>(&mut self, every: Duration, mut check: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.disarm();
        self.task = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !check().await {
                    return;
                }
            }
        }));
    }

    pub fn disarm(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for StalenessMonitor {
    fn drop(&mut self) {
        self.disarm();
    }
}
