//! ==============================================================================
//! cooldown.rs - per-device command cooldowns
//! ==============================================================================
//!
//! purpose:
//!     after a command is sent to a device, further commands for that device
//!     are refused until either the cooldown runs out or the device confirms
//!     the new state over the live channel.
//!
//! timers:
//!     one tokio task per cooling device. it decrements the remaining seconds
//!     once per second and removes itself at zero. an early confirmation
//!     aborts it and zeroes the entry. dropping the last registry handle
//!     aborts whatever is still running.
//!
//!     check-and-start happens under a single lock, so two callers racing for
//!     the same device cannot both get through. each start hands back a
//!     ticket; a failed command cancels through it, which leaves any newer
//!     run for the same device alone.
//!
//! ==============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::domain::CommandKey;
use crate::error::LiveError;

pub const DEFAULT_COOLDOWN_SECS: u32 = 20;

const TICK: Duration = Duration::from_secs(1);

/// one started cooldown. cancelling through it only stops that run, never a
/// later one for the same device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownTicket {
    key: CommandKey,
    run: u64,
}

#[derive(Default)]
struct Timers {
    remaining: HashMap<CommandKey, u32>,
    tickers: HashMap<CommandKey, JoinHandle<()>>,
    runs: HashMap<CommandKey, u64>,
    next_run: u64,
}

impl Timers {
    fn stop(&mut self, key: CommandKey) -> u32 {
        if let Some(ticker) = self.tickers.remove(&key) {
            ticker.abort();
        }
        self.runs.remove(&key);
        self.remaining.insert(key, 0).unwrap_or(0)
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        for (_, ticker) in self.tickers.drain() {
            ticker.abort();
        }
    }
}

#[derive(Clone)]
pub struct CooldownRegistry {
    timers: Arc<Mutex<Timers>>,
    duration_secs: u32,
}

impl CooldownRegistry {
    pub fn new(duration_secs: u32) -> Self {
        Self {
            timers: Arc::new(Mutex::new(Timers::default())),
            duration_secs,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Timers> {
        // a poisoned map is still a valid map
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn remaining(&self, key: CommandKey) -> u32 {
        self.lock().remaining.get(&key).copied().unwrap_or(0)
    }

    /// remaining seconds for every command key, zero included
    pub fn snapshot(&self) -> BTreeMap<CommandKey, u32> {
        let timers = self.lock();
        CommandKey::ALL
            .iter()
            .map(|key| (*key, timers.remaining.get(key).copied().unwrap_or(0)))
            .collect()
    }

    /// start the cooldown for `key`, or report how long it still has to run
    ///
    /// a running cooldown is left exactly as it was.
    pub fn try_start(&self, key: CommandKey) -> Result<CooldownTicket, LiveError> {
        let mut timers = self.lock();
        let left = timers.remaining.get(&key).copied().unwrap_or(0);
        if left > 0 {
            return Err(LiveError::DeviceCooling { device: key, remaining: left });
        }
        timers.next_run += 1;
        let ticket = CooldownTicket { key, run: timers.next_run };
        if self.duration_secs == 0 {
            return Ok(ticket);
        }

        // the first tick is due one second after the start, however late
        // the ticker task gets polled
        let first = Instant::now() + TICK;
        timers.remaining.insert(key, self.duration_secs);
        timers.runs.insert(key, ticket.run);
        let ticker = tokio::spawn(tick_down(Arc::downgrade(&self.timers), key, first));
        if let Some(stale) = timers.tickers.insert(key, ticker) {
            stale.abort();
        }
        tracing::debug!(device = %key, secs = self.duration_secs, "cooldown started");
        Ok(ticket)
    }

    /// stop the cooldown early; returns whether one was running
    pub fn cancel(&self, key: CommandKey) -> bool {
        let was = self.lock().stop(key);
        if was > 0 {
            tracing::debug!(device = %key, remaining = was, "cooldown cancelled");
        }
        was > 0
    }

    /// stop the run `ticket` started, if it is still the one running
    pub fn cancel_run(&self, ticket: CooldownTicket) -> bool {
        let mut timers = self.lock();
        if timers.runs.get(&ticket.key) != Some(&ticket.run) {
            return false;
        }
        let was = timers.stop(ticket.key);
        tracing::debug!(device = %ticket.key, remaining = was, "cooldown cancelled");
        was > 0
    }

    pub fn clear_all(&self) {
        let mut timers = self.lock();
        for (_, ticker) in timers.tickers.drain() {
            ticker.abort();
        }
        timers.remaining.clear();
        timers.runs.clear();
    }

    pub fn active_timers(&self) -> usize {
        self.lock().tickers.len()
    }
}

async fn tick_down(timers: Weak<Mutex<Timers>>, key: CommandKey, first: Instant) {
    let mut ticker = time::interval_at(first, TICK);
    loop {
        ticker.tick().await;
        let Some(shared) = timers.upgrade() else {
            return;
        };
        let mut guard = shared.lock().unwrap_or_else(|e| e.into_inner());
        let left = guard
            .remaining
            .get(&key)
            .copied()
            .unwrap_or(0)
            .saturating_sub(1);
        guard.remaining.insert(key, left);
        if left == 0 {
            guard.tickers.remove(&key);
            guard.runs.remove(&key);
            tracing::debug!(device = %key, "cooldown expired");
            return;
        }
    }
}
