//! ==============================================================================
//! view.rs - the live garden view
//! ==============================================================================
//!
//! purpose:
//!     one owning context for "what is this garden doing right now". it
//!     merges three sources that disagree in timing:
//!     - the durable cache (instant, possibly old)
//!     - http snapshots (authoritative, slow)
//!     - live push events (fast, partial)
//!     and runs the device command protocol on top.
//!
//! lifecycle of a selection:
//!
//!     select_garden(id)            (no-op if id is already active)
//!        │ 1. leave old room, stop old pump + staleness check
//!        │ 2. persist selection, drop all cooldowns
//!        │ 3. fresh per-garden state, hydrated from cache
//!        │ 4. join new room, start pump, arm staleness check
//!        ▼ 5. load snapshot (sensor + devices + history, concurrently)
//!
//!     steps 1-4 run under the selection lock, so the joined room always
//!     belongs to the active garden.
//!
//! acceptance rules:
//!     every write into the state is tagged with the garden it was issued
//!     for and is dropped if that garden is no longer active. there is no
//!     request cancellation; late answers are just ignored.
//!     - sensor push events merge field-by-field
//!     - device snapshots replace the whole set
//!     - history failures clear the chart instead of leaving it stale
//!
//! relationships:
//!     - uses: backend.rs, live.rs, cache.rs, cooldown.rs, staleness.rs,
//!             optimistic.rs, history.rs, selection.rs
//!     - used by: main.rs / server.rs (http surface)
//!
//! ==============================================================================

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backend::GardenApi;
use crate::cache::{CacheKind, DurableCache};
use crate::config::TimingConfig;
use crate::cooldown::CooldownRegistry;
use crate::domain::{CommandKey, DeviceKey, DeviceStateSet, GardenRef, SensorSnapshot};
use crate::error::{LiveError, LiveResult};
use crate::history::{self, ChartSeries};
use crate::live::{LiveChannel, LiveEvent, Membership, Subscription};
use crate::optimistic::TwoPhaseWrite;
use crate::selection;
use crate::staleness::{self, StalenessMonitor};

// ==============================================================================
// per-garden state
// ==============================================================================

#[derive(Debug, Clone, Default)]
pub struct GardenState {
    pub garden_id: Option<String>,
    pub sensor: Option<SensorSnapshot>,
    /// true only while nothing, not even a cached reading, can be shown
    pub sensor_loading: bool,
    pub devices: DeviceStateSet,
    pub auto_write: TwoPhaseWrite<bool>,
    pub chart: ChartSeries,
    /// when a reading was last accepted from the network or the live channel
    pub last_updated: Option<Instant>,
    pub analysis: Option<serde_json::Value>,
    /// last user-facing error
    pub error: Option<String>,
}

impl GardenState {
    fn for_garden(garden_id: &str) -> Self {
        Self {
            garden_id: Some(garden_id.to_string()),
            ..Self::default()
        }
    }

    pub fn is_active(&self, garden_id: &str) -> bool {
        self.garden_id.as_deref() == Some(garden_id)
    }
}

/// serializable picture of the view, served by the daemon
#[derive(Debug, Clone, Serialize)]
pub struct LiveSnapshot {
    pub garden: Option<GardenRef>,
    pub sensor: Option<SensorSnapshot>,
    pub sensor_loading: bool,
    pub devices: DeviceStateSet,
    pub auto_pending: bool,
    pub cooldowns: BTreeMap<CommandKey, u32>,
    pub chart: ChartSeries,
    pub seconds_since_update: Option<u64>,
    pub analysis: Option<serde_json::Value>,
    pub error: Option<String>,
}

// ==============================================================================
// shared context
// ==============================================================================

#[derive(Default)]
struct Attachments {
    membership: Option<Membership>,
    pump: Option<JoinHandle<()>>,
    monitor: StalenessMonitor,
}

impl Attachments {
    fn detach(&mut self) {
        if let Some(mut membership) = self.membership.take() {
            membership.leave();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.monitor.disarm();
    }
}

struct Shared {
    api: Arc<dyn GardenApi>,
    channel: Arc<dyn LiveChannel>,
    cache: DurableCache,
    cooldowns: CooldownRegistry,
    timing: TimingConfig,
    gardens: RwLock<Vec<GardenRef>>,
    state: RwLock<GardenState>,
    attachments: Mutex<Attachments>,
    selecting: AsyncMutex<()>,
}

impl Shared {
    fn attachments(&self) -> std::sync::MutexGuard<'_, Attachments> {
        self.attachments.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.attachments().detach();
        self.cooldowns.clear_all();
    }
}

/// cheap to clone; background tasks only hold weak references, so dropping
/// the last handle tears everything down
#[derive(Clone)]
pub struct LiveView {
    shared: Arc<Shared>,
}

fn user_reason(e: LiveError) -> String {
    match e {
        LiveError::Backend(reason) => reason,
        other => other.to_string(),
    }
}

impl LiveView {
    pub fn new(
        api: Arc<dyn GardenApi>,
        channel: Arc<dyn LiveChannel>,
        cache: DurableCache,
        timing: TimingConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                api,
                channel,
                cache,
                cooldowns: CooldownRegistry::new(timing.cooldown_seconds),
                timing,
                gardens: RwLock::new(Vec::new()),
                state: RwLock::new(GardenState::default()),
                attachments: Mutex::new(Attachments::default()),
                selecting: AsyncMutex::new(()),
            }),
        }
    }

    fn from_weak(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    // ==========================================================================
    // garden selection
    // ==========================================================================

    pub async fn refresh_gardens(&self) -> LiveResult<Vec<GardenRef>> {
        let gardens = self.shared.api.list_gardens().await?;
        tracing::info!(count = gardens.len(), "garden list loaded");
        *self.shared.gardens.write().await = gardens.clone();
        Ok(gardens)
    }

    pub async fn set_gardens(&self, gardens: Vec<GardenRef>) {
        *self.shared.gardens.write().await = gardens;
    }

    pub async fn gardens(&self) -> Vec<GardenRef> {
        self.shared.gardens.read().await.clone()
    }

    /// load the garden list and apply the initial selection
    pub async fn start(&self, hint: Option<&str>) -> LiveResult<Option<String>> {
        let gardens = self.refresh_gardens().await?;
        let persisted = self.shared.cache.selected_garden();
        let chosen = selection::initial_selection(persisted.as_deref(), hint, &gardens);
        if let Some(id) = &chosen {
            self.select_garden(id).await;
        }
        Ok(chosen)
    }

    pub async fn active_garden(&self) -> Option<String> {
        self.shared.state.read().await.garden_id.clone()
    }

    /// make `garden_id` the active garden
    ///
    /// unknown ids are ignored and the current selection stays; returns
    /// whether `garden_id` is now selected. picking the garden that is
    /// already active changes nothing, cooldowns and pending writes
    /// included. fetch failures are reported through the state's error,
    /// not here.
    pub async fn select_garden(&self, garden_id: &str) -> bool {
        let known = self.shared.gardens.read().await.iter().any(|g| g.id == garden_id);
        if !known {
            tracing::debug!(garden = %garden_id, "ignoring selection of unknown garden");
            return false;
        }

        {
            let _selecting = self.shared.selecting.lock().await;
            if self.shared.state.read().await.is_active(garden_id) {
                tracing::debug!(garden = %garden_id, "garden already selected");
                return true;
            }

            // leave the old room before anything of the new garden exists
            self.shared.attachments().detach();
            self.shared.cache.persist_selection(garden_id);
            self.shared.cooldowns.clear_all();

            let cache = &self.shared.cache;
            let mut fresh = GardenState::for_garden(garden_id);
            fresh.sensor = cache.hydrate(garden_id, CacheKind::Sensor);
            fresh.devices = cache.hydrate(garden_id, CacheKind::Device).unwrap_or_default();
            fresh.analysis = cache.hydrate(garden_id, CacheKind::Analysis);
            let from_cache = fresh.sensor.is_some();
            *self.shared.state.write().await = fresh;
            tracing::info!(garden = %garden_id, from_cache, "garden selected");

            self.attach(garden_id);
        }

        if let Err(e) = self.load_snapshot(garden_id).await {
            tracing::warn!(garden = %garden_id, "initial load incomplete: {}", e);
        }
        true
    }

    /// back to "no garden selected"
    pub async fn clear_selection(&self) {
        let _selecting = self.shared.selecting.lock().await;
        self.shared.attachments().detach();
        self.shared.cooldowns.clear_all();
        *self.shared.state.write().await = GardenState::default();
    }

    /// stop every background task and timer, keeping the last state visible
    pub fn teardown(&self) {
        self.shared.attachments().detach();
        self.shared.cooldowns.clear_all();
    }

    fn attach(&self, garden_id: &str) {
        let Subscription { mut events, membership } = self.shared.channel.join(garden_id);

        let weak = Arc::downgrade(&self.shared);
        let pump = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(view) = LiveView::from_weak(&weak) else {
                            return;
                        };
                        view.apply_live_event(event).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "live events dropped, relying on staleness check");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        });

        let weak = Arc::downgrade(&self.shared);
        let watched = garden_id.to_string();
        let mut attachments = self.shared.attachments();
        if let Some(mut old) = attachments.membership.replace(membership) {
            old.leave();
        }
        if let Some(old) = attachments.pump.replace(pump) {
            old.abort();
        }
        attachments.monitor.arm(self.shared.timing.stale_check(), move || {
            let weak = weak.clone();
            let watched = watched.clone();
            async move {
                match LiveView::from_weak(&weak) {
                    Some(view) => {
                        view.check_staleness(&watched).await;
                        true
                    }
                    None => false,
                }
            }
        });
    }

    // ==========================================================================
    // snapshot loader
    // ==========================================================================

    /// fetch sensor, devices and history for `garden_id` concurrently
    ///
    /// each slice is committed as soon as its own request finishes; a failed
    /// request never discards the others. the first failure to arrive is the
    /// one reported.
    pub async fn load_snapshot(&self, garden_id: &str) -> LiveResult<()> {
        {
            let mut state = self.shared.state.write().await;
            if !state.is_active(garden_id) {
                return Ok(());
            }
            state.error = None;
            if state.sensor.is_none() {
                state.sensor_loading = true;
            }
        }

        let first_failure: Mutex<Option<String>> = Mutex::new(None);
        let record = |reason: Option<String>| {
            if let Some(reason) = reason {
                let mut slot = first_failure.lock().unwrap_or_else(|e| e.into_inner());
                slot.get_or_insert(reason);
            }
        };
        let api = &self.shared.api;
        let limit = self.shared.timing.history_limit;

        tokio::join!(
            async {
                let result = api.latest_sensor(garden_id).await;
                record(self.commit_sensor(garden_id, result).await);
            },
            async {
                let result = api.device_states(garden_id).await;
                record(self.commit_devices(garden_id, result).await);
            },
            async {
                let result = api.sensor_history(garden_id, limit).await;
                record(self.commit_history(garden_id, result).await);
            },
        );

        let failure = first_failure.into_inner().unwrap_or_else(|e| e.into_inner());
        let Some(reason) = failure else {
            return Ok(());
        };
        let err = LiveError::PartialFetchFailure(reason);
        let mut state = self.shared.state.write().await;
        if state.is_active(garden_id) {
            state.error = Some(err.to_string());
        }
        Err(err)
    }

    async fn commit_sensor(&self, garden_id: &str, result: LiveResult<SensorSnapshot>) -> Option<String> {
        let mut state = self.shared.state.write().await;
        if !state.is_active(garden_id) {
            tracing::debug!(garden = %garden_id, "discarding late sensor response");
            return None;
        }
        state.sensor_loading = false;
        match result {
            Ok(snapshot) => {
                self.shared.cache.persist(garden_id, CacheKind::Sensor, &snapshot);
                state.sensor = Some(snapshot);
                state.last_updated = Some(Instant::now());
                None
            }
            Err(e) => Some(format!("sensor data: {}", user_reason(e))),
        }
    }

    async fn commit_devices(&self, garden_id: &str, result: LiveResult<DeviceStateSet>) -> Option<String> {
        let mut state = self.shared.state.write().await;
        if !state.is_active(garden_id) {
            tracing::debug!(garden = %garden_id, "discarding late device response");
            return None;
        }
        match result {
            Ok(devices) => {
                // the backend answers with the full set
                state.devices = devices;
                self.shared.cache.persist(garden_id, CacheKind::Device, &devices);
                None
            }
            Err(e) => Some(format!("device states: {}", user_reason(e))),
        }
    }

    async fn commit_history(
        &self,
        garden_id: &str,
        result: LiveResult<Vec<SensorSnapshot>>,
    ) -> Option<String> {
        let mut state = self.shared.state.write().await;
        if !state.is_active(garden_id) {
            tracing::debug!(garden = %garden_id, "discarding late history response");
            return None;
        }
        match result {
            Ok(rows) => {
                state.chart = history::to_chart_series(rows);
                None
            }
            Err(e) => {
                state.chart.clear();
                Some(format!("history: {}", user_reason(e)))
            }
        }
    }

    // ==========================================================================
    // live events
    // ==========================================================================

    /// apply one push event; returns whether it was accepted
    pub async fn apply_live_event(&self, event: LiveEvent) -> bool {
        let mut state = self.shared.state.write().await;
        let Some(garden_id) = state.garden_id.clone() else {
            return false;
        };
        if event.garden_id() != garden_id {
            tracing::trace!(active = %garden_id, tagged = %event.garden_id(), "ignoring event for another garden");
            return false;
        }

        match event {
            LiveEvent::SensorData(update) => {
                let sensor = state.sensor.get_or_insert_with(SensorSnapshot::default);
                sensor.merge(&update);
                let merged = sensor.clone();
                state.last_updated = Some(Instant::now());
                state.sensor_loading = false;
                self.shared.cache.persist(&garden_id, CacheKind::Sensor, &merged);
            }
            LiveEvent::DeviceStatus(update) => {
                let Some(key) = DeviceKey::from_wire(&update.device) else {
                    tracing::warn!(device = %update.device, "unknown device in status update");
                    return false;
                };
                state.devices.set(key, update.state);
                self.shared.cache.persist(&garden_id, CacheKind::Device, &state.devices);
                // the device confirmed, no need to wait the cooldown out
                if let Some(command) = key.command_key() {
                    self.shared.cooldowns.cancel(command);
                }
            }
        }
        true
    }

    // ==========================================================================
    // commands
    // ==========================================================================

    /// switch a device on or off
    ///
    /// the cooldown starts before the request goes out and is cleared again
    /// if the backend refuses.
    pub async fn control(&self, device: CommandKey, desired: bool) -> LiveResult<()> {
        let garden_id = self.active_garden().await.ok_or(LiveError::NoActiveGarden)?;
        let ticket = self.shared.cooldowns.try_start(device)?;
        tracing::info!(garden = %garden_id, %device, desired, "sending device command");

        let result = self.shared.api.control_device(&garden_id, device, desired).await;

        let mut state = self.shared.state.write().await;
        let still_active = state.is_active(&garden_id);
        match result {
            Ok(()) => {
                if still_active {
                    state.devices.set(device.device_key(), desired);
                    self.shared.cache.persist(&garden_id, CacheKind::Device, &state.devices);
                }
                Ok(())
            }
            Err(e) => {
                let err = LiveError::CommandRejected(user_reason(e));
                tracing::warn!(garden = %garden_id, %device, "{}", err);
                // a newer command for the same device keeps its own cooldown
                self.shared.cooldowns.cancel_run(ticket);
                if still_active {
                    state.error = Some(err.to_string());
                }
                Err(err)
            }
        }
    }

    /// flip auto mode optimistically, rolling back if the backend refuses;
    /// returns the new value
    pub async fn toggle_auto_mode(&self) -> LiveResult<bool> {
        let (garden_id, target) = {
            let mut guard = self.shared.state.write().await;
            let state = &mut *guard;
            let garden_id = state.garden_id.clone().ok_or(LiveError::NoActiveGarden)?;
            let target = !state.devices.auto;
            if !state.auto_write.begin(&mut state.devices.auto, target) {
                return Err(LiveError::AutoModePending);
            }
            (garden_id, target)
        };

        let result = self.shared.api.set_auto_mode(&garden_id, target).await;

        let mut guard = self.shared.state.write().await;
        let state = &mut *guard;
        let still_active = state.is_active(&garden_id);
        match result {
            Ok(()) => {
                if still_active {
                    state.auto_write.commit();
                    self.shared.cache.persist(&garden_id, CacheKind::Device, &state.devices);
                }
                tracing::info!(garden = %garden_id, auto = target, "auto mode changed");
                Ok(target)
            }
            Err(e) => {
                let err = LiveError::CommandRejected(user_reason(e));
                if still_active {
                    state.auto_write.rollback(&mut state.devices.auto);
                    state.error = Some(err.to_string());
                }
                tracing::warn!(garden = %garden_id, "auto mode change rolled back: {}", err);
                Err(err)
            }
        }
    }

    /// fetch the latest plant-health analysis for the active garden
    pub async fn refresh_analysis(&self) -> LiveResult<serde_json::Value> {
        let garden_id = self.active_garden().await.ok_or(LiveError::NoActiveGarden)?;
        let result = self.shared.api.latest_analysis(&garden_id).await;

        let mut state = self.shared.state.write().await;
        let still_active = state.is_active(&garden_id);
        match result {
            Ok(analysis) => {
                if still_active {
                    self.shared.cache.persist(&garden_id, CacheKind::Analysis, &analysis);
                    state.analysis = Some(analysis.clone());
                }
                Ok(analysis)
            }
            Err(e) => {
                if still_active {
                    state.error = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    // ==========================================================================
    // staleness
    // ==========================================================================

    /// reload `garden_id` if nothing fresh was accepted within the threshold;
    /// returns whether a reload was triggered
    pub async fn check_staleness(&self, garden_id: &str) -> bool {
        let stale = {
            let state = self.shared.state.read().await;
            state.is_active(garden_id)
                && staleness::is_stale(
                    state.last_updated,
                    Instant::now(),
                    self.shared.timing.stale_threshold(),
                )
        };
        if stale {
            tracing::info!(garden = %garden_id, "no fresh data, reloading");
            if let Err(e) = self.load_snapshot(garden_id).await {
                tracing::warn!(garden = %garden_id, "background reload incomplete: {}", e);
            }
        }
        stale
    }

    pub fn staleness_armed(&self) -> bool {
        self.shared.attachments().monitor.is_armed()
    }

    // ==========================================================================
    // reads
    // ==========================================================================

    pub async fn state(&self) -> GardenState {
        self.shared.state.read().await.clone()
    }

    pub fn cooldown(&self, device: CommandKey) -> u32 {
        self.shared.cooldowns.remaining(device)
    }

    pub fn cooldown_timers(&self) -> usize {
        self.shared.cooldowns.active_timers()
    }

    pub async fn snapshot(&self) -> LiveSnapshot {
        let state = self.shared.state.read().await.clone();
        let garden = match &state.garden_id {
            Some(id) => self.shared.gardens.read().await.iter().find(|g| &g.id == id).cloned(),
            None => None,
        };
        LiveSnapshot {
            garden,
            sensor: state.sensor,
            sensor_loading: state.sensor_loading,
            devices: state.devices,
            auto_pending: state.auto_write.is_pending(),
            cooldowns: self.shared.cooldowns.snapshot(),
            chart: state.chart,
            seconds_since_update: state
                .last_updated
                .map(|at| Instant::now().saturating_duration_since(at).as_secs()),
            analysis: state.analysis,
            error: state.error,
        }
    }
}
