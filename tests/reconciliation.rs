use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use garden_live::backend::GardenApi;
use garden_live::cache::{CacheKind, DurableCache};
use garden_live::config::TimingConfig;
use garden_live::domain::{CommandKey, DeviceStateSet, GardenRef, SensorSnapshot, SensorUpdate};
use garden_live::live::{DeviceStatusUpdate, LiveEvent, RoomHub};
use garden_live::{LiveError, LiveResult, LiveView};

// ==============================================================================
// scripted backend
// ==============================================================================

struct Script {
    sensor: LiveResult<SensorSnapshot>,
    devices: LiveResult<DeviceStateSet>,
    history: LiveResult<Vec<SensorSnapshot>>,
    control: LiveResult<()>,
    auto: LiveResult<()>,
    analysis: LiveResult<serde_json::Value>,
    auto_gate: Option<Arc<Notify>>,
    /// held by the next control call only
    control_gate: Option<Arc<Notify>>,
    sensor_gates: HashMap<String, Arc<Notify>>,
    device_gates: HashMap<String, Arc<Notify>>,
    history_gates: HashMap<String, Arc<Notify>>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            sensor: Ok(reading(20.0)),
            devices: Ok(DeviceStateSet::default()),
            history: Ok(Vec::new()),
            control: Ok(()),
            auto: Ok(()),
            analysis: Ok(serde_json::json!({ "health": "good" })),
            auto_gate: None,
            control_gate: None,
            sensor_gates: HashMap::new(),
            device_gates: HashMap::new(),
            history_gates: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct ScriptedBackend {
    script: Mutex<Script>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn with(script: Script) -> Arc<Self> {
        Arc::new(Self { script: Mutex::new(script), calls: Mutex::new(Vec::new()) })
    }

    fn edit(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.script.lock().unwrap());
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[async_trait]
impl GardenApi for ScriptedBackend {
    async fn list_gardens(&self) -> LiveResult<Vec<GardenRef>> {
        Ok(vec![garden("g1"), garden("g2")])
    }

    async fn latest_sensor(&self, garden_id: &str) -> LiveResult<SensorSnapshot> {
        self.log(format!("sensor:{}", garden_id));
        let (result, gate) = {
            let script = self.script.lock().unwrap();
            (script.sensor.clone(), script.sensor_gates.get(garden_id).cloned())
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        result
    }

    async fn device_states(&self, garden_id: &str) -> LiveResult<DeviceStateSet> {
        self.log(format!("devices:{}", garden_id));
        let (result, gate) = {
            let script = self.script.lock().unwrap();
            (script.devices.clone(), script.device_gates.get(garden_id).cloned())
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        result
    }

    async fn sensor_history(&self, garden_id: &str, _limit: usize) -> LiveResult<Vec<SensorSnapshot>> {
        self.log(format!("history:{}", garden_id));
        let (result, gate) = {
            let script = self.script.lock().unwrap();
            (script.history.clone(), script.history_gates.get(garden_id).cloned())
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        result
    }

    async fn control_device(&self, garden_id: &str, device: CommandKey, state: bool) -> LiveResult<()> {
        self.log(format!("control:{}:{}:{}", garden_id, device, state));
        let (result, gate) = {
            let mut script = self.script.lock().unwrap();
            (script.control.clone(), script.control_gate.take())
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        result
    }

    async fn set_auto_mode(&self, garden_id: &str, enabled: bool) -> LiveResult<()> {
        self.log(format!("auto:{}:{}", garden_id, enabled));
        let (result, gate) = {
            let script = self.script.lock().unwrap();
            (script.auto.clone(), script.auto_gate.clone())
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        result
    }

    async fn latest_analysis(&self, garden_id: &str) -> LiveResult<serde_json::Value> {
        self.log(format!("analysis:{}", garden_id));
        self.script.lock().unwrap().analysis.clone()
    }
}

// ==============================================================================
// helpers
// ==============================================================================

fn garden(id: &str) -> GardenRef {
    GardenRef {
        id: id.to_string(),
        name: format!("Garden {}", id),
        connected: true,
        last_connected: None,
        has_camera: false,
        device_serial: Some(format!("ESP32-{}", id)),
    }
}

fn reading(temperature: f64) -> SensorSnapshot {
    SensorSnapshot {
        temperature: Some(temperature),
        humidity: Some(50.0),
        light: Some(300.0),
        soil: Some(40.0),
        timestamp: Some("2024-06-01T12:00:00Z".into()),
    }
}

fn sensor_event(garden_id: &str, f: impl FnOnce(&mut SensorUpdate)) -> LiveEvent {
    let mut update = SensorUpdate { garden_id: garden_id.to_string(), ..Default::default() };
    f(&mut update);
    LiveEvent::SensorData(update)
}

fn device_event(garden_id: &str, device: &str, state: bool) -> LiveEvent {
    LiveEvent::DeviceStatus(DeviceStatusUpdate {
        garden_id: garden_id.to_string(),
        device: device.to_string(),
        state,
    })
}

async fn view_over(backend: Arc<ScriptedBackend>, hub: &RoomHub, cache: DurableCache) -> LiveView {
    let view = LiveView::new(backend, Arc::new(hub.clone()), cache, TimingConfig::default());
    view.set_gardens(vec![garden("g1"), garden("g2")]).await;
    view
}

/// let spawned pump tasks drain their queues
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

async fn until_called(backend: &ScriptedBackend, prefix: &str) {
    while backend.count(prefix) == 0 {
        tokio::task::yield_now().await;
    }
}

// ==============================================================================
// selection and loading
// ==============================================================================

#[tokio::test]
async fn unknown_garden_keeps_previous_selection() {
    let backend = ScriptedBackend::with(Script::default());
    let view = view_over(backend, &RoomHub::new(), DurableCache::in_memory()).await;

    assert!(view.select_garden("g1").await);
    assert!(!view.select_garden("nope").await);
    assert_eq!(view.active_garden().await.as_deref(), Some("g1"));
}

#[tokio::test]
async fn start_prefers_persisted_selection() {
    let cache = DurableCache::in_memory();
    cache.persist_selection("g2");
    let backend = ScriptedBackend::with(Script::default());
    let view = LiveView::new(backend, Arc::new(RoomHub::new()), cache, TimingConfig::default());

    let chosen = view.start(Some("g1")).await.unwrap();
    assert_eq!(chosen.as_deref(), Some("g2"));
    assert_eq!(view.active_garden().await.as_deref(), Some("g2"));
}

#[tokio::test]
async fn cached_state_paints_before_network_and_suppresses_loading() {
    let cache = DurableCache::in_memory();
    cache.persist("g1", CacheKind::Sensor, &reading(18.0));
    cache.persist(
        "g1",
        CacheKind::Device,
        &DeviceStateSet { light: true, ..Default::default() },
    );
    let backend = ScriptedBackend::with(Script {
        sensor: Err(LiveError::Backend("offline".into())),
        devices: Err(LiveError::Backend("offline".into())),
        ..Default::default()
    });
    let view = view_over(backend, &RoomHub::new(), cache).await;

    view.select_garden("g1").await;
    let state = view.state().await;
    assert_eq!(state.sensor.unwrap().temperature, Some(18.0));
    assert!(state.devices.light);
    assert!(!state.sensor_loading);
    // nothing fresh was accepted
    assert!(state.last_updated.is_none());
}

#[tokio::test]
async fn partial_fetch_failure_commits_the_rest() {
    let history: Vec<SensorSnapshot> = (0..24)
        .rev()
        .map(|hour| SensorSnapshot {
            temperature: Some(hour as f64),
            timestamp: Some(format!("2024-06-01T{:02}:00:00Z", hour)),
            ..Default::default()
        })
        .collect();
    let cache = DurableCache::in_memory();
    cache.persist("g1", CacheKind::Device, &DeviceStateSet { fan: true, ..Default::default() });
    let backend = ScriptedBackend::with(Script {
        sensor: Ok(SensorSnapshot { temperature: Some(25.0), ..Default::default() }),
        devices: Err(LiveError::Backend("device service down".into())),
        history: Ok(history),
        ..Default::default()
    });
    let view = view_over(backend, &RoomHub::new(), cache).await;

    view.select_garden("g1").await;
    let state = view.state().await;
    assert_eq!(state.sensor.as_ref().unwrap().temperature, Some(25.0));
    assert!(state.last_updated.is_some());
    assert_eq!(state.devices, DeviceStateSet { fan: true, ..Default::default() });
    assert_eq!(state.chart.len(), 24);
    assert_eq!(state.chart[0].temperature, Some(0.0));
    assert_eq!(state.chart[23].temperature, Some(23.0));
    let message = state.error.expect("one error surfaced");
    assert!(message.contains("device service down"), "{}", message);

    let err = view.load_snapshot("g1").await.unwrap_err();
    assert!(matches!(err, LiveError::PartialFetchFailure(_)));
}

#[tokio::test]
async fn history_failure_clears_chart() {
    let backend = ScriptedBackend::with(Script {
        history: Ok(vec![reading(20.0)]),
        ..Default::default()
    });
    let view = view_over(backend.clone(), &RoomHub::new(), DurableCache::in_memory()).await;
    view.select_garden("g1").await;
    assert_eq!(view.state().await.chart.len(), 1);

    backend.edit(|s| s.history = Err(LiveError::Backend("timeout".into())));
    assert!(view.load_snapshot("g1").await.is_err());
    assert!(view.state().await.chart.is_empty());
}

#[tokio::test]
async fn late_response_after_switch_is_discarded() {
    let gate = Arc::new(Notify::new());
    let mut script = Script::default();
    script.sensor = Ok(reading(99.0));
    script.sensor_gates.insert("g1".into(), gate.clone());
    let backend = ScriptedBackend::with(script);
    let view = view_over(backend.clone(), &RoomHub::new(), DurableCache::in_memory()).await;

    let first = tokio::spawn({
        let view = view.clone();
        async move { view.select_garden("g1").await }
    });
    while backend.count("sensor:g1") == 0 {
        tokio::task::yield_now().await;
    }

    backend.edit(|s| s.sensor = Ok(reading(21.0)));
    view.select_garden("g2").await;
    gate.notify_one();
    first.await.unwrap();

    let state = view.state().await;
    assert_eq!(state.garden_id.as_deref(), Some("g2"));
    assert_eq!(state.sensor.unwrap().temperature, Some(21.0));
}

#[tokio::test]
async fn late_device_and_history_responses_after_switch_are_discarded() {
    let devices_gate = Arc::new(Notify::new());
    let history_gate = Arc::new(Notify::new());
    let mut script = Script::default();
    script.devices = Ok(DeviceStateSet { fan: true, pump: true, ..Default::default() });
    script.history = Ok(vec![reading(30.0), reading(31.0)]);
    script.device_gates.insert("g1".into(), devices_gate.clone());
    script.history_gates.insert("g1".into(), history_gate.clone());
    let backend = ScriptedBackend::with(script);
    let cache = DurableCache::in_memory();
    let view = view_over(backend.clone(), &RoomHub::new(), cache.clone()).await;

    let first = tokio::spawn({
        let view = view.clone();
        async move { view.select_garden("g1").await }
    });
    until_called(&backend, "devices:g1").await;
    until_called(&backend, "history:g1").await;

    backend.edit(|s| {
        s.devices = Ok(DeviceStateSet { light: true, ..Default::default() });
        s.history = Ok(vec![reading(22.0)]);
    });
    view.select_garden("g2").await;
    devices_gate.notify_one();
    history_gate.notify_one();
    first.await.unwrap();

    let state = view.state().await;
    assert_eq!(state.garden_id.as_deref(), Some("g2"));
    assert_eq!(state.devices, DeviceStateSet { light: true, ..Default::default() });
    assert_eq!(state.chart.len(), 1);
    assert_eq!(state.chart[0].temperature, Some(22.0));
    assert!(state.error.is_none());
    // the late g1 set was never written anywhere
    assert_eq!(cache.hydrate::<DeviceStateSet>("g1", CacheKind::Device), None);
}

#[tokio::test(start_paused = true)]
async fn reselecting_the_active_garden_changes_nothing() {
    let hub = RoomHub::new();
    let backend = ScriptedBackend::with(Script::default());
    let view = view_over(backend.clone(), &hub, DurableCache::in_memory()).await;
    view.select_garden("g1").await;
    view.control(CommandKey::Pump, true).await.unwrap();
    assert_eq!(view.cooldown(CommandKey::Pump), 20);

    assert!(view.select_garden("g1").await);
    assert_eq!(view.cooldown(CommandKey::Pump), 20);
    assert_eq!(
        view.control(CommandKey::Pump, false).await,
        Err(LiveError::DeviceCooling { device: CommandKey::Pump, remaining: 20 })
    );
    assert_eq!(backend.count("control"), 1);
    assert!(view.state().await.devices.pump);
    assert_eq!(backend.count("sensor:g1"), 1);
    assert_eq!(hub.members("g1"), 1);
}

#[tokio::test]
async fn reselecting_keeps_a_pending_auto_write() {
    let gate = Arc::new(Notify::new());
    let backend = ScriptedBackend::with(Script {
        auto: Err(LiveError::Backend("rejected".into())),
        auto_gate: Some(gate.clone()),
        ..Default::default()
    });
    let view = view_over(backend.clone(), &RoomHub::new(), DurableCache::in_memory()).await;
    view.select_garden("g1").await;

    let toggle = tokio::spawn({
        let view = view.clone();
        async move { view.toggle_auto_mode().await }
    });
    until_called(&backend, "auto:g1:true").await;
    assert!(view.select_garden("g1").await);
    assert!(view.state().await.auto_write.is_pending());

    gate.notify_one();
    assert!(toggle.await.unwrap().is_err());
    assert!(!view.state().await.devices.auto);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_selections_stay_in_the_active_gardens_room() {
    let hub = RoomHub::new();
    let backend = ScriptedBackend::with(Script::default());
    let view = view_over(backend, &hub, DurableCache::in_memory()).await;

    for _ in 0..50 {
        let a = tokio::spawn({
            let view = view.clone();
            async move { view.select_garden("g1").await }
        });
        let b = tokio::spawn({
            let view = view.clone();
            async move { view.select_garden("g2").await }
        });
        assert!(a.await.unwrap());
        assert!(b.await.unwrap());

        let active = view.active_garden().await.unwrap();
        let other = if active == "g1" { "g2" } else { "g1" };
        assert_eq!(hub.members(&active), 1);
        assert_eq!(hub.members(other), 0);
    }
}

// ==============================================================================
// live events
// ==============================================================================

#[tokio::test]
async fn sensor_events_merge_field_by_field() {
    let backend = ScriptedBackend::with(Script::default());
    let view = view_over(backend, &RoomHub::new(), DurableCache::in_memory()).await;
    view.select_garden("g1").await;

    assert!(view.apply_live_event(sensor_event("g1", |u| u.temperature = Some(22.0))).await);
    assert!(view.apply_live_event(sensor_event("g1", |u| u.soil = Some(61.0))).await);
    assert!(
        view.apply_live_event(sensor_event("g1", |u| {
            u.temperature = Some(23.5);
            u.humidity = Some(45.0);
        }))
        .await
    );

    let sensor = view.state().await.sensor.unwrap();
    assert_eq!(sensor.temperature, Some(23.5));
    assert_eq!(sensor.humidity, Some(45.0));
    assert_eq!(sensor.soil, Some(61.0));
    // never mentioned, keeps the fetched value
    assert_eq!(sensor.light, Some(300.0));
}

#[tokio::test]
async fn event_for_another_garden_changes_nothing() {
    let backend = ScriptedBackend::with(Script::default());
    let view = view_over(backend, &RoomHub::new(), DurableCache::in_memory()).await;
    view.select_garden("g1").await;
    let before = view.state().await;

    assert!(!view.apply_live_event(sensor_event("g2", |u| u.temperature = Some(40.0))).await);
    assert!(!view.apply_live_event(device_event("g2", "FAN", true)).await);

    let after = view.state().await;
    assert_eq!(after.sensor, before.sensor);
    assert_eq!(after.devices, before.devices);
    assert_eq!(after.last_updated, before.last_updated);
}

#[tokio::test]
async fn switching_gardens_leaves_the_old_room_first() {
    let hub = RoomHub::new();
    let backend = ScriptedBackend::with(Script::default());
    let view = view_over(backend, &hub, DurableCache::in_memory()).await;

    view.select_garden("g1").await;
    assert_eq!(hub.members("g1"), 1);
    view.select_garden("g2").await;
    assert_eq!(hub.members("g1"), 0);
    assert_eq!(hub.members("g2"), 1);

    assert_eq!(hub.publish(sensor_event("g1", |u| u.temperature = Some(40.0))), 0);
    // a g1 event still in flight on the new room is rejected by the guard
    assert_eq!(hub.publish_to("g2", sensor_event("g1", |u| u.temperature = Some(41.0))), 1);
    settle().await;
    assert_eq!(view.state().await.sensor.unwrap().temperature, Some(20.0));

    assert_eq!(hub.publish(sensor_event("g2", |u| u.temperature = Some(26.0))), 1);
    settle().await;
    assert_eq!(view.state().await.sensor.unwrap().temperature, Some(26.0));
}

#[tokio::test]
async fn device_event_maps_legacy_pump_key_and_persists() {
    let cache = DurableCache::in_memory();
    let backend = ScriptedBackend::with(Script::default());
    let view = view_over(backend, &RoomHub::new(), cache.clone()).await;
    view.select_garden("g1").await;

    assert!(view.apply_live_event(device_event("g1", "PUMP2", true)).await);
    assert!(view.state().await.devices.pump2);
    assert!(!view.apply_live_event(device_event("g1", "SPRINKLER", true)).await);

    let cached: DeviceStateSet = cache.hydrate("g1", CacheKind::Device).unwrap();
    assert!(cached.pump2);
}

// ==============================================================================
// commands and cooldowns
// ==============================================================================

#[tokio::test]
async fn control_without_garden_fails() {
    let backend = ScriptedBackend::with(Script::default());
    let view = view_over(backend.clone(), &RoomHub::new(), DurableCache::in_memory()).await;

    assert_eq!(view.control(CommandKey::Fan, true).await, Err(LiveError::NoActiveGarden));
    assert_eq!(view.toggle_auto_mode().await, Err(LiveError::NoActiveGarden));
    assert_eq!(backend.count("control"), 0);
}

#[tokio::test(start_paused = true)]
async fn toggle_then_confirmation_clears_cooldown_early() {
    let backend = ScriptedBackend::with(Script::default());
    let view = view_over(backend.clone(), &RoomHub::new(), DurableCache::in_memory()).await;
    view.select_garden("g1").await;
    assert!(!view.state().await.devices.pump);

    view.control(CommandKey::Pump, true).await.unwrap();
    assert_eq!(view.cooldown(CommandKey::Pump), 20);
    assert!(view.state().await.devices.pump);
    assert_eq!(backend.count("control:g1:PUMP:true"), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        view.control(CommandKey::Pump, false).await,
        Err(LiveError::DeviceCooling { device: CommandKey::Pump, remaining: 19 })
    );
    assert_eq!(backend.count("control"), 1);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(view.cooldown(CommandKey::Pump), 15);
    assert!(view.apply_live_event(device_event("g1", "PUMP", true)).await);
    assert_eq!(view.cooldown(CommandKey::Pump), 0);
    assert_eq!(view.cooldown_timers(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    view.control(CommandKey::Pump, false).await.unwrap();
    assert!(!view.state().await.devices.pump);
}

#[tokio::test(start_paused = true)]
async fn cooldown_runs_out_after_twenty_seconds() {
    let backend = ScriptedBackend::with(Script::default());
    let view = view_over(backend, &RoomHub::new(), DurableCache::in_memory()).await;
    view.select_garden("g1").await;

    view.control(CommandKey::Fan, true).await.unwrap();
    let mut seen = vec![view.cooldown(CommandKey::Fan)];
    // sample half way between ticks
    tokio::time::sleep(Duration::from_millis(500)).await;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        seen.push(view.cooldown(CommandKey::Fan));
    }
    assert_eq!(seen, (0..=20).rev().collect::<Vec<u32>>());
    assert_eq!(view.cooldown_timers(), 0);

    view.control(CommandKey::Fan, false).await.unwrap();
    assert_eq!(view.cooldown(CommandKey::Fan), 20);
}

#[tokio::test(start_paused = true)]
async fn rejected_command_clears_cooldown_for_retry() {
    let backend = ScriptedBackend::with(Script {
        control: Err(LiveError::Backend("device offline".into())),
        ..Default::default()
    });
    let view = view_over(backend.clone(), &RoomHub::new(), DurableCache::in_memory()).await;
    view.select_garden("g1").await;

    let err = view.control(CommandKey::Light, true).await.unwrap_err();
    assert_eq!(err, LiveError::CommandRejected("device offline".into()));
    assert_eq!(view.cooldown(CommandKey::Light), 0);
    assert!(!view.state().await.devices.light);
    assert!(view.state().await.error.is_some());

    backend.edit(|s| s.control = Ok(()));
    view.control(CommandKey::Light, true).await.unwrap();
    assert!(view.state().await.devices.light);
}

#[tokio::test(start_paused = true)]
async fn switching_gardens_drops_cooldowns() {
    let backend = ScriptedBackend::with(Script::default());
    let view = view_over(backend, &RoomHub::new(), DurableCache::in_memory()).await;
    view.select_garden("g1").await;
    view.control(CommandKey::Pump2, true).await.unwrap();
    assert_eq!(view.cooldown(CommandKey::Pump2), 20);

    view.select_garden("g2").await;
    assert_eq!(view.cooldown(CommandKey::Pump2), 0);
    assert_eq!(view.cooldown_timers(), 0);
}

#[tokio::test(start_paused = true)]
async fn cooldown_is_running_before_the_command_reaches_the_backend() {
    let gate = Arc::new(Notify::new());
    let backend = ScriptedBackend::with(Script {
        control_gate: Some(gate.clone()),
        ..Default::default()
    });
    let view = view_over(backend.clone(), &RoomHub::new(), DurableCache::in_memory()).await;
    view.select_garden("g1").await;

    let first = tokio::spawn({
        let view = view.clone();
        async move { view.control(CommandKey::Fan, true).await }
    });
    until_called(&backend, "control:g1:FAN:true").await;
    assert_eq!(view.cooldown(CommandKey::Fan), 20);
    assert!(!view.state().await.devices.fan);

    assert_eq!(
        view.control(CommandKey::Fan, false).await,
        Err(LiveError::DeviceCooling { device: CommandKey::Fan, remaining: 20 })
    );
    assert_eq!(backend.count("control"), 1);

    gate.notify_one();
    first.await.unwrap().unwrap();
    assert!(view.state().await.devices.fan);
}

#[tokio::test(start_paused = true)]
async fn late_command_success_after_switch_is_discarded() {
    let gate = Arc::new(Notify::new());
    let backend = ScriptedBackend::with(Script {
        control_gate: Some(gate.clone()),
        ..Default::default()
    });
    let cache = DurableCache::in_memory();
    let view = view_over(backend.clone(), &RoomHub::new(), cache.clone()).await;
    view.select_garden("g1").await;

    let command = tokio::spawn({
        let view = view.clone();
        async move { view.control(CommandKey::Light, true).await }
    });
    until_called(&backend, "control:g1:LIGHT:true").await;
    view.select_garden("g2").await;

    gate.notify_one();
    assert_eq!(command.await.unwrap(), Ok(()));

    let state = view.state().await;
    assert_eq!(state.garden_id.as_deref(), Some("g2"));
    assert!(!state.devices.light);
    let cached: DeviceStateSet = cache.hydrate("g2", CacheKind::Device).unwrap();
    assert!(!cached.light);
}

#[tokio::test(start_paused = true)]
async fn late_failure_leaves_a_newer_cooldown_alone() {
    let gate = Arc::new(Notify::new());
    let backend = ScriptedBackend::with(Script {
        control: Err(LiveError::Backend("device offline".into())),
        control_gate: Some(gate.clone()),
        ..Default::default()
    });
    let view = view_over(backend.clone(), &RoomHub::new(), DurableCache::in_memory()).await;
    view.select_garden("g1").await;

    let stale = tokio::spawn({
        let view = view.clone();
        async move { view.control(CommandKey::Pump, true).await }
    });
    until_called(&backend, "control:g1:PUMP:true").await;

    view.select_garden("g2").await;
    view.select_garden("g1").await;
    backend.edit(|s| s.control = Ok(()));
    view.control(CommandKey::Pump, false).await.unwrap();
    assert_eq!(view.cooldown(CommandKey::Pump), 20);

    gate.notify_one();
    assert!(stale.await.unwrap().is_err());
    assert_eq!(view.cooldown(CommandKey::Pump), 20);
    assert_eq!(view.cooldown_timers(), 1);
}

#[tokio::test]
async fn auto_mode_rolls_back_when_backend_refuses() {
    let gate = Arc::new(Notify::new());
    let backend = ScriptedBackend::with(Script {
        auto: Err(LiveError::Backend("rejected".into())),
        auto_gate: Some(gate.clone()),
        ..Default::default()
    });
    let view = view_over(backend.clone(), &RoomHub::new(), DurableCache::in_memory()).await;
    view.select_garden("g1").await;
    assert!(!view.state().await.devices.auto);

    let toggle = tokio::spawn({
        let view = view.clone();
        async move { view.toggle_auto_mode().await }
    });
    while backend.count("auto:g1:true") == 0 {
        tokio::task::yield_now().await;
    }
    let pending = view.state().await;
    assert!(pending.devices.auto);
    assert!(pending.auto_write.is_pending());
    assert_eq!(view.toggle_auto_mode().await, Err(LiveError::AutoModePending));

    gate.notify_one();
    let result = toggle.await.unwrap();
    assert_eq!(result, Err(LiveError::CommandRejected("rejected".into())));

    let settled = view.state().await;
    assert!(!settled.devices.auto);
    assert!(settled.error.is_some());
}

#[tokio::test]
async fn auto_mode_commits_on_success() {
    let backend = ScriptedBackend::with(Script::default());
    let view = view_over(backend, &RoomHub::new(), DurableCache::in_memory()).await;
    view.select_garden("g1").await;

    assert_eq!(view.toggle_auto_mode().await, Ok(true));
    assert!(view.state().await.devices.auto);
    assert_eq!(view.toggle_auto_mode().await, Ok(false));
    assert!(!view.state().await.devices.auto);
}

// ==============================================================================
// analysis and staleness
// ==============================================================================

#[tokio::test]
async fn analysis_is_cached_and_rehydrated() {
    let cache = DurableCache::in_memory();
    let backend = ScriptedBackend::with(Script::default());
    let view = view_over(backend, &RoomHub::new(), cache.clone()).await;
    view.select_garden("g1").await;

    let analysis = view.refresh_analysis().await.unwrap();
    assert_eq!(analysis["health"], "good");

    view.select_garden("g2").await;
    assert!(view.state().await.analysis.is_none());
    view.select_garden("g1").await;
    assert_eq!(view.state().await.analysis, Some(analysis));
}

#[tokio::test(start_paused = true)]
async fn staleness_monitor_reloads_quiet_garden() {
    let backend = ScriptedBackend::with(Script::default());
    let view = view_over(backend.clone(), &RoomHub::new(), DurableCache::in_memory()).await;
    view.select_garden("g1").await;
    assert!(view.staleness_armed());
    assert_eq!(backend.count("sensor:g1"), 1);

    // first check at 60s sees data exactly 60s old: not yet stale
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(backend.count("sensor:g1"), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(backend.count("sensor:g1"), 2);

    view.clear_selection().await;
    assert!(!view.staleness_armed());
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(backend.count("sensor:g1"), 2);
}

#[tokio::test(start_paused = true)]
async fn live_events_keep_the_monitor_quiet() {
    let hub = RoomHub::new();
    let backend = ScriptedBackend::with(Script::default());
    let view = view_over(backend.clone(), &hub, DurableCache::in_memory()).await;
    view.select_garden("g1").await;

    for minute in 0..5 {
        tokio::time::sleep(Duration::from_secs(30)).await;
        hub.publish(sensor_event("g1", |u| u.temperature = Some(20.0 + minute as f64)));
        settle().await;
    }
    assert_eq!(backend.count("sensor:g1"), 1);
}

#[tokio::test]
async fn teardown_stops_timers_and_subscription() {
    let hub = RoomHub::new();
    let backend = ScriptedBackend::with(Script::default());
    let view = view_over(backend, &hub, DurableCache::in_memory()).await;
    view.select_garden("g1").await;
    view.control(CommandKey::Fan, true).await.unwrap();

    view.teardown();
    assert_eq!(view.cooldown_timers(), 0);
    assert_eq!(hub.members("g1"), 0);
    assert!(!view.staleness_armed());
}
