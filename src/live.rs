//! ==============================================================================
//! live.rs - push events and garden rooms
//! ==============================================================================
//!
//! purpose:
//!     the live channel delivers state changes as they happen. clients join
//!     a per-garden room and receive two kinds of events:
//!
//!         sensor_data_update    { garden_id, ...partial sensor fields }
//!         device_status_update  { garden_id, device, state }
//!
//! subscription model:
//!     `join` hands back a Subscription: the event receiver plus a Membership
//!     guard. leaving the room is disposing the guard, either explicitly with
//!     `leave()` or by dropping it. the view leaves the old room before it
//!     joins the next one.
//!
//!     events can still arrive tagged with a garden that is no longer active
//!     (they were in flight while we switched), so consumers must check the
//!     garden id themselves; membership alone is not a guarantee.
//!
//! relationships:
//!     - used by: view.rs (subscriber pump), main.rs (webhook ingestion)
//!
//! ==============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::domain::SensorUpdate;

/// buffered events per room before slow receivers start lagging
const ROOM_CAPACITY: usize = 64;

// ==============================================================================
// events
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatusUpdate {
    pub garden_id: String,
    /// upper-snake wire key, e.g. `PUMP_2`
    pub device: String,
    pub state: bool,
}

/// wire envelope: `{"event": "<name>", "data": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum LiveEvent {
    #[serde(rename = "sensor_data_update")]
    SensorData(SensorUpdate),
    #[serde(rename = "device_status_update")]
    DeviceStatus(DeviceStatusUpdate),
}

impl LiveEvent {
    pub fn garden_id(&self) -> &str {
        match self {
            Self::SensorData(update) => &update.garden_id,
            Self::DeviceStatus(update) => &update.garden_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SensorData(_) => "sensor_data_update",
            Self::DeviceStatus(_) => "device_status_update",
        }
    }
}

// ==============================================================================
// subscriptions
// ==============================================================================

/// room membership; leaving is idempotent and also happens on drop
pub struct Membership {
    leave: Option<Box<dyn FnOnce() + Send>>,
}

impl Membership {
    pub fn leave(&mut self) {
        if let Some(leave) = self.leave.take() {
            leave();
        }
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.leave();
    }
}

pub struct Subscription {
    pub events: broadcast::Receiver<LiveEvent>,
    pub membership: Membership,
}

/// something that can put us in a garden's room
pub trait LiveChannel: Send + Sync {
    fn join(&self, garden_id: &str) -> Subscription;
}

// ==============================================================================
// in-process room hub
// ==============================================================================

struct Room {
    sender: broadcast::Sender<LiveEvent>,
    members: usize,
}

/// broadcast rooms keyed by garden id
///
/// the daemon feeds it from the `/hooks/live` endpoint; tests publish to it
/// directly.
#[derive(Clone, Default)]
pub struct RoomHub {
    rooms: Arc<Mutex<HashMap<String, Room>>>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// deliver an event to the room of the garden it is tagged with;
    /// returns how many subscribers received it
    pub fn publish(&self, event: LiveEvent) -> usize {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        match rooms.get(event.garden_id()) {
            Some(room) => room.sender.send(event).unwrap_or(0),
            None => {
                tracing::trace!(garden = %event.garden_id(), "no room for {}", event.name());
                0
            }
        }
    }

    /// deliver an event into a specific room regardless of its tag
    pub fn publish_to(&self, garden_id: &str, event: LiveEvent) -> usize {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms
            .get(garden_id)
            .map(|room| room.sender.send(event).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn members(&self, garden_id: &str) -> usize {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms.get(garden_id).map(|room| room.members).unwrap_or(0)
    }
}

impl LiveChannel for RoomHub {
    fn join(&self, garden_id: &str) -> Subscription {
        let events = {
            let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
            let room = rooms.entry(garden_id.to_string()).or_insert_with(|| Room {
                sender: broadcast::channel(ROOM_CAPACITY).0,
                members: 0,
            });
            room.members += 1;
            room.sender.subscribe()
        };
        tracing::debug!(garden = %garden_id, "joined garden room");

        let rooms = Arc::clone(&self.rooms);
        let room_id = garden_id.to_string();
        let leave = move || {
            let mut rooms = rooms.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(room) = rooms.get_mut(&room_id) {
                room.members = room.members.saturating_sub(1);
                if room.members == 0 {
                    rooms.remove(&room_id);
                }
            }
            tracing::debug!(garden = %room_id, "left garden room");
        };

        Subscription {
            events,
            membership: Membership {
                leave: Some(Box::new(leave)),
            },
        }
    }
}
