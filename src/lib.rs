//! ==============================================================================
//! garden-live - live state reconciliation for smart-garden dashboards
//! ==============================================================================
//!
//! purpose:
//!     keeps one coherent view of a garden's sensors and actuators while
//!     data arrives from three places at once: the durable cache, http
//!     snapshots and live push events. device commands go through a
//!     per-device cooldown so overlapping commands cannot be issued.
//!
//! modules:
//!     - domain:      gardens, readings, device keys
//!     - cache:       last-known state per garden
//!     - backend:     garden REST api (trait + reqwest client)
//!     - live:        push events and garden rooms
//!     - cooldown:    per-device command timers
//!     - optimistic:  two-phase writes with rollback
//!     - staleness:   periodic backstop refresh
//!     - history:     history rows -> chart series
//!     - selection:   initial garden choice
//!     - view:        the orchestrating LiveView
//!     - server:      local http api over a LiveView
//!
//! ==============================================================================

pub mod backend;
pub mod cache;
pub mod config;
pub mod cooldown;
pub mod domain;
pub mod error;
pub mod history;
pub mod live;
pub mod optimistic;
pub mod selection;
pub mod server;
pub mod staleness;
pub mod view;

pub use error::{LiveError, LiveResult};
pub use view::{GardenState, LiveSnapshot, LiveView};
