//! Bluetooth Module
//!
//! Connects to a DeskBike (or any CSC sensor) and streams raw measurement
//! notifications as [`AppEvent`](crate::domain::models::AppEvent)s.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   ConnectionManager                      │
//! │  (scan / connect / disconnect, one session at a time)    │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ BleAdapter + BleLink
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌────────────┐ ┌────────────┐ ┌────────────┐
//! │  btleplug  │ │  Mock bike │ │ Test fakes │
//! │  platform  │ │  MOCK_BLE  │ │            │
//! └────────────┘ └────────────┘ └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - CSC UUIDs and short-form parsing
//! - [`adapter`] - Adapter capability traits and GATT table types
//! - [`lifecycle`] - Connection lifecycle manager
//! - [`retry`] - Bounded fixed-delay retry
//! - [`gate`] - Single-fire session end signal
//! - [`platform`] - btleplug implementation
//! - [`mock`] - Simulated bike

pub mod adapter;
pub mod gate;
pub mod lifecycle;
pub mod mock;
pub mod platform;
pub mod protocol;
pub mod retry;

pub use lifecycle::{ConnectionManager, LifecycleConfig};
