//! Bluetooth transport engine for the NXT brick.
//!
//! A [`Bluetooth`] engine owns the link to the radio chip through one
//! background arbiter thread. The chip carries either administrative command
//! frames or the raw stream of one connection at a time; the arbiter decides
//! which, switches the chip between the two, and resets it when the protocol
//! goes wrong.
//!
//! ```text
//!            connect / listen / inquire / ...        read / write
//!                          │                              │
//!                          ▼                              ▼
//!                   ┌─────────────┐               ┌──────────────┐
//!                   │  CmdState   │               │ Channel[0..4]│
//!                   │ one request │               │  buffers     │
//!                   └──────┬──────┘               └──────┬───────┘
//!                          └────────────┐   ┌────────────┘
//!                                       ▼   ▼
//!                                  ┌───────────┐   command ⇄ stream
//!                                  │  Arbiter  │──────────────────► HardwareLink
//!                                  └───────────┘
//! ```
//!
//! Only one administrative command is in flight at a time. Callers block on
//! it; a second caller queues behind the first.

mod arbiter;
mod channel;
mod engine;
mod events;

pub mod address;
pub mod bluetooth;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;

pub use address::BtAddress;
pub use bluetooth::{Bluetooth, LinkState};
pub use brickcomm_conn::{Available, ConnError, ConnState, IoMode};
pub use channel::SwitchPolicy;
pub use config::{EngineConfig, Settings, DEFAULT_PIN, MAX_PIN_LEN};
pub use connection::Connection;
pub use device::{DeviceInfo, DiscoveryListener, InquiryStatus};
pub use engine::{LinkMode, RequestState, CHANNELS};
pub use error::{BtError, Result};
