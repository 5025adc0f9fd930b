//! Firmware library for the ACDC LED message badge.
//!
//! Everything that decides *what* the badge does lives here and runs on
//! the host: the flash record store wrapper and erase sequencer, the
//! configuration store, the BLE connection/pairing state machine, the
//! attribute write dispatcher and the controller that ties them together.
//!
//! Usage: `cargo test` (host) or `cargo build --release --features embedded`
//! (nRF52840 target, see `src/main.rs`).
//!
//! The `embedded` feature adds the hardware glue: SoftDevice GATT server
//! and advertising, `sequential-storage` flash backend, HT16K33 display
//! driver and joystick tasks.

#![cfg_attr(not(test), no_std)]

// Must come first so the logging macros are visible to every module.
#[macro_use]
mod fmt;

pub mod app;
pub mod ble;
pub mod config;
pub mod display;
pub mod error;
pub mod message;
pub mod storage;
pub mod store;
pub mod ui;

pub use app::{BadgeController, BadgeEvent, Io, Task};
pub use error::{Error, FlashError, LinkError};
