//! User interface - joystick input and the 14-segment LED display.
//!
//! ## Components
//!
//! - **Joystick**: 5-way switch with debouncing and centre long-press
//! - **Display**: HT16K33-driven 8-character 14-segment display via I²C
//!
//! Routing of joystick events onto badge actions ([`input_logic`]),
//! message animation ([`animation`]) and the factory self-test
//! ([`selftest`]) are pure logic and run on the host.

pub mod animation;
#[cfg(feature = "embedded")]
pub mod buttons;
#[cfg(feature = "embedded")]
pub mod ht16k33;
pub mod input_logic;
pub mod selftest;

/// Joystick events (after debouncing).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum JoystickEvent {
    Up,
    Down,
    Left,
    Right,
    Center,
    /// Centre held for `LONG_PRESS_MS`.
    CenterLong,
}
