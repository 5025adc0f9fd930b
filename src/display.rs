//! What the LED display should currently show.
//!
//! The renderer itself (I²C driver, fonts, animation frames) sits behind
//! [`Renderer`]; this module only tracks power, brightness and which
//! message is active, including the transient pairing-code message.

use crate::config::{DEFAULT_BRIGHTNESS, MAX_BRIGHTNESS, NUM_MESSAGES};
use crate::message::MessageSlot;

/// Active index meaning "a transient, non-persisted message is shown".
pub const TRANSIENT_INDEX: i8 = -1;

/// Display collaborator.
pub trait Renderer {
    /// Show `slot` with the given power state and brightness (0..=15).
    fn render(&mut self, slot: &MessageSlot, on: bool, brightness: u8);

    /// Start the current message's animation over from its first frame.
    fn restart(&mut self);
}

pub struct DisplayState {
    on: bool,
    brightness: u8,
    active: i8,
    /// Index to return to once the transient message is dropped.
    saved_active: i8,
    transient: Option<MessageSlot>,
}

impl DisplayState {
    pub const fn new() -> Self {
        Self {
            on: true,
            brightness: DEFAULT_BRIGHTNESS,
            active: 0,
            saved_active: 0,
            transient: None,
        }
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn brightness(&self) -> u8 {
        self.brightness
    }

    /// Active index, or [`TRANSIENT_INDEX`].
    pub fn active_index(&self) -> i8 {
        self.active
    }

    pub fn showing_transient(&self) -> bool {
        self.active == TRANSIENT_INDEX
    }

    pub fn set_on(&mut self, on: bool) {
        self.on = on;
    }

    pub fn set_brightness(&mut self, level: u8) {
        self.brightness = level.min(MAX_BRIGHTNESS);
    }

    /// Switch to stored message `index`. Out-of-range indices are
    /// ignored; returns whether the selection was applied.
    pub fn select(&mut self, index: i8) -> bool {
        if !valid_index(index) {
            return false;
        }
        self.active = index;
        self.saved_active = index;
        self.transient = None;
        true
    }

    /// Make `index` the slot [`restore`](Self::restore) returns to, leaving
    /// a transient message on screen. Same bounds as [`select`](Self::select).
    pub fn select_after_transient(&mut self, index: i8) -> bool {
        if !self.showing_transient() {
            return self.select(index);
        }
        if !valid_index(index) {
            return false;
        }
        self.saved_active = index;
        true
    }

    /// Boot-time choice of the first message: `None` or an out-of-range
    /// index falls back to slot 0.
    pub fn pick_active(&mut self, requested: Option<i8>) {
        let index = requested.filter(|&i| valid_index(i)).unwrap_or(0);
        self.select(index);
    }

    /// Replace the display with a one-off message until [`restore`](Self::restore).
    pub fn show_transient(&mut self, text: &str) {
        if !self.showing_transient() {
            self.saved_active = self.active;
        }
        self.transient = Some(MessageSlot::transient(text));
        self.active = TRANSIENT_INDEX;
    }

    /// Drop the transient message and go back to the previously active
    /// slot. Returns whether anything changed.
    pub fn restore(&mut self) -> bool {
        if !self.showing_transient() {
            return false;
        }
        self.transient = None;
        self.active = self.saved_active;
        true
    }

    /// Message that should be on the display right now.
    pub fn current<'a>(&'a self, slots: &'a [MessageSlot; NUM_MESSAGES]) -> &'a MessageSlot {
        match (&self.transient, usize::try_from(self.active)) {
            (Some(slot), Err(_)) => slot,
            (_, Ok(index)) if index < NUM_MESSAGES => &slots[index],
            _ => &slots[0],
        }
    }

    /// Push the current state to `renderer`.
    pub fn draw(&self, slots: &[MessageSlot; NUM_MESSAGES], renderer: &mut impl Renderer) {
        renderer.render(self.current(slots), self.on, self.brightness);
    }
}

impl Default for DisplayState {
    fn default() -> Self {
        Self::new()
    }
}

fn valid_index(index: i8) -> bool {
    (0..NUM_MESSAGES as i8).contains(&index)
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests (run on host, not embedded)
// ═══════════════════════════════════════════════════════════════════════════
