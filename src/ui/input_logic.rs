//! Joystick routing.
//!
//! While navigation is enabled the joystick browses messages and sets the
//! brightness; while it is disabled (a pairing prompt is up) only the
//! accept/reject answers get through.

use super::JoystickEvent;
use crate::config::{MAX_BRIGHTNESS, NUM_MESSAGES};

/// What a joystick event asks the badge to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InputAction {
    SelectMessage(i8),
    SetBrightness(u8),
    /// Start user-visible pairing advertising.
    StartPairing,
    /// Answer to the pending passkey prompt.
    MatchConfirmed(bool),
}

/// Previous message, wrapping from the first slot to the last.
pub fn select_prev(active: i8) -> i8 {
    if active <= 0 {
        NUM_MESSAGES as i8 - 1
    } else {
        active - 1
    }
}

/// Next message, wrapping from the last slot to the first. A transient
/// message (negative index) moves to the first slot.
pub fn select_next(active: i8) -> i8 {
    if active < 0 || active + 1 >= NUM_MESSAGES as i8 {
        0
    } else {
        active + 1
    }
}

pub fn brightness_down(level: u8) -> u8 {
    level.saturating_sub(1)
}

pub fn brightness_up(level: u8) -> u8 {
    level.saturating_add(1).min(MAX_BRIGHTNESS)
}

/// Map a joystick event to an action.
pub fn route(
    event: JoystickEvent,
    navigation_enabled: bool,
    active: i8,
    brightness: u8,
) -> Option<InputAction> {
    if !navigation_enabled {
        return match event {
            JoystickEvent::Up => Some(InputAction::MatchConfirmed(true)),
            JoystickEvent::Down => Some(InputAction::MatchConfirmed(false)),
            _ => None,
        };
    }

    match event {
        JoystickEvent::Up => Some(InputAction::SelectMessage(select_prev(active))),
        JoystickEvent::Down => Some(InputAction::SelectMessage(select_next(active))),
        JoystickEvent::Left => Some(InputAction::SetBrightness(brightness_down(brightness))),
        JoystickEvent::Right => Some(InputAction::SetBrightness(brightness_up(brightness))),
        JoystickEvent::CenterLong => Some(InputAction::StartPairing),
        JoystickEvent::Center => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests (run on host, not embedded)
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_selection_wraps() {
        assert_eq!(select_prev(0), 3);
        assert_eq!(select_prev(2), 1);
        assert_eq!(select_next(3), 0);
        assert_eq!(select_next(1), 2);
        assert_eq!(select_next(-1), 0);
    }

    #[test]
    fn brightness_stays_in_range() {
        assert_eq!(brightness_down(0), 0);
        assert_eq!(brightness_up(MAX_BRIGHTNESS), MAX_BRIGHTNESS);
        assert_eq!(brightness_up(7), 8);
    }

    #[test]
    fn navigation_routes() {
        assert_eq!(
            route(JoystickEvent::Down, true, 1, 8),
            Some(InputAction::SelectMessage(2))
        );
        assert_eq!(
            route(JoystickEvent::Left, true, 1, 8),
            Some(InputAction::SetBrightness(7))
        );
        assert_eq!(
            route(JoystickEvent::CenterLong, true, 0, 8),
            Some(InputAction::StartPairing)
        );
        assert_eq!(route(JoystickEvent::Center, true, 0, 8), None);
    }

    #[test]
    fn pairing_prompt_only_accepts_answers() {
        assert_eq!(
            route(JoystickEvent::Up, false, 0, 8),
            Some(InputAction::MatchConfirmed(true))
        );
        assert_eq!(
            route(JoystickEvent::Down, false, 0, 8),
            Some(InputAction::MatchConfirmed(false))
        );
        assert_eq!(route(JoystickEvent::Left, false, 0, 8), None);
        assert_eq!(route(JoystickEvent::CenterLong, false, 0, 8), None);
    }
}
