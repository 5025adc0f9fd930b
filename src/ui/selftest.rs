//! Factory self-test, run on first boot and after a factory reset.
//!
//! A lamp test lights every segment until any switch is pressed, then the
//! display names each switch in turn and the user presses it. A wrong
//! switch fails the test.

use super::JoystickEvent;

const LAMP_TEST: &str = "********";

/// Switches in the order they are prompted.
const SEQUENCE: [(JoystickEvent, &str); 5] = [
    (JoystickEvent::Center, "CENTER"),
    (JoystickEvent::Up, "UP"),
    (JoystickEvent::Left, "LEFT"),
    (JoystickEvent::Right, "RIGHT"),
    (JoystickEvent::Down, "DOWN"),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SelfTestState {
    LampTest,
    /// Waiting for the switch at this position of the sequence.
    Expect(usize),
    Passed,
    Failed,
}

pub struct SelfTest {
    state: SelfTestState,
}

impl SelfTest {
    pub const fn new() -> Self {
        Self {
            state: SelfTestState::LampTest,
        }
    }

    pub fn state(&self) -> SelfTestState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, SelfTestState::Passed | SelfTestState::Failed)
    }

    /// Text the display should show right now.
    pub fn prompt(&self) -> &'static str {
        match self.state {
            SelfTestState::LampTest => LAMP_TEST,
            SelfTestState::Expect(i) => SEQUENCE[i].1,
            SelfTestState::Passed => "PASS",
            SelfTestState::Failed => "FAIL",
        }
    }

    /// Feed one debounced press.
    pub fn on_press(&mut self, event: JoystickEvent) -> SelfTestState {
        // A held centre is still the centre switch.
        let event = match event {
            JoystickEvent::CenterLong => JoystickEvent::Center,
            other => other,
        };

        self.state = match self.state {
            SelfTestState::LampTest => SelfTestState::Expect(0),
            SelfTestState::Expect(i) if SEQUENCE[i].0 != event => {
                warn!("selftest: expected {}, got {}", SEQUENCE[i].0, event);
                SelfTestState::Failed
            }
            SelfTestState::Expect(i) if i + 1 == SEQUENCE.len() => SelfTestState::Passed,
            SelfTestState::Expect(i) => SelfTestState::Expect(i + 1),
            done => done,
        };
        self.state
    }
}

impl Default for SelfTest {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests (run on host, not embedded)
// ═══════════════════════════════════════════════════════════════════════════
