//! Joystick input with async debouncing.
//!
//! Five switches (active-low with internal pull-up): up, down, left,
//! right and centre. Each one runs its own task that waits for a GPIO
//! edge, debounces it and posts a `BadgeEvent::Joystick` to the event
//! loop. The centre switch distinguishes a short press from a
//! `LONG_PRESS_MS` hold.

use crate::app::{BadgeEvent, EventSender};
use crate::config::{BUTTON_DEBOUNCE_MS, LONG_PRESS_MS};
use crate::ui::JoystickEvent;
use embassy_futures::select::{select, Either};
use embassy_nrf::gpio::{AnyPin, Input, Pull};
use embassy_time::{Duration, Timer};

/// Run a single direction switch.
///
/// Waits for the pin to go low (pressed), debounces, sends the event,
/// then waits for release before repeating.
pub async fn button_task(pin: AnyPin, event: JoystickEvent, tx: EventSender) -> ! {
    let mut btn = Input::new(pin, Pull::Up);

    loop {
        btn.wait_for_falling_edge().await;
        Timer::after(Duration::from_millis(BUTTON_DEBOUNCE_MS)).await;

        if btn.is_low() {
            info!("joystick: {}", event);
            tx.send(BadgeEvent::Joystick(event)).await;

            btn.wait_for_rising_edge().await;
            Timer::after(Duration::from_millis(BUTTON_DEBOUNCE_MS)).await;
        }
    }
}

/// Run the centre switch: short press or long hold.
pub async fn center_task(pin: AnyPin, tx: EventSender) -> ! {
    let mut btn = Input::new(pin, Pull::Up);
    let hold = Duration::from_millis(LONG_PRESS_MS.saturating_sub(BUTTON_DEBOUNCE_MS));

    loop {
        btn.wait_for_falling_edge().await;
        Timer::after(Duration::from_millis(BUTTON_DEBOUNCE_MS)).await;
        if !btn.is_low() {
            continue;
        }

        let event = match select(btn.wait_for_rising_edge(), Timer::after(hold)).await {
            Either::First(()) => JoystickEvent::Center,
            Either::Second(()) => JoystickEvent::CenterLong,
        };
        info!("joystick: {}", event);
        tx.send(BadgeEvent::Joystick(event)).await;

        if btn.is_low() {
            btn.wait_for_rising_edge().await;
        }
        Timer::after(Duration::from_millis(BUTTON_DEBOUNCE_MS)).await;
    }
}

/// True when `pin` is held down right now (boot-time factory reset check).
pub fn is_held(pin: &mut AnyPin) -> bool {
    let btn = Input::new(pin, Pull::Up);
    btn.is_low()
}
