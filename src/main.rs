//! ACDC badge firmware entry point (nRF52840 + SoftDevice S140).
//!
//! Boot order:
//!   1. SoftDevice, GATT server, flash and display tasks start.
//!   2. Wait for the record store to finish loading.
//!   3. Centre held at power-up: erase everything and wait for it.
//!   4. Self-test if the first-boot flag is missing.
//!   5. Load messages and name, then hand the controller to the app task
//!      and start advertising.
//!
//! Wiring: joystick up/down/left/right/centre on P0.04..P0.08 (active
//! low), HT16K33 on TWIM0 with SDA P0.26 and SCL P0.27.

#![no_std]
#![no_main]

use acdc_badge::app::{BadgeController, BadgeEvent, EventSender, Io};
use acdc_badge::ble::softdevice::{self, Bonder, SdLink, Server};
use acdc_badge::config::{DEFAULT_BRIGHTNESS, EVENT_QUEUE_DEPTH, FLUSH_INTERVAL_SECS};
use acdc_badge::display::Renderer;
use acdc_badge::error::Error;
use acdc_badge::message::MessageSlot;
use acdc_badge::storage::nor::{self, NorStorage};
use acdc_badge::storage::FlashOutcome;
use acdc_badge::ui::buttons;
use acdc_badge::ui::ht16k33::{self, DisplayLink};
use acdc_badge::ui::selftest::{SelfTest, SelfTestState};
use acdc_badge::ui::JoystickEvent;
use defmt::{info, unwrap, warn};
use embassy_executor::Spawner;
use embassy_nrf::gpio::{AnyPin, Pin};
use embassy_nrf::interrupt::{self, InterruptExt, Priority};
use embassy_nrf::peripherals::TWISPI0;
use embassy_nrf::{bind_interrupts, twim};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Ticker, Timer};
use nrf_softdevice::{Flash, Softdevice};
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

bind_interrupts!(struct Irqs {
    SPIM0_SPIS0_TWIM0_TWIS0_SPI0_TWI0 => twim::InterruptHandler<TWISPI0>;
});

/// Every producer posts here; only the app task (or boot) receives.
static EVENTS: Channel<CriticalSectionRawMutex, BadgeEvent, EVENT_QUEUE_DEPTH> = Channel::new();

type Badge = BadgeController<NorStorage>;

// ── Tasks ───────────────────────────────────────────────────────────────

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run().await
}

#[embassy_executor::task]
async fn flash_task(flash: Flash, events: EventSender) -> ! {
    nor::run(flash, events).await
}

#[embassy_executor::task]
async fn display_task(i2c: twim::Twim<'static, TWISPI0>) -> ! {
    ht16k33::display_task(i2c).await
}

#[embassy_executor::task(pool_size = 4)]
async fn direction_task(pin: AnyPin, event: JoystickEvent, events: EventSender) -> ! {
    buttons::button_task(pin, event, events).await
}

#[embassy_executor::task]
async fn center_task(pin: AnyPin, events: EventSender) -> ! {
    buttons::center_task(pin, events).await
}

#[embassy_executor::task]
async fn ble_task(
    sd: &'static Softdevice,
    server: &'static Server,
    bonder: &'static Bonder,
    events: EventSender,
) -> ! {
    softdevice::run(sd, server, bonder, events).await
}

/// Periodic flush point so failed writes are eventually retried.
#[embassy_executor::task]
async fn flush_task(events: EventSender) -> ! {
    let mut ticker = Ticker::every(Duration::from_secs(FLUSH_INTERVAL_SECS));
    loop {
        ticker.next().await;
        events.send(BadgeEvent::FlushTimer).await;
    }
}

/// The event loop: handle each burst in arrival order, then run the
/// deferred work it scheduled.
#[embassy_executor::task]
async fn app_task(mut badge: Badge, mut link: SdLink) -> ! {
    let mut screen = DisplayLink::default();
    loop {
        let mut event = EVENTS.receive().await;
        loop {
            let mut io = Io::new(&mut link, &mut screen);
            if let Err(e) = badge.handle(event, &mut io) {
                fatal(e);
            }
            match EVENTS.try_receive() {
                Ok(next) => event = next,
                Err(_) => break,
            }
        }
        badge.run_deferred();
        if let Err(e) = badge.publish(&mut Io::new(&mut link, &mut screen)) {
            fatal(e);
        }
    }
}

/// Debug builds stop under the debugger; release builds log and reset.
#[cfg(debug_assertions)]
fn fatal(e: Error) -> ! {
    defmt::panic!("fatal: {}", e)
}

#[cfg(not(debug_assertions))]
fn fatal(e: Error) -> ! {
    defmt::error!("fatal: {}, resetting", e);
    cortex_m::peripheral::SCB::sys_reset()
}

// ── Boot helpers ────────────────────────────────────────────────────────

/// Feed flash completions to the controller until one yields `outcome`.
/// Anything else arriving this early is dropped.
async fn wait_for_flash(badge: &mut Badge, outcome: FlashOutcome) {
    loop {
        if let BadgeEvent::Flash(event) = EVENTS.receive().await {
            if badge.on_flash_event(&event) == outcome {
                return;
            }
        }
    }
}

async fn self_test(screen: &mut DisplayLink) {
    info!("boot: starting self-test");
    let mut test = SelfTest::new();
    loop {
        screen.restart();
        screen.render(&MessageSlot::transient(test.prompt()), true, DEFAULT_BRIGHTNESS);
        if test.is_finished() {
            break;
        }
        if let BadgeEvent::Joystick(event) = EVENTS.receive().await {
            test.on_press(event);
        }
    }

    if test.state() == SelfTestState::Failed {
        warn!("boot: self-test failed, halting");
        loop {
            Timer::after(Duration::from_secs(3600)).await;
        }
    }
    info!("boot: self-test passed");
    Timer::after(Duration::from_secs(1)).await;
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("ACDC badge starting");

    // SoftDevice reserves priorities 0, 1 and 4.
    let mut config = embassy_nrf::config::Config::default();
    config.gpiote_interrupt_priority = Priority::P2;
    config.time_interrupt_priority = Priority::P2;
    let p = embassy_nrf::init(config);
    interrupt::SPIM0_SPIS0_TWIM0_TWIS0_SPI0_TWI0.set_priority(Priority::P3);

    let events = EVENTS.sender();

    let sd = Softdevice::enable(&softdevice::softdevice_config());
    static SERVER: StaticCell<Server> = StaticCell::new();
    let server: &'static Server = SERVER.init(unwrap!(Server::new(sd, events)));
    let sd: &'static Softdevice = sd;
    let flash = Flash::take(sd);
    unwrap!(spawner.spawn(softdevice_task(sd)));
    unwrap!(spawner.spawn(flash_task(flash, events)));

    let i2c = twim::Twim::new(p.TWISPI0, Irqs, p.P0_26, p.P0_27, twim::Config::default());
    unwrap!(spawner.spawn(display_task(i2c)));

    let mut center = p.P0_08.degrade();
    let factory_reset = buttons::is_held(&mut center);

    for (pin, event) in [
        (p.P0_04.degrade(), JoystickEvent::Up),
        (p.P0_05.degrade(), JoystickEvent::Down),
        (p.P0_06.degrade(), JoystickEvent::Left),
        (p.P0_07.degrade(), JoystickEvent::Right),
    ] {
        unwrap!(spawner.spawn(direction_task(pin, event, events)));
    }
    unwrap!(spawner.spawn(center_task(center, events)));

    let mut badge = Badge::new(NorStorage::new(), server.attribute_table());
    wait_for_flash(&mut badge, FlashOutcome::Initialized).await;

    let mut needs_self_test = false;
    if factory_reset {
        info!("boot: centre held, factory reset");
        match badge.start_factory_reset() {
            Ok(()) if badge.flash().erase_in_progress() => {
                wait_for_flash(&mut badge, FlashOutcome::EraseComplete).await;
            }
            Ok(()) => {}
            Err(e) => warn!("boot: factory reset failed: {}", e),
        }
        needs_self_test = true;
    }

    let mut screen = DisplayLink::default();
    if needs_self_test || badge.needs_first_boot() {
        self_test(&mut screen).await;
        if let Err(e) = badge.finish_first_boot() {
            warn!("boot: first-boot flag not saved: {}", e);
        }
    }

    let bonder = softdevice::bonder(events);
    let mut link = SdLink::new(bonder, server);
    if let Err(e) = badge.boot(&mut Io::new(&mut link, &mut screen), None) {
        fatal(e);
    }
    // Presses made during the self-test are not navigation.
    while let Ok(event) = EVENTS.try_receive() {
        if let BadgeEvent::Flash(event) = event {
            badge.on_flash_event(&event);
        }
    }

    unwrap!(spawner.spawn(app_task(badge, link)));
    unwrap!(spawner.spawn(ble_task(sd, server, bonder, events)));
    unwrap!(spawner.spawn(flush_task(events)));
    info!("boot: running");
}
