//! HT16K33 14-segment display driver and the display task.
//!
//! The controller never touches I²C: its [`Renderer`] is a [`DisplayLink`]
//! that posts the latest frame request to [`DISPLAY_FRAME`]. The display
//! task owns the bus, applies power/brightness and animates the message.

use crate::config::{DEFAULT_BRIGHTNESS, DISPLAY_I2C_ADDR, DISPLAY_UPDATE_PERIOD_MS, DISPLAY_WIDTH};
use crate::display::Renderer;
use crate::message::MessageSlot;
use crate::ui::animation::{glyph, Animator, Window};
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Ticker};
use embedded_hal::i2c::Error as _;
use embedded_hal_async::i2c::I2c;

const CMD_WRITE_RAM: u8 = 0x00;
const CMD_OSCILLATOR: u8 = 0x20;
const CMD_DISPLAY: u8 = 0x80;
const CMD_DIMMING: u8 = 0xE0;

pub struct Ht16k33<I2C> {
    i2c: I2C,
    addr: u8,
}

impl<I2C: I2c> Ht16k33<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self {
            i2c,
            addr: DISPLAY_I2C_ADDR & 0x7F,
        }
    }

    /// Start the oscillator, switch the display on at default brightness.
    pub async fn init(&mut self) -> Result<(), I2C::Error> {
        self.command(CMD_OSCILLATOR | 1).await?;
        self.set_on(true).await?;
        self.set_brightness(DEFAULT_BRIGHTNESS).await
    }

    /// Display on/off, blinking disabled.
    pub async fn set_on(&mut self, on: bool) -> Result<(), I2C::Error> {
        self.command(CMD_DISPLAY | on as u8).await
    }

    pub async fn set_brightness(&mut self, level: u8) -> Result<(), I2C::Error> {
        self.command(CMD_DIMMING | (level & 0x0F)).await
    }

    /// Write one frame, low byte of each segment pattern first.
    pub async fn write_window(&mut self, window: &Window) -> Result<(), I2C::Error> {
        let mut buf = [0u8; 1 + DISPLAY_WIDTH * 2];
        buf[0] = CMD_WRITE_RAM;
        for (i, &c) in window.iter().enumerate() {
            let [lo, hi] = glyph(c).to_le_bytes();
            buf[1 + i * 2] = lo;
            buf[2 + i * 2] = hi;
        }
        self.i2c.write(self.addr, &buf).await
    }

    async fn command(&mut self, cmd: u8) -> Result<(), I2C::Error> {
        self.i2c.write(self.addr, &[cmd]).await
    }
}

/// What the controller last asked the display to show.
pub struct Frame {
    pub slot: MessageSlot,
    pub on: bool,
    pub brightness: u8,
    pub restart: bool,
}

pub static DISPLAY_FRAME: Signal<CriticalSectionRawMutex, Frame> = Signal::new();

/// [`Renderer`] handed to the controller on target.
#[derive(Default)]
pub struct DisplayLink {
    restart: bool,
}

impl Renderer for DisplayLink {
    fn render(&mut self, slot: &MessageSlot, on: bool, brightness: u8) {
        DISPLAY_FRAME.signal(Frame {
            slot: slot.clone(),
            on,
            brightness,
            restart: core::mem::take(&mut self.restart),
        });
    }

    fn restart(&mut self) {
        self.restart = true;
    }
}

/// Drive the display forever.
pub async fn display_task<I2C: I2c>(i2c: I2C) -> ! {
    let mut dev = Ht16k33::new(i2c);
    if let Err(e) = dev.init().await {
        warn!("display: init failed: {}", defmt::Debug2Format(&e.kind()));
    }
    info!("display: ready");

    let mut anim = Animator::new();
    let mut current: Option<Frame> = None;
    let mut ticker = Ticker::every(Duration::from_millis(DISPLAY_UPDATE_PERIOD_MS));

    loop {
        match select(DISPLAY_FRAME.wait(), ticker.next()).await {
            Either::First(frame) => {
                let power_changed = current.as_ref().map(|c| c.on) != Some(frame.on);
                let level_changed = current.as_ref().map(|c| c.brightness) != Some(frame.brightness);
                if power_changed && dev.set_on(frame.on).await.is_err() {
                    warn!("display: power command failed");
                }
                if level_changed && dev.set_brightness(frame.brightness).await.is_err() {
                    warn!("display: dimming command failed");
                }
                if frame.restart {
                    anim.restart();
                }
                if dev.write_window(&anim.frame(&frame.slot)).await.is_err() {
                    warn!("display: frame write failed");
                }
                current = Some(frame);
            }
            Either::Second(()) => {
                let Some(frame) = current.as_ref() else {
                    continue;
                };
                if frame.on
                    && anim.tick(&frame.slot)
                    && dev.write_window(&anim.frame(&frame.slot)).await.is_err()
                {
                    warn!("display: frame write failed");
                }
            }
        }
    }
}
