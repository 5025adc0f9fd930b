//! Application-wide constants and compile-time configuration.
//!
//! All BLE identifiers, timing parameters, flash layout and message
//! limits live here so they can be tuned in one place.

// Messages

/// Number of stored message slots.
pub const NUM_MESSAGES: usize = 4;

/// Longest message text in bytes. The wire buffer reserves one more byte
/// for the terminating NUL.
pub const MSG_MAX_LEN: usize = 35;

/// Length of the text buffer inside a message attribute.
pub const MSG_TEXT_BUF_LEN: usize = MSG_MAX_LEN + 1;

/// Encoded message attribute: 1 byte mode + 2 byte LE speed + text buffer.
pub const MSG_WIRE_LEN: usize = 1 + 2 + MSG_TEXT_BUF_LEN;

/// Messages shown on a badge whose flash has never been written.
pub const DEFAULT_MESSAGES: [&str; NUM_MESSAGES] = [
    "DC26",
    "HACK THE PLANET",
    "ATTACKER COMMUNITY",
    "SHALL WE PLAY A GAME?",
];

/// Default scroll/update speed (display ticks per step).
pub const DEFAULT_MESSAGE_SPEED: u16 = 16;

// Display

/// Display refresh period (ms). Message speeds count in these ticks.
pub const DISPLAY_UPDATE_PERIOD_MS: u64 = 50;

/// Number of characters on the 14-segment display.
pub const DISPLAY_WIDTH: usize = 8;

/// Highest brightness level accepted by the display driver.
pub const MAX_BRIGHTNESS: u8 = 15;

/// Brightness applied at boot.
pub const DEFAULT_BRIGHTNESS: u8 = 8;

/// HT16K33 I²C address.
pub const DISPLAY_I2C_ADDR: u8 = 0x70;

// BLE identity

/// Advertised name until the user renames the badge.
pub const DEFAULT_DEVICE_NAME: &str = "DC26_Badge";

/// Longest device name the link layer accepts.
pub const DEVICE_NAME_MAX_LEN: usize = 31;

pub const MANUFACTURER_NAME: &str = "AttackerCommunity";

/// Vendor-specific 128-bit base UUID (little-endian, bytes 12..13 carry the short id).
pub const BADGE_UUID_BASE: [u8; 16] = [
    0xd5, 0xc4, 0x19, 0x3c, 0x63, 0x8c, 0xf7, 0xac, 0x06, 0x47, 0x7e, 0xe8, 0x00, 0x00, 0x00, 0x00,
];

pub const BADGE_SERVICE_UUID: u16 = 0x4141;
pub const BADGE_ONOFF_UUID: u16 = 0x4242;
pub const BADGE_INDEX_UUID: u16 = 0x4343;
pub const BADGE_BRIGHTNESS_UUID: u16 = 0x4444;
/// Message slot `i` uses `BADGE_MSG_UUID_FIRST + i`.
pub const BADGE_MSG_UUID_FIRST: u16 = 0x4545;

/// Value handle of the GAP Device Name characteristic. The SoftDevice
/// always registers the GAP service first, so this never moves.
pub const DEVICE_NAME_VALUE_HANDLE: u16 = 0x0003;

// BLE advertising

/// Fast advertising interval (0.625 ms units). 64 = 40 ms.
pub const ADV_FAST_INTERVAL: u32 = 64;

/// Fast advertising duration (10 ms units). 3000 = 30 s.
pub const ADV_FAST_TIMEOUT: u16 = 3000;

/// Slow advertising interval (0.625 ms units). 900 = 562.5 ms.
pub const ADV_SLOW_INTERVAL: u32 = 900;

/// Slow advertising duration (10 ms units). 18000 = 180 s.
pub const ADV_SLOW_TIMEOUT: u16 = 18000;

// BLE connection

/// Connection interval range (1.25 ms units). 80..160 = 100..200 ms.
pub const BLE_CONN_INTERVAL_MIN: u16 = 80;
pub const BLE_CONN_INTERVAL_MAX: u16 = 160;

/// Slave latency (connection events the badge may skip).
pub const BLE_SLAVE_LATENCY: u16 = 0;

/// Supervision timeout (10 ms units). 400 = 4 s.
pub const BLE_SUP_TIMEOUT: u16 = 400;

/// Largest attribute write payload forwarded to the dispatcher.
pub const ATTR_WRITE_MAX_LEN: usize = 64;

/// Upper bound on bonds kept by the security handler.
pub const MAX_BONDED_PEERS: usize = 4;

// Flash layout

/// File holding the device name and first-boot flag.
pub const FILE_ID_METADATA: u16 = 0x0001;
pub const RECORD_KEY_DEVICE_NAME: u16 = 0x0001;
pub const RECORD_KEY_FIRSTBOOT: u16 = 0x0002;

/// File holding one record per message slot.
pub const FILE_ID_MESSAGES: u16 = 0x0002;
/// Slot `i` is stored under `RECORD_KEY_MESSAGE_BASE + i`.
pub const RECORD_KEY_MESSAGE_BASE: u16 = 0x0001;

/// Written once the first-boot self-test has completed.
pub const FIRSTBOOT_MAGIC: u32 = 0xB007_10AD;

/// First file id the erase-all scan does not visit (valid ids are below this).
pub const ERASE_FILE_ID_END: u16 = 0xC000;

/// Dirty (stale) records tolerated before a garbage collection is forced.
pub const GC_DIRTY_RECORD_THRESHOLD: u32 = 10;

/// Largest record payload in bytes (word-padded).
pub const MAX_RECORD_LEN: usize = 40;

/// Flash page index where record storage starts (4 KB per page on nRF52840).
pub const STORAGE_FLASH_PAGE_START: u32 = 240;

/// Number of flash pages reserved for record storage.
pub const STORAGE_FLASH_PAGE_COUNT: u32 = 4;

/// Flash operations that may be queued before callers see `NoSpaceInQueues`.
pub const FLASH_QUEUE_DEPTH: usize = 8;

// Event loop

/// Capacity of the event channel fed by interrupt-side producers.
pub const EVENT_QUEUE_DEPTH: usize = 16;

/// Capacity of the deferred task queue.
pub const TASK_QUEUE_DEPTH: usize = 4;

/// Period of the opportunistic save-all-dirty flush (seconds).
pub const FLUSH_INTERVAL_SECS: u64 = 30;

// Joystick

/// Button debounce time (ms).
pub const BUTTON_DEBOUNCE_MS: u64 = 50;

/// Holding centre this long starts pairing advertising (ms).
pub const LONG_PRESS_MS: u64 = 2000;
