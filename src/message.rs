//! Message slots and the device identity - the badge's persistent data model.
//!
//! A slot travels in one fixed wire layout, used both as the GATT
//! attribute value and as the flash record payload:
//!
//! ```text
//! [0]      update mode (u8)
//! [1..3]   speed (u16, little-endian, display ticks per step)
//! [3..39]  text, NUL-padded, at most MSG_MAX_LEN bytes of ASCII
//! ```

use crate::config::{
    DEFAULT_DEVICE_NAME, DEFAULT_MESSAGES, DEFAULT_MESSAGE_SPEED, DEVICE_NAME_MAX_LEN,
    MSG_MAX_LEN, MSG_WIRE_LEN, NUM_MESSAGES,
};
use crc::{Crc, CRC_16_IBM_3740};
use heapless::String;

/// Text substituted for bytes the display font cannot draw.
const REPLACEMENT_CHAR: char = '?';

/// How a message animates on the display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum UpdateMode {
    Static = 0,
    Scroll = 1,
    Replace = 2,
    ScrambleReveal = 3,
    ScrollLoop = 4,
}

impl TryFrom<u8> for UpdateMode {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Static),
            1 => Ok(Self::Scroll),
            2 => Ok(Self::Replace),
            3 => Ok(Self::ScrambleReveal),
            4 => Ok(Self::ScrollLoop),
            other => Err(other),
        }
    }
}

/// Bounded device name, mirrors the advertised GAP name.
pub type DeviceName = String<DEVICE_NAME_MAX_LEN>;

/// Message text, ASCII only.
pub type MessageText = String<MSG_MAX_LEN>;

/// One stored message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageSlot {
    pub mode: UpdateMode,
    pub speed: u16,
    pub text: MessageText,
}

impl MessageSlot {
    /// Build a slot, truncating `text` to `MSG_MAX_LEN` and replacing
    /// anything outside printable ASCII.
    pub fn new(mode: UpdateMode, speed: u16, text: &str) -> Self {
        Self {
            mode,
            speed,
            text: ascii_text(text.as_bytes()),
        }
    }

    /// Compiled-in content for slot `index`.
    pub fn default_for(index: usize) -> Self {
        let text = DEFAULT_MESSAGES.get(index).copied().unwrap_or("");
        Self::new(UpdateMode::Scroll, DEFAULT_MESSAGE_SPEED, text)
    }

    /// A single-use message (pairing code) shown without touching a slot.
    pub fn transient(text: &str) -> Self {
        Self::new(UpdateMode::Static, 0, text)
    }

    /// Serialize to the fixed wire layout.
    pub fn encode(&self) -> [u8; MSG_WIRE_LEN] {
        let mut buf = [0u8; MSG_WIRE_LEN];
        buf[0] = self.mode as u8;
        buf[1..3].copy_from_slice(&self.speed.to_le_bytes());
        let text = self.text.as_bytes();
        buf[3..3 + text.len()].copy_from_slice(text);
        buf
    }

    /// Parse the wire layout.
    ///
    /// Returns `None` when the mode byte is unknown or the buffer cannot
    /// hold the header. Text stops at the first NUL (or the end of the
    /// buffer) and is clamped to `MSG_MAX_LEN`.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 3 {
            return None;
        }
        let mode = UpdateMode::try_from(data[0]).ok()?;
        let speed = u16::from_le_bytes([data[1], data[2]]);
        let text_bytes = &data[3..];
        let end = text_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(text_bytes.len());

        Some(Self {
            mode,
            speed,
            text: ascii_text(&text_bytes[..end]),
        })
    }

    /// 16-bit checksum over the wire encoding.
    pub fn checksum(&self) -> u16 {
        crc16(&self.encode())
    }
}

/// Compiled-in default for every slot.
pub fn default_slots() -> [MessageSlot; NUM_MESSAGES] {
    core::array::from_fn(MessageSlot::default_for)
}

/// Default advertised name.
pub fn default_device_name() -> DeviceName {
    device_name_from_bytes(DEFAULT_DEVICE_NAME.as_bytes())
}

/// Build a device name from raw bytes (as read back from the link layer
/// or flash). Stops at the first NUL, truncates to the name capacity and
/// drops invalid UTF-8 tails.
pub fn device_name_from_bytes(data: &[u8]) -> DeviceName {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    let mut name = DeviceName::new();
    let valid = match core::str::from_utf8(&data[..end]) {
        Ok(s) => s,
        Err(e) => core::str::from_utf8(&data[..e.valid_up_to()]).unwrap_or(""),
    };
    for c in valid.chars() {
        if name.push(c).is_err() {
            break;
        }
    }
    name
}

fn ascii_text(bytes: &[u8]) -> MessageText {
    let mut text = MessageText::new();
    for &b in bytes.iter().take(MSG_MAX_LEN) {
        let c = if (0x20..0x7F).contains(&b) {
            b as char
        } else {
            REPLACEMENT_CHAR
        };
        // Capacity equals the `take` bound, so this cannot overflow.
        let _ = text.push(c);
    }
    text
}

/// CRC-16/CCITT-FALSE, matching the nRF SDK `crc16_compute` with the
/// default 0xFFFF seed.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests (run on host, not embedded)
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout_matches_wire_format() {
        let slot = MessageSlot::new(UpdateMode::ScrollLoop, 0x0102, "HI");
        let buf = slot.encode();
        assert_eq!(buf.len(), MSG_WIRE_LEN);
        assert_eq!(buf[0], 4);
        assert_eq!(&buf[1..3], &[0x02, 0x01]); // little-endian speed
        assert_eq!(&buf[3..5], b"HI");
        assert!(buf[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn decode_stops_at_nul() {
        let mut buf = [0u8; MSG_WIRE_LEN];
        buf[0] = 1;
        buf[1] = 8;
        buf[3..6].copy_from_slice(b"ABC");
        buf[7] = b'Z'; // after the terminator, ignored
        let slot = MessageSlot::decode(&buf).unwrap();
        assert_eq!(slot.mode, UpdateMode::Scroll);
        assert_eq!(slot.speed, 8);
        assert_eq!(slot.text.as_str(), "ABC");
    }

    #[test]
    fn decode_rejects_unknown_mode_and_short_header() {
        let mut buf = [0u8; MSG_WIRE_LEN];
        buf[0] = 5;
        assert!(MessageSlot::decode(&buf).is_none());
        assert!(MessageSlot::decode(&[1, 0]).is_none());
        assert!(MessageSlot::decode(&[]).is_none());
    }

    #[test]
    fn decode_accepts_header_only() {
        let slot = MessageSlot::decode(&[2, 4, 0]).unwrap();
        assert_eq!(slot.mode, UpdateMode::Replace);
        assert!(slot.text.is_empty());
    }

    #[test]
    fn text_without_terminator_is_clamped() {
        let mut buf = [b'X'; MSG_WIRE_LEN];
        buf[0] = 0;
        let slot = MessageSlot::decode(&buf).unwrap();
        assert_eq!(slot.text.len(), MSG_MAX_LEN);
    }

    #[test]
    fn non_ascii_bytes_are_replaced() {
        let slot = MessageSlot::decode(&[0, 0, 0, b'A', 0xC3, 0xA9, b'\n']).unwrap();
        assert_eq!(slot.text.as_str(), "A???");
    }

    #[test]
    fn defaults_cover_every_slot() {
        let slots = default_slots();
        assert_eq!(slots[0].text.as_str(), DEFAULT_MESSAGES[0]);
        assert_eq!(slots[3].text.as_str(), DEFAULT_MESSAGES[3]);
        assert!(slots.iter().all(|s| s.speed == DEFAULT_MESSAGE_SPEED));
    }

    #[test]
    fn checksum_tracks_every_field() {
        let base = MessageSlot::new(UpdateMode::Static, 16, "HELLO");
        let mut speed = base.clone();
        speed.speed = 17;
        let mut mode = base.clone();
        mode.mode = UpdateMode::Scroll;
        let text = MessageSlot::new(UpdateMode::Static, 16, "HELLP");

        assert_eq!(base.checksum(), base.clone().checksum());
        assert_ne!(base.checksum(), speed.checksum());
        assert_ne!(base.checksum(), mode.checksum());
        assert_ne!(base.checksum(), text.checksum());
    }

    #[test]
    fn crc16_known_vector() {
        // CRC-16/CCITT-FALSE check value.
        assert_eq!(crc16(b"123456789"), 0x29B1);
    }

    #[test]
    fn device_name_truncates_and_stops_at_nul() {
        let name = device_name_from_bytes(b"Badge\0junk");
        assert_eq!(name.as_str(), "Badge");

        let long = [b'N'; 40];
        assert_eq!(device_name_from_bytes(&long).len(), DEVICE_NAME_MAX_LEN);

        let bad_utf8 = [b'O', b'K', 0xFF, b'!'];
        assert_eq!(device_name_from_bytes(&bad_utf8).as_str(), "OK");
    }
}
