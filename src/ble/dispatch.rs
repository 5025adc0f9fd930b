//! Attribute write dispatcher.
//!
//! Every write resolves to exactly one action. Nothing here reports an
//! error to the peer: bad lengths and out-of-range values are truncated
//! or ignored.

use super::{AttrWrite, LinkLayer};
use crate::app::{BadgeController, Io, Task};
use crate::ble::connection::check_link;
use crate::config::{DEVICE_NAME_VALUE_HANDLE, NUM_MESSAGES};
use crate::display::Renderer;
use crate::error::Error;
use crate::storage::RecordStorage;

/// Semantic target of an attribute write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Attribute {
    OnOff,
    Brightness,
    ActiveIndex,
    Message(u8),
    DeviceName,
    Unknown(u16),
}

/// Value handles of the badge service, as assigned by the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttributeTable {
    pub on_off: u16,
    pub brightness: u16,
    pub active_index: u16,
    pub messages: [u16; NUM_MESSAGES],
    pub device_name: u16,
}

impl AttributeTable {
    pub fn classify(&self, handle: u16) -> Attribute {
        if handle == self.on_off {
            Attribute::OnOff
        } else if handle == self.brightness {
            Attribute::Brightness
        } else if handle == self.active_index {
            Attribute::ActiveIndex
        } else if handle == self.device_name {
            Attribute::DeviceName
        } else if let Some(i) = self.messages.iter().position(|&h| h == handle) {
            Attribute::Message(i as u8)
        } else {
            Attribute::Unknown(handle)
        }
    }
}

impl Default for AttributeTable {
    /// Layout the SoftDevice produces for the badge service when it is the
    /// first vendor service registered after GAP and GATT.
    fn default() -> Self {
        Self {
            on_off: 0x000E,
            active_index: 0x0010,
            brightness: 0x0012,
            messages: [0x0014, 0x0016, 0x0018, 0x001A],
            device_name: DEVICE_NAME_VALUE_HANDLE,
        }
    }
}

impl<S: RecordStorage> BadgeController<S> {
    pub(crate) fn on_write<L: LinkLayer, R: Renderer>(
        &mut self,
        write: &AttrWrite,
        io: &mut Io<'_, L, R>,
    ) -> Result<(), Error> {
        let attribute = self.attributes.classify(write.handle);
        let data = write.data.as_slice();

        if let Attribute::Unknown(handle) = attribute {
            // Could be a message we failed to classify; let a flush sort it out.
            debug!("dispatch: write to unknown handle {:#x}", handle);
            self.defer(Task::SaveDirty);
            return Ok(());
        }
        let Some(&first) = data.first() else {
            debug!("dispatch: empty write to {} ignored", attribute);
            return Ok(());
        };

        match attribute {
            Attribute::OnOff => {
                self.display.set_on(first & 0x01 != 0);
                self.redraw(io);
            }
            Attribute::Brightness => {
                self.display.set_brightness(first & 0x0F);
                self.redraw(io);
            }
            Attribute::ActiveIndex => {
                let index = first as i8;
                if self.conn.pending_passkey().is_some() {
                    // The code stays up until the prompt is answered.
                    if !self.display.select_after_transient(index) {
                        debug!("dispatch: index {} out of range", index);
                    }
                } else if self.display.select(index) {
                    io.display.restart();
                    self.redraw(io);
                } else {
                    debug!("dispatch: index {} out of range", index);
                }
            }
            Attribute::DeviceName => self.on_name_write(io)?,
            Attribute::Message(slot) => {
                let slot = slot as usize;
                if self.store.apply_slot_write(slot, write.offset as usize, data)
                    && self.display.active_index() == slot as i8
                {
                    io.display.restart();
                    self.redraw(io);
                }
                self.defer(Task::SaveDirty);
            }
            Attribute::Unknown(_) => {}
        }
        Ok(())
    }

    /// The stack has already clamped and stored the name; read it back
    /// from there rather than trusting the raw payload.
    fn on_name_write<L: LinkLayer, R: Renderer>(
        &mut self,
        io: &mut Io<'_, L, R>,
    ) -> Result<(), Error> {
        let name = match io.link.device_name() {
            Ok(name) => name,
            Err(e) => {
                warn!("dispatch: device name read-back failed: {}", e);
                return Ok(());
            }
        };
        info!("dispatch: device renamed to {}", name.as_str());

        if let Err(e) = self.store.save_name(&mut self.flash, name) {
            warn!("dispatch: saving device name failed: {}", e);
        }
        check_link(io.link.refresh_advertising())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests (run on host, not embedded)
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{Harness, LinkCall};
    use crate::app::BadgeEvent;
    use crate::ble::LinkEvent;
    use crate::config::{DEFAULT_MESSAGES, FILE_ID_MESSAGES, FILE_ID_METADATA, RECORD_KEY_DEVICE_NAME};
    use crate::message::{device_name_from_bytes, UpdateMode};
    use crate::storage::ram::QueuedOp;
    use crate::store::message_key;

    fn write(h: &mut Harness, handle: u16, data: &[u8]) {
        h.send(BadgeEvent::Link(LinkEvent::AttributeWrite {
            conn: 1,
            write: AttrWrite::new(handle, 0, data),
        }));
    }

    fn table() -> AttributeTable {
        AttributeTable::default()
    }

    #[test]
    fn classify_covers_every_handle() {
        let t = table();
        assert_eq!(t.classify(t.on_off), Attribute::OnOff);
        assert_eq!(t.classify(t.brightness), Attribute::Brightness);
        assert_eq!(t.classify(t.active_index), Attribute::ActiveIndex);
        assert_eq!(t.classify(t.messages[3]), Attribute::Message(3));
        assert_eq!(t.classify(DEVICE_NAME_VALUE_HANDLE), Attribute::DeviceName);
        assert_eq!(t.classify(0x0099), Attribute::Unknown(0x0099));
    }

    #[test]
    fn on_off_uses_bit_zero() {
        let mut h = Harness::booted();
        write(&mut h, table().on_off, &[0xFE]);
        assert!(!h.badge.display().is_on());
        assert_eq!(h.screen.last_on(), Some(false));
        write(&mut h, table().on_off, &[0x01]);
        assert!(h.badge.display().is_on());
    }

    #[test]
    fn brightness_is_masked_not_rejected() {
        let mut h = Harness::booted();
        write(&mut h, table().brightness, &[0x3C]);
        assert_eq!(h.badge.display().brightness(), 0x0C);
        assert_eq!(h.screen.last_brightness(), Some(0x0C));
    }

    #[test]
    fn display_writes_never_touch_flash() {
        let mut h = Harness::booted();
        write(&mut h, table().on_off, &[0]);
        write(&mut h, table().brightness, &[3]);
        write(&mut h, table().active_index, &[1]);
        assert_eq!(h.badge.flash().backend().queued().count(), 0);
        assert_eq!(h.badge.pending_tasks(), 0);
    }

    #[test]
    fn index_write_selects_and_restarts_animation() {
        let mut h = Harness::booted();
        let restarts = h.screen.restarts;
        write(&mut h, table().active_index, &[2]);
        assert_eq!(h.badge.display().active_index(), 2);
        assert_eq!(h.screen.restarts, restarts + 1);
        assert_eq!(h.screen.last_text(), Some(DEFAULT_MESSAGES[2]));
    }

    #[test]
    fn index_out_of_range_is_a_no_op() {
        let mut h = Harness::booted();
        write(&mut h, table().active_index, &[1]);
        let frames = h.screen.frames.len();

        write(&mut h, table().active_index, &[NUM_MESSAGES as u8]);
        write(&mut h, table().active_index, &[(-2i8) as u8]);
        write(&mut h, table().active_index, &[(-1i8) as u8]);

        assert_eq!(h.badge.display().active_index(), 1);
        assert_eq!(h.screen.frames.len(), frames);
    }

    #[test]
    fn message_write_defers_a_single_flush() {
        let mut h = Harness::booted();
        let handle = table().messages[2];
        h.handle_only(BadgeEvent::Link(LinkEvent::AttributeWrite {
            conn: 1,
            write: AttrWrite::new(handle, 0, &[1, 8, 0, b'N', b'E', b'W']),
        }))
        .unwrap();
        h.handle_only(BadgeEvent::Link(LinkEvent::AttributeWrite {
            conn: 1,
            write: AttrWrite::new(handle, 0, &[1, 8, 0, b'N', b'E', b'W', b'E', b'R']),
        }))
        .unwrap();

        // Both writes applied before anything reaches flash.
        assert_eq!(h.badge.flash().backend().queued().count(), 0);
        assert_eq!(h.badge.pending_tasks(), 1);
        assert_eq!(h.badge.store().slot(2).unwrap().text.as_str(), "NEWER");

        h.badge.run_deferred();
        let writes: std::vec::Vec<_> = h.badge.flash().backend().queued().cloned().collect();
        assert_eq!(writes.len(), 1);
        assert!(matches!(
            &writes[0],
            QueuedOp::Write { file_id: FILE_ID_MESSAGES, key, .. } if *key == message_key(2)
        ));
    }

    #[test]
    fn message_write_with_bad_mode_is_ignored() {
        let mut h = Harness::booted();
        write(&mut h, table().messages[0], &[9, 8, 0, b'X']);
        assert_eq!(h.badge.store().slot(0).unwrap().text.as_str(), DEFAULT_MESSAGES[0]);
        assert_eq!(h.badge.store().dirty_mask(), 0);
    }

    #[test]
    fn active_message_write_redraws() {
        let mut h = Harness::booted();
        write(&mut h, table().messages[0], &[0, 4, 0, b'H', b'I']);
        assert_eq!(h.screen.last_text(), Some("HI"));
        assert_eq!(h.badge.store().slot(0).unwrap().mode, UpdateMode::Static);
    }

    #[test]
    fn unknown_handle_triggers_flush() {
        let mut h = Harness::booted();
        h.badge.store_mut().apply_slot_write(1, 0, &[0, 1, 0, b'Q']);
        h.handle_only(BadgeEvent::Link(LinkEvent::AttributeWrite {
            conn: 1,
            write: AttrWrite::new(0x0042, 0, &[]),
        }))
        .unwrap();
        assert_eq!(h.badge.pending_tasks(), 1);
        h.badge.run_deferred();
        assert_eq!(h.badge.flash().backend().queued().count(), 1);
    }

    #[test]
    fn empty_payload_is_ignored() {
        let mut h = Harness::booted();
        write(&mut h, table().active_index, &[2]);
        write(&mut h, table().active_index, &[]);
        write(&mut h, table().on_off, &[]);
        assert_eq!(h.badge.display().active_index(), 2);
        assert!(h.badge.display().is_on());
    }

    #[test]
    fn rename_reads_back_from_link_and_persists() {
        let mut h = Harness::booted();
        // The stack clamped what the peer sent.
        h.link.name = device_name_from_bytes(b"Crash Override");
        write(&mut h, DEVICE_NAME_VALUE_HANDLE, b"Crash Override and then some");

        assert_eq!(h.badge.store().name().as_str(), "Crash Override");
        assert_eq!(h.link.calls.last(), Some(&LinkCall::RefreshAdvertising));
        assert!(h.badge.flash().backend().queued().any(|op| matches!(
            op,
            QueuedOp::Write { file_id: FILE_ID_METADATA, key: RECORD_KEY_DEVICE_NAME, .. }
        )));
    }
}
