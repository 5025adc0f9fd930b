//! Configuration store - message slots and device name, synced with flash.
//!
//! Dirty tracking works on checksums kept in RAM only: one CRC-16 per slot,
//! holding the value of the slot as of the last flush (or load). A slot
//! whose current checksum differs is dirty. Nothing about the cache is
//! ever persisted.

use crate::config::{
    FILE_ID_MESSAGES, FILE_ID_METADATA, FIRSTBOOT_MAGIC, MAX_RECORD_LEN, MSG_WIRE_LEN,
    NUM_MESSAGES, RECORD_KEY_DEVICE_NAME, RECORD_KEY_FIRSTBOOT, RECORD_KEY_MESSAGE_BASE,
};
use crate::error::FlashError;
use crate::message::{
    default_device_name, default_slots, device_name_from_bytes, DeviceName, MessageSlot,
};
use crate::storage::{FlashStore, RecordStorage};

/// Record key for message slot `index`.
pub const fn message_key(index: usize) -> u16 {
    RECORD_KEY_MESSAGE_BASE + index as u16
}

/// Slot index stored under `key` in the messages file, if any.
pub fn slot_for_key(key: u16) -> Option<usize> {
    let index = key.checked_sub(RECORD_KEY_MESSAGE_BASE)? as usize;
    (index < NUM_MESSAGES).then_some(index)
}

/// In-memory message table and identity.
pub struct ConfigStore {
    slots: [MessageSlot; NUM_MESSAGES],
    /// Checksum per slot as last flushed; `None` forces a rewrite.
    checksums: [Option<u16>; NUM_MESSAGES],
    name: DeviceName,
}

impl ConfigStore {
    /// Store holding the compiled-in defaults, all slots clean.
    pub fn new() -> Self {
        let mut store = Self {
            slots: default_slots(),
            checksums: [None; NUM_MESSAGES],
            name: default_device_name(),
        };
        store.refresh_checksums();
        store
    }

    pub fn slots(&self) -> &[MessageSlot; NUM_MESSAGES] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Option<&MessageSlot> {
        self.slots.get(index)
    }

    pub fn name(&self) -> &DeviceName {
        &self.name
    }

    /// Slot `index` differs from what was last flushed.
    pub fn is_dirty(&self, index: usize) -> bool {
        match (self.slots.get(index), self.checksums.get(index)) {
            (Some(slot), Some(cached)) => *cached != Some(slot.checksum()),
            _ => false,
        }
    }

    /// Bit `i` set when slot `i` is dirty.
    pub fn dirty_mask(&self) -> u8 {
        (0..NUM_MESSAGES)
            .filter(|&i| self.is_dirty(i))
            .fold(0, |mask, i| mask | (1 << i))
    }

    /// Forget that slot `index` was flushed, so the next pass rewrites it.
    pub fn invalidate(&mut self, index: usize) {
        if let Some(cached) = self.checksums.get_mut(index) {
            *cached = None;
        }
    }

    /// Replace slot `index` outright.
    pub fn set_slot(&mut self, index: usize, slot: MessageSlot) -> bool {
        match self.slots.get_mut(index) {
            Some(current) => {
                *current = slot;
                true
            }
            None => false,
        }
    }

    /// Apply a raw attribute write to slot `index`.
    ///
    /// A write at offset 0 replaces the whole value (bytes past the end of
    /// the payload read as zero); a write at a later offset patches the
    /// current encoding. Bytes past the wire length are dropped. The slot
    /// is only replaced when the result decodes, so readers never see a
    /// half-applied value. Returns whether the slot changed.
    pub fn apply_slot_write(&mut self, index: usize, offset: usize, data: &[u8]) -> bool {
        let Some(current) = self.slots.get(index) else {
            return false;
        };
        if data.is_empty() || offset >= MSG_WIRE_LEN {
            return false;
        }

        let mut raw = if offset == 0 {
            [0u8; MSG_WIRE_LEN]
        } else {
            current.encode()
        };
        let len = data.len().min(MSG_WIRE_LEN - offset);
        raw[offset..offset + len].copy_from_slice(&data[..len]);

        match MessageSlot::decode(&raw) {
            Some(slot) if slot != *current => {
                self.slots[index] = slot;
                true
            }
            Some(_) => false,
            None => {
                warn!("store: slot {} write has unknown mode {}", index, raw[0]);
                false
            }
        }
    }

    /// Read every slot from flash.
    ///
    /// A missing record leaves that slot at its compiled-in default; any
    /// other error aborts the load. Checksums are recomputed afterwards.
    pub fn load<S: RecordStorage>(&mut self, flash: &FlashStore<S>) -> Result<(), FlashError> {
        let mut buf = [0u8; MAX_RECORD_LEN];
        for index in 0..NUM_MESSAGES {
            match flash.get(FILE_ID_MESSAGES, message_key(index), &mut buf) {
                Ok(len) => match MessageSlot::decode(&buf[..len]) {
                    Some(slot) => self.slots[index] = slot,
                    None => {
                        warn!("store: slot {} record unreadable, using default", index);
                        self.slots[index] = MessageSlot::default_for(index);
                    }
                },
                Err(FlashError::NotFound) => {
                    debug!("store: slot {} not stored, using default", index);
                    self.slots[index] = MessageSlot::default_for(index);
                }
                Err(e) => {
                    error!("store: loading slot {} failed: {}", index, e);
                    return Err(e);
                }
            }
        }
        self.refresh_checksums();
        info!("store: loaded {} message slots", NUM_MESSAGES);
        Ok(())
    }

    /// Queue a flash write for every dirty slot.
    ///
    /// Returns the number of writes accepted by the flash queue; commit
    /// results arrive later as flash events. If anything was written all
    /// cached checksums are refreshed together, except for slots whose
    /// write was rejected: those stay dirty for the next pass.
    pub fn save_dirty<S: RecordStorage>(
        &mut self,
        flash: &mut FlashStore<S>,
    ) -> Result<usize, FlashError> {
        let mut written = 0;
        let mut rejected = [false; NUM_MESSAGES];
        let mut first_error = None;

        for index in 0..NUM_MESSAGES {
            if !self.is_dirty(index) {
                continue;
            }
            match flash.save(FILE_ID_MESSAGES, message_key(index), &self.slots[index].encode()) {
                Ok(()) => written += 1,
                Err(e) => {
                    rejected[index] = true;
                    first_error.get_or_insert(e);
                }
            }
        }

        if written > 0 {
            self.refresh_checksums();
        }
        for (index, _) in rejected.iter().enumerate().filter(|(_, r)| **r) {
            self.invalidate(index);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                if written > 0 {
                    debug!("store: queued {} slot writes", written);
                }
                Ok(written)
            }
        }
    }

    /// Load the stored device name, falling back to the default.
    pub fn load_name<S: RecordStorage>(&mut self, flash: &FlashStore<S>) -> Result<(), FlashError> {
        let mut buf = [0u8; MAX_RECORD_LEN];
        match flash.get(FILE_ID_METADATA, RECORD_KEY_DEVICE_NAME, &mut buf) {
            Ok(len) => {
                let name = device_name_from_bytes(&buf[..len]);
                self.name = if name.is_empty() {
                    default_device_name()
                } else {
                    name
                };
                Ok(())
            }
            Err(FlashError::NotFound) => {
                self.name = default_device_name();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Adopt `name` and persist it immediately.
    pub fn save_name<S: RecordStorage>(
        &mut self,
        flash: &mut FlashStore<S>,
        name: DeviceName,
    ) -> Result<(), FlashError> {
        self.name = name;
        flash.save(FILE_ID_METADATA, RECORD_KEY_DEVICE_NAME, self.name.as_bytes())
    }

    /// True until the first-boot record carries the magic value.
    pub fn needs_first_boot<S: RecordStorage>(&self, flash: &FlashStore<S>) -> bool {
        let mut buf = [0u8; 4];
        match flash.get(FILE_ID_METADATA, RECORD_KEY_FIRSTBOOT, &mut buf) {
            Ok(4) => u32::from_le_bytes(buf) != FIRSTBOOT_MAGIC,
            _ => true,
        }
    }

    pub fn finish_first_boot<S: RecordStorage>(
        &self,
        flash: &mut FlashStore<S>,
    ) -> Result<(), FlashError> {
        flash.save(
            FILE_ID_METADATA,
            RECORD_KEY_FIRSTBOOT,
            &FIRSTBOOT_MAGIC.to_le_bytes(),
        )
    }

    fn refresh_checksums(&mut self) {
        for (cached, slot) in self.checksums.iter_mut().zip(self.slots.iter()) {
            *cached = Some(slot.checksum());
        }
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests (run on host, not embedded)
// ═══════════════════════════════════════════════════════════════════════════
