//! In-memory record storage.
//!
//! Behaves like the flash data storage the badge runs on, minus the
//! flash: operations queue up to a configurable depth and only take
//! effect when [`RamStorage::process`] commits them, which also produces
//! the completion event. Updates and deletes leave dirty records behind
//! until a GC, and the simulated flash fills up when live plus dirty
//! records exceed its capacity.
//!
//! Used by the host test-suite; also handy as a stand-in backend when
//! bringing up a board without reserved flash pages.

use super::{FlashEvent, FlashOp, FlashStat, Record, RecordDesc, RecordStorage};
use crate::config::{FLASH_QUEUE_DEPTH, MAX_RECORD_LEN};
use crate::error::FlashError;
use heapless::{Deque, Vec};

/// Upper bound for the configurable queue depth.
pub const MAX_QUEUE_DEPTH: usize = 32;

/// Live records the simulated flash can hold.
pub const RECORD_CAPACITY: usize = 32;

/// Record slots (live + dirty) before writes fail with `NoSpaceInFlash`.
pub const FLASH_RECORD_SLOTS: u32 = 48;

type Payload = Vec<u8, MAX_RECORD_LEN>;

/// An operation waiting in the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueuedOp {
    Init,
    Write {
        file_id: u16,
        key: u16,
        data: Payload,
    },
    Update {
        record_id: u32,
        file_id: u16,
        key: u16,
        data: Payload,
    },
    DeleteFile {
        file_id: u16,
    },
    Gc,
}

impl QueuedOp {
    fn event_header(&self) -> (FlashOp, u16, u16) {
        match self {
            QueuedOp::Init => (FlashOp::Init, 0, 0),
            QueuedOp::Write { file_id, key, .. } => (FlashOp::Write, *file_id, *key),
            QueuedOp::Update { file_id, key, .. } => (FlashOp::Update, *file_id, *key),
            QueuedOp::DeleteFile { file_id } => (FlashOp::DeleteFile, *file_id, 0),
            QueuedOp::Gc => (FlashOp::Gc, 0, 0),
        }
    }
}

#[derive(Clone, Debug)]
struct StoredRecord {
    record_id: u32,
    file_id: u16,
    key: u16,
    data: Payload,
}

pub struct RamStorage {
    records: Vec<StoredRecord, RECORD_CAPACITY>,
    queue: Deque<QueuedOp, MAX_QUEUE_DEPTH>,
    queue_depth: usize,
    next_record_id: u32,
    dirty_records: u32,
    corruption: bool,
    fail_next: Option<FlashError>,
    gc_count: u32,
    commit_count: u32,
}

impl RamStorage {
    /// Empty storage with the firmware's queue depth. An `Init` operation
    /// is already queued.
    pub fn new() -> Self {
        Self::with_queue_depth(FLASH_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(depth: usize) -> Self {
        let mut storage = Self {
            records: Vec::new(),
            queue: Deque::new(),
            queue_depth: depth.clamp(1, MAX_QUEUE_DEPTH),
            next_record_id: 1,
            dirty_records: 0,
            corruption: false,
            fail_next: None,
            gc_count: 0,
            commit_count: 0,
        };
        let _ = storage.queue.push_back(QueuedOp::Init);
        storage
    }

    /// Simulated reset: committed records survive, queued work is lost and
    /// a fresh `Init` is queued.
    pub fn power_cycle(&self) -> Self {
        let mut storage = Self::with_queue_depth(self.queue_depth);
        storage.records = self.records.clone();
        storage.next_record_id = self.next_record_id;
        storage.dirty_records = self.dirty_records;
        storage.corruption = self.corruption;
        storage
    }

    pub fn set_queue_depth(&mut self, depth: usize) {
        self.queue_depth = depth.clamp(1, MAX_QUEUE_DEPTH);
    }

    pub fn set_corruption(&mut self, corrupted: bool) {
        self.corruption = corrupted;
    }

    /// Make the next committed operation fail with `error` instead of
    /// taking effect.
    pub fn fail_next_commit(&mut self, error: FlashError) {
        self.fail_next = Some(error);
    }

    pub fn queued(&self) -> impl Iterator<Item = &QueuedOp> {
        self.queue.iter()
    }

    /// Completed garbage collections.
    pub fn gc_count(&self) -> u32 {
        self.gc_count
    }

    /// Successfully committed writes and updates.
    pub fn commit_count(&self) -> u32 {
        self.commit_count
    }

    /// Committed payload of a record.
    pub fn record(&self, file_id: u16, key: u16) -> Option<&[u8]> {
        self.records
            .iter()
            .find(|r| r.file_id == file_id && r.key == key)
            .map(|r| r.data.as_slice())
    }

    /// Commit the oldest queued operation and return its completion event.
    pub fn process(&mut self) -> Option<FlashEvent> {
        let op = self.queue.pop_front()?;
        let (kind, file_id, key) = op.event_header();
        let result = match self.fail_next.take() {
            Some(error) => Err(error),
            None => self.commit(op),
        };
        Some(FlashEvent::new(kind, file_id, key, result))
    }

    fn commit(&mut self, op: QueuedOp) -> Result<(), FlashError> {
        match op {
            QueuedOp::Init => Ok(()),
            QueuedOp::Write { file_id, key, data } => {
                self.ensure_slot()?;
                let record_id = self.allocate_id();
                self.records
                    .push(StoredRecord {
                        record_id,
                        file_id,
                        key,
                        data,
                    })
                    .map_err(|_| FlashError::NoSpaceInFlash)?;
                self.commit_count += 1;
                Ok(())
            }
            QueuedOp::Update { record_id, data, .. } => {
                self.ensure_slot()?;
                let new_id = self.allocate_id();
                let record = self
                    .records
                    .iter_mut()
                    .find(|r| r.record_id == record_id)
                    .ok_or(FlashError::NotFound)?;
                record.record_id = new_id;
                record.data = data;
                self.dirty_records += 1;
                self.commit_count += 1;
                Ok(())
            }
            QueuedOp::DeleteFile { file_id } => {
                let before = self.records.len();
                self.records.retain(|r| r.file_id != file_id);
                self.dirty_records += (before - self.records.len()) as u32;
                Ok(())
            }
            QueuedOp::Gc => {
                self.dirty_records = 0;
                self.corruption = false;
                self.gc_count += 1;
                Ok(())
            }
        }
    }

    fn ensure_slot(&self) -> Result<(), FlashError> {
        if self.records.len() as u32 + self.dirty_records >= FLASH_RECORD_SLOTS {
            return Err(FlashError::NoSpaceInFlash);
        }
        Ok(())
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_record_id;
        self.next_record_id = self.next_record_id.wrapping_add(1).max(1);
        id
    }

    fn enqueue(&mut self, op: QueuedOp) -> Result<(), FlashError> {
        if self.queue.len() >= self.queue_depth {
            return Err(FlashError::NoSpaceInQueues);
        }
        self.queue
            .push_back(op)
            .map_err(|_| FlashError::NoSpaceInQueues)
    }

    fn payload(record: &Record<'_>) -> Result<Payload, FlashError> {
        if record.data.is_empty() || record.data.len() % 4 != 0 {
            return Err(FlashError::InvalidLength);
        }
        Vec::from_slice(record.data).map_err(|_| FlashError::RecordTooLarge)
    }
}

impl Default for RamStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStorage for RamStorage {
    fn find(&self, file_id: u16, key: u16) -> Result<RecordDesc, FlashError> {
        self.records
            .iter()
            .find(|r| r.file_id == file_id && r.key == key)
            .map(|r| RecordDesc {
                record_id: r.record_id,
            })
            .ok_or(FlashError::NotFound)
    }

    fn find_in_file(&self, file_id: u16) -> Result<RecordDesc, FlashError> {
        self.records
            .iter()
            .find(|r| r.file_id == file_id)
            .map(|r| RecordDesc {
                record_id: r.record_id,
            })
            .ok_or(FlashError::NotFound)
    }

    fn read(&self, desc: RecordDesc, buf: &mut [u8]) -> Result<usize, FlashError> {
        let record = self
            .records
            .iter()
            .find(|r| r.record_id == desc.record_id)
            .ok_or(FlashError::NotFound)?;
        let len = record.data.len().min(buf.len());
        buf[..len].copy_from_slice(&record.data[..len]);
        Ok(len)
    }

    fn write(&mut self, record: Record<'_>) -> Result<(), FlashError> {
        let data = Self::payload(&record)?;
        self.enqueue(QueuedOp::Write {
            file_id: record.file_id,
            key: record.key,
            data,
        })
    }

    fn update(&mut self, desc: RecordDesc, record: Record<'_>) -> Result<(), FlashError> {
        let data = Self::payload(&record)?;
        self.enqueue(QueuedOp::Update {
            record_id: desc.record_id,
            file_id: record.file_id,
            key: record.key,
            data,
        })
    }

    fn delete_file(&mut self, file_id: u16) -> Result<(), FlashError> {
        self.enqueue(QueuedOp::DeleteFile { file_id })
    }

    fn stat(&self) -> Result<FlashStat, FlashError> {
        Ok(FlashStat {
            valid_records: self.records.len() as u32,
            dirty_records: self.dirty_records,
            corruption: self.corruption,
        })
    }

    fn gc(&mut self) -> Result<(), FlashError> {
        self.enqueue(QueuedOp::Gc)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests (run on host, not embedded)
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> RamStorage {
        let mut storage = RamStorage::new();
        assert_eq!(storage.process().unwrap().op, FlashOp::Init);
        storage
    }

    fn rec(file_id: u16, key: u16, data: &[u8]) -> Record<'_> {
        Record { file_id, key, data }
    }

    #[test]
    fn nothing_visible_until_processed() {
        let mut storage = ready();
        storage.write(rec(1, 1, b"ABCD")).unwrap();
        assert_eq!(storage.find(1, 1), Err(FlashError::NotFound));

        let ev = storage.process().unwrap();
        assert_eq!(ev, FlashEvent::new(FlashOp::Write, 1, 1, Ok(())));
        assert!(storage.find(1, 1).is_ok());
        assert_eq!(storage.record(1, 1), Some(&b"ABCD"[..]));
    }

    #[test]
    fn unaligned_payload_rejected() {
        let mut storage = ready();
        assert_eq!(
            storage.write(rec(1, 1, b"ABC")),
            Err(FlashError::InvalidLength)
        );
    }

    #[test]
    fn queue_depth_is_enforced() {
        let mut storage = RamStorage::with_queue_depth(2);
        storage.process();
        storage.gc().unwrap();
        storage.delete_file(3).unwrap();
        assert_eq!(storage.gc(), Err(FlashError::NoSpaceInQueues));
    }

    #[test]
    fn update_marks_old_copy_dirty() {
        let mut storage = ready();
        storage.write(rec(2, 1, b"AAAA")).unwrap();
        storage.process();
        let desc = storage.find(2, 1).unwrap();
        storage.update(desc, rec(2, 1, b"BBBB")).unwrap();
        storage.process();

        let stat = storage.stat().unwrap();
        assert_eq!(stat.valid_records, 1);
        assert_eq!(stat.dirty_records, 1);
        assert_eq!(storage.record(2, 1), Some(&b"BBBB"[..]));
        assert_ne!(storage.find(2, 1).unwrap(), desc);
    }

    #[test]
    fn fills_up_until_gc() {
        let mut storage = ready();
        storage.write(rec(2, 1, b"AAAA")).unwrap();
        storage.process();
        for _ in 0..FLASH_RECORD_SLOTS - 1 {
            let desc = storage.find(2, 1).unwrap();
            storage.update(desc, rec(2, 1, b"BBBB")).unwrap();
            storage.process().unwrap().result.unwrap();
        }
        let desc = storage.find(2, 1).unwrap();
        storage.update(desc, rec(2, 1, b"CCCC")).unwrap();
        assert_eq!(
            storage.process().unwrap().result,
            Err(FlashError::NoSpaceInFlash)
        );

        storage.gc().unwrap();
        storage.process();
        let desc = storage.find(2, 1).unwrap();
        storage.update(desc, rec(2, 1, b"CCCC")).unwrap();
        assert_eq!(storage.process().unwrap().result, Ok(()));
    }

    #[test]
    fn power_cycle_keeps_committed_records_only() {
        let mut storage = ready();
        storage.write(rec(2, 1, b"KEEP")).unwrap();
        storage.process();
        storage.write(rec(2, 2, b"LOST")).unwrap();

        let mut rebooted = storage.power_cycle();
        assert_eq!(rebooted.process().unwrap().op, FlashOp::Init);
        assert_eq!(rebooted.record(2, 1), Some(&b"KEEP"[..]));
        assert_eq!(rebooted.record(2, 2), None);
        assert!(rebooted.process().is_none());
    }
}
