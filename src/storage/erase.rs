//! Erase-all sequencer (factory reset).
//!
//! Walks the file-id space from 0 upward, requesting a delete for every
//! file that still holds a record. When the backend queue is full the walk
//! stops and remembers the rejected file id; the next completion event
//! resumes from exactly that id. Once the whole space has been visited a
//! single garbage collection is queued, and its completion ends the
//! sequence. Collections that were already queued ahead of it complete
//! first and do not count.

use super::RecordStorage;
use crate::config::ERASE_FILE_ID_END;
use crate::error::FlashError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErasePhase {
    /// No erase running.
    Idle,
    /// Waiting for queue space to request a delete for `next_file`.
    Paused { next_file: u16 },
    /// Scan done, waiting for queue space to request the closing GC.
    GcDeferred,
    /// Closing GC queued.
    Collecting,
}

pub struct EraseAll {
    phase: ErasePhase,
    end: u16,
    /// Other collections queued ahead of the closing one.
    gcs_ahead: u32,
}

impl EraseAll {
    pub const fn new() -> Self {
        Self::with_end(ERASE_FILE_ID_END)
    }

    /// Sequencer that visits file ids `0..end`.
    pub const fn with_end(end: u16) -> Self {
        Self {
            phase: ErasePhase::Idle,
            end,
            gcs_ahead: 0,
        }
    }

    pub fn phase(&self) -> ErasePhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase != ErasePhase::Idle
    }

    /// File id the scan will resume from, if it is waiting on the queue.
    pub fn paused_at(&self) -> Option<u16> {
        match self.phase {
            ErasePhase::Paused { next_file } => Some(next_file),
            _ => None,
        }
    }

    /// Begin a fresh scan from file 0. `gcs_outstanding` is the number of
    /// collections already queued on `storage`.
    pub fn start(
        &mut self,
        storage: &mut impl RecordStorage,
        gcs_outstanding: u32,
    ) -> Result<(), FlashError> {
        if self.is_active() {
            warn!("erase: already running");
            return Ok(());
        }
        self.gcs_ahead = gcs_outstanding;
        self.scan_from(0, storage)
    }

    /// Someone else queued a collection while the erase runs.
    pub fn note_foreign_gc(&mut self) {
        // Once ours is queued, later ones complete after it.
        if self.is_active() && self.phase != ErasePhase::Collecting {
            self.gcs_ahead += 1;
        }
    }

    /// A queued operation finished, so there is queue space again.
    pub fn on_queue_progress(&mut self, storage: &mut impl RecordStorage) {
        let result = match self.phase {
            ErasePhase::Paused { next_file } => self.scan_from(next_file, storage),
            ErasePhase::GcDeferred => self.request_gc(storage),
            ErasePhase::Idle | ErasePhase::Collecting => Ok(()),
        };
        if let Err(e) = result {
            error!("erase: aborted: {}", e);
        }
    }

    /// A GC finished. Returns `true` when it was the closing GC of an erase.
    pub fn on_gc_complete(&mut self, storage: &mut impl RecordStorage) -> bool {
        if self.phase == ErasePhase::Collecting && self.gcs_ahead == 0 {
            self.phase = ErasePhase::Idle;
            return true;
        }
        if self.is_active() {
            self.gcs_ahead = self.gcs_ahead.saturating_sub(1);
        }
        self.on_queue_progress(storage);
        false
    }

    fn scan_from(
        &mut self,
        mut file: u16,
        storage: &mut impl RecordStorage,
    ) -> Result<(), FlashError> {
        while file < self.end {
            if let Err(FlashError::NotFound) = storage.find_in_file(file) {
                file += 1;
                continue;
            }

            match storage.delete_file(file) {
                Ok(()) => debug!("erase: delete of file {} queued", file),
                Err(FlashError::NoSpaceInQueues) => {
                    debug!("erase: queue full, pausing at file {}", file);
                    self.phase = ErasePhase::Paused { next_file: file };
                    return Ok(());
                }
                Err(e) => warn!("erase: delete of file {} rejected: {}", file, e),
            }
            file += 1;
        }

        debug!("erase: scan complete, starting gc");
        self.request_gc(storage)
    }

    fn request_gc(&mut self, storage: &mut impl RecordStorage) -> Result<(), FlashError> {
        match storage.gc() {
            Ok(()) => {
                self.phase = ErasePhase::Collecting;
                Ok(())
            }
            Err(FlashError::NoSpaceInQueues) => {
                self.phase = ErasePhase::GcDeferred;
                Ok(())
            }
            Err(e) => {
                // Nothing left to wait for; let boot continue.
                self.phase = ErasePhase::Idle;
                Err(e)
            }
        }
    }
}

impl Default for EraseAll {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests (run on host, not embedded)
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::super::ram::{QueuedOp, RamStorage};
    use super::*;

    /// Storage holding one record in each of files `0..files`, queue empty.
    fn populated(files: u16, queue_depth: usize) -> RamStorage {
        let mut storage = RamStorage::with_queue_depth(queue_depth.max(files as usize + 1));
        storage.process(); // init
        for file in 0..files {
            storage
                .write(super::super::Record {
                    file_id: file,
                    key: 1,
                    data: &[file as u8; 4],
                })
                .unwrap();
        }
        while storage.process().is_some() {}
        storage.set_queue_depth(queue_depth);
        storage
    }

    fn queued_deletes(storage: &RamStorage) -> std::vec::Vec<u16> {
        storage
            .queued()
            .filter_map(|op| match op {
                QueuedOp::DeleteFile { file_id } => Some(*file_id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn empty_store_goes_straight_to_gc() {
        let mut storage = RamStorage::new();
        storage.process();
        let mut erase = EraseAll::with_end(32);
        erase.start(&mut storage, 0).unwrap();
        assert_eq!(erase.phase(), ErasePhase::Collecting);
        assert!(matches!(storage.queued().next(), Some(QueuedOp::Gc)));

        storage.process();
        assert!(erase.on_gc_complete(&mut storage));
        assert!(!erase.is_active());
    }

    #[test]
    fn deletes_every_populated_file_then_collects() {
        let mut storage = populated(5, 16);
        let mut erase = EraseAll::with_end(32);
        erase.start(&mut storage, 0).unwrap();

        assert_eq!(queued_deletes(&storage), [0, 1, 2, 3, 4]);
        assert_eq!(erase.phase(), ErasePhase::Collecting);

        while let Some(ev) = storage.process() {
            if ev.op == super::super::FlashOp::Gc {
                assert!(erase.on_gc_complete(&mut storage));
            } else {
                erase.on_queue_progress(&mut storage);
            }
        }
        assert!(!erase.is_active());
        assert_eq!(storage.find_in_file(3), Err(FlashError::NotFound));
    }

    #[test]
    fn queue_full_resumes_at_rejected_file() {
        // 20 populated files, queue only fits 7 deletes: file 7 is rejected.
        let mut storage = populated(20, 7);
        let mut erase = EraseAll::with_end(20);
        erase.start(&mut storage, 0).unwrap();

        assert_eq!(queued_deletes(&storage), [0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(erase.paused_at(), Some(7));

        // One delete completes; the scan picks up at 7, not 0 and not 8.
        storage.process();
        erase.on_queue_progress(&mut storage);
        assert_eq!(queued_deletes(&storage), [1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(erase.paused_at(), Some(8));
    }

    #[test]
    fn queue_full_run_completes_with_one_gc() {
        let mut storage = populated(20, 3);
        let mut erase = EraseAll::with_end(20);
        erase.start(&mut storage, 0).unwrap();

        let mut done = false;
        while let Some(ev) = storage.process() {
            if ev.op == super::super::FlashOp::Gc {
                done = erase.on_gc_complete(&mut storage);
            } else {
                erase.on_queue_progress(&mut storage);
            }
        }

        assert!(done);
        assert_eq!(storage.gc_count(), 1);
        assert_eq!(storage.stat().unwrap().valid_records, 0);
    }

    #[test]
    fn gc_rejected_for_queue_space_is_retried() {
        let mut storage = populated(2, 2);
        let mut erase = EraseAll::with_end(4);
        erase.start(&mut storage, 0).unwrap();
        // Two deletes fill the queue; the GC has to wait.
        assert_eq!(erase.phase(), ErasePhase::GcDeferred);

        storage.process();
        erase.on_queue_progress(&mut storage);
        assert_eq!(erase.phase(), ErasePhase::Collecting);
    }

    #[test]
    fn start_while_running_is_ignored() {
        let mut storage = populated(3, 1);
        let mut erase = EraseAll::with_end(8);
        erase.start(&mut storage, 0).unwrap();
        assert_eq!(erase.paused_at(), Some(1));
        erase.start(&mut storage, 0).unwrap();
        assert_eq!(erase.paused_at(), Some(1));
    }

    #[test]
    fn earlier_gc_does_not_finish_the_erase() {
        let mut storage = populated(2, 8);
        storage.gc().unwrap();
        let mut erase = EraseAll::with_end(4);
        erase.start(&mut storage, 1).unwrap();
        assert_eq!(erase.phase(), ErasePhase::Collecting);

        // The collection queued before the erase completes first.
        let ev = storage.process().unwrap();
        assert_eq!(ev.op, super::super::FlashOp::Gc);
        assert!(!erase.on_gc_complete(&mut storage));
        assert!(erase.is_active());

        let mut done = false;
        while let Some(ev) = storage.process() {
            if ev.op == super::super::FlashOp::Gc {
                done = erase.on_gc_complete(&mut storage);
            } else {
                assert!(!done);
                erase.on_queue_progress(&mut storage);
            }
        }
        assert!(done);
        assert_eq!(storage.stat().unwrap().valid_records, 0);
    }

    #[test]
    fn gc_queued_during_scan_is_skipped() {
        let mut storage = populated(3, 1);
        let mut erase = EraseAll::with_end(8);
        erase.start(&mut storage, 0).unwrap();
        assert_eq!(erase.paused_at(), Some(1));

        // Someone else grabs the freed slot before the scan resumes.
        storage.process();
        storage.gc().unwrap();
        erase.note_foreign_gc();
        erase.on_queue_progress(&mut storage);
        assert_eq!(erase.paused_at(), Some(1));

        let mut gcs = 0;
        let mut done = false;
        while let Some(ev) = storage.process() {
            if ev.op == super::super::FlashOp::Gc {
                gcs += 1;
                done = erase.on_gc_complete(&mut storage);
                assert_eq!(done, gcs == 2);
            } else {
                erase.on_queue_progress(&mut storage);
            }
        }
        assert!(done);
        assert_eq!(storage.stat().unwrap().valid_records, 0);
    }
}
