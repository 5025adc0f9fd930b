//! Flash record store.
//!
//! Key-addressed, word-aligned records grouped into files, stored through
//! an asynchronous backend: every mutating call only *queues* work and the
//! outcome arrives later as a [`FlashEvent`] that the event loop feeds back
//! into [`FlashStore::on_event`].
//!
//! Layout used by the badge:
//!   - `FILE_ID_METADATA`: device name, first-boot flag.
//!   - `FILE_ID_MESSAGES`: one record per message slot, keyed by base + index.
//!
//! Backends:
//!   - [`ram::RamStorage`] - deterministic in-memory simulation (host tests).
//!   - `nor::NorStorage` - `sequential-storage` on the nRF52840 internal
//!     flash (embedded builds).

pub mod erase;
#[cfg(feature = "embedded")]
pub mod nor;
pub mod ram;

use crate::config::{GC_DIRTY_RECORD_THRESHOLD, MAX_RECORD_LEN};
use crate::error::FlashError;
use erase::EraseAll;
use heapless::Vec;

/// Opaque handle to a stored record, valid until the record is updated or deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecordDesc {
    pub record_id: u32,
}

/// A record handed to the backend. `data` is always a whole number of words.
#[derive(Clone, Copy, Debug)]
pub struct Record<'a> {
    pub file_id: u16,
    pub key: u16,
    pub data: &'a [u8],
}

/// Store health snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashStat {
    /// Live records.
    pub valid_records: u32,
    /// Superseded or deleted records still occupying flash until GC.
    pub dirty_records: u32,
    /// The backend found corrupted pages or records.
    pub corruption: bool,
}

/// Which queued operation completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashOp {
    Init,
    Write,
    Update,
    DeleteFile,
    Gc,
}

/// Completion report raised by a backend for each queued operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashEvent {
    pub op: FlashOp,
    pub file_id: u16,
    pub key: u16,
    pub result: Result<(), FlashError>,
}

impl FlashEvent {
    pub const fn new(op: FlashOp, file_id: u16, key: u16, result: Result<(), FlashError>) -> Self {
        Self {
            op,
            file_id,
            key,
            result,
        }
    }
}

/// What the caller of [`FlashStore::on_event`] needs to act on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashOutcome {
    /// Nothing for the caller to do.
    Handled,
    /// The backend finished initialising; reads are now valid.
    Initialized,
    /// A queued write/update did not commit. Not retried by this layer.
    WriteFailed {
        file_id: u16,
        key: u16,
        error: FlashError,
    },
    /// The erase-all sequence (including its final GC) has finished.
    EraseComplete,
}

/// The flash data storage capability the badge is built on.
///
/// Lookups and reads are synchronous. `write`, `update`, `delete_file`
/// and `gc` only queue work and return `NoSpaceInQueues` when the queue is
/// full; each accepted call later yields exactly one [`FlashEvent`].
pub trait RecordStorage {
    /// Locate a record by file and key.
    fn find(&self, file_id: u16, key: u16) -> Result<RecordDesc, FlashError>;

    /// Locate any record in `file_id`.
    fn find_in_file(&self, file_id: u16) -> Result<RecordDesc, FlashError>;

    /// Copy a record's payload into `buf`, returning the number of bytes
    /// copied (the stored length, in whole words, clamped to `buf`).
    fn read(&self, desc: RecordDesc, buf: &mut [u8]) -> Result<usize, FlashError>;

    fn write(&mut self, record: Record<'_>) -> Result<(), FlashError>;

    fn update(&mut self, desc: RecordDesc, record: Record<'_>) -> Result<(), FlashError>;

    fn delete_file(&mut self, file_id: u16) -> Result<(), FlashError>;

    fn stat(&self) -> Result<FlashStat, FlashError>;

    fn gc(&mut self) -> Result<(), FlashError>;
}

/// Word-padded copy of a payload. Odd lengths are rounded up with zeros.
fn pad_to_words(data: &[u8]) -> Result<Vec<u8, MAX_RECORD_LEN>, FlashError> {
    if data.is_empty() {
        return Err(FlashError::InvalidLength);
    }
    let padded_len = data.len().div_ceil(4) * 4;
    if padded_len > MAX_RECORD_LEN {
        return Err(FlashError::RecordTooLarge);
    }

    let mut buf: Vec<u8, MAX_RECORD_LEN> = Vec::new();
    buf.extend_from_slice(data)
        .map_err(|_| FlashError::RecordTooLarge)?;
    buf.resize(padded_len, 0)
        .map_err(|_| FlashError::RecordTooLarge)?;
    Ok(buf)
}

/// Wrapper that adds the badge's policies on top of a [`RecordStorage`]:
/// write-or-update selection, word padding, GC triggering and the
/// erase-all sequence.
pub struct FlashStore<S> {
    backend: S,
    initialized: bool,
    erase: EraseAll,
    /// Collections requested through [`gc`](Self::gc) and not yet completed.
    pending_gcs: u32,
}

impl<S: RecordStorage> FlashStore<S> {
    pub fn new(backend: S) -> Self {
        Self {
            backend,
            initialized: false,
            erase: EraseAll::new(),
            pending_gcs: 0,
        }
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut S {
        &mut self.backend
    }

    /// True once the backend reported `Init`. Written once per boot.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// True from `begin_erase_all` until the closing GC completes.
    pub fn erase_in_progress(&self) -> bool {
        self.erase.is_active()
    }

    pub fn eraser(&self) -> &EraseAll {
        &self.erase
    }

    /// Read a record into `buf`, returning the number of bytes copied.
    pub fn get(&self, file_id: u16, key: u16, buf: &mut [u8]) -> Result<usize, FlashError> {
        let desc = self.backend.find(file_id, key).map_err(|e| {
            if e != FlashError::NotFound {
                debug!("flash: find {}/{} failed: {}", file_id, key, e);
            }
            e
        })?;
        self.backend.read(desc, buf)
    }

    /// Queue a write (record absent) or update (record present).
    pub fn save(&mut self, file_id: u16, key: u16, data: &[u8]) -> Result<(), FlashError> {
        let payload = pad_to_words(data)?;
        let record = Record {
            file_id,
            key,
            data: &payload,
        };

        let result = match self.backend.find(file_id, key) {
            Err(FlashError::NotFound) => {
                debug!("flash: write {}/{} ({} bytes)", file_id, key, payload.len());
                self.backend.write(record)
            }
            Ok(desc) => {
                debug!("flash: update {}/{} ({} bytes)", file_id, key, payload.len());
                self.backend.update(desc, record)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!("flash: save {}/{} rejected: {}", file_id, key, e);
        }
        result
    }

    pub fn delete_file(&mut self, file_id: u16) -> Result<(), FlashError> {
        self.backend.delete_file(file_id)
    }

    pub fn stat(&self) -> Result<FlashStat, FlashError> {
        self.backend.stat()
    }

    pub fn gc(&mut self) -> Result<(), FlashError> {
        info!("flash: starting garbage collection");
        self.backend.gc()?;
        self.pending_gcs += 1;
        self.erase.note_foreign_gc();
        Ok(())
    }

    /// Start deleting every file. Completion is reported through
    /// [`FlashOutcome::EraseComplete`].
    pub fn begin_erase_all(&mut self) -> Result<(), FlashError> {
        info!("flash: erasing all files");
        self.erase.start(&mut self.backend, self.pending_gcs)
    }

    /// Apply completion policy for one backend event.
    pub fn on_event(&mut self, event: &FlashEvent) -> FlashOutcome {
        match event.op {
            FlashOp::Init => {
                if let Err(e) = event.result {
                    error!("flash: init failed: {}", e);
                } else {
                    debug!("flash: init done");
                }
                self.initialized = true;
                FlashOutcome::Initialized
            }
            FlashOp::Write | FlashOp::Update => {
                self.erase.on_queue_progress(&mut self.backend);
                match event.result {
                    Ok(()) => {
                        debug!("flash: write/update {}/{} succeeded", event.file_id, event.key);
                        self.maybe_gc();
                        FlashOutcome::Handled
                    }
                    Err(error) => {
                        error!(
                            "flash: write/update {}/{} failed: {}",
                            event.file_id, event.key, error
                        );
                        if error == FlashError::NoSpaceInFlash {
                            if let Err(e) = self.gc() {
                                warn!("flash: gc request failed: {}", e);
                            }
                        } else {
                            self.maybe_gc();
                        }
                        FlashOutcome::WriteFailed {
                            file_id: event.file_id,
                            key: event.key,
                            error,
                        }
                    }
                }
            }
            FlashOp::DeleteFile => {
                if let Err(e) = event.result {
                    warn!("flash: delete of file {} failed: {}", event.file_id, e);
                }
                self.erase.on_queue_progress(&mut self.backend);
                FlashOutcome::Handled
            }
            FlashOp::Gc => {
                if let Err(e) = event.result {
                    warn!("flash: gc failed: {}", e);
                }
                if self.erase.on_gc_complete(&mut self.backend) {
                    info!("flash: erase finished");
                    FlashOutcome::EraseComplete
                } else {
                    self.pending_gcs = self.pending_gcs.saturating_sub(1);
                    FlashOutcome::Handled
                }
            }
        }
    }

    /// Collect when the store is corrupted or has accumulated too many
    /// stale records.
    fn maybe_gc(&mut self) {
        let stats = match self.backend.stat() {
            Ok(stats) => stats,
            Err(e) => {
                warn!("flash: stat failed: {}", e);
                return;
            }
        };
        if stats.corruption || stats.dirty_records > GC_DIRTY_RECORD_THRESHOLD {
            if let Err(e) = self.gc() {
                warn!("flash: gc request failed: {}", e);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests (run on host, not embedded)
// ═══════════════════════════════════════════════════════════════════════════
