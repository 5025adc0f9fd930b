//! Record storage on the nRF52840 internal flash.
//!
//! Uses the `sequential-storage` key-value map over the pages reserved by
//! `STORAGE_FLASH_PAGE_START`/`STORAGE_FLASH_PAGE_COUNT`. A record is keyed
//! by `(file_id << 16) | key`.
//!
//! Reads must stay synchronous for the controller, so committed records
//! are mirrored in RAM. [`NorStorage`] queues operations on [`FLASH_OPS`];
//! [`run`] (spawned from `main`) commits them, updates the mirror and posts
//! a [`FlashEvent`] per operation to the event loop. Wear levelling and
//! page reclaim are done by `sequential-storage` itself, so GC only has
//! two jobs: rebuilding a corrupted map, and wiping the region once every
//! known record is gone (the closing step of an erase-all), which also
//! drops records the mirror never knew about.

use super::{FlashEvent, FlashOp, FlashStat, Record, RecordDesc, RecordStorage};
use crate::app::{BadgeEvent, EventSender};
use crate::config::{
    FILE_ID_MESSAGES, FILE_ID_METADATA, FLASH_QUEUE_DEPTH, MAX_RECORD_LEN, NUM_MESSAGES,
    RECORD_KEY_DEVICE_NAME, RECORD_KEY_FIRSTBOOT, RECORD_KEY_MESSAGE_BASE,
    STORAGE_FLASH_PAGE_COUNT, STORAGE_FLASH_PAGE_START,
};
use crate::error::FlashError;
use core::cell::RefCell;
use core::ops::Range;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embedded_storage_async::nor_flash::NorFlash;
use heapless::Vec;
use sequential_storage::cache::NoCache;

/// Flash page size for nRF52840 (4 KB).
const FLASH_PAGE_SIZE: u32 = 4096;

const STORAGE_START: u32 = STORAGE_FLASH_PAGE_START * FLASH_PAGE_SIZE;
const STORAGE_END: u32 = (STORAGE_FLASH_PAGE_START + STORAGE_FLASH_PAGE_COUNT) * FLASH_PAGE_SIZE;

/// Scratch buffer for `sequential-storage`: key, item header and payload.
const SCRATCH_LEN: usize = 128;

const MIRROR_CAPACITY: usize = 2 + NUM_MESSAGES;

/// Records the badge knows how to use; loaded into the mirror at boot.
const KNOWN_RECORDS: [(u16, u16); MIRROR_CAPACITY] = known_records();

const fn known_records() -> [(u16, u16); MIRROR_CAPACITY] {
    let mut out = [(FILE_ID_METADATA, RECORD_KEY_DEVICE_NAME); MIRROR_CAPACITY];
    out[1] = (FILE_ID_METADATA, RECORD_KEY_FIRSTBOOT);
    let mut i = 0;
    while i < NUM_MESSAGES {
        out[2 + i] = (FILE_ID_MESSAGES, RECORD_KEY_MESSAGE_BASE + i as u16);
        i += 1;
    }
    out
}

const fn map_key(file_id: u16, key: u16) -> u32 {
    ((file_id as u32) << 16) | key as u32
}

type Payload = Vec<u8, MAX_RECORD_LEN>;

struct Entry {
    file_id: u16,
    key: u16,
    data: Payload,
}

struct Mirror {
    entries: Vec<Entry, MIRROR_CAPACITY>,
    corruption: bool,
}

impl Mirror {
    const fn new() -> Self {
        Self {
            entries: Vec::new(),
            corruption: false,
        }
    }

    fn get(&self, file_id: u16, key: u16) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.file_id == file_id && e.key == key)
    }

    fn upsert(&mut self, file_id: u16, key: u16, data: Payload) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.file_id == file_id && e.key == key)
        {
            entry.data = data;
        } else if self.entries.push(Entry { file_id, key, data }).is_err() {
            warn!("nor: mirror full, {}/{} not cached", file_id, key);
        }
    }
}

static MIRROR: Mutex<CriticalSectionRawMutex, RefCell<Mirror>> =
    Mutex::new(RefCell::new(Mirror::new()));

enum NorOp {
    Store {
        op: FlashOp,
        file_id: u16,
        key: u16,
        data: Payload,
    },
    DeleteFile {
        file_id: u16,
    },
    Gc,
}

/// Operations accepted by [`NorStorage`] and not yet committed by [`run`].
static FLASH_OPS: Channel<CriticalSectionRawMutex, NorOp, FLASH_QUEUE_DEPTH> = Channel::new();

/// Controller-side handle. Reads hit the RAM mirror, writes are queued.
pub struct NorStorage {
    _private: (),
}

impl NorStorage {
    /// Only one handle is meaningful; `main` creates it once.
    pub const fn new() -> Self {
        Self { _private: () }
    }

    fn enqueue(op: NorOp) -> Result<(), FlashError> {
        FLASH_OPS
            .try_send(op)
            .map_err(|_| FlashError::NoSpaceInQueues)
    }

    fn payload(record: &Record<'_>) -> Result<Payload, FlashError> {
        if record.data.is_empty() || record.data.len() % 4 != 0 {
            return Err(FlashError::InvalidLength);
        }
        Vec::from_slice(record.data).map_err(|_| FlashError::RecordTooLarge)
    }
}

impl Default for NorStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStorage for NorStorage {
    fn find(&self, file_id: u16, key: u16) -> Result<RecordDesc, FlashError> {
        MIRROR.lock(|m| {
            m.borrow()
                .get(file_id, key)
                .map(|_| RecordDesc {
                    record_id: map_key(file_id, key),
                })
                .ok_or(FlashError::NotFound)
        })
    }

    fn find_in_file(&self, file_id: u16) -> Result<RecordDesc, FlashError> {
        MIRROR.lock(|m| {
            m.borrow()
                .entries
                .iter()
                .find(|e| e.file_id == file_id)
                .map(|e| RecordDesc {
                    record_id: map_key(e.file_id, e.key),
                })
                .ok_or(FlashError::NotFound)
        })
    }

    fn read(&self, desc: RecordDesc, buf: &mut [u8]) -> Result<usize, FlashError> {
        let file_id = (desc.record_id >> 16) as u16;
        let key = desc.record_id as u16;
        MIRROR.lock(|m| {
            let mirror = m.borrow();
            let entry = mirror.get(file_id, key).ok_or(FlashError::NotFound)?;
            let len = entry.data.len().min(buf.len());
            buf[..len].copy_from_slice(&entry.data[..len]);
            Ok(len)
        })
    }

    fn write(&mut self, record: Record<'_>) -> Result<(), FlashError> {
        let data = Self::payload(&record)?;
        Self::enqueue(NorOp::Store {
            op: FlashOp::Write,
            file_id: record.file_id,
            key: record.key,
            data,
        })
    }

    fn update(&mut self, _desc: RecordDesc, record: Record<'_>) -> Result<(), FlashError> {
        let data = Self::payload(&record)?;
        Self::enqueue(NorOp::Store {
            op: FlashOp::Update,
            file_id: record.file_id,
            key: record.key,
            data,
        })
    }

    fn delete_file(&mut self, file_id: u16) -> Result<(), FlashError> {
        Self::enqueue(NorOp::DeleteFile { file_id })
    }

    fn stat(&self) -> Result<FlashStat, FlashError> {
        Ok(MIRROR.lock(|m| {
            let mirror = m.borrow();
            FlashStat {
                valid_records: mirror.entries.len() as u32,
                dirty_records: 0,
                corruption: mirror.corruption,
            }
        }))
    }

    fn gc(&mut self) -> Result<(), FlashError> {
        Self::enqueue(NorOp::Gc)
    }
}

fn map_error<E>(e: sequential_storage::Error<E>) -> FlashError {
    match e {
        sequential_storage::Error::FullStorage => FlashError::NoSpaceInFlash,
        sequential_storage::Error::Corrupted { .. } => FlashError::Corruption,
        sequential_storage::Error::Storage { .. } => FlashError::Backend(1),
        _ => FlashError::Backend(0),
    }
}

/// Fill the mirror from flash. Missing records are normal; a corrupted
/// map is flagged so the next GC rebuilds it.
async fn load_mirror<F: NorFlash>(
    flash: &mut F,
    range: Range<u32>,
    scratch: &mut [u8],
) -> Result<(), FlashError> {
    let mut result = Ok(());
    for (file_id, key) in KNOWN_RECORDS {
        match sequential_storage::map::fetch_item::<u32, &[u8], _>(
            flash,
            range.clone(),
            &mut NoCache::new(),
            scratch,
            &map_key(file_id, key),
        )
        .await
        {
            Ok(Some(data)) => match Payload::from_slice(data) {
                Ok(data) => MIRROR.lock(|m| m.borrow_mut().upsert(file_id, key, data)),
                Err(()) => warn!("nor: record {}/{} too large, skipped", file_id, key),
            },
            Ok(None) => {}
            Err(e) => {
                error!("nor: read {}/{} failed: {:?}", file_id, key, defmt::Debug2Format(&e));
                let e = map_error(e);
                if e == FlashError::Corruption {
                    MIRROR.lock(|m| m.borrow_mut().corruption = true);
                }
                result = Err(e);
            }
        }
    }
    result
}

async fn store<F: NorFlash>(
    flash: &mut F,
    range: Range<u32>,
    scratch: &mut [u8],
    file_id: u16,
    key: u16,
    data: &[u8],
) -> Result<(), FlashError> {
    sequential_storage::map::store_item::<u32, &[u8], _>(
        flash,
        range,
        &mut NoCache::new(),
        scratch,
        &map_key(file_id, key),
        &data,
    )
    .await
    .map_err(|e| {
        error!("nor: store {}/{} failed: {:?}", file_id, key, defmt::Debug2Format(&e));
        map_error(e)
    })
}

async fn delete_file<F: NorFlash>(
    flash: &mut F,
    range: Range<u32>,
    scratch: &mut [u8],
    file_id: u16,
) -> Result<(), FlashError> {
    let mut keys: Vec<u16, MIRROR_CAPACITY> = Vec::new();
    MIRROR.lock(|m| {
        for entry in m.borrow().entries.iter().filter(|e| e.file_id == file_id) {
            let _ = keys.push(entry.key);
        }
    });

    for key in keys {
        sequential_storage::map::remove_item::<u32, _>(
            flash,
            range.clone(),
            &mut NoCache::new(),
            scratch,
            &map_key(file_id, key),
        )
        .await
        .map_err(|e| {
            error!("nor: remove {}/{} failed: {:?}", file_id, key, defmt::Debug2Format(&e));
            map_error(e)
        })?;
        MIRROR.lock(|m| {
            m.borrow_mut()
                .entries
                .retain(|e| !(e.file_id == file_id && e.key == key))
        });
    }
    Ok(())
}

/// Erase every page of the region.
async fn wipe<F: NorFlash>(flash: &mut F, range: Range<u32>) -> Result<(), FlashError> {
    info!("nor: no records left, erasing {:#x}..{:#x}", range.start, range.end);
    sequential_storage::erase_all(flash, range)
        .await
        .map_err(map_error)?;
    MIRROR.lock(|m| m.borrow_mut().corruption = false);
    Ok(())
}

/// Wipe the region and write back every mirrored record.
async fn rebuild<F: NorFlash>(
    flash: &mut F,
    range: Range<u32>,
    scratch: &mut [u8],
) -> Result<(), FlashError> {
    warn!("nor: rebuilding corrupted store");
    sequential_storage::erase_all(flash, range.clone())
        .await
        .map_err(map_error)?;

    let mut records: Vec<(u16, u16, Payload), MIRROR_CAPACITY> = Vec::new();
    MIRROR.lock(|m| {
        for e in m.borrow().entries.iter() {
            let _ = records.push((e.file_id, e.key, e.data.clone()));
        }
    });
    for (file_id, key, data) in records {
        store(flash, range.clone(), scratch, file_id, key, &data).await?;
    }
    MIRROR.lock(|m| m.borrow_mut().corruption = false);
    Ok(())
}

/// Commit queued operations forever. Posts `Init` once the mirror is
/// loaded, then one event per operation taken from [`FLASH_OPS`].
pub async fn run<F: NorFlash>(mut flash: F, events: EventSender) -> ! {
    let range = STORAGE_START..STORAGE_END;
    let mut scratch = [0u8; SCRATCH_LEN];

    let init = load_mirror(&mut flash, range.clone(), &mut scratch).await;
    info!(
        "nor: {} records loaded from {:#x}..{:#x}",
        MIRROR.lock(|m| m.borrow().entries.len()),
        range.start,
        range.end
    );
    events
        .send(BadgeEvent::Flash(FlashEvent::new(FlashOp::Init, 0, 0, init)))
        .await;

    loop {
        let event = match FLASH_OPS.receive().await {
            NorOp::Store {
                op,
                file_id,
                key,
                data,
            } => {
                let result = store(&mut flash, range.clone(), &mut scratch, file_id, key, &data).await;
                if result.is_ok() {
                    debug!("nor: committed {}/{}", file_id, key);
                    MIRROR.lock(|m| m.borrow_mut().upsert(file_id, key, data));
                }
                FlashEvent::new(op, file_id, key, result)
            }
            NorOp::DeleteFile { file_id } => {
                let result = delete_file(&mut flash, range.clone(), &mut scratch, file_id).await;
                FlashEvent::new(FlashOp::DeleteFile, file_id, 0, result)
            }
            NorOp::Gc => {
                let (corrupted, empty) =
                    MIRROR.lock(|m| (m.borrow().corruption, m.borrow().entries.is_empty()));
                let result = if empty {
                    wipe(&mut flash, range.clone()).await
                } else if corrupted {
                    rebuild(&mut flash, range.clone(), &mut scratch).await
                } else {
                    Ok(())
                };
                FlashEvent::new(FlashOp::Gc, 0, 0, result)
            }
        };
        events.send(BadgeEvent::Flash(event)).await;
    }
}
