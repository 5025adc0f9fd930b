//! Unified error type for the badge firmware.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Implements `defmt::Format` (with the `defmt` feature) for efficient
//! on-target logging.

/// Top-level error type used across the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The flash record store rejected or failed an operation.
    Flash(FlashError),

    /// The link layer rejected a command.
    Link(LinkError),

    /// A driver reported an unrecoverable condition. Escapes to the
    /// system fault handler.
    Fatal(u32),
}

impl Error {
    /// Only `Fatal` is allowed to leave the event loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

/// Flash record store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// No record (or no file) matched the lookup. Benign on load.
    NotFound,
    /// The flash pages are full; a garbage collection may reclaim space.
    NoSpaceInFlash,
    /// The operation queue is full; retry after the next completion event.
    NoSpaceInQueues,
    /// The store reported corrupted pages or records.
    Corruption,
    /// Record payload is not a whole number of words, or is empty.
    InvalidLength,
    /// Record payload exceeds `config::MAX_RECORD_LEN`.
    RecordTooLarge,
    /// Raw backend error code.
    Backend(u16),
}

/// Subset of link-layer errors we propagate (keeps the enum `Copy`-friendly).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkError {
    /// Command not valid for the current connection state (e.g. the link
    /// already dropped).
    InvalidState,
    /// Raw SoftDevice error code.
    Raw(u32),
}

// Convenience conversions

impl From<FlashError> for Error {
    fn from(e: FlashError) -> Self {
        Error::Flash(e)
    }
}

impl From<LinkError> for Error {
    fn from(e: LinkError) -> Self {
        Error::Link(e)
    }
}
