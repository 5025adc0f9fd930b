//! Bluetooth Low Energy subsystem.
//!
//! The badge runs the Nordic SoftDevice S140 in **Peripheral** role with a
//! single central at a time:
//!
//! 1. **Connection & pairing** ([`connection`]) - link lifecycle,
//!    advertising phases, passkey match confirmation.
//! 2. **Write dispatch** ([`dispatch`]) - maps attribute writes onto the
//!    display state and the configuration store.
//! 3. **SoftDevice glue** (`softdevice`, embedded only) - GATT server,
//!    advertising loop and security handler; turns stack callbacks into
//!    the events defined here and implements [`LinkLayer`].
//!
//! Everything except the glue is plain data and runs on the host.

pub mod connection;
pub mod dispatch;
#[cfg(feature = "embedded")]
pub mod softdevice;

use crate::config::{ATTR_WRITE_MAX_LEN, NUM_MESSAGES};
use crate::display::DisplayState;
use crate::error::LinkError;
use crate::message::{DeviceName, MessageSlot};
use heapless::Vec;

/// Link-layer connection handle.
pub type ConnHandle = u16;

/// Bonding-manager peer id.
pub type PeerId = u16;

/// Six ASCII digits shown to the user during pairing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Passkey(pub [u8; 6]);

impl Passkey {
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.0).unwrap_or("------")
    }
}

/// One attribute write as delivered by the stack.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AttrWrite {
    /// Attribute value handle.
    pub handle: u16,
    /// Byte offset into the attribute value.
    pub offset: u16,
    pub data: Vec<u8, ATTR_WRITE_MAX_LEN>,
}

impl AttrWrite {
    /// Build a write, truncating `data` to the largest value the badge
    /// accepts.
    pub fn new(handle: u16, offset: u16, data: &[u8]) -> Self {
        let len = data.len().min(ATTR_WRITE_MAX_LEN);
        let mut buf = Vec::new();
        // `len` never exceeds the capacity.
        let _ = buf.extend_from_slice(&data[..len]);
        Self {
            handle,
            offset,
            data: buf,
        }
    }
}

/// Events raised by the link layer.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkEvent {
    Connected(ConnHandle),
    Disconnected { conn: ConnHandle, reason: u8 },
    AttributeWrite { conn: ConnHandle, write: AttrWrite },
    /// GATT client or server procedure timed out.
    GattTimeout(ConnHandle),
    PhyUpdateRequest(ConnHandle),
    /// The peer accessed an attribute before system attributes were set.
    SysAttrMissing(ConnHandle),
}

/// Events raised by the pairing/bonding manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityEvent {
    /// A passkey must be shown; with `match_request` the user has to
    /// confirm it matches the one on the central.
    PasskeyDisplay {
        conn: ConnHandle,
        passkey: Passkey,
        match_request: bool,
    },
    Secured(ConnHandle),
    Failed { conn: ConnHandle, peer: PeerId },
}

/// Advertising phase changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvEvent {
    Fast,
    Slow,
    /// Both phases expired without a connection.
    Idle,
}

/// Reply to a passkey match request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KeyReply {
    /// The user confirmed the displayed passkey.
    Accept,
    /// Reject the pairing attempt.
    NoKey,
}

/// Why the badge drops a link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisconnectReason {
    RemoteUserTerminated,
}

impl DisconnectReason {
    /// HCI status code sent to the peer.
    pub const fn hci_code(self) -> u8 {
        match self {
            DisconnectReason::RemoteUserTerminated => 0x13,
        }
    }
}

/// Commands the badge issues to the link layer.
///
/// Implemented by the SoftDevice glue on target and by recording doubles
/// in tests. `InvalidState` means the link went away under the command
/// and is tolerated; any other error is fatal.
pub trait LinkLayer {
    fn reply_auth_key(&mut self, conn: ConnHandle, reply: KeyReply) -> Result<(), LinkError>;

    fn disconnect(&mut self, conn: ConnHandle, reason: DisconnectReason) -> Result<(), LinkError>;

    /// Accept a PHY update with automatic selection in both directions.
    fn accept_phy_update(&mut self, conn: ConnHandle) -> Result<(), LinkError>;

    /// Route queued (long) writes on `conn` to the badge.
    fn assign_queued_writes(&mut self, conn: ConnHandle) -> Result<(), LinkError>;

    /// Initialise empty system attributes for `conn`.
    fn set_sys_attrs(&mut self, conn: ConnHandle) -> Result<(), LinkError>;

    /// Current GAP device name, as clamped by the stack.
    fn device_name(&self) -> Result<DeviceName, LinkError>;

    fn set_device_name(&mut self, name: &str) -> Result<(), LinkError>;

    /// Rebuild the advertising payload after an identity change.
    fn refresh_advertising(&mut self) -> Result<(), LinkError>;

    fn start_advertising(&mut self) -> Result<(), LinkError>;

    /// Forget the bond with `peer`.
    fn delete_bond(&mut self, peer: PeerId) -> Result<(), LinkError>;

    /// Make the readable attribute values match the badge's live state.
    fn publish_values(
        &mut self,
        slots: &[MessageSlot; NUM_MESSAGES],
        display: &DisplayState,
    ) -> Result<(), LinkError>;
}
