//! SoftDevice S140 glue: GATT service, advertising loop, security handler
//! and the [`LinkLayer`] implementation.
//!
//! Stack callbacks never touch badge state. They translate what happened
//! into a [`BadgeEvent`] and post it on the event channel; the app task
//! answers through [`SdLink`].

use super::dispatch::AttributeTable;
use super::{
    AdvEvent, AttrWrite, ConnHandle, DisconnectReason, KeyReply, LinkEvent, LinkLayer, Passkey,
    PeerId, SecurityEvent,
};
use crate::app::{BadgeEvent, EventSender};
use crate::config::{
    ADV_FAST_INTERVAL, ADV_FAST_TIMEOUT, ADV_SLOW_INTERVAL, ADV_SLOW_TIMEOUT, BADGE_SERVICE_UUID,
    BADGE_UUID_BASE, BLE_CONN_INTERVAL_MAX, BLE_CONN_INTERVAL_MIN, BLE_SLAVE_LATENCY,
    BLE_SUP_TIMEOUT, DEFAULT_DEVICE_NAME, DEVICE_NAME_MAX_LEN, DEVICE_NAME_VALUE_HANDLE,
    MAX_BONDED_PEERS, MSG_WIRE_LEN, NUM_MESSAGES,
};
use crate::display::DisplayState;
use crate::error::LinkError;
use crate::message::{default_device_name, device_name_from_bytes, DeviceName, MessageSlot};
use core::cell::{Cell, RefCell};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use heapless::Vec;
use nrf_softdevice::ble::gatt_server::{self, RegisterError, WriteOp};
use nrf_softdevice::ble::peripheral;
use nrf_softdevice::ble::security::{IoCapabilities, SecurityHandler};
use nrf_softdevice::ble::{Connection, EncryptionInfo, IdentityKey, MasterId, SecurityMode};
use nrf_softdevice::{raw, Softdevice};
use static_cell::StaticCell;

type MessageValue = Vec<u8, MSG_WIRE_LEN>;

/// Characteristic order fixes the value handles `AttributeTable::default` expects.
#[nrf_softdevice::gatt_service(uuid = "00004141-e87e-4706-acf7-8c633c19c4d5")]
pub struct BadgeService {
    #[characteristic(uuid = "00004242-e87e-4706-acf7-8c633c19c4d5", read, write)]
    on_off: u8,
    #[characteristic(uuid = "00004343-e87e-4706-acf7-8c633c19c4d5", read, write)]
    index: u8,
    #[characteristic(uuid = "00004444-e87e-4706-acf7-8c633c19c4d5", read, write)]
    brightness: u8,
    #[characteristic(uuid = "00004545-e87e-4706-acf7-8c633c19c4d5", read, write)]
    msg0: MessageValue,
    #[characteristic(uuid = "00004546-e87e-4706-acf7-8c633c19c4d5", read, write)]
    msg1: MessageValue,
    #[characteristic(uuid = "00004547-e87e-4706-acf7-8c633c19c4d5", read, write)]
    msg2: MessageValue,
    #[characteristic(uuid = "00004548-e87e-4706-acf7-8c633c19c4d5", read, write)]
    msg3: MessageValue,
}

/// GATT server forwarding every write, with its handle and offset, to the
/// event loop.
pub struct Server {
    pub badge: BadgeService,
    events: EventSender,
}

impl Server {
    pub fn new(sd: &mut Softdevice, events: EventSender) -> Result<Self, RegisterError> {
        Ok(Self {
            badge: BadgeService::new(sd)?,
            events,
        })
    }

    /// Value handles as registered with the stack.
    pub fn attribute_table(&self) -> AttributeTable {
        let b = &self.badge;
        AttributeTable {
            on_off: b.on_off_value_handle,
            brightness: b.brightness_value_handle,
            active_index: b.index_value_handle,
            messages: [
                b.msg0_value_handle,
                b.msg1_value_handle,
                b.msg2_value_handle,
                b.msg3_value_handle,
            ],
            device_name: DEVICE_NAME_VALUE_HANDLE,
        }
    }

    /// Load the stored configuration into the readable attribute values.
    pub fn publish(&self, slots: &[MessageSlot; NUM_MESSAGES], display: &DisplayState) {
        let b = &self.badge;
        let mut ok = b.on_off_set(&(display.is_on() as u8)).is_ok();
        ok &= b.brightness_set(&display.brightness()).is_ok();
        ok &= b.index_set(&(display.active_index() as u8)).is_ok();

        for (i, slot) in slots.iter().enumerate() {
            let value = MessageValue::from_slice(&slot.encode()).unwrap_or_default();
            let result = match i {
                0 => b.msg0_set(&value),
                1 => b.msg1_set(&value),
                2 => b.msg2_set(&value),
                _ => b.msg3_set(&value),
            };
            ok &= result.is_ok();
        }
        if !ok {
            warn!("gatt: could not publish every attribute value");
        }
    }
}

impl gatt_server::Server for Server {
    type Event = ();

    fn on_write(
        &self,
        conn: &Connection,
        handle: u16,
        _op: WriteOp,
        offset: usize,
        data: &[u8],
    ) -> Option<Self::Event> {
        if let Some(conn) = conn.handle() {
            let write = AttrWrite::new(handle, offset as u16, data);
            post(&self.events, BadgeEvent::Link(LinkEvent::AttributeWrite { conn, write }));
        }
        None
    }
}

fn post(events: &EventSender, event: BadgeEvent) {
    if events.try_send(event).is_err() {
        warn!("ble: event queue full, event dropped");
    }
}

// ── Security ────────────────────────────────────────────────────────────

struct PeerBond {
    master_id: MasterId,
    key: EncryptionInfo,
    peer_id: IdentityKey,
}

/// Bond table plus the bridge from SoftDevice security callbacks to
/// [`SecurityEvent`]s. Bonds live in RAM only.
pub struct Bonder {
    peers: RefCell<Vec<PeerBond, MAX_BONDED_PEERS>>,
    /// Link the passkey callbacks refer to; the stack does not pass it.
    conn: Cell<Option<ConnHandle>>,
    events: EventSender,
}

impl Bonder {
    fn new(events: EventSender) -> Self {
        Self {
            peers: RefCell::new(Vec::new()),
            conn: Cell::new(None),
            events,
        }
    }

    fn forget(&self, peer: PeerId) -> bool {
        let mut peers = self.peers.borrow_mut();
        let index = peer as usize;
        if index < peers.len() {
            peers.remove(index);
            true
        } else {
            false
        }
    }
}

impl SecurityHandler for Bonder {
    fn io_capabilities(&self) -> IoCapabilities {
        IoCapabilities::DisplayYesNo
    }

    fn can_bond(&self, _conn: &Connection) -> bool {
        true
    }

    fn display_passkey(&self, passkey: &[u8; 6]) {
        let Some(conn) = self.conn.get() else {
            warn!("sec: passkey without a connection");
            return;
        };
        post(
            &self.events,
            BadgeEvent::Security(SecurityEvent::PasskeyDisplay {
                conn,
                passkey: Passkey(*passkey),
                match_request: true,
            }),
        );
    }

    fn on_bonded(
        &self,
        _conn: &Connection,
        master_id: MasterId,
        key: EncryptionInfo,
        peer_id: IdentityKey,
    ) {
        let mut peers = self.peers.borrow_mut();
        if let Some(existing) = peers.iter_mut().find(|p| p.master_id == master_id) {
            existing.key = key;
            existing.peer_id = peer_id;
            return;
        }

        if peers.is_full() {
            peers.remove(0);
        }

        let _ = peers.push(PeerBond {
            master_id,
            key,
            peer_id,
        });
    }

    fn get_key(&self, conn: &Connection, master_id: MasterId) -> Option<EncryptionInfo> {
        let peers = self.peers.borrow();
        if let Some(bond) = peers.iter().find(|p| p.master_id == master_id) {
            return Some(bond.key);
        }

        // Known address, unknown keys: the central dropped its side of the bond.
        let stale = peers
            .iter()
            .position(|p| p.peer_id.is_match(conn.peer_address()));
        if let (Some(peer), Some(handle)) = (stale, conn.handle()) {
            post(
                &self.events,
                BadgeEvent::Security(SecurityEvent::Failed {
                    conn: handle,
                    peer: peer as PeerId,
                }),
            );
        }
        None
    }

    fn get_peripheral_key(&self, conn: &Connection) -> Option<(MasterId, EncryptionInfo)> {
        self.peers.borrow().iter().find_map(|p| {
            p.peer_id
                .is_match(conn.peer_address())
                .then_some((p.master_id, p.key))
        })
    }

    fn on_security_update(&self, conn: &Connection, mode: SecurityMode) {
        info!("sec: security mode {}", mode);
        if matches!(mode, SecurityMode::NoAccess | SecurityMode::Open) {
            return;
        }
        if let Some(handle) = conn.handle() {
            post(&self.events, BadgeEvent::Security(SecurityEvent::Secured(handle)));
        }
    }
}

pub fn bonder(events: EventSender) -> &'static Bonder {
    static BONDER: StaticCell<Bonder> = StaticCell::new();
    BONDER.init(Bonder::new(events))
}

// ── Stack configuration ─────────────────────────────────────────────────

/// Security mode 1 level 1: anyone may write the GAP name.
fn open_write_perm() -> raw::ble_gap_conn_sec_mode_t {
    // SAFETY: plain bindgen struct, all-zero is a valid bit pattern.
    let mut perm: raw::ble_gap_conn_sec_mode_t = unsafe { core::mem::zeroed() };
    perm.set_sm(1);
    perm.set_lv(1);
    perm
}

/// Single peripheral link, writable GAP name kept by the stack.
pub fn softdevice_config() -> nrf_softdevice::Config {
    nrf_softdevice::Config {
        clock: Some(raw::nrf_clock_lf_cfg_t {
            source: raw::NRF_CLOCK_LF_SRC_RC as u8,
            rc_ctiv: 16,
            rc_temp_ctiv: 2,
            accuracy: raw::NRF_CLOCK_LF_ACCURACY_500_PPM as u8,
        }),
        conn_gap: Some(raw::ble_gap_conn_cfg_t {
            conn_count: 1,
            event_length: 24,
        }),
        conn_gatt: Some(raw::ble_gatt_conn_cfg_t { att_mtu: 128 }),
        gatts_attr_tab_size: Some(raw::ble_gatts_cfg_attr_tab_size_t {
            attr_tab_size: raw::BLE_GATTS_ATTR_TAB_SIZE_DEFAULT,
        }),
        gap_role_count: Some(raw::ble_gap_cfg_role_count_t {
            adv_set_count: 1,
            periph_role_count: 1,
            central_role_count: 0,
            central_sec_count: 0,
            _bitfield_1: raw::ble_gap_cfg_role_count_t::new_bitfield_1(0),
        }),
        gap_device_name: Some(raw::ble_gap_cfg_device_name_t {
            p_value: DEFAULT_DEVICE_NAME.as_ptr() as _,
            current_len: DEFAULT_DEVICE_NAME.len() as u16,
            max_len: DEVICE_NAME_MAX_LEN as u16,
            write_perm: open_write_perm(),
            _bitfield_1: raw::ble_gap_cfg_device_name_t::new_bitfield_1(
                raw::BLE_GATTS_VLOC_STACK as u8,
            ),
        }),
        ..Default::default()
    }
}

// ── Advertising ─────────────────────────────────────────────────────────

/// Raised by [`SdLink::start_advertising`] to leave the idle state.
static ADV_START: Signal<CriticalSectionRawMutex, ()> = Signal::new();

fn read_device_name() -> Result<DeviceName, LinkError> {
    let mut buf = [0u8; DEVICE_NAME_MAX_LEN];
    let mut len = buf.len() as u16;
    // SAFETY: `buf` outlives the call and `len` holds its capacity.
    check(unsafe { raw::sd_ble_gap_device_name_get(buf.as_mut_ptr(), &mut len) })?;
    let len = (len as usize).min(buf.len());
    Ok(device_name_from_bytes(&buf[..len]))
}

fn adv_payloads() -> (Vec<u8, 31>, [u8; 18]) {
    let name = read_device_name().unwrap_or_else(|_| default_device_name());

    let mut adv_data: Vec<u8, 31> = Vec::new();
    let _ = adv_data.extend_from_slice(&[
        0x02,
        0x01,
        raw::BLE_GAP_ADV_FLAGS_LE_ONLY_GENERAL_DISC_MODE as u8,
    ]);
    let room = adv_data.capacity() - adv_data.len() - 2;
    let name = &name.as_bytes()[..name.len().min(room)];
    // 0x09 complete local name, 0x08 shortened.
    let ad_type = if name.len() < room { 0x09 } else { 0x08 };
    let _ = adv_data.extend_from_slice(&[1 + name.len() as u8, ad_type]);
    let _ = adv_data.extend_from_slice(name);

    let mut scan_data = [0u8; 18];
    scan_data[0] = 0x11;
    scan_data[1] = 0x07; // complete list of 128-bit service UUIDs
    scan_data[2..].copy_from_slice(&BADGE_UUID_BASE);
    scan_data[2 + 12..2 + 14].copy_from_slice(&BADGE_SERVICE_UUID.to_le_bytes());

    (adv_data, scan_data)
}

/// Fast phase, then slow phase. `None` when both time out.
async fn advertise(
    sd: &'static Softdevice,
    bonder: &'static Bonder,
    events: &EventSender,
) -> Option<Connection> {
    let (adv_data, scan_data) = adv_payloads();
    let phases = [
        (AdvEvent::Fast, ADV_FAST_INTERVAL, ADV_FAST_TIMEOUT),
        (AdvEvent::Slow, ADV_SLOW_INTERVAL, ADV_SLOW_TIMEOUT),
    ];

    for (event, interval, timeout) in phases {
        events.send(BadgeEvent::Adv(event)).await;
        let config = peripheral::Config {
            interval,
            timeout: Some(timeout),
            ..Default::default()
        };
        let adv = peripheral::ConnectableAdvertisement::ScannableUndirected {
            adv_data: &adv_data,
            scan_data: &scan_data,
        };
        match peripheral::advertise_pairable(sd, adv, &config, bonder).await {
            Ok(conn) => return Some(conn),
            Err(peripheral::AdvertiseError::Timeout) => debug!("adv: {} phase timed out", event),
            Err(e) => {
                warn!("adv: failed: {:?}", e);
                return None;
            }
        }
    }
    None
}

/// Advertise, serve one connection, repeat. Goes idle when both phases
/// expire until [`SdLink::start_advertising`] is called.
pub async fn run(
    sd: &'static Softdevice,
    server: &'static Server,
    bonder: &'static Bonder,
    events: EventSender,
) -> ! {
    let mut idle = false;
    loop {
        if idle {
            ADV_START.wait().await;
        }
        ADV_START.reset();

        let Some(conn) = advertise(sd, bonder, &events).await else {
            events.send(BadgeEvent::Adv(AdvEvent::Idle)).await;
            idle = true;
            continue;
        };
        idle = false;

        let Some(handle) = conn.handle() else {
            continue;
        };
        bonder.conn.set(Some(handle));
        events
            .send(BadgeEvent::Link(LinkEvent::Connected(handle)))
            .await;

        let params = raw::ble_gap_conn_params_t {
            min_conn_interval: BLE_CONN_INTERVAL_MIN,
            max_conn_interval: BLE_CONN_INTERVAL_MAX,
            slave_latency: BLE_SLAVE_LATENCY,
            conn_sup_timeout: BLE_SUP_TIMEOUT,
        };
        if let Err(e) = conn.set_conn_params(params) {
            warn!("ble: set_conn_params failed: {:?}", e);
        }

        // Returns when the link drops; the wrapper does not report why.
        let _ = gatt_server::run(&conn, server, |()| {}).await;

        bonder.conn.set(None);
        events
            .send(BadgeEvent::Link(LinkEvent::Disconnected {
                conn: handle,
                reason: 0,
            }))
            .await;
    }
}

// ── Link layer ──────────────────────────────────────────────────────────

fn check(ret: u32) -> Result<(), LinkError> {
    match ret {
        raw::NRF_SUCCESS => Ok(()),
        raw::NRF_ERROR_INVALID_STATE | raw::BLE_ERROR_INVALID_CONN_HANDLE => {
            Err(LinkError::InvalidState)
        }
        code => Err(LinkError::Raw(code)),
    }
}

/// [`LinkLayer`] over raw SoftDevice calls.
pub struct SdLink {
    bonder: &'static Bonder,
    server: &'static Server,
}

impl SdLink {
    pub fn new(bonder: &'static Bonder, server: &'static Server) -> Self {
        Self { bonder, server }
    }
}

impl LinkLayer for SdLink {
    fn reply_auth_key(&mut self, conn: ConnHandle, reply: KeyReply) -> Result<(), LinkError> {
        let key_type = match reply {
            KeyReply::Accept => raw::BLE_GAP_AUTH_KEY_TYPE_PASSKEY,
            KeyReply::NoKey => raw::BLE_GAP_AUTH_KEY_TYPE_NONE,
        };
        // SAFETY: a null key confirms a numeric comparison.
        check(unsafe { raw::sd_ble_gap_auth_key_reply(conn, key_type as u8, core::ptr::null()) })
    }

    fn disconnect(&mut self, conn: ConnHandle, reason: DisconnectReason) -> Result<(), LinkError> {
        check(unsafe { raw::sd_ble_gap_disconnect(conn, reason.hci_code()) })
    }

    fn accept_phy_update(&mut self, conn: ConnHandle) -> Result<(), LinkError> {
        let phys = raw::ble_gap_phys_t {
            tx_phys: raw::BLE_GAP_PHY_AUTO as u8,
            rx_phys: raw::BLE_GAP_PHY_AUTO as u8,
        };
        check(unsafe { raw::sd_ble_gap_phy_update(conn, &phys) })
    }

    fn assign_queued_writes(&mut self, _conn: ConnHandle) -> Result<(), LinkError> {
        // nrf-softdevice answers every user-memory request with stack
        // memory, so prepared writes already reach `Server::on_write`.
        Ok(())
    }

    fn set_sys_attrs(&mut self, conn: ConnHandle) -> Result<(), LinkError> {
        check(unsafe { raw::sd_ble_gatts_sys_attr_set(conn, core::ptr::null(), 0, 0) })
    }

    fn device_name(&self) -> Result<DeviceName, LinkError> {
        read_device_name()
    }

    fn set_device_name(&mut self, name: &str) -> Result<(), LinkError> {
        let perm = open_write_perm();
        let len = name.len().min(DEVICE_NAME_MAX_LEN);
        check(unsafe { raw::sd_ble_gap_device_name_set(&perm, name.as_ptr(), len as u16) })
    }

    fn refresh_advertising(&mut self) -> Result<(), LinkError> {
        // The payload is rebuilt from the GAP name each time advertising starts.
        debug!("adv: payload refresh on next start");
        Ok(())
    }

    fn start_advertising(&mut self) -> Result<(), LinkError> {
        ADV_START.signal(());
        Ok(())
    }

    fn delete_bond(&mut self, peer: PeerId) -> Result<(), LinkError> {
        if self.bonder.forget(peer) {
            info!("sec: bond {} deleted", peer);
        }
        Ok(())
    }

    fn publish_values(
        &mut self,
        slots: &[MessageSlot; NUM_MESSAGES],
        display: &DisplayState,
    ) -> Result<(), LinkError> {
        // A value that fails to set is logged and refreshed on the next burst.
        self.server.publish(slots, display);
        Ok(())
    }
}
