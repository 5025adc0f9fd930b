//! Connection and pairing state machine.
//!
//! ```text
//! Advertising ─connect─▶ Unsecured ─passkey─▶ PasskeyPending ─confirm─▶ Secured
//!      ▲                     │                      │                     │
//!      └──────────────────── disconnect (from any connected state) ───────┘
//! ```
//!
//! Advertising has fast and slow phases; when both expire the badge goes
//! idle and the joystick gets its navigation back. Pairing prompts are
//! only honoured inside the user-visible window opened by a long press.

use super::{
    AdvEvent, ConnHandle, DisconnectReason, KeyReply, LinkEvent, LinkLayer, Passkey,
    SecurityEvent,
};
use crate::app::{BadgeController, Io};
use crate::display::Renderer;
use crate::error::{Error, LinkError};
use crate::storage::RecordStorage;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    Advertising,
    Unsecured,
    PasskeyPending,
    Secured,
}

/// The single live link, if any.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Connection {
    handle: Option<ConnHandle>,
    /// Link waiting for the user to confirm a passkey. At most one.
    pending_passkey: Option<ConnHandle>,
    secured: bool,
}

impl Connection {
    pub const fn new() -> Self {
        Self {
            handle: None,
            pending_passkey: None,
            secured: false,
        }
    }

    pub fn handle(&self) -> Option<ConnHandle> {
        self.handle
    }

    pub fn pending_passkey(&self) -> Option<ConnHandle> {
        self.pending_passkey
    }

    pub fn state(&self) -> LinkState {
        match (self.handle, self.pending_passkey, self.secured) {
            (None, _, _) => LinkState::Advertising,
            (Some(_), Some(_), _) => LinkState::PasskeyPending,
            (Some(_), None, true) => LinkState::Secured,
            (Some(_), None, false) => LinkState::Unsecured,
        }
    }

    fn connect(&mut self, handle: ConnHandle) {
        *self = Self {
            handle: Some(handle),
            pending_passkey: None,
            secured: false,
        };
    }

    fn disconnect(&mut self) {
        *self = Self::new();
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvPhase {
    #[default]
    Idle,
    Fast,
    Slow,
}

/// Advertising phase plus the user-visible pairing window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdvState {
    phase: AdvPhase,
    pairing_window: bool,
}

impl AdvState {
    pub const fn new() -> Self {
        Self {
            phase: AdvPhase::Idle,
            pairing_window: false,
        }
    }

    pub fn phase(&self) -> AdvPhase {
        self.phase
    }

    /// A user asked for pairing and advertising has not gone idle since.
    pub fn pairing_window(&self) -> bool {
        self.pairing_window
    }
}

/// Tolerate a command on a link that already went away; anything else
/// the stack rejects is unrecoverable.
pub(crate) fn check_link(result: Result<(), LinkError>) -> Result<(), Error> {
    match result {
        Ok(()) => Ok(()),
        Err(LinkError::InvalidState) => {
            warn!("ble: command on stale link ignored");
            Ok(())
        }
        Err(LinkError::Raw(code)) => Err(Error::Fatal(code)),
    }
}

impl<S: RecordStorage> BadgeController<S> {
    pub(crate) fn on_link_event<L: LinkLayer, R: Renderer>(
        &mut self,
        event: LinkEvent,
        io: &mut Io<'_, L, R>,
    ) -> Result<(), Error> {
        match event {
            LinkEvent::Connected(conn) => {
                info!("ble: connected, handle {}", conn);
                self.conn.connect(conn);
                check_link(io.link.assign_queued_writes(conn))
            }
            LinkEvent::Disconnected { conn, reason } => {
                info!("ble: disconnected, handle {} reason {:#x}", conn, reason);
                let cancelled = self.conn.pending_passkey().is_some();
                self.conn.disconnect();
                // The stack restarts advertising on its own.
                self.adv.phase = AdvPhase::Fast;
                if cancelled {
                    self.navigation = true;
                }
                if self.display.restore() {
                    io.display.restart();
                    self.redraw(io);
                }
                Ok(())
            }
            LinkEvent::AttributeWrite { conn, write } => {
                if self.conn.handle() != Some(conn) {
                    debug!("ble: write on unknown handle {}", conn);
                }
                self.on_write(&write, io)
            }
            LinkEvent::GattTimeout(conn) => {
                warn!("ble: GATT timeout on {}, disconnecting", conn);
                check_link(io.link.disconnect(conn, DisconnectReason::RemoteUserTerminated))
            }
            LinkEvent::PhyUpdateRequest(conn) => {
                debug!("ble: PHY update requested");
                check_link(io.link.accept_phy_update(conn))
            }
            LinkEvent::SysAttrMissing(conn) => check_link(io.link.set_sys_attrs(conn)),
        }
    }

    pub(crate) fn on_security_event<L: LinkLayer, R: Renderer>(
        &mut self,
        event: SecurityEvent,
        io: &mut Io<'_, L, R>,
    ) -> Result<(), Error> {
        match event {
            SecurityEvent::PasskeyDisplay {
                conn,
                passkey,
                match_request,
            } => self.on_passkey(conn, passkey, match_request, io),
            SecurityEvent::Secured(conn) => {
                if self.conn.handle() == Some(conn) {
                    self.conn.secured = true;
                }
                info!("ble: link {} secured", conn);
                Ok(())
            }
            SecurityEvent::Failed { conn, peer } => {
                warn!("ble: security failed on {}, dropping bond {}", conn, peer);
                if let Err(e) = io.link.delete_bond(peer) {
                    warn!("ble: bond delete failed: {}", e);
                }
                Ok(())
            }
        }
    }

    fn on_passkey<L: LinkLayer, R: Renderer>(
        &mut self,
        conn: ConnHandle,
        passkey: Passkey,
        match_request: bool,
        io: &mut Io<'_, L, R>,
    ) -> Result<(), Error> {
        if !match_request {
            self.display.show_transient(passkey.as_str());
            io.display.restart();
            self.redraw(io);
            return Ok(());
        }

        if !self.adv.pairing_window || self.conn.handle() != Some(conn) {
            info!("ble: pairing outside the visible window, rejecting");
            return check_link(io.link.reply_auth_key(conn, KeyReply::NoKey));
        }

        if let Some(pending) = self.conn.pending_passkey {
            warn!("ble: passkey already pending on {}, ignoring", pending);
            return Ok(());
        }

        info!("ble: passkey {} awaiting confirmation", passkey.as_str());
        self.conn.pending_passkey = Some(conn);
        self.navigation = false;
        self.display.show_transient(passkey.as_str());
        io.display.restart();
        self.redraw(io);
        Ok(())
    }

    /// The user answered the passkey prompt.
    pub(crate) fn on_match_confirmed<L: LinkLayer, R: Renderer>(
        &mut self,
        accepted: bool,
        io: &mut Io<'_, L, R>,
    ) -> Result<(), Error> {
        let result = match self.conn.pending_passkey.take() {
            Some(conn) => {
                info!("ble: passkey {}", if accepted { "accepted" } else { "rejected" });
                let reply = if accepted {
                    KeyReply::Accept
                } else {
                    KeyReply::NoKey
                };
                check_link(io.link.reply_auth_key(conn, reply))
            }
            None => {
                debug!("ble: confirmation with nothing pending");
                Ok(())
            }
        };

        self.navigation = true;
        if self.display.restore() {
            io.display.restart();
        }
        self.redraw(io);
        result
    }

    pub(crate) fn on_adv_event<L: LinkLayer, R: Renderer>(
        &mut self,
        event: AdvEvent,
        io: &mut Io<'_, L, R>,
    ) -> Result<(), Error> {
        match event {
            AdvEvent::Fast => self.adv.phase = AdvPhase::Fast,
            AdvEvent::Slow => self.adv.phase = AdvPhase::Slow,
            AdvEvent::Idle => {
                info!("ble: advertising idle");
                self.adv = AdvState::new();
                if self.conn.pending_passkey.is_none() {
                    self.navigation = true;
                    if self.display.restore() {
                        io.display.restart();
                        self.redraw(io);
                    }
                }
            }
        }
        Ok(())
    }

    /// Long press: advertise and open the pairing window.
    pub(crate) fn start_pairing<L: LinkLayer, R: Renderer>(
        &mut self,
        io: &mut Io<'_, L, R>,
    ) -> Result<(), Error> {
        info!("ble: user started pairing");
        check_link(io.link.start_advertising())?;
        self.adv.pairing_window = true;
        if self.adv.phase == AdvPhase::Idle {
            self.adv.phase = AdvPhase::Fast;
        }
        self.navigation = false;
        Ok(())
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
    use crate::display::TRANSIENT_INDEX;

    fn passkey(conn: ConnHandle, digits: &[u8; 6]) -> BadgeEvent {
        BadgeEvent::Security(SecurityEvent::PasskeyDisplay {
            conn,
            passkey: Passkey(*digits),
            match_request: true,
        })
    }

    /// Connected on handle 1 inside a pairing window.
    fn pairing_harness() -> Harness {
        let mut h = Harness::booted();
        h.send(BadgeEvent::Joystick(crate::ui::JoystickEvent::CenterLong));
        h.send(BadgeEvent::Link(LinkEvent::Connected(1)));
        h.link.calls.clear();
        h
    }

    #[test]
    fn connect_assigns_queued_writes() {
        let mut h = Harness::booted();
        h.send(BadgeEvent::Link(LinkEvent::Connected(7)));
        assert_eq!(h.badge.connection().handle(), Some(7));
        assert_eq!(h.badge.connection().state(), LinkState::Unsecured);
        assert_eq!(h.link.calls, [LinkCall::AssignQueuedWrites(7)]);
    }

    #[test]
    fn passkey_outside_window_is_rejected() {
        let mut h = Harness::booted();
        h.send(BadgeEvent::Link(LinkEvent::Connected(1)));
        h.send(passkey(1, b"123456"));
        assert_eq!(
            h.link.calls.last(),
            Some(&LinkCall::ReplyAuthKey(1, KeyReply::NoKey))
        );
        assert_eq!(h.badge.connection().pending_passkey(), None);
        assert!(h.badge.navigation_enabled());
    }

    #[test]
    fn passkey_for_other_handle_is_rejected() {
        let mut h = pairing_harness();
        h.send(passkey(2, b"123456"));
        assert_eq!(h.link.calls, [LinkCall::ReplyAuthKey(2, KeyReply::NoKey)]);
        assert_eq!(h.badge.connection().pending_passkey(), None);
    }

    #[test]
    fn passkey_prompt_shows_code_and_locks_navigation() {
        let mut h = pairing_harness();
        h.send(passkey(1, b"042042"));
        assert_eq!(h.badge.connection().state(), LinkState::PasskeyPending);
        assert_eq!(h.badge.display().active_index(), TRANSIENT_INDEX);
        assert_eq!(h.screen.last_text(), Some("042042"));
        assert!(!h.badge.navigation_enabled());
        assert!(h.link.calls.is_empty());
    }

    #[test]
    fn second_passkey_request_is_ignored() {
        let mut h = pairing_harness();
        h.send(passkey(1, b"111111"));
        h.send(passkey(1, b"222222"));

        assert_eq!(h.badge.connection().pending_passkey(), Some(1));
        assert_eq!(h.screen.last_text(), Some("111111"));
        // The original request is still unanswered.
        assert!(h.link.calls.is_empty());
    }

    #[test]
    fn confirmation_replies_and_restores() {
        let mut h = pairing_harness();
        h.badge_select(2);
        h.send(passkey(1, b"123456"));
        h.send(BadgeEvent::MatchConfirmed(true));

        assert_eq!(h.link.calls, [LinkCall::ReplyAuthKey(1, KeyReply::Accept)]);
        assert_eq!(h.badge.connection().pending_passkey(), None);
        assert_eq!(h.badge.display().active_index(), 2);
        assert!(h.badge.navigation_enabled());
    }

    #[test]
    fn index_write_during_prompt_keeps_code_on_screen() {
        let mut h = pairing_harness();
        h.send(passkey(1, b"424242"));
        h.badge_select(2);

        assert_eq!(h.badge.connection().pending_passkey(), Some(1));
        assert_eq!(h.badge.display().active_index(), TRANSIENT_INDEX);
        assert_eq!(h.screen.last_text(), Some("424242"));

        h.send(BadgeEvent::MatchConfirmed(true));
        assert_eq!(h.badge.display().active_index(), 2);
        assert_eq!(h.screen.last_text(), Some(crate::config::DEFAULT_MESSAGES[2]));
    }

    #[test]
    fn rejection_replies_no_key() {
        let mut h = pairing_harness();
        h.send(passkey(1, b"123456"));
        h.send(BadgeEvent::MatchConfirmed(false));
        assert_eq!(h.link.calls, [LinkCall::ReplyAuthKey(1, KeyReply::NoKey)]);
        assert!(h.badge.navigation_enabled());
    }

    #[test]
    fn joystick_answers_prompt() {
        let mut h = pairing_harness();
        h.send(passkey(1, b"123456"));
        h.send(BadgeEvent::Joystick(crate::ui::JoystickEvent::Up));
        assert_eq!(h.link.calls, [LinkCall::ReplyAuthKey(1, KeyReply::Accept)]);
    }

    #[test]
    fn disconnect_cancels_pending_prompt() {
        let mut h = pairing_harness();
        h.badge_select(3);
        h.send(passkey(1, b"123456"));
        h.send(BadgeEvent::Link(LinkEvent::Disconnected {
            conn: 1,
            reason: 0x13,
        }));

        assert_eq!(h.badge.connection().state(), LinkState::Advertising);
        assert_eq!(h.badge.connection().pending_passkey(), None);
        assert_eq!(h.badge.display().active_index(), 3);
        assert_eq!(h.badge.adv().phase(), AdvPhase::Fast);

        // A late answer has nobody to reply to.
        h.send(BadgeEvent::MatchConfirmed(true));
        assert!(h.link.calls.is_empty());
    }

    #[test]
    fn security_failure_deletes_bond() {
        let mut h = pairing_harness();
        h.send(BadgeEvent::Security(SecurityEvent::Failed { conn: 1, peer: 4 }));
        assert_eq!(h.link.calls, [LinkCall::DeleteBond(4)]);
        assert_eq!(h.badge.connection().handle(), Some(1));
    }

    #[test]
    fn gatt_timeout_forces_disconnect() {
        let mut h = pairing_harness();
        h.send(BadgeEvent::Link(LinkEvent::GattTimeout(1)));
        assert_eq!(
            h.link.calls,
            [LinkCall::Disconnect(1, DisconnectReason::RemoteUserTerminated)]
        );
    }

    #[test]
    fn phy_update_and_sys_attrs_are_answered() {
        let mut h = pairing_harness();
        h.send(BadgeEvent::Link(LinkEvent::PhyUpdateRequest(1)));
        h.send(BadgeEvent::Link(LinkEvent::SysAttrMissing(1)));
        assert_eq!(
            h.link.calls,
            [LinkCall::AcceptPhyUpdate(1), LinkCall::SetSysAttrs(1)]
        );
        assert_eq!(h.badge.connection().state(), LinkState::Unsecured);
    }

    #[test]
    fn secured_event_marks_link() {
        let mut h = pairing_harness();
        h.send(BadgeEvent::Security(SecurityEvent::Secured(1)));
        assert_eq!(h.badge.connection().state(), LinkState::Secured);
    }

    #[test]
    fn advertising_idle_closes_window_and_restores_navigation() {
        let mut h = Harness::booted();
        h.send(BadgeEvent::Joystick(crate::ui::JoystickEvent::CenterLong));
        assert!(h.badge.adv().pairing_window());
        assert!(!h.badge.navigation_enabled());
        assert!(h.link.calls.contains(&LinkCall::StartAdvertising));

        h.send(BadgeEvent::Adv(AdvEvent::Slow));
        assert_eq!(h.badge.adv().phase(), AdvPhase::Slow);
        h.send(BadgeEvent::Adv(AdvEvent::Idle));
        assert_eq!(h.badge.adv().phase(), AdvPhase::Idle);
        assert!(!h.badge.adv().pairing_window());
        assert!(h.badge.navigation_enabled());
    }

    #[test]
    fn stale_link_errors_are_tolerated_raw_errors_are_fatal() {
        assert_eq!(check_link(Err(LinkError::InvalidState)), Ok(()));
        assert_eq!(check_link(Err(LinkError::Raw(3))), Err(Error::Fatal(3)));

        let mut h = pairing_harness();
        h.link.fail_with = Some(LinkError::Raw(8));
        let result = h.try_send(BadgeEvent::Link(LinkEvent::PhyUpdateRequest(1)));
        assert!(result.unwrap_err().is_fatal());
    }
}
