//! The badge controller - one owned aggregate for all application state.
//!
//! Interrupt-side producers (SoftDevice callbacks, flash task, timers,
//! joystick) only post [`BadgeEvent`]s. The event loop feeds them to
//! [`BadgeController::handle`] in arrival order and then drains the
//! deferred task queue with [`BadgeController::run_deferred`], so every
//! write in a burst is applied before the flush it scheduled runs.

use crate::ble::dispatch::AttributeTable;
use crate::ble::connection::{check_link, AdvState, Connection};
use crate::ble::{AdvEvent, LinkEvent, LinkLayer, SecurityEvent};
#[cfg(feature = "embedded")]
use crate::config::EVENT_QUEUE_DEPTH;
use crate::config::{FILE_ID_MESSAGES, TASK_QUEUE_DEPTH};
use crate::display::{DisplayState, Renderer};
use crate::error::Error;
use crate::storage::{FlashEvent, FlashOutcome, FlashStore, RecordStorage};
use crate::store::{slot_for_key, ConfigStore};
use crate::ui::input_logic::{self, InputAction};
use crate::ui::JoystickEvent;
use heapless::Deque;

/// Work posted for the event loop to run after the current event burst.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Task {
    /// Flush every dirty message slot.
    SaveDirty,
}

/// Everything the controller reacts to.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BadgeEvent {
    Link(LinkEvent),
    Security(SecurityEvent),
    Adv(AdvEvent),
    Flash(FlashEvent),
    /// The user answered a passkey prompt.
    MatchConfirmed(bool),
    Joystick(JoystickEvent),
    /// Periodic flush point.
    FlushTimer,
    Deferred(Task),
}

/// Producer end of the event channel drained by the app task.
#[cfg(feature = "embedded")]
pub type EventSender = embassy_sync::channel::Sender<
    'static,
    embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex,
    BadgeEvent,
    EVENT_QUEUE_DEPTH,
>;

/// Outbound collaborators handed to each handler call.
pub struct Io<'a, L, R> {
    pub link: &'a mut L,
    pub display: &'a mut R,
}

impl<'a, L: LinkLayer, R: Renderer> Io<'a, L, R> {
    pub fn new(link: &'a mut L, display: &'a mut R) -> Self {
        Self { link, display }
    }
}

pub struct BadgeController<S> {
    pub(crate) flash: FlashStore<S>,
    pub(crate) store: ConfigStore,
    pub(crate) display: DisplayState,
    pub(crate) conn: Connection,
    pub(crate) adv: AdvState,
    /// Joystick browses messages; off while a pairing prompt or the
    /// pairing window owns it.
    pub(crate) navigation: bool,
    pub(crate) attributes: AttributeTable,
    tasks: Deque<Task, TASK_QUEUE_DEPTH>,
}

impl<S: RecordStorage> BadgeController<S> {
    pub fn new(backend: S, attributes: AttributeTable) -> Self {
        Self {
            flash: FlashStore::new(backend),
            store: ConfigStore::new(),
            display: DisplayState::new(),
            conn: Connection::new(),
            adv: AdvState::new(),
            navigation: true,
            attributes,
            tasks: Deque::new(),
        }
    }

    pub fn flash(&self) -> &FlashStore<S> {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut FlashStore<S> {
        &mut self.flash
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ConfigStore {
        &mut self.store
    }

    pub fn display(&self) -> &DisplayState {
        &self.display
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn adv(&self) -> &AdvState {
        &self.adv
    }

    pub fn navigation_enabled(&self) -> bool {
        self.navigation
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    // ── Boot ────────────────────────────────────────────────────────────

    /// Factory reset: delete every stored file. Wait for
    /// [`FlashOutcome::EraseComplete`] before calling [`boot`](Self::boot).
    pub fn start_factory_reset(&mut self) -> Result<(), Error> {
        warn!("app: factory reset requested");
        self.flash.begin_erase_all()?;
        Ok(())
    }

    pub fn needs_first_boot(&self) -> bool {
        self.store.needs_first_boot(&self.flash)
    }

    pub fn finish_first_boot(&mut self) -> Result<(), Error> {
        self.store.finish_first_boot(&mut self.flash)?;
        Ok(())
    }

    /// Load persisted state (storage must be initialised), restore the
    /// device name on the link layer and pick the first message.
    pub fn boot<L: LinkLayer, R: Renderer>(
        &mut self,
        io: &mut Io<'_, L, R>,
        active: Option<i8>,
    ) -> Result<(), Error> {
        self.store.load(&self.flash)?;
        self.store.load_name(&self.flash)?;
        check_link(io.link.set_device_name(self.store.name().as_str()))?;
        self.display.pick_active(active);
        io.display.restart();
        self.redraw(io);
        self.publish(io)?;
        info!("app: booted, showing message {}", self.display.active_index());
        Ok(())
    }

    // ── Event loop ──────────────────────────────────────────────────────

    /// Handle one event. Only [`Error::Fatal`] is returned; everything
    /// else is recovered here.
    pub fn handle<L: LinkLayer, R: Renderer>(
        &mut self,
        event: BadgeEvent,
        io: &mut Io<'_, L, R>,
    ) -> Result<(), Error> {
        match event {
            BadgeEvent::Link(event) => self.on_link_event(event, io),
            BadgeEvent::Security(event) => self.on_security_event(event, io),
            BadgeEvent::Adv(event) => self.on_adv_event(event, io),
            BadgeEvent::Flash(event) => {
                self.on_flash_event(&event);
                Ok(())
            }
            BadgeEvent::MatchConfirmed(accepted) => self.on_match_confirmed(accepted, io),
            BadgeEvent::Joystick(event) => self.on_joystick(event, io),
            BadgeEvent::FlushTimer => {
                self.defer(Task::SaveDirty);
                Ok(())
            }
            BadgeEvent::Deferred(task) => {
                self.defer(task);
                Ok(())
            }
        }
    }

    /// Apply flash completion policy. A message slot whose write did not
    /// commit is marked dirty again so a later flush retries it.
    pub fn on_flash_event(&mut self, event: &FlashEvent) -> FlashOutcome {
        let outcome = self.flash.on_event(event);
        if let FlashOutcome::WriteFailed {
            file_id: FILE_ID_MESSAGES,
            key,
            ..
        } = outcome
        {
            if let Some(slot) = slot_for_key(key) {
                self.store.invalidate(slot);
            }
        }
        outcome
    }

    /// Run queued tasks in FIFO order.
    pub fn run_deferred(&mut self) {
        while let Some(task) = self.tasks.pop_front() {
            match task {
                Task::SaveDirty => match self.store.save_dirty(&mut self.flash) {
                    Ok(0) => {}
                    Ok(n) => info!("app: flushing {} message slots", n),
                    Err(e) => warn!("app: flush incomplete: {}", e),
                },
            }
        }
    }

    /// Push the live configuration to the readable attribute values. Run
    /// after each event burst so reads reflect what the badge applied.
    pub fn publish<L: LinkLayer, R>(&self, io: &mut Io<'_, L, R>) -> Result<(), Error> {
        check_link(io.link.publish_values(self.store.slots(), &self.display))
    }

    /// Queue `task` unless an identical one is already waiting.
    pub(crate) fn defer(&mut self, task: Task) {
        if self.tasks.iter().any(|queued| *queued == task) {
            return;
        }
        if self.tasks.push_back(task).is_err() {
            warn!("app: task queue full, dropping {}", task);
        }
    }

    fn on_joystick<L: LinkLayer, R: Renderer>(
        &mut self,
        event: JoystickEvent,
        io: &mut Io<'_, L, R>,
    ) -> Result<(), Error> {
        let action = input_logic::route(
            event,
            self.navigation,
            self.display.active_index(),
            self.display.brightness(),
        );
        match action {
            Some(InputAction::SelectMessage(index)) => {
                if self.display.select(index) {
                    io.display.restart();
                    self.redraw(io);
                }
                Ok(())
            }
            Some(InputAction::SetBrightness(level)) => {
                self.display.set_brightness(level);
                self.redraw(io);
                Ok(())
            }
            Some(InputAction::StartPairing) => self.start_pairing(io),
            Some(InputAction::MatchConfirmed(accepted)) => self.on_match_confirmed(accepted, io),
            None => Ok(()),
        }
    }

    pub(crate) fn redraw<L, R: Renderer>(&self, io: &mut Io<'_, L, R>) {
        self.display.draw(self.store.slots(), io.display);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Test doubles shared by the module tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::ble::{ConnHandle, DisconnectReason, KeyReply, PeerId};
    use crate::error::LinkError;
    use crate::message::{default_device_name, device_name_from_bytes, DeviceName, MessageSlot};
    use crate::storage::ram::RamStorage;
    use std::string::{String, ToString};
    use std::vec::Vec;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum LinkCall {
        ReplyAuthKey(ConnHandle, KeyReply),
        Disconnect(ConnHandle, DisconnectReason),
        AcceptPhyUpdate(ConnHandle),
        AssignQueuedWrites(ConnHandle),
        SetSysAttrs(ConnHandle),
        SetDeviceName(String),
        RefreshAdvertising,
        StartAdvertising,
        DeleteBond(PeerId),
    }

    /// Attribute values as last published: on, brightness, active, slots.
    pub type Published = (bool, u8, i8, [MessageSlot; crate::config::NUM_MESSAGES]);

    pub struct RecordingLink {
        pub calls: Vec<LinkCall>,
        pub name: DeviceName,
        pub fail_with: Option<LinkError>,
        pub published: Option<Published>,
    }

    impl RecordingLink {
        fn record(&mut self, call: LinkCall) -> Result<(), LinkError> {
            self.calls.push(call);
            match self.fail_with {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    impl LinkLayer for RecordingLink {
        fn reply_auth_key(&mut self, conn: ConnHandle, reply: KeyReply) -> Result<(), LinkError> {
            self.record(LinkCall::ReplyAuthKey(conn, reply))
        }
        fn disconnect(&mut self, conn: ConnHandle, reason: DisconnectReason) -> Result<(), LinkError> {
            self.record(LinkCall::Disconnect(conn, reason))
        }
        fn accept_phy_update(&mut self, conn: ConnHandle) -> Result<(), LinkError> {
            self.record(LinkCall::AcceptPhyUpdate(conn))
        }
        fn assign_queued_writes(&mut self, conn: ConnHandle) -> Result<(), LinkError> {
            self.record(LinkCall::AssignQueuedWrites(conn))
        }
        fn set_sys_attrs(&mut self, conn: ConnHandle) -> Result<(), LinkError> {
            self.record(LinkCall::SetSysAttrs(conn))
        }
        fn device_name(&self) -> Result<DeviceName, LinkError> {
            Ok(self.name.clone())
        }
        fn set_device_name(&mut self, name: &str) -> Result<(), LinkError> {
            self.name = device_name_from_bytes(name.as_bytes());
            self.record(LinkCall::SetDeviceName(name.to_string()))
        }
        fn refresh_advertising(&mut self) -> Result<(), LinkError> {
            self.record(LinkCall::RefreshAdvertising)
        }
        fn start_advertising(&mut self) -> Result<(), LinkError> {
            self.record(LinkCall::StartAdvertising)
        }
        fn delete_bond(&mut self, peer: PeerId) -> Result<(), LinkError> {
            self.record(LinkCall::DeleteBond(peer))
        }
        fn publish_values(
            &mut self,
            slots: &[MessageSlot; crate::config::NUM_MESSAGES],
            display: &crate::display::DisplayState,
        ) -> Result<(), LinkError> {
            self.published = Some((
                display.is_on(),
                display.brightness(),
                display.active_index(),
                slots.clone(),
            ));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingScreen {
        pub frames: Vec<(MessageSlot, bool, u8)>,
        pub restarts: usize,
    }

    impl RecordingScreen {
        pub fn last_text(&self) -> Option<&str> {
            self.frames.last().map(|(slot, _, _)| slot.text.as_str())
        }
        pub fn last_on(&self) -> Option<bool> {
            self.frames.last().map(|(_, on, _)| *on)
        }
        pub fn last_brightness(&self) -> Option<u8> {
            self.frames.last().map(|(_, _, b)| *b)
        }
    }

    impl Renderer for RecordingScreen {
        fn render(&mut self, slot: &MessageSlot, on: bool, brightness: u8) {
            self.frames.push((slot.clone(), on, brightness));
        }
        fn restart(&mut self) {
            self.restarts += 1;
        }
    }

    pub struct Harness {
        pub badge: BadgeController<RamStorage>,
        pub link: RecordingLink,
        pub screen: RecordingScreen,
    }

    impl Harness {
        /// Controller booted from empty flash, all queues drained.
        pub fn booted() -> Self {
            let mut h = Self {
                badge: BadgeController::new(RamStorage::new(), AttributeTable::default()),
                link: RecordingLink {
                    calls: Vec::new(),
                    name: default_device_name(),
                    fail_with: None,
                    published: None,
                },
                screen: RecordingScreen::default(),
            };
            h.settle();
            let mut io = Io::new(&mut h.link, &mut h.screen);
            h.badge.boot(&mut io, None).unwrap();
            h.link.calls.clear();
            h
        }

        /// One event as its own burst: handle, run deferred work, publish.
        pub fn try_send(&mut self, event: BadgeEvent) -> Result<(), Error> {
            self.handle_only(event)?;
            self.badge.run_deferred();
            let mut io = Io::new(&mut self.link, &mut self.screen);
            self.badge.publish(&mut io)
        }

        pub fn send(&mut self, event: BadgeEvent) {
            self.try_send(event).unwrap();
        }

        /// Handle without draining the task queue.
        pub fn handle_only(&mut self, event: BadgeEvent) -> Result<(), Error> {
            let mut io = Io::new(&mut self.link, &mut self.screen);
            self.badge.handle(event, &mut io)
        }

        /// Commit every queued flash operation through the controller.
        pub fn settle(&mut self) {
            while let Some(ev) = self.badge.flash_mut().backend_mut().process() {
                self.badge.on_flash_event(&ev);
            }
        }

        /// Select a message over the link, as the phone app would.
        pub fn badge_select(&mut self, index: i8) {
            let handle = self.badge.attributes.active_index;
            self.send(BadgeEvent::Link(LinkEvent::AttributeWrite {
                conn: self.badge.connection().handle().unwrap_or(0),
                write: crate::ble::AttrWrite::new(handle, 0, &[index as u8]),
            }));
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests (run on host, not embedded)
// ═══════════════════════════════════════════════════════════════════════════
