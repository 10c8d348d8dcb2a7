//! OTA transfer state machine
//!
//! A pure transition function: every transport completion, notification and
//! caller request arrives as an [`Event`], and the machine answers with the
//! [`Action`]s to perform. It never performs I/O itself, which keeps the
//! protocol independent of any BLE binding and lets every transition be
//! tested directly.
//!
//! Flow: connect → request MTU → discover → enable notifications → Ready →
//! START → N × chunk → END → Completed/Refused.

use std::sync::Arc;
use std::time::Duration;

use bleota_proto::ble::{ATT_WRITE_OVERHEAD, DEFAULT_ATT_MTU};
use bleota_proto::{AckStatus, Command, DecodeError, FrameCodec, Message};
use log::{debug, info, warn};

use crate::error::{DiscoveryError, GATT_SUCCESS, ProtocolError, TransferError, TransportError};
use crate::gatt::{
    CharacteristicHandle, CharacteristicKind, ConnectionEvent, ServiceDescriptor, WriteMode,
};
use crate::image::FirmwareImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Idle,
    Connecting,
    Discovering,
    Ready,
    AwaitingStartAck,
    Uploading,
    AwaitingEndAck,
    Completed,
    Refused,
    Failed,
    Disconnected,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::Completed | State::Refused | State::Failed | State::Disconnected
        )
    }

    /// Command whose ack the machine is waiting for, if any
    pub fn awaited_ack(self) -> Option<Command> {
        match self {
            State::AwaitingStartAck => Some(Command::Start),
            State::AwaitingEndAck => Some(Command::End),
            _ => None,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Idle => "idle",
            State::Connecting => "connecting",
            State::Discovering => "discovering",
            State::Ready => "ready",
            State::AwaitingStartAck => "awaiting start ack",
            State::Uploading => "uploading",
            State::AwaitingEndAck => "awaiting end ack",
            State::Completed => "completed",
            State::Refused => "refused",
            State::Failed => "failed",
            State::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Input to the machine, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connection(ConnectionEvent),
    MtuNegotiated(Result<u16, TransportError>),
    ServicesDiscovered(Result<ServiceDescriptor, DiscoveryError>),
    NotificationsEnabled(Result<(), TransportError>),
    WriteCompleted(Result<(), TransportError>),
    /// Decoded ack notification, or the reason it could not be decoded
    Notification(Result<Message, DecodeError>),
    StartTransfer,
    AckTimeout,
}

/// Output of the machine, to be performed in order
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Connect,
    RequestMtu(u16),
    DiscoverServices,
    EnableNotifications(ServiceDescriptor),
    Write {
        characteristic: CharacteristicHandle,
        data: Vec<u8>,
        mode: WriteMode,
    },
    /// (Re)start the ack deadline
    ArmAckTimer,
    Disconnect,
    Report(SessionEvent),
}

/// Observations delivered to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionState { connected: bool, status: i32 },
    MtuNegotiated { mtu: u16, status: i32 },
    Discovery(Result<ServiceDescriptor, DiscoveryError>),
    /// Notifications are on and `ota()` may be called
    Ready,
    WriteFailed {
        characteristic: CharacteristicKind,
        status: i32,
    },
    Message(Message),
    Progress(u8),
    /// Exactly one per session, nothing follows it
    Finished(Outcome),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    Refused(Command),
    Failed(TransferError),
    Disconnected { status: i32 },
}

impl Outcome {
    fn state(&self) -> State {
        match self {
            Outcome::Completed => State::Completed,
            Outcome::Refused(_) => State::Refused,
            Outcome::Failed(_) => State::Failed,
            Outcome::Disconnected { .. } => State::Disconnected,
        }
    }
}

/// The single GATT operation currently outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Connect,
    Mtu,
    Discovery,
    Notifications,
    Write(PendingWrite),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingWrite {
    Start,
    Chunk(usize),
    End,
}

impl PendingWrite {
    fn characteristic(self) -> CharacteristicKind {
        match self {
            PendingWrite::Chunk(_) => CharacteristicKind::Firmware,
            PendingWrite::Start | PendingWrite::End => CharacteristicKind::Command,
        }
    }
}

/// Read-only view of a session for diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: State,
    pub offset: usize,
    pub len: usize,
    pub mtu: u16,
    pub descriptor: Option<ServiceDescriptor>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: State::Idle,
            offset: 0,
            len: 0,
            mtu: DEFAULT_ATT_MTU,
            descriptor: None,
        }
    }
}

pub struct TransferMachine {
    codec: Arc<dyn FrameCodec>,
    image: FirmwareImage,
    requested_mtu: u16,
    data_write_mode: WriteMode,
    ack_timeout: Duration,
    state: State,
    offset: usize,
    mtu: u16,
    descriptor: Option<ServiceDescriptor>,
    in_flight: Option<Pending>,
}

impl TransferMachine {
    pub fn new(
        codec: Arc<dyn FrameCodec>,
        image: FirmwareImage,
        requested_mtu: u16,
        data_write_mode: WriteMode,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            codec,
            image,
            requested_mtu,
            data_write_mode,
            ack_timeout,
            state: State::Idle,
            offset: 0,
            mtu: DEFAULT_ATT_MTU,
            descriptor: None,
            in_flight: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn descriptor(&self) -> Option<&ServiceDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state,
            offset: self.offset,
            len: self.image.len(),
            mtu: self.mtu,
            descriptor: self.descriptor.clone(),
        }
    }

    /// Firmware bytes carried by one data write at the negotiated MTU
    pub fn payload_size(&self) -> usize {
        (self.mtu as usize).saturating_sub(ATT_WRITE_OVERHEAD + self.codec.overhead())
    }

    /// Idle → Connecting
    pub fn connect(&mut self) -> Vec<Action> {
        if self.state != State::Idle {
            warn!("connect ignored while {}", self.state);
            return Vec::new();
        }
        self.transition(State::Connecting);
        self.issue(Pending::Connect, Action::Connect)
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        if self.state.is_terminal() {
            debug!("discarding {event:?} after session {}", self.state);
            return Vec::new();
        }

        match event {
            Event::Connection(connection) => self.on_connection(connection),
            Event::MtuNegotiated(result) => self.on_mtu(result),
            Event::ServicesDiscovered(result) => self.on_discovered(result),
            Event::NotificationsEnabled(result) => self.on_notifications_enabled(result),
            Event::WriteCompleted(result) => self.on_write_completed(result),
            Event::Notification(result) => self.on_notification(result),
            Event::StartTransfer => self.on_start_transfer(),
            Event::AckTimeout => self.on_ack_timeout(),
        }
    }

    fn on_connection(&mut self, connection: ConnectionEvent) -> Vec<Action> {
        match connection {
            ConnectionEvent::Connected if self.state == State::Connecting => {
                self.complete(Pending::Connect);
                info!("connected");
                self.transition(State::Discovering);
                let mut actions = vec![report(SessionEvent::ConnectionState {
                    connected: true,
                    status: GATT_SUCCESS,
                })];
                actions.extend(self.issue(Pending::Mtu, Action::RequestMtu(self.requested_mtu)));
                actions
            }
            ConnectionEvent::Connected => {
                warn!("ignoring connected event while {}", self.state);
                Vec::new()
            }
            ConnectionEvent::Failed(e) => {
                let mut actions = vec![report(SessionEvent::ConnectionState {
                    connected: false,
                    status: e.code(),
                })];
                actions.extend(self.fail(TransferError::Connect(e)));
                actions
            }
            ConnectionEvent::Disconnected { status } => {
                let mut actions = vec![report(SessionEvent::ConnectionState {
                    connected: false,
                    status,
                })];
                if self.state == State::Connecting {
                    actions.extend(self.fail(TransferError::Connect(TransportError::Status(status))));
                } else {
                    actions.extend(self.finish(Outcome::Disconnected { status }));
                }
                actions
            }
        }
    }

    fn on_mtu(&mut self, result: Result<u16, TransportError>) -> Vec<Action> {
        if !self.complete(Pending::Mtu) {
            return Vec::new();
        }

        let event = match result {
            Ok(mtu) => {
                self.mtu = mtu;
                SessionEvent::MtuNegotiated {
                    mtu,
                    status: GATT_SUCCESS,
                }
            }
            Err(e) => {
                warn!("MTU request failed ({e}), staying at {DEFAULT_ATT_MTU}");
                self.mtu = DEFAULT_ATT_MTU;
                SessionEvent::MtuNegotiated {
                    mtu: self.requested_mtu,
                    status: e.code(),
                }
            }
        };
        debug!("mtu {} gives {} byte chunks", self.mtu, self.payload_size());

        let mut actions = vec![report(event)];
        if self.payload_size() == 0 {
            actions.extend(self.fail(DiscoveryError::MtuTooSmall { mtu: self.mtu }.into()));
            return actions;
        }
        actions.extend(self.issue(Pending::Discovery, Action::DiscoverServices));
        actions
    }

    fn on_discovered(&mut self, result: Result<ServiceDescriptor, DiscoveryError>) -> Vec<Action> {
        if !self.complete(Pending::Discovery) {
            return Vec::new();
        }

        match result {
            Ok(descriptor) => {
                info!(
                    "resolved service {} (firmware {}, command {})",
                    descriptor.service, descriptor.firmware.uuid, descriptor.command.uuid
                );
                self.descriptor = Some(descriptor.clone());
                let mut actions = vec![report(SessionEvent::Discovery(Ok(descriptor.clone())))];
                actions.extend(self.issue(
                    Pending::Notifications,
                    Action::EnableNotifications(descriptor),
                ));
                actions
            }
            Err(e) => {
                let mut actions = vec![report(SessionEvent::Discovery(Err(e.clone())))];
                actions.extend(self.fail(e.into()));
                actions
            }
        }
    }

    fn on_notifications_enabled(&mut self, result: Result<(), TransportError>) -> Vec<Action> {
        if !self.complete(Pending::Notifications) {
            return Vec::new();
        }

        match result {
            Ok(()) => {
                self.transition(State::Ready);
                vec![report(SessionEvent::Ready)]
            }
            Err(e) => self.fail(DiscoveryError::NotificationsFailed(e).into()),
        }
    }

    fn on_start_transfer(&mut self) -> Vec<Action> {
        if self.state != State::Ready {
            warn!("start transfer ignored while {}", self.state);
            return Vec::new();
        }
        // Ready is only reachable through a resolved descriptor
        let Some(command) = self.descriptor.as_ref().map(|d| d.command) else {
            return Vec::new();
        };

        info!("starting transfer of {} bytes", self.image.len());
        self.transition(State::AwaitingStartAck);
        let mut actions = self.issue(
            Pending::Write(PendingWrite::Start),
            Action::Write {
                characteristic: command,
                data: self.codec.encode_start_command(),
                mode: WriteMode::WithResponse,
            },
        );
        actions.push(Action::ArmAckTimer);
        actions
    }

    fn on_write_completed(&mut self, result: Result<(), TransportError>) -> Vec<Action> {
        let Some(Pending::Write(write)) = self.in_flight else {
            warn!("write completion without a pending write while {}", self.state);
            return Vec::new();
        };
        self.in_flight = None;

        if let Err(e) = result {
            let characteristic = write.characteristic();
            let mut actions = vec![report(SessionEvent::WriteFailed {
                characteristic,
                status: e.code(),
            })];
            actions.extend(self.fail(TransferError::Write {
                characteristic,
                offset: self.offset,
                source: e,
            }));
            return actions;
        }

        match write {
            PendingWrite::Start | PendingWrite::End => self.pump(),
            PendingWrite::Chunk(len) => {
                self.offset += len;
                let mut actions = vec![report(SessionEvent::Progress(self.progress()))];
                actions.extend(self.pump());
                actions
            }
        }
    }

    fn on_notification(&mut self, result: Result<Message, DecodeError>) -> Vec<Action> {
        let message = match result {
            Ok(message) => message,
            Err(e) => return self.protocol_error(e.into()),
        };
        debug!("received {message} while {}", self.state);

        let mut actions = vec![report(SessionEvent::Message(message))];
        let next = match (self.state, message) {
            (State::AwaitingStartAck, Message::StartAck(AckStatus::Accept)) => {
                self.transition(State::Uploading);
                self.pump()
            }
            (State::AwaitingEndAck, Message::EndAck(AckStatus::Accept)) => {
                self.finish(Outcome::Completed)
            }
            (State::AwaitingStartAck, Message::StartAck(AckStatus::Refuse))
            | (State::AwaitingEndAck, Message::EndAck(AckStatus::Refuse)) => {
                self.finish(Outcome::Refused(message.command()))
            }
            (state, message) => {
                self.protocol_error(ProtocolError::UnexpectedMessage { message, state })
            }
        };
        actions.extend(next);
        actions
    }

    fn on_ack_timeout(&mut self) -> Vec<Action> {
        match self.state.awaited_ack() {
            Some(command) => self.protocol_error(ProtocolError::AckTimeout {
                command,
                timeout: self.ack_timeout,
            }),
            None => Vec::new(),
        }
    }

    /// Issues the next write once the previous one has completed
    fn pump(&mut self) -> Vec<Action> {
        if self.state != State::Uploading || self.in_flight.is_some() {
            return Vec::new();
        }
        let Some(descriptor) = self.descriptor.as_ref() else {
            return Vec::new();
        };
        let (firmware, command) = (descriptor.firmware, descriptor.command);

        if self.offset < self.image.len() {
            let chunk = self.image.chunk(self.offset, self.payload_size());
            let len = chunk.len();
            let data = self.codec.encode_data_chunk(chunk);
            return self.issue(
                Pending::Write(PendingWrite::Chunk(len)),
                Action::Write {
                    characteristic: firmware,
                    data,
                    mode: self.data_write_mode,
                },
            );
        }

        self.transition(State::AwaitingEndAck);
        let mut actions = self.issue(
            Pending::Write(PendingWrite::End),
            Action::Write {
                characteristic: command,
                data: self.codec.encode_end_command(),
                mode: WriteMode::WithResponse,
            },
        );
        actions.push(Action::ArmAckTimer);
        actions
    }

    fn progress(&self) -> u8 {
        (self.offset as u64 * 100 / self.image.len() as u64) as u8
    }

    fn issue(&mut self, pending: Pending, action: Action) -> Vec<Action> {
        debug_assert!(
            self.in_flight.is_none(),
            "{pending:?} issued while {:?} outstanding",
            self.in_flight
        );
        self.in_flight = Some(pending);
        vec![action]
    }

    /// Clears the outstanding operation if it is `pending`
    fn complete(&mut self, pending: Pending) -> bool {
        if self.in_flight == Some(pending) {
            self.in_flight = None;
            true
        } else {
            warn!(
                "unexpected {pending:?} completion while {} ({:?} outstanding)",
                self.state, self.in_flight
            );
            false
        }
    }

    fn protocol_error(&mut self, source: ProtocolError) -> Vec<Action> {
        self.fail(TransferError::Protocol {
            offset: self.offset,
            source,
        })
    }

    fn fail(&mut self, error: TransferError) -> Vec<Action> {
        warn!("transfer failed: {error}");
        self.finish(Outcome::Failed(error))
    }

    /// Closes the link, then reports the single terminal outcome
    fn finish(&mut self, outcome: Outcome) -> Vec<Action> {
        self.transition(outcome.state());
        self.in_flight = None;
        info!("session finished: {outcome:?}");
        vec![Action::Disconnect, report(SessionEvent::Finished(outcome))]
    }

    fn transition(&mut self, next: State) {
        debug!("{} -> {}", self.state, next);
        self.state = next;
    }
}

fn report(event: SessionEvent) -> Action {
    Action::Report(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::ServiceLayout;
    use bleota_proto::TaggedCodec;

    fn machine(len: usize, mtu: u16) -> TransferMachine {
        let image = FirmwareImage::new((0..len).map(|i| i as u8).collect::<Vec<_>>()).unwrap();
        TransferMachine::new(
            Arc::new(TaggedCodec),
            image,
            mtu,
            WriteMode::WithResponse,
            Duration::from_secs(1),
        )
    }

    fn reports(actions: &[Action]) -> Vec<SessionEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Report(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn writes(actions: &[Action]) -> Vec<(CharacteristicKind, Vec<u8>)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Write {
                    characteristic,
                    data,
                    ..
                } => Some((characteristic.kind, data.clone())),
                _ => None,
            })
            .collect()
    }

    fn ready(m: &mut TransferMachine) {
        assert_eq!(m.connect(), vec![Action::Connect]);
        let requested = m.requested_mtu;
        let actions = m.handle(Event::Connection(ConnectionEvent::Connected));
        assert!(actions.contains(&Action::RequestMtu(requested)));
        let actions = m.handle(Event::MtuNegotiated(Ok(requested)));
        assert!(actions.contains(&Action::DiscoverServices));
        let descriptor = ServiceLayout::default().descriptor();
        let actions = m.handle(Event::ServicesDiscovered(Ok(descriptor.clone())));
        assert!(actions.contains(&Action::EnableNotifications(descriptor)));
        let actions = m.handle(Event::NotificationsEnabled(Ok(())));
        assert_eq!(reports(&actions), vec![SessionEvent::Ready]);
        assert_eq!(m.state(), State::Ready);
    }

    /// Drives a ready machine through an accepted transfer, returning chunk sizes and progress
    fn upload(m: &mut TransferMachine) -> (Vec<usize>, Vec<u8>) {
        let actions = m.handle(Event::StartTransfer);
        assert_eq!(writes(&actions), vec![(CharacteristicKind::Command, vec![0x01])]);
        assert!(m.handle(Event::WriteCompleted(Ok(()))).is_empty());

        let mut actions = m.handle(Event::Notification(Ok(Message::StartAck(AckStatus::Accept))));
        let mut chunks = Vec::new();
        let mut progress = Vec::new();
        while m.state() == State::Uploading {
            let written = writes(&actions);
            assert_eq!(written.len(), 1);
            assert_eq!(written[0].0, CharacteristicKind::Firmware);
            chunks.push(written[0].1.len());
            let before = m.offset();
            actions = m.handle(Event::WriteCompleted(Ok(())));
            assert!(m.offset() > before, "offset stalled at {before}");
            assert!(m.offset() <= m.image.len());
            for event in reports(&actions) {
                if let SessionEvent::Progress(p) = event {
                    progress.push(p);
                }
            }
        }
        assert_eq!(m.state(), State::AwaitingEndAck);
        assert_eq!(m.offset(), m.image.len());
        assert_eq!(writes(&actions), vec![(CharacteristicKind::Command, vec![0x02])]);
        (chunks, progress)
    }

    #[test]
    fn last_chunk_is_short() {
        let mut m = machine(10, 7);
        ready(&mut m);
        assert_eq!(m.payload_size(), 4);
        let (chunks, progress) = upload(&mut m);
        assert_eq!(chunks, vec![4, 4, 2]);
        assert_eq!(progress, vec![40, 80, 100]);
    }

    #[test]
    fn progress_quarters() {
        let mut m = machine(200, 53);
        ready(&mut m);
        let (chunks, progress) = upload(&mut m);
        assert_eq!(chunks, vec![50; 4]);
        assert_eq!(progress, vec![25, 50, 75, 100]);
    }

    #[test]
    fn end_ack_completes_and_disconnects() {
        let mut m = machine(8, 23);
        ready(&mut m);
        upload(&mut m);
        assert!(m.handle(Event::WriteCompleted(Ok(()))).is_empty());
        let actions = m.handle(Event::Notification(Ok(Message::EndAck(AckStatus::Accept))));
        assert_eq!(
            actions,
            vec![
                Action::Report(SessionEvent::Message(Message::EndAck(AckStatus::Accept))),
                Action::Disconnect,
                Action::Report(SessionEvent::Finished(Outcome::Completed)),
            ]
        );
        assert_eq!(m.state(), State::Completed);
        assert_eq!(m.offset(), 8);
    }

    #[test]
    fn refused_start_sends_no_data() {
        let mut m = machine(64, 23);
        ready(&mut m);
        m.handle(Event::StartTransfer);
        m.handle(Event::WriteCompleted(Ok(())));
        let actions = m.handle(Event::Notification(Ok(Message::StartAck(AckStatus::Refuse))));
        assert!(writes(&actions).is_empty());
        assert_eq!(
            reports(&actions).last(),
            Some(&SessionEvent::Finished(Outcome::Refused(Command::Start)))
        );
        assert_eq!(m.state(), State::Refused);
        assert_eq!(m.offset(), 0);
    }

    #[test]
    fn ack_before_start_write_completion_waits() {
        let mut m = machine(6, 23);
        ready(&mut m);
        m.handle(Event::StartTransfer);
        let actions = m.handle(Event::Notification(Ok(Message::StartAck(AckStatus::Accept))));
        assert!(writes(&actions).is_empty());
        assert_eq!(m.state(), State::Uploading);

        let actions = m.handle(Event::WriteCompleted(Ok(())));
        assert_eq!(
            writes(&actions),
            vec![(CharacteristicKind::Firmware, vec![0, 1, 2, 3, 4, 5])]
        );
    }

    #[test]
    fn end_waits_for_last_chunk_completion() {
        let mut m = machine(4, 23);
        ready(&mut m);
        m.handle(Event::StartTransfer);
        m.handle(Event::WriteCompleted(Ok(())));
        let actions = m.handle(Event::Notification(Ok(Message::StartAck(AckStatus::Accept))));
        assert_eq!(writes(&actions).len(), 1);
        assert_eq!(m.offset(), 0);
        assert_eq!(m.state(), State::Uploading);

        let actions = m.handle(Event::WriteCompleted(Ok(())));
        assert_eq!(m.offset(), 4);
        assert_eq!(writes(&actions), vec![(CharacteristicKind::Command, vec![0x02])]);
    }

    #[test]
    fn chunk_write_failure_reports_offset() {
        let mut m = machine(10, 7);
        ready(&mut m);
        m.handle(Event::StartTransfer);
        m.handle(Event::WriteCompleted(Ok(())));
        m.handle(Event::Notification(Ok(Message::StartAck(AckStatus::Accept))));
        m.handle(Event::WriteCompleted(Ok(())));
        let actions = m.handle(Event::WriteCompleted(Err(TransportError::Status(133))));
        assert_eq!(
            reports(&actions),
            vec![
                SessionEvent::WriteFailed {
                    characteristic: CharacteristicKind::Firmware,
                    status: 133,
                },
                SessionEvent::Finished(Outcome::Failed(TransferError::Write {
                    characteristic: CharacteristicKind::Firmware,
                    offset: 4,
                    source: TransportError::Status(133),
                })),
            ]
        );
        assert_eq!(m.state(), State::Failed);
    }

    #[test]
    fn unparseable_ack_is_fatal() {
        let mut m = machine(10, 23);
        ready(&mut m);
        m.handle(Event::StartTransfer);
        let actions = m.handle(Event::Notification(Err(DecodeError::UnknownStatus(5))));
        assert_eq!(actions[0], Action::Disconnect);
        assert_eq!(m.state(), State::Failed);
    }

    #[test]
    fn unexpected_ack_while_uploading_is_fatal() {
        let mut m = machine(100, 23);
        ready(&mut m);
        m.handle(Event::StartTransfer);
        m.handle(Event::WriteCompleted(Ok(())));
        m.handle(Event::Notification(Ok(Message::StartAck(AckStatus::Accept))));
        let actions = m.handle(Event::Notification(Ok(Message::EndAck(AckStatus::Accept))));
        assert_eq!(
            reports(&actions).last(),
            Some(&SessionEvent::Finished(Outcome::Failed(TransferError::Protocol {
                offset: 0,
                source: ProtocolError::UnexpectedMessage {
                    message: Message::EndAck(AckStatus::Accept),
                    state: State::Uploading,
                },
            })))
        );
    }

    #[test]
    fn ack_timeout_only_while_waiting_for_ack() {
        let mut m = machine(10, 23);
        ready(&mut m);
        assert!(m.handle(Event::AckTimeout).is_empty());
        m.handle(Event::StartTransfer);
        m.handle(Event::AckTimeout);
        assert_eq!(m.state(), State::Failed);
    }

    #[test]
    fn mtu_failure_falls_back_to_default() {
        let mut m = machine(10, 185);
        m.connect();
        m.handle(Event::Connection(ConnectionEvent::Connected));
        let actions = m.handle(Event::MtuNegotiated(Err(TransportError::Status(4))));
        assert_eq!(
            actions,
            vec![
                Action::Report(SessionEvent::MtuNegotiated { mtu: 185, status: 4 }),
                Action::DiscoverServices,
            ]
        );
        assert_eq!(m.mtu(), DEFAULT_ATT_MTU);
        assert_eq!(m.payload_size(), 20);
    }

    #[test]
    fn tiny_mtu_fails_discovery() {
        let mut m = machine(10, 3);
        m.connect();
        m.handle(Event::Connection(ConnectionEvent::Connected));
        m.handle(Event::MtuNegotiated(Ok(3)));
        assert_eq!(m.state(), State::Failed);
    }

    #[test]
    fn discovery_failure_names_missing_element() {
        let mut m = machine(10, 23);
        m.connect();
        m.handle(Event::Connection(ConnectionEvent::Connected));
        m.handle(Event::MtuNegotiated(Ok(23)));
        let missing = DiscoveryError::CharacteristicNotFound {
            which: CharacteristicKind::Command,
            uuid: ServiceLayout::default().command,
        };
        let actions = m.handle(Event::ServicesDiscovered(Err(missing.clone())));
        assert_eq!(
            reports(&actions),
            vec![
                SessionEvent::Discovery(Err(missing.clone())),
                SessionEvent::Finished(Outcome::Failed(TransferError::Discovery(missing))),
            ]
        );
    }

    #[test]
    fn disconnect_while_connecting_is_a_failure() {
        let mut m = machine(10, 23);
        m.connect();
        m.handle(Event::Connection(ConnectionEvent::Disconnected { status: 8 }));
        assert_eq!(m.state(), State::Failed);
    }

    #[test]
    fn link_loss_mid_upload_ends_session() {
        let mut m = machine(100, 23);
        ready(&mut m);
        m.handle(Event::StartTransfer);
        let actions = m.handle(Event::Connection(ConnectionEvent::Disconnected { status: 19 }));
        assert_eq!(
            reports(&actions).last(),
            Some(&SessionEvent::Finished(Outcome::Disconnected { status: 19 }))
        );
        assert_eq!(m.state(), State::Disconnected);
    }

    #[test]
    fn events_after_terminal_state_are_discarded() {
        let mut m = machine(10, 23);
        ready(&mut m);
        m.handle(Event::StartTransfer);
        m.handle(Event::WriteCompleted(Ok(())));
        m.handle(Event::Notification(Ok(Message::StartAck(AckStatus::Refuse))));
        assert!(m.handle(Event::WriteCompleted(Ok(()))).is_empty());
        assert!(
            m.handle(Event::Notification(Ok(Message::StartAck(AckStatus::Accept))))
                .is_empty()
        );
        assert!(m.handle(Event::StartTransfer).is_empty());
    }

    #[test]
    fn start_outside_ready_is_ignored() {
        let mut m = machine(10, 23);
        m.connect();
        assert!(m.handle(Event::StartTransfer).is_empty());
        assert_eq!(m.state(), State::Connecting);
    }
}
