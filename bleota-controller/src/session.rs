//! Session controller: owns one OTA attempt from connect to close
//!
//! A driver task owns the [`TransferMachine`] and drains a single event queue.
//! Transport completions, routed notifications and caller requests all land
//! in that queue, so transitions run one at a time in arrival order.

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use bleota_proto::{FrameCodec, TaggedCodec};

use crate::config::TransferConfig;
use crate::error::SessionError;
use crate::gatt::{CharacteristicHandle, ConnectionEvent, GattEndpoint};
use crate::image::FirmwareImage;
use crate::machine::{Action, Event, SessionEvent, Snapshot, State, TransferMachine};
use crate::router;

/// Receives session observations on the driver task
pub trait Observer: Send + 'static {
    fn on_event(&mut self, event: SessionEvent);
}

impl<F> Observer for F
where
    F: FnMut(SessionEvent) + Send + 'static,
{
    fn on_event(&mut self, event: SessionEvent) {
        self(event)
    }
}

struct ActiveSession {
    events: mpsc::UnboundedSender<Event>,
    driver: JoinHandle<()>,
}

/// Entry point for delivering one firmware image over one GATT link
pub struct OtaClient<E: GattEndpoint> {
    endpoint: Arc<E>,
    codec: Arc<dyn FrameCodec>,
    config: TransferConfig,
    snapshot: Arc<watch::Sender<Snapshot>>,
    session: Option<ActiveSession>,
    attempts: u32,
}

impl<E: GattEndpoint> OtaClient<E> {
    pub fn new(endpoint: Arc<E>, config: TransferConfig) -> Self {
        Self::with_codec(endpoint, config, Arc::new(TaggedCodec))
    }

    pub fn with_codec(
        endpoint: Arc<E>,
        config: TransferConfig,
        codec: Arc<dyn FrameCodec>,
    ) -> Self {
        Self {
            endpoint,
            codec,
            config,
            snapshot: Arc::new(watch::Sender::new(Snapshot::default())),
            session: None,
            attempts: 0,
        }
    }

    /// Starts a fresh session and drives it towards Ready
    ///
    /// Any previous session is closed first. Returns as soon as the session
    /// task is running; progress is reported to `observer`.
    pub async fn connect(&mut self, image: FirmwareImage, observer: impl Observer) {
        self.close().await;

        let mut machine = TransferMachine::new(
            self.codec.clone(),
            image,
            self.config.requested_mtu,
            self.config.data_write_mode,
            self.config.ack_timeout(),
        );
        let initial = machine.connect();
        let snapshot = Arc::new(watch::Sender::new(machine.snapshot()));

        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver {
            endpoint: self.endpoint.clone(),
            codec: self.codec.clone(),
            machine,
            events_tx: tx.clone(),
            events_rx: rx,
            observer: Box::new(observer),
            snapshot: snapshot.clone(),
            ack_timeout: self.config.ack_timeout(),
            router: None,
        };

        self.attempts += 1;
        info!("starting OTA session #{}", self.attempts);
        self.snapshot = snapshot;
        self.session = Some(ActiveSession {
            events: tx,
            driver: tokio::spawn(driver.run(initial)),
        });
    }

    /// Begins the transfer; only valid once the session is Ready
    pub fn ota(&self) -> Result<(), SessionError> {
        let session = self.session.as_ref().ok_or(SessionError::NoSession)?;
        let state = self.snapshot.borrow().state;
        if state != State::Ready {
            return Err(SessionError::NotReady(state));
        }
        session
            .events
            .send(Event::StartTransfer)
            .map_err(|_| SessionError::NoSession)
    }

    /// Disconnects and discards the session; a no-op without one
    ///
    /// Once this returns no further observer callback runs.
    pub async fn close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        session.driver.abort();
        let _ = session.driver.await;
        self.snapshot.send_modify(|snapshot| {
            if !snapshot.state.is_terminal() {
                snapshot.state = State::Disconnected;
            }
        });
        self.endpoint.disconnect().await;
        info!("session closed");
    }

    pub fn state(&self) -> State {
        self.snapshot.borrow().state
    }

    /// Firmware bytes accepted by the transport so far
    pub fn offset(&self) -> usize {
        self.snapshot.borrow().offset
    }

    pub fn mtu(&self) -> u16 {
        self.snapshot.borrow().mtu
    }

    pub fn service(&self) -> Option<uuid::Uuid> {
        self.snapshot.borrow().descriptor.as_ref().map(|d| d.service)
    }

    pub fn firmware_characteristic(&self) -> Option<CharacteristicHandle> {
        self.snapshot.borrow().descriptor.as_ref().map(|d| d.firmware)
    }

    pub fn command_characteristic(&self) -> Option<CharacteristicHandle> {
        self.snapshot.borrow().descriptor.as_ref().map(|d| d.command)
    }

    /// Sessions started by this client, including the current one
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Subscribe to snapshots of the current session, e.g. to wait for a state
    ///
    /// Each `connect` starts a new channel, so subscribe again afterwards.
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }
}

impl<E: GattEndpoint> Drop for OtaClient<E> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.driver.abort();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let endpoint = self.endpoint.clone();
            runtime.spawn(async move { endpoint.disconnect().await });
        }
    }
}

/// Aborts the router task when the driver goes away
struct RouterTask(JoinHandle<()>);

impl Drop for RouterTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Driver<E: GattEndpoint> {
    endpoint: Arc<E>,
    codec: Arc<dyn FrameCodec>,
    machine: TransferMachine,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    observer: Box<dyn Observer>,
    snapshot: Arc<watch::Sender<Snapshot>>,
    ack_timeout: std::time::Duration,
    router: Option<RouterTask>,
}

impl<E: GattEndpoint> Driver<E> {
    async fn run(mut self, initial: Vec<Action>) {
        let mut deadline = None;
        self.perform(initial, &mut deadline).await;

        while !self.machine.state().is_terminal() {
            let event = match deadline {
                Some(at) => match tokio::time::timeout_at(at, self.events_rx.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        deadline = None;
                        Some(Event::AckTimeout)
                    }
                },
                None => self.events_rx.recv().await,
            };
            let Some(event) = event else {
                break;
            };

            let actions = self.machine.handle(event);
            self.snapshot.send_replace(self.machine.snapshot());
            if self.machine.state().awaited_ack().is_none() {
                deadline = None;
            }
            self.perform(actions, &mut deadline).await;
        }
        debug!("session driver exiting in state {}", self.machine.state());
    }

    async fn perform(&mut self, actions: Vec<Action>, deadline: &mut Option<Instant>) {
        for action in actions {
            let completion = match action {
                Action::Connect => Some(self.connect().await),
                Action::RequestMtu(size) => {
                    Some(Event::MtuNegotiated(self.endpoint.request_mtu(size).await))
                }
                Action::DiscoverServices => {
                    Some(Event::ServicesDiscovered(self.endpoint.discover_services().await))
                }
                Action::EnableNotifications(descriptor) => Some(Event::NotificationsEnabled(
                    self.endpoint.enable_notifications(&descriptor).await,
                )),
                Action::Write {
                    characteristic,
                    data,
                    mode,
                } => Some(Event::WriteCompleted(
                    self.endpoint
                        .write_characteristic(&characteristic, &data, mode)
                        .await,
                )),
                Action::ArmAckTimer => {
                    *deadline = Some(Instant::now() + self.ack_timeout);
                    None
                }
                Action::Disconnect => {
                    self.router = None;
                    self.endpoint.disconnect().await;
                    None
                }
                Action::Report(event) => {
                    self.observer.on_event(event);
                    None
                }
            };

            // Completions queue behind anything the router delivered meanwhile
            if let Some(event) = completion {
                let _ = self.events_tx.send(event);
            }
        }
    }

    /// Connects and starts routing notifications before reporting the link up
    async fn connect(&mut self) -> Event {
        if let Err(e) = self.endpoint.connect().await {
            return Event::Connection(ConnectionEvent::Failed(e));
        }
        match self.endpoint.notifications().await {
            Ok(stream) => {
                let task = tokio::spawn(router::run(
                    stream,
                    self.codec.clone(),
                    self.events_tx.clone(),
                ));
                self.router = Some(RouterTask(task));
                Event::Connection(ConnectionEvent::Connected)
            }
            Err(e) => Event::Connection(ConnectionEvent::Failed(e)),
        }
    }
}
