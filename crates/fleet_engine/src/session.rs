//! One station connection.
//!
//! A session reads frames strictly in arrival order on its own task and
//! writes commands from a coalescing queue on a second one. Everything else
//! talks to it through a cloneable [`SessionHandle`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use fleet_core::FleetEvent;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, oneshot, watch};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::EventFanout;
use crate::protocol::{
    AckStatus, DisableReason, Frame, Inbound, MAX_CHUNK_PAYLOAD, Outbound, ProtocolError,
    decode_inbound, encode_outbound, read_frame, write_frame,
};
use crate::registry::{FleetRegistry, RegistryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub hello_timeout: Duration,
    /// A session without Data for this long is dead.
    pub telemetry_timeout: Duration,
    pub command_ack_timeout: Duration,
    pub command_retries: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            hello_timeout: Duration::from_secs(10),
            telemetry_timeout: Duration::from_secs(30),
            command_ack_timeout: Duration::from_secs(2),
            command_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareSettings {
    pub chunk_size: usize,
    pub ack_timeout: Duration,
    pub max_retries: u32,
}

impl Default for FirmwareSettings {
    fn default() -> Self {
        FirmwareSettings {
            chunk_size: 512,
            ack_timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("No hello received within {timeout:?}")]
    HelloTimeout { timeout: Duration },
    #[error("No telemetry from {client_id} within {timeout:?}")]
    TelemetryTimeout { client_id: String, timeout: Duration },
    #[error("Firmware transfer to {client_id} is in progress")]
    FirmwareTransferInProgress { client_id: String },
    #[error("Firmware chunk {sequence} of {total} not acknowledged after {attempts} attempts")]
    ChunkNotAcknowledged {
        sequence: u16,
        total: u16,
        attempts: u32,
    },
    #[error("Firmware image of {size} bytes needs more than 65535 chunks")]
    FirmwareTooLarge { size: usize },
    #[error("Firmware image is empty")]
    EmptyFirmware,
    #[error("Current of {amps}A cannot be sent to a station")]
    InvalidCurrent { amps: u32 },
    #[error("Session of {client_id} is closed")]
    Closed { client_id: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    PeerClosed,
    /// Superseded by a newer connection, or closed on shutdown.
    Closed,
}

struct Queued {
    message_id: u32,
    command: Outbound,
}

/// Newer SetCurrent and Disable commands replace unsent ones of the same kind.
#[derive(Default)]
struct CommandQueue {
    items: Mutex<VecDeque<Queued>>,
    notify: Notify,
}

impl CommandQueue {
    /// Returns the message ids of the commands which were replaced, or `None`
    /// when a SetCurrent arrives while a firmware transfer runs.
    fn push(&self, queued: Queued, firmware_active: &AtomicBool) -> Option<Vec<u32>> {
        let mut superseded = Vec::new();
        {
            let mut items = self.items.lock();
            // Checked under the queue lock so it cannot race the purge below
            if matches!(queued.command, Outbound::SetCurrent { .. })
                && firmware_active.load(Ordering::SeqCst)
            {
                return None;
            }
            if !matches!(queued.command, Outbound::FirmwareChunk { .. }) {
                let kind = std::mem::discriminant(&queued.command);
                items.retain(|item| {
                    let same_kind = std::mem::discriminant(&item.command) == kind;
                    if same_kind {
                        superseded.push(item.message_id);
                    }
                    !same_kind
                });
            }
            items.push_back(queued);
        }
        self.notify.notify_one();
        Some(superseded)
    }

    /// Take unsent SetCurrent commands off the queue, returning their message ids.
    fn remove_set_current(&self) -> Vec<u32> {
        let mut removed = Vec::new();
        self.items.lock().retain(|item| {
            let set_current = matches!(item.command, Outbound::SetCurrent { .. });
            if set_current {
                removed.push(item.message_id);
            }
            !set_current
        });
        removed
    }

    fn pop(&self) -> Option<Queued> {
        self.items.lock().pop_front()
    }
}

struct SessionShared {
    session_id: Uuid,
    client_id: String,
    settings: SessionSettings,
    queue: CommandQueue,
    pending_acks: Mutex<HashMap<u32, oneshot::Sender<AckStatus>>>,
    next_message_id: AtomicU32,
    set_current_generation: AtomicU64,
    disable_generation: AtomicU64,
    firmware_active: AtomicBool,
    closed: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionShared>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.inner.session_id)
            .field("client_id", &self.inner.client_id)
            .finish()
    }
}

/// Clears the transfer flag however the transfer ends.
struct FirmwareTransferGuard<'a>(&'a AtomicBool);

impl Drop for FirmwareTransferGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SessionHandle {
    pub fn new(client_id: String, settings: SessionSettings) -> Self {
        let (closed, _) = watch::channel(false);
        SessionHandle {
            inner: Arc::new(SessionShared {
                session_id: Uuid::new_v4(),
                client_id,
                settings,
                queue: CommandQueue::default(),
                pending_acks: Mutex::new(HashMap::new()),
                next_message_id: AtomicU32::new(1),
                set_current_generation: AtomicU64::new(0),
                disable_generation: AtomicU64::new(0),
                firmware_active: AtomicBool::new(false),
                closed,
            }),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Close the session. Pending acknowledgement waits fail immediately.
    pub fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        self.inner.pending_acks.lock().clear();
        self.inner.queue.notify.notify_one();
        debug!("Session {} of {} closing", self.session_id(), self.client_id());
    }

    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub fn firmware_transfer_active(&self) -> bool {
        self.inner.firmware_active.load(Ordering::SeqCst)
    }

    /// Queue a new output current. Refused while firmware is being sent.
    pub fn set_current(&self, amps: u32) -> Result<(), SessionError> {
        if self.firmware_transfer_active() {
            return Err(SessionError::FirmwareTransferInProgress {
                client_id: self.client_id().to_string(),
            });
        }
        let amps = u8::try_from(amps).map_err(|_| SessionError::InvalidCurrent { amps })?;
        self.send_tracked(Outbound::SetCurrent { amps })
    }

    pub fn disable(&self, reason: DisableReason) -> Result<(), SessionError> {
        self.send_tracked(Outbound::Disable { reason })
    }

    /// Send a firmware image chunk by chunk, each waiting for its Ack.
    ///
    /// A failed transfer leaves the session open.
    pub async fn upload_firmware(
        &self,
        image: &[u8],
        settings: &FirmwareSettings,
    ) -> Result<(), SessionError> {
        if image.is_empty() {
            return Err(SessionError::EmptyFirmware);
        }
        let chunk_size = settings.chunk_size.clamp(1, MAX_CHUNK_PAYLOAD);
        let total = u16::try_from(image.len().div_ceil(chunk_size))
            .map_err(|_| SessionError::FirmwareTooLarge { size: image.len() })?;
        if self
            .inner
            .firmware_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::FirmwareTransferInProgress {
                client_id: self.client_id().to_string(),
            });
        }
        let _guard = FirmwareTransferGuard(&self.inner.firmware_active);
        // Their ack waits time out and resend once the transfer is over
        if !self.inner.queue.remove_set_current().is_empty() {
            debug!("Holding back unsent current command to {}", self.client_id());
        }

        info!(
            "Sending {} bytes of firmware to {} in {} chunks",
            image.len(),
            self.client_id(),
            total
        );
        for (sequence, chunk) in image.chunks(chunk_size).enumerate() {
            self.send_chunk(sequence as u16, total, chunk, settings).await?;
        }
        info!("Firmware transfer to {} complete", self.client_id());
        Ok(())
    }

    async fn send_chunk(
        &self,
        sequence: u16,
        total: u16,
        chunk: &[u8],
        settings: &FirmwareSettings,
    ) -> Result<(), SessionError> {
        let attempts = settings.max_retries + 1;
        for attempt in 1..=attempts {
            let (message_id, ack) = self.enqueue(Outbound::FirmwareChunk {
                sequence,
                total,
                payload: chunk.to_vec(),
            })?;
            match timeout(settings.ack_timeout, ack).await {
                Ok(Ok(AckStatus::Accepted)) => return Ok(()),
                Ok(Ok(AckStatus::Rejected(code))) => warn!(
                    "Chunk {} of {} rejected by {} with code {} (attempt {}/{})",
                    sequence,
                    total,
                    self.client_id(),
                    code,
                    attempt,
                    attempts
                ),
                Ok(Err(_)) => {
                    return Err(SessionError::Closed {
                        client_id: self.client_id().to_string(),
                    });
                }
                Err(_) => {
                    self.inner.pending_acks.lock().remove(&message_id);
                    warn!(
                        "Chunk {} of {} not acknowledged by {} (attempt {}/{})",
                        sequence,
                        total,
                        self.client_id(),
                        attempt,
                        attempts
                    );
                }
            }
        }
        Err(SessionError::ChunkNotAcknowledged {
            sequence,
            total,
            attempts,
        })
    }

    fn generation(&self, command: &Outbound) -> Option<&AtomicU64> {
        match command {
            Outbound::SetCurrent { .. } => Some(&self.inner.set_current_generation),
            Outbound::Disable { .. } => Some(&self.inner.disable_generation),
            Outbound::FirmwareChunk { .. } => None,
        }
    }

    fn enqueue(
        &self,
        command: Outbound,
    ) -> Result<(u32, oneshot::Receiver<AckStatus>), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed {
                client_id: self.client_id().to_string(),
            });
        }
        let message_id = self.inner.next_message_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();
        self.inner.pending_acks.lock().insert(message_id, sender);
        let Some(superseded) = self.inner.queue.push(
            Queued {
                message_id,
                command,
            },
            &self.inner.firmware_active,
        ) else {
            self.inner.pending_acks.lock().remove(&message_id);
            return Err(SessionError::FirmwareTransferInProgress {
                client_id: self.client_id().to_string(),
            });
        };
        if !superseded.is_empty() {
            let mut pending = self.inner.pending_acks.lock();
            for id in superseded {
                // Dropping the sender ends the wait of the replaced command
                pending.remove(&id);
            }
        }
        Ok((message_id, receiver))
    }

    /// Queue a command and retry it in the background until acknowledged.
    fn send_tracked(&self, command: Outbound) -> Result<(), SessionError> {
        let generation = self
            .generation(&command)
            .map_or(0, |counter| counter.fetch_add(1, Ordering::SeqCst) + 1);
        let (message_id, ack) = self.enqueue(command.clone())?;
        let handle = self.clone();
        tokio::spawn(async move {
            handle.track(command, generation, message_id, ack).await;
        });
        Ok(())
    }

    async fn track(
        self,
        command: Outbound,
        generation: u64,
        mut message_id: u32,
        mut ack: oneshot::Receiver<AckStatus>,
    ) {
        let settings = self.inner.settings;
        let mut retries = 0;
        loop {
            match timeout(settings.command_ack_timeout, ack).await {
                Ok(Ok(AckStatus::Accepted)) => {
                    debug!("{} acknowledged {:?}", self.client_id(), command);
                    return;
                }
                Ok(Ok(AckStatus::Rejected(code))) => {
                    warn!(
                        "{} rejected {:?} with code {}",
                        self.client_id(),
                        command,
                        code
                    );
                    return;
                }
                // Superseded before it was sent, or the session closed
                Ok(Err(_)) => return,
                Err(_) => {
                    self.inner.pending_acks.lock().remove(&message_id);
                }
            }

            if !self.is_latest(&command, generation) {
                return;
            }
            if retries == settings.command_retries {
                warn!(
                    "{} never acknowledged {:?}, giving up",
                    self.client_id(),
                    command
                );
                return;
            }
            retries += 1;
            debug!(
                "Resending {:?} to {} (retry {}/{})",
                command,
                self.client_id(),
                retries,
                settings.command_retries
            );
            match self.resend(&command, generation).await {
                Some((id, receiver)) => {
                    message_id = id;
                    ack = receiver;
                }
                None => return,
            }
        }
    }

    fn is_latest(&self, command: &Outbound, generation: u64) -> bool {
        let current = self
            .generation(command)
            .map_or(0, |counter| counter.load(Ordering::SeqCst));
        current == generation
    }

    /// Enqueue `command` again, holding it back while a firmware transfer runs.
    async fn resend(
        &self,
        command: &Outbound,
        generation: u64,
    ) -> Option<(u32, oneshot::Receiver<AckStatus>)> {
        loop {
            match self.enqueue(command.clone()) {
                Ok(sent) => return Some(sent),
                Err(SessionError::FirmwareTransferInProgress { .. }) => {
                    debug!(
                        "Holding {:?} for {} until its firmware transfer ends",
                        command,
                        self.client_id()
                    );
                    tokio::time::sleep(self.inner.settings.command_ack_timeout).await;
                    if !self.is_latest(command, generation) {
                        return None;
                    }
                }
                Err(_) => return None,
            }
        }
    }

    fn resolve_ack(&self, message_id: u32, status: AckStatus) {
        match self.inner.pending_acks.lock().remove(&message_id) {
            Some(waiter) => {
                let _ = waiter.send(status);
            }
            None => debug!(
                "Ack from {} for unknown message {}",
                self.client_id(),
                message_id
            ),
        }
    }

    async fn next_command(&self) -> Option<Queued> {
        loop {
            let notified = self.inner.queue.notify.notified();
            if self.is_closed() {
                return None;
            }
            if let Some(queued) = self.inner.queue.pop() {
                return Some(queued);
            }
            notified.await;
        }
    }
}

/// Drive one station connection until it ends.
///
/// The first frame must be a Hello. The session then replaces any earlier
/// session of the same station and runs until the peer leaves, a frame is
/// malformed, telemetry stops, or the session is closed from outside.
pub async fn run_session<S>(
    stream: S,
    address: String,
    registry: Arc<FleetRegistry>,
    events: Arc<EventFanout>,
    settings: SessionSettings,
) -> Result<SessionEnd, SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);

    let (client_id, firmware_version) = read_hello(&mut reader, settings.hello_timeout).await?;
    let handle = SessionHandle::new(client_id.clone(), settings);
    if let Some(previous) =
        registry.attach_session(&client_id, &firmware_version, &address, handle.clone())
    {
        info!(
            "Station {} reconnected from {}, closing session {}",
            client_id,
            address,
            previous.session_id()
        );
        previous.close();
    }
    info!(
        "Station {} connected from {} with firmware {} (session {})",
        client_id,
        address,
        firmware_version,
        handle.session_id()
    );
    events.publish(FleetEvent::StationConnected {
        station_id: client_id.clone(),
        address,
    });

    let writer_task = tokio::spawn(write_commands(handle.clone(), writer));
    let result = read_frames(&handle, &mut reader, &registry, &events, settings).await;

    handle.close();
    if let Err(e) = writer_task.await {
        warn!("Writer of {} failed: {}", client_id, e);
    }
    if registry.detach_session(&client_id, handle.session_id()) {
        events.publish(FleetEvent::StationDisconnected {
            station_id: client_id.clone(),
        });
    }
    match &result {
        Ok(end) => info!("Station {} disconnected ({:?})", client_id, end),
        Err(e) => warn!("Station {} dropped: {}", client_id, e),
    }
    result
}

async fn read_hello<R: AsyncRead + Unpin>(
    reader: &mut R,
    hello_timeout: Duration,
) -> Result<(String, String), SessionError> {
    let body = timeout(hello_timeout, read_frame(reader))
        .await
        .map_err(|_| SessionError::HelloTimeout {
            timeout: hello_timeout,
        })??;
    match decode_inbound(&body)?.body {
        Inbound::Hello {
            client_id,
            firmware_version,
        } => Ok((client_id, firmware_version)),
        _ => Err(ProtocolError::UnexpectedFrame { expected: "hello" }.into()),
    }
}

async fn read_frames<R: AsyncRead + Unpin>(
    handle: &SessionHandle,
    reader: &mut R,
    registry: &FleetRegistry,
    events: &EventFanout,
    settings: SessionSettings,
) -> Result<SessionEnd, SessionError> {
    let mut deadline = Instant::now() + settings.telemetry_timeout;
    let mut faulted = false;
    loop {
        let body = tokio::select! {
            result = timeout_at(deadline, read_frame(reader)) => match result {
                Ok(Ok(body)) => body,
                Ok(Err(ProtocolError::Closed)) => return Ok(SessionEnd::PeerClosed),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(SessionError::TelemetryTimeout {
                        client_id: handle.client_id().to_string(),
                        timeout: settings.telemetry_timeout,
                    });
                }
            },
            _ = handle.closed() => return Ok(SessionEnd::Closed),
        };

        match decode_inbound(&body)?.body {
            Inbound::Data(telemetry) => {
                deadline = Instant::now() + settings.telemetry_timeout;
                let fault = telemetry.pilot_voltage.is_fault();
                if fault && !faulted {
                    warn!(
                        "Station {} reports pilot {:?}, disabling",
                        handle.client_id(),
                        telemetry.pilot_voltage
                    );
                    handle.disable(DisableReason::PilotFault)?;
                }
                faulted = fault;

                let transition = match registry.upsert_telemetry(
                    handle.client_id(),
                    handle.session_id(),
                    telemetry.clone(),
                ) {
                    Ok(transition) => transition,
                    Err(RegistryError::SessionSuperseded { .. }) => return Ok(SessionEnd::Closed),
                    Err(e) => return Err(e.into()),
                };
                events.publish(FleetEvent::TelemetryUpdated {
                    station_id: handle.client_id().to_string(),
                    telemetry,
                    transition,
                });
            }
            Inbound::Ack { message_id, status } => handle.resolve_ack(message_id, status),
            Inbound::Hello { .. } => {
                return Err(ProtocolError::UnexpectedFrame {
                    expected: "data or ack",
                }
                .into());
            }
        }
    }
}

async fn write_commands<W: AsyncWrite + Unpin>(handle: SessionHandle, mut writer: W) {
    while let Some(queued) = handle.next_command().await {
        let frame = encode_outbound(&Frame {
            message_id: queued.message_id,
            body: queued.command,
        });
        tokio::select! {
            result = write_frame(&mut writer, &frame) => {
                if let Err(e) = result {
                    warn!("Could not write to {}: {}", handle.client_id(), e);
                    handle.close();
                    break;
                }
            }
            _ = handle.closed() => break,
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use crate::protocol::{decode_outbound, encode_inbound};
    use crate::registry::tests::telemetry;
    use fleet_core::{CurrentLimits, PilotVoltage};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex};
    use tokio::task::JoinHandle;

    /// Scripted station on the far end of a duplex pipe.
    pub(crate) struct FakeStation {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        next_id: u32,
    }

    impl FakeStation {
        pub(crate) fn new(stream: DuplexStream) -> Self {
            let (reader, writer) = tokio::io::split(stream);
            FakeStation {
                reader,
                writer,
                next_id: 1000,
            }
        }

        pub(crate) async fn send(&mut self, body: Inbound) {
            self.next_id += 1;
            let frame = encode_inbound(&Frame {
                message_id: self.next_id,
                body,
            });
            write_frame(&mut self.writer, &frame)
                .await
                .expect("Could not write frame");
        }

        pub(crate) async fn hello(&mut self, client_id: &str) {
            self.send(Inbound::Hello {
                client_id: client_id.into(),
                firmware_version: "1.0.0".into(),
            })
            .await;
        }

        pub(crate) async fn data(&mut self, pilot: PilotVoltage) {
            self.send(Inbound::Data(telemetry(pilot))).await;
        }

        pub(crate) async fn receive(&mut self) -> Frame<Outbound> {
            let body = read_frame(&mut self.reader)
                .await
                .expect("Could not read frame");
            decode_outbound(&body).expect("Could not decode frame")
        }

        pub(crate) async fn ack(&mut self, message_id: u32) {
            self.send(Inbound::Ack {
                message_id,
                status: AckStatus::Accepted,
            })
            .await;
        }

        pub(crate) async fn is_closed(&mut self) -> bool {
            matches!(
                read_frame(&mut self.reader).await,
                Err(ProtocolError::Closed) | Err(ProtocolError::Io(_))
            )
        }
    }

    pub(crate) fn registry() -> Arc<FleetRegistry> {
        Arc::new(
            FleetRegistry::open(Arc::new(MemoryStore::new()), CurrentLimits::default())
                .expect("Could not open registry"),
        )
    }

    pub(crate) fn connect(
        registry: &Arc<FleetRegistry>,
        events: &Arc<EventFanout>,
        settings: SessionSettings,
    ) -> (FakeStation, JoinHandle<Result<SessionEnd, SessionError>>) {
        let (station_side, controller_side) = duplex(16 * 1024);
        let task = tokio::spawn(run_session(
            controller_side,
            "10.0.0.2:5000".into(),
            registry.clone(),
            events.clone(),
            settings,
        ));
        (FakeStation::new(station_side), task)
    }

    async fn wait_for_session(registry: &FleetRegistry, id: &str) -> SessionHandle {
        loop {
            if let Some(session) = registry.session(id) {
                return session;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_hello_then_telemetry() {
        let registry = registry();
        let events = Arc::new(EventFanout::new());
        let mut listener = events.add_listener("test");
        let (mut station, task) = connect(&registry, &events, SessionSettings::default());

        station.hello("C1").await;
        station.data(PilotVoltage::Volt9).await;

        let connected = listener.recv().await.expect("Could not receive");
        assert!(matches!(
            connected.event,
            FleetEvent::StationConnected { ref station_id, .. } if station_id == "C1"
        ));
        let updated = listener.recv().await.expect("Could not receive");
        assert!(matches!(
            updated.event,
            FleetEvent::TelemetryUpdated {
                transition: Some(fleet_core::TelemetryTransition::CameOnline),
                ..
            }
        ));

        drop(station);
        let end = task.await.expect("Session panicked").expect("Session failed");
        assert_eq!(end, SessionEnd::PeerClosed);
        assert!(registry.session("C1").is_none());
        let disconnected = listener.recv().await.expect("Could not receive");
        assert!(matches!(
            disconnected.event,
            FleetEvent::StationDisconnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_first_frame_must_be_hello() {
        let registry = registry();
        let events = Arc::new(EventFanout::new());
        let (mut station, task) = connect(&registry, &events, SessionSettings::default());

        station.data(PilotVoltage::Volt9).await;

        let result = task.await.expect("Session panicked");
        assert!(matches!(
            result,
            Err(SessionError::Protocol(ProtocolError::UnexpectedFrame { .. }))
        ));
        assert!(!registry.contains("C1"));
    }

    #[tokio::test]
    async fn test_malformed_frame_ends_session() {
        let registry = registry();
        let events = Arc::new(EventFanout::new());
        let (mut station, task) = connect(&registry, &events, SessionSettings::default());
        station.hello("C1").await;

        // Unknown frame type 0x7f
        write_frame(&mut station.writer, &[0x00, 0x05, 0x7f, 0, 0, 0, 1])
            .await
            .expect("Could not write");

        let result = task.await.expect("Session panicked");
        assert!(matches!(
            result,
            Err(SessionError::Protocol(ProtocolError::UnknownFrameType { .. }))
        ));
        assert!(registry.session("C1").is_none());
        assert!(station.is_closed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hello_timeout() {
        let registry = registry();
        let events = Arc::new(EventFanout::new());
        let (_station, task) = connect(&registry, &events, SessionSettings::default());

        let result = task.await.expect("Session panicked");
        assert!(matches!(result, Err(SessionError::HelloTimeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_telemetry_timeout_marks_offline() {
        let registry = registry();
        let events = Arc::new(EventFanout::new());
        let (mut station, task) = connect(&registry, &events, SessionSettings::default());
        station.hello("C1").await;
        station.data(PilotVoltage::Volt9).await;

        let result = task.await.expect("Session panicked");
        assert!(matches!(result, Err(SessionError::TelemetryTimeout { .. })));
        let snapshot = registry.snapshot(Duration::from_secs(30));
        assert!(!snapshot.stations[0].online);
        assert!(snapshot.stations[0].telemetry.is_none());
        assert!(station.is_closed().await);
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_previous_session() {
        let registry = registry();
        let events = Arc::new(EventFanout::new());
        let (mut first, first_task) = connect(&registry, &events, SessionSettings::default());
        first.hello("C1").await;
        let first_session = wait_for_session(&registry, "C1").await;

        let (mut second, _second_task) = connect(&registry, &events, SessionSettings::default());
        second.hello("C1").await;

        let end = first_task
            .await
            .expect("Session panicked")
            .expect("Session failed");
        assert_eq!(end, SessionEnd::Closed);
        assert!(first_session.is_closed());
        let current = registry.session("C1").expect("Could not find session");
        assert_ne!(current.session_id(), first_session.session_id());
        assert!(first.is_closed().await);
    }

    #[tokio::test]
    async fn test_set_current_is_coalesced() {
        let registry = registry();
        let events = Arc::new(EventFanout::new());
        let (mut station, _task) = connect(&registry, &events, SessionSettings::default());
        station.hello("C1").await;
        let session = wait_for_session(&registry, "C1").await;

        // Both are queued before the writer runs; only the newer survives
        session.set_current(10).expect("Could not set current");
        session.set_current(16).expect("Could not set current");
        session
            .disable(DisableReason::Operator)
            .expect("Could not disable");

        let frame = station.receive().await;
        assert_eq!(frame.body, Outbound::SetCurrent { amps: 16 });
        let frame = station.receive().await;
        assert_eq!(
            frame.body,
            Outbound::Disable {
                reason: DisableReason::Operator
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_command_is_retried() {
        let registry = registry();
        let events = Arc::new(EventFanout::new());
        let settings = SessionSettings {
            telemetry_timeout: Duration::from_secs(3600),
            ..SessionSettings::default()
        };
        let (mut station, _task) = connect(&registry, &events, settings);
        station.hello("C1").await;
        let session = wait_for_session(&registry, "C1").await;

        session.set_current(16).expect("Could not set current");
        let first = station.receive().await;
        let retry = station.receive().await;
        assert_eq!(retry.body, Outbound::SetCurrent { amps: 16 });
        assert_ne!(retry.message_id, first.message_id);

        station.ack(retry.message_id).await;
        session.set_current(20).expect("Could not set current");
        assert_eq!(station.receive().await.body, Outbound::SetCurrent { amps: 20 });
    }

    #[tokio::test]
    async fn test_fault_pilot_disables_station() {
        let registry = registry();
        let events = Arc::new(EventFanout::new());
        let (mut station, _task) = connect(&registry, &events, SessionSettings::default());
        station.hello("C1").await;
        station.data(PilotVoltage::Fault).await;

        let frame = station.receive().await;
        assert_eq!(
            frame.body,
            Outbound::Disable {
                reason: DisableReason::PilotFault
            }
        );
    }

    #[tokio::test]
    async fn test_firmware_transfer() {
        let registry = registry();
        let events = Arc::new(EventFanout::new());
        let (mut station, _task) = connect(&registry, &events, SessionSettings::default());
        station.hello("C1").await;
        let session = wait_for_session(&registry, "C1").await;

        let image: Vec<u8> = (0..10u8).collect();
        let settings = FirmwareSettings {
            chunk_size: 4,
            ..FirmwareSettings::default()
        };
        let upload = {
            let session = session.clone();
            let image = image.clone();
            tokio::spawn(async move { session.upload_firmware(&image, &settings).await })
        };

        let mut received = Vec::new();
        for expected in 0..3u16 {
            let frame = station.receive().await;
            match frame.body {
                Outbound::FirmwareChunk {
                    sequence,
                    total,
                    payload,
                } => {
                    assert_eq!(sequence, expected);
                    assert_eq!(total, 3);
                    received.extend(payload);
                }
                other => panic!("Expected a chunk, got {:?}", other),
            }
            if expected == 1 {
                assert!(matches!(
                    session.set_current(16),
                    Err(SessionError::FirmwareTransferInProgress { .. })
                ));
                assert!(matches!(
                    session.upload_firmware(&image, &settings).await,
                    Err(SessionError::FirmwareTransferInProgress { .. })
                ));
            }
            station.ack(frame.message_id).await;
        }

        upload
            .await
            .expect("Upload panicked")
            .expect("Upload failed");
        assert_eq!(received, image);
        assert!(!session.firmware_transfer_active());
        session.set_current(16).expect("Could not set current");
    }

    #[tokio::test(start_paused = true)]
    /// Chunk 3 of 10 is never acknowledged: the transfer fails, the session stays
    async fn test_firmware_chunk_timeout_keeps_session() {
        let registry = registry();
        let events = Arc::new(EventFanout::new());
        let settings = SessionSettings {
            telemetry_timeout: Duration::from_secs(3600),
            ..SessionSettings::default()
        };
        let (mut station, task) = connect(&registry, &events, settings);
        station.hello("C1").await;
        let session = wait_for_session(&registry, "C1").await;

        let firmware = FirmwareSettings {
            chunk_size: 1,
            ack_timeout: Duration::from_secs(1),
            max_retries: 2,
        };
        let upload = {
            let session = session.clone();
            tokio::spawn(async move { session.upload_firmware(&[7u8; 10], &firmware).await })
        };

        for _ in 0..3 {
            let frame = station.receive().await;
            station.ack(frame.message_id).await;
        }
        // Chunk 3 and its two retries go unanswered
        for _ in 0..3 {
            let frame = station.receive().await;
            assert!(matches!(
                frame.body,
                Outbound::FirmwareChunk { sequence: 3, .. }
            ));
        }

        let result = upload.await.expect("Upload panicked");
        assert!(matches!(
            result,
            Err(SessionError::ChunkNotAcknowledged {
                sequence: 3,
                total: 10,
                attempts: 3
            })
        ));
        assert!(!task.is_finished());
        session.set_current(16).expect("Could not set current");
        assert_eq!(station.receive().await.body, Outbound::SetCurrent { amps: 16 });
    }

    #[tokio::test(start_paused = true)]
    /// A current command that times out mid-transfer is resent after the last chunk
    async fn test_current_not_resent_during_firmware_transfer() {
        let registry = registry();
        let events = Arc::new(EventFanout::new());
        let settings = SessionSettings {
            telemetry_timeout: Duration::from_secs(3600),
            ..SessionSettings::default()
        };
        let (mut station, _task) = connect(&registry, &events, settings);
        station.hello("C1").await;
        let session = wait_for_session(&registry, "C1").await;

        session.set_current(16).expect("Could not set current");
        assert_eq!(station.receive().await.body, Outbound::SetCurrent { amps: 16 });

        let firmware = FirmwareSettings {
            chunk_size: 4,
            ack_timeout: Duration::from_secs(10),
            max_retries: 0,
        };
        let upload = {
            let session = session.clone();
            tokio::spawn(async move { session.upload_firmware(&[1u8; 4], &firmware).await })
        };
        let chunk = station.receive().await;
        assert!(matches!(
            chunk.body,
            Outbound::FirmwareChunk { sequence: 0, .. }
        ));

        // The current command times out while the chunk is outstanding
        assert!(
            timeout(Duration::from_secs(5), station.receive())
                .await
                .is_err()
        );
        station.ack(chunk.message_id).await;
        upload
            .await
            .expect("Upload panicked")
            .expect("Upload failed");

        let retry = station.receive().await;
        assert_eq!(retry.body, Outbound::SetCurrent { amps: 16 });
        station.ack(retry.message_id).await;
        session.set_current(20).expect("Could not set current");
        assert_eq!(station.receive().await.body, Outbound::SetCurrent { amps: 20 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_firmware_transfer_drops_queued_current() {
        let session = SessionHandle::new("C1".into(), SessionSettings::default());
        session.set_current(16).expect("Could not set current");

        let upload = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .upload_firmware(&[1u8; 4], &FirmwareSettings::default())
                    .await
            })
        };
        while !session.firmware_transfer_active() {
            tokio::task::yield_now().await;
        }

        let queued = session.inner.queue.pop().expect("Nothing queued");
        assert!(matches!(
            queued.command,
            Outbound::FirmwareChunk { sequence: 0, .. }
        ));
        assert!(session.inner.queue.pop().is_none());
        assert!(matches!(
            session.set_current(20),
            Err(SessionError::FirmwareTransferInProgress { .. })
        ));
        upload.abort();
    }
}
