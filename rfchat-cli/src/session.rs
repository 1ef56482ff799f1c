//! Chat session: the command surface the front end drives. Holds at most one
//! connection; every release of its resources goes through `teardown`.

use std::sync::Arc;

use rfchat_core::connection::is_peer_gone;
use rfchat_core::{
    classify_read_error, ConnectionState, ConnectionStateMachine, DeviceId,
    DiscoveredDevice, DisconnectReason, FrameWriteError, ReadOutcome, Role, ServiceRecord,
    StopCause, Toggle, WatcherStatus,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::discovery::DiscoveryController;
use crate::events::{ChatEvent, EventReceiver, EventSender};
use crate::manager::{ChatError, ConnectionManager};
use crate::radio::{Radio, ServiceListener};
use crate::stream::{ChatStream, ClosableReader, ClosableWriter, CloseSignal};

/// Live stream of the connection.
struct Link {
    writer: Arc<Mutex<ClosableWriter>>,
    close: CloseSignal,
    peer_name: String,
    /// Receive loop; exits on its own once `close` fires.
    _receive: JoinHandle<()>,
}

/// The single connection slot.
struct Slot {
    machine: ConnectionStateMachine,
    /// Bumped on every listen/connect so stale tasks leave newer connections alone.
    epoch: u64,
    /// Accept task. It owns the listener: the advertisement is withdrawn once
    /// the task has been dropped.
    accept: Option<JoinHandle<()>>,
    link: Option<Link>,
}

struct Inner {
    manager: ConnectionManager,
    discovery: DiscoveryController,
    events: EventSender,
    slot: Mutex<Slot>,
}

pub struct ChatSession {
    inner: Arc<Inner>,
}

impl ChatSession {
    pub fn new(radio: Arc<dyn Radio>, record: ServiceRecord) -> (Self, EventReceiver) {
        let (events, rx) = EventSender::channel();
        let inner = Inner {
            discovery: DiscoveryController::new(radio.clone(), events.clone()),
            manager: ConnectionManager::new(radio, record),
            events,
            slot: Mutex::new(Slot {
                machine: ConnectionStateMachine::new(),
                epoch: 0,
                accept: None,
                link: None,
            }),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn local_name(&self) -> String {
        self.inner.manager.radio().local_name()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.slot.lock().await.machine.state()
    }

    /// Name of the connected peer, if any.
    pub async fn peer_name(&self) -> Option<String> {
        let slot = self.inner.slot.lock().await;
        slot.link.as_ref().map(|l| l.peer_name.clone())
    }

    /// Advertise the service and wait in the background for one inbound peer.
    /// On failure the session is back at Idle with nothing held.
    pub async fn start_listening(&self) -> Result<(), ChatError> {
        let mut slot = self.inner.slot.lock().await;
        slot.machine.begin(Role::Server).map_err(|_| ChatError::Busy)?;
        slot.epoch += 1;
        let epoch = slot.epoch;
        let listener = match self.inner.manager.listen().await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!(error = %e, "listen failed");
                rollback(&mut slot);
                return Err(e);
            }
        };
        slot.accept = Some(tokio::spawn(accept_one(self.inner.clone(), listener, epoch)));
        Ok(())
    }

    /// Same as [`ChatSession::disconnect`].
    pub async fn stop_listening(&self) {
        self.disconnect().await;
    }

    /// Start the device watcher. Returns false if it was already running.
    pub async fn start_discovery(&self) -> Result<bool, ChatError> {
        Ok(self.inner.discovery.start().await?)
    }

    pub async fn stop_discovery(&self) -> bool {
        self.inner.discovery.stop().await
    }

    pub fn discovery_status(&self) -> WatcherStatus {
        self.inner.discovery.status()
    }

    pub async fn toggle_discovery(&self) -> Result<Toggle, ChatError> {
        Ok(self.inner.discovery.toggle().await?)
    }

    /// Visible devices, in discovery order.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.inner.discovery.snapshot()
    }

    /// Validate the chat service on `device` and open the stream to it.
    /// Any failure before the stream opens leaves the session at Idle.
    pub async fn connect(&self, device: &DeviceId) -> Result<(), ChatError> {
        let epoch = {
            let mut slot = self.inner.slot.lock().await;
            slot.machine.begin(Role::Client).map_err(|_| ChatError::Busy)?;
            slot.epoch += 1;
            slot.epoch
        };
        tracing::info!(%device, "connecting");
        let opened = async {
            let service = self.inner.manager.resolve(device).await?;
            let stream = self.inner.manager.open(&service).await?;
            Ok::<_, ChatError>((service, stream))
        }
        .await;

        let mut slot = self.inner.slot.lock().await;
        let current =
            slot.epoch == epoch && slot.machine.state() == ConnectionState::Connecting;
        let (service, stream) = match opened {
            Ok(ok) if current => ok,
            Ok(_) => return Err(ChatError::Cancelled),
            Err(e) => {
                tracing::warn!(%device, error = %e, "connect failed");
                if current {
                    rollback(&mut slot);
                }
                return Err(e);
            }
        };
        self.inner
            .install(&mut slot, epoch, Role::Client, stream, service.service_name);
        drop(slot);
        self.inner.discovery.stop().await;
        Ok(())
    }

    /// Send one message. Empty text, or no live connection, is a no-op.
    pub async fn send(&self, text: &str) -> Result<(), ChatError> {
        if text.is_empty() {
            return Ok(());
        }
        let (writer, epoch) = {
            let slot = self.inner.slot.lock().await;
            match (&slot.link, slot.machine.state()) {
                (Some(link), ConnectionState::Connected) => (link.writer.clone(), slot.epoch),
                _ => {
                    tracing::debug!("send without a connection ignored");
                    return Ok(());
                }
            }
        };
        let written = {
            let mut w = writer.lock().await;
            w.write_frame(text).await
        };
        let mut slot = self.inner.slot.lock().await;
        if slot.epoch != epoch || slot.machine.state() != ConnectionState::Connected {
            tracing::debug!("connection released during send");
            return Ok(());
        }
        match written {
            Ok(()) => {
                tracing::debug!(len = text.len(), "sent");
                self.inner.events.emit(ChatEvent::MessageSent(text.to_owned()));
                Ok(())
            }
            Err(FrameWriteError::Io(e)) if is_peer_gone(e.kind()) => {
                self.inner.peer_gone(
                    &mut slot,
                    DisconnectReason::RemoteSideDisconnect(e.to_string()),
                );
                Ok(())
            }
            Err(e) => Err(ChatError::Transport(e.to_string())),
        }
    }

    /// Release everything and report `Disconnected` once. Safe from any state.
    pub async fn disconnect(&self) {
        self.inner.discovery.stop().await;
        self.inner.teardown(None, DisconnectReason::Local).await;
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        // Background tasks keep `inner` alive, so the release must not depend on
        // winning the slot lock right now.
        let inner = self.inner.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    inner.discovery.stop().await;
                    inner.teardown(None, DisconnectReason::Local).await;
                });
            }
            Err(_) => {
                if let Ok(mut slot) = inner.slot.try_lock() {
                    if let Some(accept) = slot.accept.take() {
                        accept.abort();
                    }
                    if let Some(link) = slot.link.take() {
                        link.close.close();
                    }
                }
            }
        }
    }
}

/// Undo a failed listen/connect attempt.
fn rollback(slot: &mut Slot) {
    if let Err(e) = slot.machine.transition(ConnectionState::Idle) {
        tracing::warn!(error = %e, "rollback");
    }
}

impl Inner {
    /// Take ownership of an established stream and start its receive loop.
    fn install(
        self: &Arc<Self>,
        slot: &mut Slot,
        epoch: u64,
        role: Role,
        stream: ChatStream,
        service_name: String,
    ) {
        let peer_name = stream.remote_name().to_owned();
        let (reader, writer, close) = stream.into_parts();
        if let Err(e) = slot.machine.transition(ConnectionState::Connected) {
            tracing::warn!(error = %e, "install");
        }
        tracing::info!(%role, peer = %peer_name, "connected");
        self.events.emit(ChatEvent::Connected {
            role,
            peer_name: peer_name.clone(),
            service_name,
        });
        let receive = tokio::spawn(receive_loop(self.clone(), reader, epoch));
        slot.link = Some(Link {
            writer: Arc::new(Mutex::new(writer)),
            close,
            peer_name,
            _receive: receive,
        });
    }

    /// A write found the peer gone: report it and mark the connection dead.
    /// Resources stay held until the caller disconnects.
    fn peer_gone(&self, slot: &mut Slot, reason: DisconnectReason) {
        tracing::warn!(%reason, "peer gone");
        self.events.emit(ChatEvent::PeerDisconnected(reason.to_string()));
        if let Err(e) = slot.machine.transition(ConnectionState::Disconnected) {
            tracing::warn!(error = %e, "peer gone");
        }
        if let Some(link) = &slot.link {
            link.close.close();
        }
    }

    /// Single release routine. `epoch` limits it to one connection; `None`
    /// means whatever is current. Reports `Disconnected` only if something was held.
    async fn teardown(&self, epoch: Option<u64>, reason: DisconnectReason) -> bool {
        let mut slot = self.slot.lock().await;
        if epoch.is_some_and(|e| e != slot.epoch) {
            return false;
        }
        self.release(&mut slot, reason).await
    }

    /// Withdraw the advertisement, close and release the stream, then notify.
    /// Runs under the slot lock, so nothing touches the stream after it.
    async fn release(&self, slot: &mut Slot, reason: DisconnectReason) -> bool {
        let active = !slot.machine.is_idle();
        let accept = slot.accept.take();
        let link = slot.link.take();
        if !active && accept.is_none() && link.is_none() {
            return false;
        }
        if let Some(accept) = accept {
            accept.abort();
            if let Err(e) = accept.await {
                if e.is_panic() {
                    tracing::warn!(error = %e, "accept task panicked");
                }
            }
        }
        if let Some(link) = link {
            link.close.close();
            link.writer.lock().await.shutdown().await;
        }
        if slot.machine.state() != ConnectionState::Disconnecting {
            if let Err(e) = slot.machine.transition(ConnectionState::Disconnecting) {
                tracing::debug!(error = %e, "teardown");
            }
        }
        if let Err(e) = slot.machine.transition(ConnectionState::Disconnected) {
            tracing::debug!(error = %e, "teardown");
        }
        tracing::info!(%reason, "disconnected");
        self.events.emit(ChatEvent::Disconnected(reason.to_string()));
        true
    }
}

async fn accept_one(inner: Arc<Inner>, mut listener: Box<dyn ServiceListener>, epoch: u64) {
    let accepted = listener.accept().await;
    drop(listener);
    let mut slot = inner.slot.lock().await;
    if slot.epoch != epoch || slot.machine.state() != ConnectionState::Advertising {
        return;
    }
    // This task is finishing on its own; teardown must not wait for it.
    slot.accept = None;
    match accepted {
        Ok(stream) => {
            let service_name = inner.manager.record().service_name.to_owned();
            inner.install(&mut slot, epoch, Role::Server, stream, service_name);
        }
        Err(e) => {
            tracing::warn!(error = %e, "accept failed");
            inner
                .release(&mut slot, DisconnectReason::ReadFailed(e.to_string()))
                .await;
        }
    }
}

async fn receive_loop(inner: Arc<Inner>, mut reader: ClosableReader, epoch: u64) {
    let err = loop {
        match reader.read_frame().await {
            Ok(text) => {
                tracing::debug!(len = text.len(), "received");
                inner.events.emit(ChatEvent::MessageReceived(text));
            }
            Err(err) => break err,
        }
    };
    match classify_read_error(&err, reader.is_closed()) {
        ReadOutcome::StopSilently(StopCause::LocalAbort) => {
            tracing::debug!("receive loop stopped by local close");
        }
        ReadOutcome::StopSilently(cause) => {
            tracing::info!(%cause, "receive loop stopped");
            inner.events.emit(ChatEvent::ReceiveStopped(cause));
        }
        ReadOutcome::Disconnect(reason) => {
            tracing::warn!(%reason, "receive failed");
            inner
                .events
                .emit(ChatEvent::PeerDisconnected(reason.to_string()));
            inner.teardown(Some(epoch), reason).await;
        }
    }
}
