//! In-process radio. Several radios share one `Air`; streams are tokio duplex
//! pipes. Used by the test suite.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rfchat_core::discovery::BLUETOOTH_CLASSIC_PROTOCOL_ID;
use rfchat_core::{
    DeviceId, DeviceUpdate, DiscoveredDevice, SdpAttributes, ServiceRecord, WatcherEvent,
};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use super::{DeviceWatcher, Radio, RadioError, RemoteService, ServiceListener};
use crate::stream::ChatStream;

const PIPE_CAPACITY: usize = 64 * 1024;

struct Node {
    name: String,
    address: String,
    /// Discovery protocol id the device answers to.
    protocol: String,
    powered: bool,
    reject_advertising: Option<String>,
    /// Outbound opens wait here while set.
    open_gate: Option<Arc<Notify>>,
    services: HashMap<Uuid, Offered>,
}

struct Offered {
    attributes: SdpAttributes,
    token: u64,
    inbound: mpsc::UnboundedSender<ChatStream>,
}

struct Watcher {
    owner: DeviceId,
    filter: String,
    tx: mpsc::UnboundedSender<WatcherEvent>,
}

#[derive(Default)]
struct AirState {
    next_id: u64,
    nodes: BTreeMap<DeviceId, Node>,
    watchers: Vec<Watcher>,
    streams_opened: usize,
}

impl AirState {
    fn node(&self, id: &DeviceId) -> Option<&Node> {
        self.nodes.get(id)
    }

    fn powered(&self, id: &DeviceId) -> bool {
        self.node(id).is_some_and(|n| n.powered)
    }

    /// Deliver to every watcher whose filter matches `protocol`, except the one
    /// owned by `about`. Closed watchers are dropped.
    fn broadcast(&mut self, about: &DeviceId, protocol: &str, event: WatcherEvent) {
        self.watchers.retain(|w| {
            &w.owner == about || w.filter != protocol || w.tx.send(event.clone()).is_ok()
        });
    }

    fn visible(&self, id: &DeviceId, node: &Node) -> DiscoveredDevice {
        DiscoveredDevice {
            id: id.clone(),
            name: node.name.clone(),
            address: Some(node.address.clone()),
            is_connected: Some(false),
        }
    }
}

/// Shared medium for loopback radios.
#[derive(Clone, Default)]
pub struct Air {
    state: Arc<Mutex<AirState>>,
}

impl Air {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AirState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring a powered Bluetooth classic radio named `name` into range.
    pub fn radio(&self, name: &str) -> LoopbackRadio {
        self.radio_with_protocol(name, BLUETOOTH_CLASSIC_PROTOCOL_ID)
    }

    /// Bring a radio into range that answers only to the discovery filter `protocol`.
    pub fn radio_with_protocol(&self, name: &str, protocol: &str) -> LoopbackRadio {
        let mut state = self.lock();
        state.next_id += 1;
        let n = state.next_id;
        let id = DeviceId::new(format!("loopback#{n}"));
        let node = Node {
            name: name.to_owned(),
            address: format!("00:00:00:00:00:{n:02X}"),
            protocol: protocol.to_owned(),
            powered: true,
            reject_advertising: None,
            open_gate: None,
            services: HashMap::new(),
        };
        let seen = state.visible(&id, &node);
        state.nodes.insert(id.clone(), node);
        state.broadcast(&id, protocol, WatcherEvent::Added(seen));
        LoopbackRadio {
            air: self.clone(),
            id,
        }
    }

    /// Number of streams opened so far across all radios.
    pub fn streams_opened(&self) -> usize {
        self.lock().streams_opened
    }
}

/// One device on the loopback air.
#[derive(Clone)]
pub struct LoopbackRadio {
    air: Air,
    id: DeviceId,
}

impl LoopbackRadio {
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Switch the radio on or off. Other devices see it appear or disappear.
    pub fn set_powered(&self, powered: bool) {
        let mut state = self.air.lock();
        let Some(node) = state.nodes.get_mut(&self.id) else {
            return;
        };
        if node.powered == powered {
            return;
        }
        node.powered = powered;
        let protocol = node.protocol.clone();
        let event = if powered {
            let node = &state.nodes[&self.id];
            WatcherEvent::Added(state.visible(&self.id, node))
        } else {
            if let Some(node) = state.nodes.get_mut(&self.id) {
                node.services.clear();
            }
            WatcherEvent::Removed(self.id.clone())
        };
        state.broadcast(&self.id, &protocol, event);
    }

    /// Hold every outbound `open` until the returned gate is notified once per open.
    pub fn hold_opens(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        if let Some(node) = self.air.lock().nodes.get_mut(&self.id) {
            node.open_gate = Some(gate.clone());
        }
        gate
    }

    /// Make the next advertisements fail with `reason`; `None` allows them again.
    pub fn reject_advertising(&self, reason: Option<&str>) {
        if let Some(node) = self.air.lock().nodes.get_mut(&self.id) {
            node.reject_advertising = reason.map(str::to_owned);
        }
    }

    pub fn rename(&self, name: &str) {
        let mut state = self.air.lock();
        let Some(node) = state.nodes.get_mut(&self.id) else {
            return;
        };
        node.name = name.to_owned();
        let protocol = node.protocol.clone();
        let update = DeviceUpdate::new(self.id.clone()).with_name(name);
        state.broadcast(&self.id, &protocol, WatcherEvent::Updated(update));
    }

    /// Leave range for good.
    pub fn leave(&self) {
        let mut state = self.air.lock();
        if let Some(node) = state.nodes.remove(&self.id) {
            state.broadcast(&self.id, &node.protocol, WatcherEvent::Removed(self.id.clone()));
        }
        state.watchers.retain(|w| w.owner != self.id);
    }

    /// Advertise `service_id` with an arbitrary attribute map.
    pub fn advertise_attributes(
        &self,
        service_id: Uuid,
        attributes: SdpAttributes,
    ) -> Result<LoopbackListener, RadioError> {
        let mut state = self.air.lock();
        state.next_id += 1;
        let token = state.next_id;
        let node = state
            .nodes
            .get_mut(&self.id)
            .filter(|n| n.powered)
            .ok_or(RadioError::Unavailable)?;
        if let Some(reason) = &node.reject_advertising {
            return Err(RadioError::AdvertisementRejected(reason.clone()));
        }
        if node.services.contains_key(&service_id) {
            return Err(RadioError::AddressInUse);
        }
        let (inbound, rx) = mpsc::unbounded_channel();
        node.services.insert(
            service_id,
            Offered {
                attributes,
                token,
                inbound,
            },
        );
        Ok(LoopbackListener {
            air: self.air.clone(),
            owner: self.id.clone(),
            service_id,
            token,
            rx,
        })
    }
}

#[async_trait]
impl Radio for LoopbackRadio {
    fn local_name(&self) -> String {
        self.air
            .lock()
            .node(&self.id)
            .map(|n| n.name.clone())
            .unwrap_or_default()
    }

    async fn advertise(
        &self,
        record: &ServiceRecord,
    ) -> Result<Box<dyn ServiceListener>, RadioError> {
        let attributes = record
            .attributes()
            .map_err(|e| RadioError::AdvertisementRejected(e.to_string()))?;
        let listener = self.advertise_attributes(record.service_id, attributes)?;
        Ok(Box::new(listener))
    }

    async fn watch(&self, filter: &str) -> Result<DeviceWatcher, RadioError> {
        let mut state = self.air.lock();
        if !state.powered(&self.id) {
            return Err(RadioError::Unavailable);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for (id, node) in &state.nodes {
            if id != &self.id && node.powered && node.protocol == filter {
                let _ = tx.send(WatcherEvent::Added(state.visible(id, node)));
            }
        }
        let _ = tx.send(WatcherEvent::EnumerationCompleted);
        state.watchers.push(Watcher {
            owner: self.id.clone(),
            filter: filter.to_owned(),
            tx,
        });
        Ok(DeviceWatcher::new(rx, None))
    }

    async fn find_service(
        &self,
        device: &DeviceId,
        service_id: Uuid,
    ) -> Result<Option<RemoteService>, RadioError> {
        let state = self.air.lock();
        if !state.powered(&self.id) {
            return Err(RadioError::Unavailable);
        }
        let node = state
            .node(device)
            .filter(|n| n.powered)
            .ok_or_else(|| RadioError::DeviceNotFound(device.clone()))?;
        Ok(node.services.get(&service_id).map(|offered| RemoteService {
            device_id: device.clone(),
            device_name: node.name.clone(),
            service_id,
            attributes: offered.attributes.clone(),
            endpoint: format!("loopback://{device}/{service_id}"),
        }))
    }

    async fn open(&self, service: &RemoteService) -> Result<ChatStream, RadioError> {
        let gate = self.air.lock().node(&self.id).and_then(|n| n.open_gate.clone());
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut state = self.air.lock();
        let local_name = state
            .node(&self.id)
            .filter(|n| n.powered)
            .map(|n| n.name.clone())
            .ok_or(RadioError::Unavailable)?;
        let offered = state
            .node(&service.device_id)
            .and_then(|n| n.services.get(&service.service_id))
            .ok_or(RadioError::EndpointNotFound)?;
        let remote_name = service.device_name.clone();
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let (far_r, far_w) = tokio::io::split(far);
        offered
            .inbound
            .send(ChatStream::new(far_r, far_w, local_name))
            .map_err(|_| RadioError::EndpointNotFound)?;
        state.streams_opened += 1;
        let (near_r, near_w) = tokio::io::split(near);
        Ok(ChatStream::new(near_r, near_w, remote_name))
    }
}

/// Inbound side of a loopback advertisement. Dropping it withdraws the service.
pub struct LoopbackListener {
    air: Air,
    owner: DeviceId,
    service_id: Uuid,
    token: u64,
    rx: mpsc::UnboundedReceiver<ChatStream>,
}

#[async_trait]
impl ServiceListener for LoopbackListener {
    async fn accept(&mut self) -> Result<ChatStream, RadioError> {
        self.rx.recv().await.ok_or(RadioError::ListenerClosed)
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        let mut state = self.air.lock();
        if let Some(node) = state.nodes.get_mut(&self.owner) {
            if node
                .services
                .get(&self.service_id)
                .is_some_and(|o| o.token == self.token)
            {
                node.services.remove(&self.service_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfchat_core::CHAT_SERVICE;

    #[tokio::test]
    async fn watcher_sees_existing_and_new_devices() {
        let air = Air::new();
        let a = air.radio("alpha");
        let _b = air.radio("bravo");
        let mut watcher = a.watch(BLUETOOTH_CLASSIC_PROTOCOL_ID).await.unwrap();
        assert!(matches!(watcher.next().await, Some(WatcherEvent::Added(d)) if d.name == "bravo"));
        assert_eq!(
            watcher.next().await,
            Some(WatcherEvent::EnumerationCompleted)
        );
        let c = air.radio("charlie");
        assert!(matches!(watcher.next().await, Some(WatcherEvent::Added(d)) if d.id == *c.id()));
        c.rename("charlie2");
        assert!(matches!(
            watcher.next().await,
            Some(WatcherEvent::Updated(u)) if u.name.as_deref() == Some("charlie2")
        ));
        c.leave();
        assert_eq!(
            watcher.next().await,
            Some(WatcherEvent::Removed(c.id().clone()))
        );
    }

    #[tokio::test]
    async fn open_connects_to_listener() {
        let air = Air::new();
        let server = air.radio("server");
        let client = air.radio("client");
        let mut listener = server.advertise(&CHAT_SERVICE).await.unwrap();
        let remote = client
            .find_service(server.id(), CHAT_SERVICE.service_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(remote.device_name, "server");
        let outbound = client.open(&remote).await.unwrap();
        let inbound = listener.accept().await.unwrap();
        assert_eq!(inbound.remote_name(), "client");
        assert_eq!(outbound.remote_name(), "server");
        assert_eq!(air.streams_opened(), 1);

        let (mut r, _w, _close) = inbound.into_parts();
        let (_r2, mut w2, _close2) = outbound.into_parts();
        w2.write_frame("ping").await.unwrap();
        assert_eq!(r.read_frame().await.unwrap(), "ping");
    }

    #[tokio::test]
    async fn dropped_listener_withdraws_service() {
        let air = Air::new();
        let server = air.radio("server");
        let client = air.radio("client");
        let listener = server.advertise(&CHAT_SERVICE).await.unwrap();
        drop(listener);
        let found = client
            .find_service(server.id(), CHAT_SERVICE.service_id)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn powered_off_radio_is_unavailable() {
        let air = Air::new();
        let radio = air.radio("solo");
        radio.set_powered(false);
        assert!(matches!(
            radio.advertise(&CHAT_SERVICE).await,
            Err(RadioError::Unavailable)
        ));
        assert!(matches!(
            radio.watch(BLUETOOTH_CLASSIC_PROTOCOL_ID).await,
            Err(RadioError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn rejected_advertisement_reports_reason() {
        let air = Air::new();
        let radio = air.radio("solo");
        radio.reject_advertising(Some("privacy"));
        match radio.advertise(&CHAT_SERVICE).await {
            Err(RadioError::AdvertisementRejected(reason)) => assert_eq!(reason, "privacy"),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("advertisement should have been rejected"),
        }
    }

    #[tokio::test]
    async fn far_end_drop_closes_near_read() {
        let air = Air::new();
        let server = air.radio("server");
        let client = air.radio("client");
        let mut listener = server.advertise(&CHAT_SERVICE).await.unwrap();
        let remote = client
            .find_service(server.id(), CHAT_SERVICE.service_id)
            .await
            .unwrap()
            .unwrap();
        let outbound = client.open(&remote).await.unwrap();
        drop(listener.accept().await.unwrap());
        let (mut r, _w, _close) = outbound.into_parts();
        assert!(matches!(
            r.read_frame().await,
            Err(rfchat_core::FrameReadError::PeerClosed)
        ));
    }

    #[tokio::test]
    async fn watcher_ignores_other_protocols() {
        let air = Air::new();
        let a = air.radio("alpha");
        let _headset = air.radio_with_protocol("headset", "le-audio");
        let mut watcher = a.watch(BLUETOOTH_CLASSIC_PROTOCOL_ID).await.unwrap();
        assert_eq!(
            watcher.next().await,
            Some(WatcherEvent::EnumerationCompleted)
        );
        let _speaker = air.radio_with_protocol("speaker", "le-audio");
        let b = air.radio("bravo");
        assert!(matches!(watcher.next().await, Some(WatcherEvent::Added(d)) if d.id == *b.id()));
    }

    #[tokio::test]
    async fn held_open_waits_for_gate() {
        let air = Air::new();
        let server = air.radio("server");
        let client = air.radio("client");
        let _listener = server.advertise(&CHAT_SERVICE).await.unwrap();
        let remote = client
            .find_service(server.id(), CHAT_SERVICE.service_id)
            .await
            .unwrap()
            .unwrap();
        let gate = client.hold_opens();
        let opening = tokio::spawn(async move { client.open(&remote).await.map(|_| ()) });
        tokio::task::yield_now().await;
        assert_eq!(air.streams_opened(), 0);
        gate.notify_one();
        opening.await.unwrap().unwrap();
        assert_eq!(air.streams_opened(), 1);
    }
}
