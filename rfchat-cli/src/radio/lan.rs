//! LAN radio: multicast presence beacons, unicast service queries, TCP streams.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rfchat_core::discovery::BLUETOOTH_CLASSIC_PROTOCOL_ID;
use rfchat_core::protocol::{
    decode_datagram, encode_datagram, Message, ServiceOffer, MAX_DATAGRAM_LEN, PROTOCOL_VERSION,
};
use rfchat_core::{DeviceId, DeviceUpdate, DiscoveredDevice, SdpAttributes, ServiceRecord, WatcherEvent};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{DeviceWatcher, Radio, RadioError, RemoteService, ServiceListener};
use crate::stream::ChatStream;

#[derive(Debug, Clone)]
pub struct LanSettings {
    pub device_name: String,
    pub discovery_port: u16,
    pub multicast_group: Ipv4Addr,
    /// TCP port for advertised services; 0 picks an ephemeral port.
    pub channel_port: u16,
    pub beacon_interval: Duration,
    pub peer_timeout: Duration,
    pub query_timeout: Duration,
}

struct Peer {
    name: String,
    addr: SocketAddr,
    last_seen: Instant,
}

/// Devices heard from recently, keyed by id.
#[derive(Default)]
struct PeerTable {
    peers: HashMap<DeviceId, Peer>,
}

impl PeerTable {
    /// Record a beacon. Returns the watcher event it implies, if any.
    fn observe(
        &mut self,
        id: &DeviceId,
        name: &str,
        addr: SocketAddr,
        now: Instant,
    ) -> Option<WatcherEvent> {
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.last_seen = now;
                peer.addr = addr;
                if peer.name == name {
                    return None;
                }
                peer.name = name.to_owned();
                Some(WatcherEvent::Updated(
                    DeviceUpdate::new(id.clone()).with_name(name),
                ))
            }
            None => {
                self.peers.insert(
                    id.clone(),
                    Peer {
                        name: name.to_owned(),
                        addr,
                        last_seen: now,
                    },
                );
                Some(WatcherEvent::Added(discovered(id, name, addr)))
            }
        }
    }

    /// Drop peers silent for `timeout` or longer.
    fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<DeviceId> {
        let gone: Vec<DeviceId> = self
            .peers
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_seen) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &gone {
            self.peers.remove(id);
        }
        gone
    }

    fn snapshot(&self) -> Vec<DiscoveredDevice> {
        self.peers
            .iter()
            .map(|(id, p)| discovered(id, &p.name, p.addr))
            .collect()
    }

    fn name_for_ip(&self, addr: SocketAddr) -> Option<String> {
        self.peers
            .values()
            .find(|p| p.addr.ip() == addr.ip())
            .map(|p| p.name.clone())
    }
}

fn discovered(id: &DeviceId, name: &str, addr: SocketAddr) -> DiscoveredDevice {
    DiscoveredDevice {
        id: id.clone(),
        name: name.to_owned(),
        address: Some(addr.ip().to_string()),
        is_connected: None,
    }
}

struct LocalOffer {
    attributes: SdpAttributes,
    channel_port: u16,
    token: u64,
}

struct Shared {
    id: DeviceId,
    settings: LanSettings,
    /// Unicast socket: beacons go out from here so peers learn where to send queries.
    control: UdpSocket,
    group: SocketAddr,
    peers: Mutex<PeerTable>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<WatcherEvent>>>,
    offers: Mutex<HashMap<Uuid, LocalOffer>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Option<ServiceOffer>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn broadcast(&self, event: WatcherEvent) {
        lock(&self.watchers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    async fn send(&self, msg: &Message, to: SocketAddr) {
        match encode_datagram(msg) {
            Ok(bytes) => {
                if let Err(e) = self.control.send_to(&bytes, to).await {
                    tracing::debug!(%to, error = %e, "datagram send failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "datagram encode failed"),
        }
    }
}

/// Radio backed by the local network. Background tasks stop when it is dropped.
pub struct LanRadio {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl LanRadio {
    pub async fn bind(settings: LanSettings) -> io::Result<Self> {
        let multicast = multicast_socket(settings.discovery_port, settings.multicast_group)?;
        let control = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let id = DeviceId::new(format!("lan#{:016x}", rand::random::<u64>()));
        let group = SocketAddr::from((settings.multicast_group, settings.discovery_port));
        tracing::info!(%id, name = %settings.device_name, %group, "lan radio up");
        let shared = Arc::new(Shared {
            id,
            settings,
            control,
            group,
            peers: Mutex::new(PeerTable::default()),
            watchers: Mutex::new(Vec::new()),
            offers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        });
        let tasks = vec![
            tokio::spawn(beacon_loop(shared.clone())),
            tokio::spawn(presence_loop(shared.clone(), multicast)),
            tokio::spawn(control_loop(shared.clone())),
            tokio::spawn(peer_timeout_loop(shared.clone())),
        ];
        Ok(Self { shared, tasks })
    }

    pub fn id(&self) -> &DeviceId {
        &self.shared.id
    }
}

impl Drop for LanRadio {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Multicast receive socket. Address reuse lets several radios on one host share the port.
fn multicast_socket(port: u16, group: Ipv4Addr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

async fn beacon_loop(shared: Arc<Shared>) {
    let beacon = Message::Beacon {
        protocol_version: PROTOCOL_VERSION,
        device_id: shared.id.clone(),
        name: shared.settings.device_name.clone(),
    };
    loop {
        shared.send(&beacon, shared.group).await;
        tokio::time::sleep(shared.settings.beacon_interval).await;
    }
}

#[async_trait]
trait Datagrams: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl Datagrams for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }
}

/// Next datagram off `socket`. After a receive error it waits `pause` before
/// trying again, so a broken socket cannot spin the loop.
async fn recv_next<S>(socket: &S, buf: &mut [u8], pause: Duration, what: &str) -> (usize, SocketAddr)
where
    S: Datagrams + ?Sized,
{
    loop {
        match socket.recv_from(buf).await {
            Ok(r) => return r,
            Err(e) => {
                tracing::warn!(error = %e, "{what} receive failed");
                tokio::time::sleep(pause).await;
            }
        }
    }
}

async fn presence_loop(shared: Arc<Shared>, socket: UdpSocket) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    let pause = shared.settings.beacon_interval;
    loop {
        let (n, from) = recv_next(&socket, &mut buf, pause, "multicast").await;
        let Ok(Message::Beacon {
            device_id, name, ..
        }) = decode_datagram(&buf[..n])
        else {
            continue;
        };
        if device_id == shared.id {
            continue;
        }
        let event = lock(&shared.peers).observe(&device_id, &name, from, Instant::now());
        if let Some(event) = event {
            tracing::debug!(?event, "presence change");
            shared.broadcast(event);
        }
    }
}

async fn control_loop(shared: Arc<Shared>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    let pause = shared.settings.beacon_interval;
    loop {
        let (n, from) = recv_next(&shared.control, &mut buf, pause, "control").await;
        match decode_datagram(&buf[..n]) {
            Ok(Message::ServiceQuery {
                query_id,
                service_id,
                ..
            }) => {
                let offer = lock(&shared.offers)
                    .get(&service_id)
                    .map(|o| ServiceOffer {
                        service_id,
                        attributes: o.attributes.clone(),
                        channel_port: o.channel_port,
                    });
                let response = Message::ServiceResponse {
                    protocol_version: PROTOCOL_VERSION,
                    query_id,
                    offer,
                };
                shared.send(&response, from).await;
            }
            Ok(Message::ServiceResponse {
                query_id, offer, ..
            }) => {
                if let Some(waiter) = lock(&shared.pending).remove(&query_id) {
                    let _ = waiter.send(offer);
                }
            }
            Ok(Message::Beacon { .. }) => {}
            Err(e) => tracing::debug!(%from, error = %e, "dropping datagram"),
        }
    }
}

async fn peer_timeout_loop(shared: Arc<Shared>) {
    loop {
        tokio::time::sleep(shared.settings.beacon_interval).await;
        let gone = lock(&shared.peers).expire(Instant::now(), shared.settings.peer_timeout);
        for id in gone {
            tracing::debug!(%id, "peer timed out");
            shared.broadcast(WatcherEvent::Removed(id));
        }
    }
}

#[async_trait]
impl Radio for LanRadio {
    fn local_name(&self) -> String {
        self.shared.settings.device_name.clone()
    }

    async fn advertise(
        &self,
        record: &ServiceRecord,
    ) -> Result<Box<dyn ServiceListener>, RadioError> {
        let attributes = record
            .attributes()
            .map_err(|e| RadioError::AdvertisementRejected(e.to_string()))?;
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.shared.settings.channel_port))
            .await
            .map_err(|e| RadioError::AdvertisementRejected(e.to_string()))?;
        let channel_port = listener.local_addr().map_err(RadioError::Io)?.port();
        let token = rand::random::<u64>();
        let mut offers = lock(&self.shared.offers);
        if offers.contains_key(&record.service_id) {
            return Err(RadioError::AdvertisementRejected(
                "service already advertised".to_owned(),
            ));
        }
        offers.insert(
            record.service_id,
            LocalOffer {
                attributes,
                channel_port,
                token,
            },
        );
        tracing::info!(service = %record.service_id, channel_port, "advertising");
        Ok(Box::new(LanListener {
            shared: self.shared.clone(),
            listener,
            service_id: record.service_id,
            token,
        }))
    }

    /// LAN peers all count as Bluetooth classic endpoints; any other filter
    /// finds nothing.
    async fn watch(&self, filter: &str) -> Result<DeviceWatcher, RadioError> {
        let (tx, rx) = mpsc::unbounded_channel();
        if filter != BLUETOOTH_CLASSIC_PROTOCOL_ID {
            tracing::debug!(filter, "no lan peers match discovery filter");
            let _ = tx.send(WatcherEvent::EnumerationCompleted);
            return Ok(DeviceWatcher::new(rx, None));
        }
        for device in lock(&self.shared.peers).snapshot() {
            let _ = tx.send(WatcherEvent::Added(device));
        }
        lock(&self.shared.watchers).push(tx.clone());
        let settle = self.shared.settings.beacon_interval;
        let task = tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            let _ = tx.send(WatcherEvent::EnumerationCompleted);
        });
        Ok(DeviceWatcher::new(rx, Some(task)))
    }

    async fn find_service(
        &self,
        device: &DeviceId,
        service_id: Uuid,
    ) -> Result<Option<RemoteService>, RadioError> {
        let (name, addr) = lock(&self.shared.peers)
            .peers
            .get(device)
            .map(|p| (p.name.clone(), p.addr))
            .ok_or_else(|| RadioError::DeviceNotFound(device.clone()))?;
        let query_id = rand::random::<u64>();
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(query_id, tx);
        let query = Message::ServiceQuery {
            protocol_version: PROTOCOL_VERSION,
            query_id,
            service_id,
        };
        self.shared.send(&query, addr).await;
        let answer = tokio::time::timeout(self.shared.settings.query_timeout, rx).await;
        lock(&self.shared.pending).remove(&query_id);
        let offer = match answer {
            Ok(Ok(offer)) => offer,
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(%device, "service query went unanswered");
                None
            }
        };
        Ok(offer
            .filter(|o| o.service_id == service_id)
            .map(|o| RemoteService {
                device_id: device.clone(),
                device_name: name,
                service_id,
                attributes: o.attributes,
                endpoint: SocketAddr::new(addr.ip(), o.channel_port).to_string(),
            }))
    }

    async fn open(&self, service: &RemoteService) -> Result<ChatStream, RadioError> {
        let addr: SocketAddr = service
            .endpoint
            .parse()
            .map_err(|_| RadioError::EndpointNotFound)?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (r, w) = stream.into_split();
        Ok(ChatStream::new(r, w, service.device_name.clone()))
    }
}

struct LanListener {
    shared: Arc<Shared>,
    listener: TcpListener,
    service_id: Uuid,
    token: u64,
}

#[async_trait]
impl ServiceListener for LanListener {
    async fn accept(&mut self) -> Result<ChatStream, RadioError> {
        let (stream, from) = self.listener.accept().await.map_err(RadioError::Io)?;
        stream.set_nodelay(true).map_err(RadioError::Io)?;
        let name = lock(&self.shared.peers)
            .name_for_ip(from)
            .unwrap_or_else(|| from.to_string());
        let (r, w) = stream.into_split();
        Ok(ChatStream::new(r, w, name))
    }
}

impl Drop for LanListener {
    fn drop(&mut self) {
        let mut offers = lock(&self.shared.offers);
        if offers
            .get(&self.service_id)
            .is_some_and(|o| o.token == self.token)
        {
            offers.remove(&self.service_id);
        }
    }
}
