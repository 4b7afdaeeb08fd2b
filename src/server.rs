use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, span, trace, warn, Level};
use uuid::Uuid;

use crate::config::EndpointConfig;
use crate::connection::{self, Connection, HandshakeHandler};
use crate::error::{CloseReason, SendError};
use crate::listener::{Listener, ListenerSet};
use crate::registry::ObjectRegistry;
use crate::wire::Frame;

/// Accepts connections, assigns their ids, runs the registration handshake,
/// demultiplexes the shared datagram socket, and answers discovery probes.
///
/// `start` binds the sockets and spawns the driver; `stop` shuts the driver
/// down and closes every connection.
pub struct Server {
    shared: Arc<ServerShared>,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

struct ServerShared {
    config: EndpointConfig,
    registry: Arc<ObjectRegistry>,
    listeners: Arc<ListenerSet>,
    connections: RwLock<FxHashMap<u32, Arc<Connection>>>,
    next_connection_id: AtomicU32,
    tcp_addr: OnceLock<SocketAddr>,
    udp_addr: OnceLock<SocketAddr>,
    udp_socket: OnceLock<Arc<UdpSocket>>,
}

/// A server never receives registration frames on the reliable channel -
/// it only sends them.
struct ServerHandshake;

impl HandshakeHandler for ServerHandshake {
    fn on_register_tcp(
        &self,
        _conn: &Arc<Connection>,
        _connection_id: u32,
    ) -> Result<(), CloseReason> {
        Err(CloseReason::Protocol(
            "unexpected RegisterTcp frame from client".to_string(),
        ))
    }

    fn is_registered(&self, conn: &Arc<Connection>) -> bool {
        conn.is_connected()
    }
}

impl Server {
    pub fn new(config: EndpointConfig, registry: ObjectRegistry) -> anyhow::Result<Server> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Server {
            shared: Arc::new(ServerShared {
                config,
                registry: Arc::new(registry),
                listeners: Arc::new(ListenerSet::new()),
                connections: RwLock::new(FxHashMap::default()),
                next_connection_id: AtomicU32::new(1),
                tcp_addr: OnceLock::new(),
                udp_addr: OnceLock::new(),
                udp_socket: OnceLock::new(),
            }),
            shutdown,
            driver: Mutex::new(None),
        })
    }

    /// Binds the listening socket (and the datagram socket, if a port is
    /// given) and spawns the driver.
    pub async fn start(&self, tcp_addr: SocketAddr, udp_port: Option<u16>) -> anyhow::Result<()> {
        if self.driver.lock().unwrap().is_some() {
            bail!("server is already started");
        }

        let listener = TcpListener::bind(tcp_addr).await?;
        let local_addr = listener.local_addr()?;
        let _ = self.shared.tcp_addr.set(local_addr);
        info!("listening for connections on {}", local_addr);

        let udp_socket = match udp_port {
            Some(port) => {
                let socket = UdpSocket::bind(SocketAddr::new(local_addr.ip(), port)).await?;
                let udp_addr = socket.local_addr()?;
                let _ = self.shared.udp_addr.set(udp_addr);
                info!("listening for datagrams on {}", udp_addr);
                let socket = Arc::new(socket);
                let _ = self.shared.udp_socket.set(socket.clone());
                Some(socket)
            }
            None => None,
        };

        let handle = tokio::spawn(run_driver(
            self.shared.clone(),
            listener,
            udp_socket,
            self.shutdown.subscribe(),
        ));
        *self.driver.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stops the driver and closes all connections. Each connection fires
    /// `disconnected` once.
    pub async fn stop(&self) {
        info!("stopping server");
        self.shutdown.send_replace(true);
        let driver = self.driver.lock().unwrap().take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
        let connections: Vec<_> = self
            .shared
            .connections
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for connection in connections {
            connection.close();
        }
    }

    /// Adds a listener observing every connection of this server.
    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.shared.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn Listener>) {
        self.shared.listeners.remove(listener);
    }

    /// Snapshot of the currently registered connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared
            .connections
            .read()
            .unwrap()
            .values()
            .filter(|c| c.is_connected())
            .cloned()
            .collect()
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.shared.tcp_addr.get().copied()
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.shared.udp_addr.get().copied()
    }

    pub fn send_to_all_tcp(&self, obj: &(dyn Any + Send + Sync)) {
        for connection in self.connections() {
            if let Err(e) = connection.send_tcp(obj) {
                warn!(connection = connection.id(), "broadcast send failed: {}", e);
            }
        }
    }

    pub fn send_to_all_except_tcp(&self, connection_id: u32, obj: &(dyn Any + Send + Sync)) {
        for connection in self.connections() {
            if connection.id() == connection_id {
                continue;
            }
            if let Err(e) = connection.send_tcp(obj) {
                warn!(connection = connection.id(), "broadcast send failed: {}", e);
            }
        }
    }

    pub fn send_to_tcp(
        &self,
        connection_id: u32,
        obj: &(dyn Any + Send + Sync),
    ) -> Result<usize, SendError> {
        match self.shared.connections.read().unwrap().get(&connection_id) {
            Some(connection) => connection.send_tcp(obj),
            None => Err(SendError::Closed),
        }
    }

    pub fn send_to_all_udp(&self, obj: &(dyn Any + Send + Sync)) {
        for connection in self.connections() {
            if let Err(e) = connection.send_udp(obj) {
                warn!(connection = connection.id(), "broadcast send failed: {}", e);
            }
        }
    }

    pub fn send_to_all_except_udp(&self, connection_id: u32, obj: &(dyn Any + Send + Sync)) {
        for connection in self.connections() {
            if connection.id() == connection_id {
                continue;
            }
            if let Err(e) = connection.send_udp(obj) {
                warn!(connection = connection.id(), "broadcast send failed: {}", e);
            }
        }
    }

    pub fn send_to_udp(
        &self,
        connection_id: u32,
        obj: &(dyn Any + Send + Sync),
    ) -> Result<usize, SendError> {
        match self.shared.connections.read().unwrap().get(&connection_id) {
            Some(connection) => connection.send_udp(obj),
            None => Err(SendError::Closed),
        }
    }
}

async fn run_driver(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    udp_socket: Option<Arc<UdpSocket>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut dgram_buf = vec![0u8; shared.config.datagram_buffer_size];
    loop {
        select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => accept_connection(&shared, stream, peer),
                Err(e) => warn!("accept failed: {}", e),
            },
            result = async {
                match udp_socket.as_ref() {
                    Some(socket) => socket.recv_from(&mut dgram_buf).await,
                    None => std::future::pending().await,
                }
            } => match result {
                Ok((len, from)) => shared.handle_datagram(&dgram_buf[..len], from),
                Err(e) => warn!("datagram receive failed: {}", e),
            },
            _ = shutdown.wait_for(|stopped| *stopped) => {
                debug!("server driver stopping");
                return;
            }
        }
    }
}

fn accept_connection(shared: &Arc<ServerShared>, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let connection_id = shared.next_connection_id.fetch_add(1, Ordering::Relaxed);
    let connection = Connection::new(
        &shared.config,
        shared.registry.clone(),
        shared.listeners.clone(),
        peer,
    );
    connection.set_id(connection_id);
    if let Some(socket) = shared.udp_socket.get() {
        connection.set_udp_socket(socket.clone());
    }

    let weak = Arc::downgrade(shared);
    connection.set_on_close(Box::new(move |_conn| {
        if let Some(shared) = weak.upgrade() {
            shared.connections.write().unwrap().remove(&connection_id);
        }
    }));
    shared
        .connections
        .write()
        .unwrap()
        .insert(connection_id, connection.clone());

    let (read_half, write_half) = stream.into_split();
    tokio::spawn(connection::run_writer(connection.clone(), write_half));

    info!(connection = connection_id, peer = %peer, "accepted connection");
    if let Err(e) = connection.send_frame(&Frame::RegisterTcp { connection_id }) {
        warn!(connection = connection_id, "sending RegisterTcp failed: {}", e);
        connection.close();
        return;
    }

    // writing RegisterTcp completes registration on this side; the datagram
    // peer binds later, whenever the client's RegisterUdp datagram arrives
    connection.mark_connected();
    connection.notify_connected();
    tokio::spawn(connection::run_reader(
        connection,
        read_half,
        Arc::new(ServerHandshake),
    ));
}

impl ServerShared {
    fn handle_datagram(&self, payload: &[u8], from: SocketAddr) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram", ?correlation_id);
        let _entered = span.enter();
        trace!("received datagram from {:?}: {} bytes", from, payload.len());

        let bound = self.connection_by_udp_peer(from);

        if bound.is_none() && payload == [self.config.discovery_magic].as_slice() {
            let response = (self.config.discovery_response)();
            debug!(
                "discovery probe from {:?}, responding with {} bytes",
                from,
                response.len()
            );
            if let Some(socket) = self.udp_socket.get() {
                if let Err(e) = socket.try_send_to(&response, from) {
                    debug!("discovery response not sent: {}", e);
                }
            }
            return;
        }

        if payload.is_empty() {
            if let Some(connection) = bound {
                connection.touch_recv();
            }
            return;
        }

        match Frame::deser(&self.registry, payload) {
            Ok(Frame::RegisterUdp { connection_id }) => {
                self.register_udp_peer(connection_id, from)
            }
            Ok(_) => match bound {
                Some(connection) => connection::dispatch_datagram(&connection, payload),
                None => debug!("datagram from unbound source {:?} - dropping", from),
            },
            Err(e) => debug!("undecodable datagram from {:?} - dropping: {}", from, e),
        }
    }

    /// The source address of the first valid RegisterUdp datagram binds the
    /// connection's datagram peer; later RegisterUdp datagrams from another
    /// source for the same id must not rebind it. There is no
    /// acknowledgment - the client repeats the frame a few times and the
    /// channel is lossy by contract.
    fn register_udp_peer(&self, connection_id: u32, from: SocketAddr) {
        let connection = self
            .connections
            .read()
            .unwrap()
            .get(&connection_id)
            .cloned();
        let Some(connection) = connection else {
            debug!("RegisterUdp for unknown connection {}", connection_id);
            return;
        };

        match connection.remote_addr_udp() {
            None => {
                connection.bind_udp_remote(from);
                connection.touch_recv();
                info!(connection = connection_id, peer = %from, "datagram peer bound");
            }
            Some(bound) if bound == from => {
                connection.touch_recv();
            }
            Some(bound) => {
                debug!(
                    "RegisterUdp for connection {} from {:?}, already bound to {:?} - ignoring",
                    connection_id, from, bound
                );
            }
        }
    }

    fn connection_by_udp_peer(&self, from: SocketAddr) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .unwrap()
            .values()
            .find(|c| c.remote_addr_udp() == Some(from))
            .cloned()
    }
}
