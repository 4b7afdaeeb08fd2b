use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::config::EndpointConfig;
use crate::connection::{self, Connection, HandshakeHandler};
use crate::discovery::{self, DiscoveredHost};
use crate::error::{CloseReason, ConnectError};
use crate::listener::{Listener, ListenerSet};
use crate::registry::ObjectRegistry;
use crate::wire::Frame;

/// Opens one connection to a server and drives its I/O. `connect` suspends
/// the caller until registration completes or the timeout elapses; after a
/// successful return the connection is `Connected` and `connected` has fired
/// on this endpoint's listeners.
pub struct Client {
    config: EndpointConfig,
    registry: Arc<ObjectRegistry>,
    listeners: Arc<ListenerSet>,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl Client {
    pub fn new(config: EndpointConfig, registry: ObjectRegistry) -> anyhow::Result<Client> {
        config.validate()?;
        Ok(Client {
            config,
            registry: Arc::new(registry),
            listeners: Arc::new(ListenerSet::new()),
            connection: Mutex::new(None),
        })
    }

    /// Adds a listener observing this client's connection.
    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn Listener>) {
        self.listeners.remove(listener);
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().unwrap().clone()
    }

    /// Closes the client's connection, if any.
    pub fn stop(&self) {
        if let Some(connection) = self.connection.lock().unwrap().take() {
            connection.close();
        }
    }

    /// Connects to `host` and suspends until the server's RegisterTcp frame
    /// is observed - the sole success condition; [`ConnectError::Timeout`]
    /// is returned when it is not observed in time. With `udp_port` given,
    /// the local datagram channel is set up before the handshake and a
    /// handful of RegisterUdp datagrams is sent afterwards so the server can
    /// bind this endpoint as the connection's datagram peer; that binding
    /// completes asynchronously and does not gate `connect`.
    pub async fn connect(
        &self,
        timeout: Duration,
        host: IpAddr,
        tcp_port: u16,
        udp_port: Option<u16>,
    ) -> Result<Arc<Connection>, ConnectError> {
        match tokio::time::timeout(timeout, self.establish(host, tcp_port, udp_port)).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => {
                self.stop();
                Err(e)
            }
            Err(_elapsed) => {
                self.stop();
                Err(ConnectError::Timeout)
            }
        }
    }

    async fn establish(
        &self,
        host: IpAddr,
        tcp_port: u16,
        udp_port: Option<u16>,
    ) -> Result<Arc<Connection>, ConnectError> {
        let stream = TcpStream::connect((host, tcp_port)).await?;
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr()?;

        let connection = Connection::new(
            &self.config,
            self.registry.clone(),
            self.listeners.clone(),
            peer,
        );
        *self.connection.lock().unwrap() = Some(connection.clone());

        if let Some(udp_port) = udp_port {
            let bind_addr: SocketAddr = match host {
                IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
            };
            let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
            let server_udp = SocketAddr::new(host, udp_port);
            connection.set_udp_socket(socket.clone());
            connection.bind_udp_remote(server_udp);
            tokio::spawn(run_udp_reader(connection.clone(), socket, server_udp));
        }

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(connection::run_writer(connection.clone(), write_half));
        let handshake = Arc::new(ClientHandshake::new());
        tokio::spawn(connection::run_reader(
            connection.clone(),
            read_half,
            handshake.clone(),
        ));
        debug!(peer = %peer, "connecting");

        let mut conn_closed = connection.subscribe_shutdown();
        let mut tcp_registered = handshake.tcp_registered.subscribe();
        select! {
            result = tcp_registered.wait_for(|registered| *registered) => {
                result.map_err(|_| ConnectError::Closed)?;
            }
            _ = conn_closed.wait_for(|closed| *closed) => {
                return Err(ConnectError::Closed);
            }
        }

        if udp_port.is_some() {
            tokio::spawn(register_datagram_peer(connection.clone()));
        }

        info!(connection = connection.id(), peer = %peer, "connected");
        Ok(connection)
    }

    /// Broadcasts a discovery probe and returns the first responding
    /// server's address, or `None` if nothing answered within the timeout.
    pub async fn discover_host(
        &self,
        udp_port: u16,
        timeout: Duration,
    ) -> anyhow::Result<Option<SocketAddr>> {
        discovery::discover_host(self.config.discovery_magic, udp_port, timeout).await
    }

    /// Broadcasts a discovery probe and collects all responders seen within
    /// the timeout, with their opaque response payloads.
    pub async fn discover_hosts(
        &self,
        udp_port: u16,
        timeout: Duration,
    ) -> anyhow::Result<Vec<DiscoveredHost>> {
        discovery::discover_hosts(self.config.discovery_magic, udp_port, timeout).await
    }
}

/// How often and how many times RegisterUdp is repeated. The datagram
/// channel is lossy and there is no acknowledgment, so the frame is simply
/// sent a few times; one arrival is enough to bind the peer.
const REGISTER_UDP_ATTEMPTS: usize = 8;
const REGISTER_UDP_INTERVAL: Duration = Duration::from_millis(100);

/// Announces this endpoint's datagram source address to the server. Runs in
/// the background after `connect` has already succeeded.
async fn register_datagram_peer(connection: Arc<Connection>) {
    let mut shutdown = connection.subscribe_shutdown();
    for _ in 0..REGISTER_UDP_ATTEMPTS {
        let register = Frame::RegisterUdp {
            connection_id: connection.id(),
        };
        if let Err(e) = connection.send_frame_udp(&register) {
            debug!("RegisterUdp not sent: {}", e);
        }
        select! {
            _ = tokio::time::sleep(REGISTER_UDP_INTERVAL) => {}
            _ = shutdown.wait_for(|closed| *closed) => return,
        }
    }
}

/// Client side of the registration handshake: observing RegisterTcp stores
/// the assigned id and completes the connection. `connected` is dispatched
/// from the reader task the moment that happens, which keeps it ordered
/// before any subsequently received frame.
struct ClientHandshake {
    tcp_registered: watch::Sender<bool>,
    completed: AtomicBool,
}

impl ClientHandshake {
    fn new() -> ClientHandshake {
        let (tcp_registered, _) = watch::channel(false);
        ClientHandshake {
            tcp_registered,
            completed: AtomicBool::new(false),
        }
    }
}

impl HandshakeHandler for ClientHandshake {
    fn on_register_tcp(
        &self,
        conn: &Arc<Connection>,
        connection_id: u32,
    ) -> Result<(), CloseReason> {
        if connection_id == 0 {
            return Err(CloseReason::Protocol(
                "server assigned connection id 0".to_string(),
            ));
        }
        conn.set_id(connection_id);
        debug!(connection = connection_id, "registered with server");
        if !self.completed.swap(true, Ordering::SeqCst) {
            conn.mark_connected();
            conn.notify_connected();
        }
        self.tcp_registered.send_replace(true);
        Ok(())
    }

    fn is_registered(&self, _conn: &Arc<Connection>) -> bool {
        *self.tcp_registered.borrow()
    }
}

async fn run_udp_reader(
    connection: Arc<Connection>,
    socket: Arc<UdpSocket>,
    expected_peer: SocketAddr,
) {
    let mut shutdown = connection.subscribe_shutdown();
    let mut buf = vec![0u8; connection.datagram_buffer_size];
    loop {
        select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, from)) => {
                    if from != expected_peer {
                        trace!("dropping datagram from unexpected source {:?}", from);
                        continue;
                    }
                    connection::dispatch_datagram(&connection, &buf[..len]);
                }
                Err(e) => warn!("datagram receive failed: {}", e),
            },
            _ = shutdown.wait_for(|closed| *closed) => {
                return;
            }
        }
    }
}
