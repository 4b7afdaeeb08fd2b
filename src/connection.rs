use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Instant;

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{watch, Notify};
use tracing::{debug, trace, warn};

use crate::buffers::{ReadBuffer, WriteBuffer};
use crate::config::EndpointConfig;
use crate::error::{CloseReason, SendError};
use crate::listener::{Listener, ListenerSet};
use crate::registry::{NetObject, ObjectRegistry};
use crate::rmi::{self, ObjectSpace, ResponseSlots};
use crate::wire::{self, Frame, InvokeOutcome, InvokeResultMsg};

const STATE_CONNECTING: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Both halves of a peering: the reliable channel plus the optionally bound
/// datagram channel, the identity assigned during registration, the listener
/// set, and idle/keep-alive accounting.
///
/// Lifecycle is `Connecting -> Connected -> Closed` with no revival. Send
/// calls are safe from any thread; the read buffer is owned exclusively by
/// the connection's reader task.
pub struct Connection {
    self_ref: Weak<Connection>,
    id: AtomicU32,
    state: AtomicU8,
    tcp_remote: SocketAddr,
    udp_socket: OnceLock<Arc<UdpSocket>>,
    udp_remote: Mutex<Option<SocketAddr>>,

    pub(crate) registry: Arc<ObjectRegistry>,
    endpoint_listeners: Arc<ListenerSet>,
    listeners: ListenerSet,

    write: Mutex<WriteBuffer>,
    write_ready: Notify,
    shutdown: watch::Sender<bool>,

    epoch: Instant,
    last_recv_millis: AtomicU64,
    last_send_millis: AtomicU64,
    timeout_millis: AtomicU64,
    keep_alive_millis: AtomicU64,
    idle_threshold_bits: AtomicU32,

    pub(crate) object_buffer_size: usize,
    pub(crate) datagram_buffer_size: usize,

    disconnect_fired: AtomicBool,
    on_close: OnceLock<Box<dyn Fn(&Connection) + Send + Sync>>,

    pub(crate) response_slots: ResponseSlots,
    object_spaces: RwLock<FxHashMap<u16, Weak<ObjectSpace>>>,
}

impl Connection {
    pub(crate) fn new(
        config: &EndpointConfig,
        registry: Arc<ObjectRegistry>,
        endpoint_listeners: Arc<ListenerSet>,
        tcp_remote: SocketAddr,
    ) -> Arc<Connection> {
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|self_ref| Connection {
            self_ref: self_ref.clone(),
            id: AtomicU32::new(0),
            state: AtomicU8::new(STATE_CONNECTING),
            tcp_remote,
            udp_socket: OnceLock::new(),
            udp_remote: Mutex::new(None),
            registry,
            endpoint_listeners,
            listeners: ListenerSet::new(),
            write: Mutex::new(WriteBuffer::new(config.write_buffer_size)),
            write_ready: Notify::new(),
            shutdown,
            epoch: Instant::now(),
            last_recv_millis: AtomicU64::new(0),
            last_send_millis: AtomicU64::new(0),
            timeout_millis: AtomicU64::new(
                config.receive_timeout.map(|d| d.as_millis() as u64).unwrap_or(0),
            ),
            keep_alive_millis: AtomicU64::new(
                config.keep_alive.map(|d| d.as_millis() as u64).unwrap_or(0),
            ),
            idle_threshold_bits: AtomicU32::new(config.idle_threshold.to_bits()),
            object_buffer_size: config.object_buffer_size,
            datagram_buffer_size: config.datagram_buffer_size,
            disconnect_fired: AtomicBool::new(false),
            on_close: OnceLock::new(),
            response_slots: ResponseSlots::new(),
            object_spaces: RwLock::new(FxHashMap::default()),
        })
    }

    fn arc(&self) -> Arc<Connection> {
        self.self_ref
            .upgrade()
            .expect("connection is referenced by the caller")
    }

    /// The id assigned by the server during registration. Nonzero exactly
    /// while the connection is in the `Connected` state.
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CONNECTED
    }

    fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    pub fn remote_addr_tcp(&self) -> SocketAddr {
        self.tcp_remote
    }

    /// The bound datagram peer, once registration has bound one.
    pub fn remote_addr_udp(&self) -> Option<SocketAddr> {
        *self.udp_remote.lock().unwrap()
    }

    /// Serializes `obj`, frames it, and queues it on the reliable channel.
    /// Returns the framed byte count. The whole frame is committed or the
    /// call fails; a failure never closes the connection.
    pub fn send_tcp(&self, obj: &(dyn Any + Send + Sync)) -> Result<usize, SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        let mut staging = BytesMut::new();
        self.registry.write_class_and_object(&mut staging, obj)?;
        self.queue_payload(&staging)
    }

    /// Serializes `obj` and sends it as a single datagram. Never blocks; a
    /// transient send failure is returned as `DatagramUnsent` and the
    /// datagram is not retried.
    pub fn send_udp(&self, obj: &(dyn Any + Send + Sync)) -> Result<usize, SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        let mut staging = BytesMut::new();
        self.registry.write_class_and_object(&mut staging, obj)?;
        self.send_datagram(&staging)
    }

    pub(crate) fn send_frame(&self, frame: &Frame) -> Result<usize, SendError> {
        let mut staging = BytesMut::new();
        frame.ser(&self.registry, &mut staging)?;
        self.queue_payload(&staging)
    }

    pub(crate) fn send_frame_udp(&self, frame: &Frame) -> Result<usize, SendError> {
        let mut staging = BytesMut::new();
        frame.ser(&self.registry, &mut staging)?;
        self.send_datagram(&staging)
    }

    fn queue_payload(&self, payload: &[u8]) -> Result<usize, SendError> {
        if payload.len() > self.object_buffer_size {
            return Err(SendError::BufferOverflow {
                frame_len: payload.len(),
                free: self.object_buffer_size,
            });
        }
        let committed = {
            let mut write = self.write.lock().unwrap();
            write
                .push_frame(payload)
                .map_err(|free| SendError::BufferOverflow {
                    frame_len: payload.len() + wire::MAX_LENGTH_PREFIX,
                    free,
                })?
        };
        self.touch_send();
        self.write_ready.notify_one();
        Ok(committed)
    }

    fn send_datagram(&self, payload: &[u8]) -> Result<usize, SendError> {
        let socket = self.udp_socket.get().ok_or(SendError::NoDatagramChannel)?;
        let remote = self
            .udp_remote
            .lock()
            .unwrap()
            .ok_or(SendError::NoDatagramChannel)?;
        if payload.len() > self.datagram_buffer_size {
            return Err(SendError::BufferOverflow {
                frame_len: payload.len(),
                free: self.datagram_buffer_size,
            });
        }
        match socket.try_send_to(payload, remote) {
            Ok(sent) => {
                self.touch_send();
                Ok(sent)
            }
            Err(e) => Err(SendError::DatagramUnsent(e)),
        }
    }

    /// Orderly close: pending frames are flushed, the reliable channel is
    /// half-closed, then the socket is dropped. Idempotent; `disconnected`
    /// fires exactly once no matter how often close is called or whether the
    /// reader observed a failure first.
    pub fn close(&self) {
        self.close_internal(CloseReason::Graceful);
    }

    pub(crate) fn close_internal(&self, reason: CloseReason) {
        if self.disconnect_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        match &reason {
            CloseReason::Graceful => debug!(connection = self.id(), "closing: {}", reason),
            _ => warn!(connection = self.id(), "closing: {}", reason),
        }
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.shutdown.send_replace(true);
        self.write_ready.notify_one();

        self.response_slots.fail_all();
        let spaces: Vec<_> = self.object_spaces.write().unwrap().drain().collect();
        for (_, space) in spaces {
            if let Some(space) = space.upgrade() {
                space.remove_connection(self);
            }
        }

        if let Some(on_close) = self.on_close.get() {
            on_close(self);
        }
        self.notify_disconnected();
        self.id.store(0, Ordering::Release);
    }

    /// Sets the write-buffer free fraction above which `idle` fires after a
    /// drain pass.
    pub fn set_idle_threshold(&self, threshold: f32) {
        self.idle_threshold_bits
            .store(threshold.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Closes the connection if nothing is received for `timeout`. `None`
    /// disables the check.
    pub fn set_timeout(&self, timeout: Option<std::time::Duration>) {
        self.timeout_millis.store(
            timeout.map(|d| d.as_millis() as u64).unwrap_or(0),
            Ordering::Relaxed,
        );
    }

    /// Queues an empty keep-alive frame whenever nothing has been sent for
    /// `interval`. `None` disables keep-alives.
    pub fn set_keep_alive(&self, interval: Option<std::time::Duration>) {
        self.keep_alive_millis.store(
            interval.map(|d| d.as_millis() as u64).unwrap_or(0),
            Ordering::Relaxed,
        );
    }

    /// Adds a listener for this connection only. Takes effect on the next
    /// dispatch cycle.
    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn Listener>) {
        self.listeners.remove(listener);
    }

    pub(crate) fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Release);
    }

    pub(crate) fn mark_connected(&self) {
        self.state.store(STATE_CONNECTED, Ordering::Release);
    }

    pub(crate) fn set_udp_socket(&self, socket: Arc<UdpSocket>) {
        let _ = self.udp_socket.set(socket);
    }

    pub(crate) fn bind_udp_remote(&self, remote: SocketAddr) {
        *self.udp_remote.lock().unwrap() = Some(remote);
    }

    pub(crate) fn set_on_close(&self, on_close: Box<dyn Fn(&Connection) + Send + Sync>) {
        let _ = self.on_close.set(on_close);
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn attach_object_space(&self, space_id: u16, space: Weak<ObjectSpace>) {
        self.object_spaces.write().unwrap().insert(space_id, space);
    }

    pub(crate) fn detach_object_space(&self, space_id: u16) {
        self.object_spaces.write().unwrap().remove(&space_id);
    }

    pub(crate) fn lookup_object_space(&self, space_id: u16) -> Option<Arc<ObjectSpace>> {
        self.object_spaces
            .read()
            .unwrap()
            .get(&space_id)
            .and_then(Weak::upgrade)
    }

    /// Delivers an invocation result to the waiter parked on its response
    /// id. A missing waiter means the call timed out or was issued without
    /// expecting a response.
    pub(crate) fn rmi_complete(&self, msg: InvokeResultMsg) {
        let response_id = msg.response_data & rmi::RESPONSE_ID_MASK;
        if response_id == 0 {
            return;
        }
        let outcome = match msg.outcome {
            InvokeOutcome::NoValue => Ok(None),
            InvokeOutcome::Value(value) => Ok(Some(value)),
            InvokeOutcome::Exception(message) => Err(message),
        };
        if !self.response_slots.complete(response_id, outcome) {
            trace!(
                connection = self.id(),
                "no waiter for response id {}",
                response_id
            );
        }
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn touch_recv(&self) {
        self.last_recv_millis.store(self.now_millis(), Ordering::Relaxed);
    }

    fn touch_send(&self) {
        self.last_send_millis.store(self.now_millis(), Ordering::Relaxed);
    }

    /// Keep-alive and receive-timeout duties of the update loop. Returns
    /// true if the connection was closed by the timeout check.
    fn check_timers(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let now = self.now_millis();

        let keep_alive = self.keep_alive_millis.load(Ordering::Relaxed);
        if keep_alive > 0
            && now.saturating_sub(self.last_send_millis.load(Ordering::Relaxed)) >= keep_alive
        {
            trace!(connection = self.id(), "sending keep-alive");
            if let Err(e) = self.queue_payload(&[]) {
                trace!(connection = self.id(), "keep-alive not queued: {}", e);
            }
        }

        let timeout = self.timeout_millis.load(Ordering::Relaxed);
        if timeout > 0
            && now.saturating_sub(self.last_recv_millis.load(Ordering::Relaxed)) >= timeout
        {
            self.close_internal(CloseReason::Timeout);
            return true;
        }
        false
    }

    fn idle_threshold(&self) -> f32 {
        f32::from_bits(self.idle_threshold_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn notify_connected(&self) {
        let conn = self.arc();
        for listener in self.dispatch_snapshot() {
            listener.connected(&conn);
        }
    }

    fn notify_disconnected(&self) {
        let conn = self.arc();
        for listener in self.dispatch_snapshot() {
            listener.disconnected(&conn);
        }
    }

    pub(crate) fn notify_received(&self, object: &NetObject) {
        trace!(
            connection = self.id(),
            "received {}",
            self.registry.type_name_of(object)
        );
        let conn = self.arc();
        for listener in self.dispatch_snapshot() {
            listener.received(&conn, object);
        }
    }

    fn notify_idle(&self) {
        let conn = self.arc();
        for listener in self.dispatch_snapshot() {
            listener.idle(&conn);
        }
    }

    fn dispatch_snapshot(&self) -> Vec<Arc<dyn Listener>> {
        let endpoint = self.endpoint_listeners.snapshot();
        let own = self.listeners.snapshot();
        endpoint.iter().chain(own.iter()).cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn stub() -> Arc<Connection> {
        Self::stub_with_config(&EndpointConfig::default())
    }

    #[cfg(test)]
    pub(crate) fn stub_with_config(config: &EndpointConfig) -> Arc<Connection> {
        Connection::new(
            config,
            Arc::new(ObjectRegistry::new()),
            Arc::new(ListenerSet::new()),
            "127.0.0.1:0".parse().unwrap(),
        )
    }
}

/// Role-specific handling of registration frames arriving on the reliable
/// channel; the client and server sides of the handshake implement this.
/// RegisterUdp travels exclusively client-to-server as a datagram, so it is
/// handled by the server's datagram demux and never by this trait.
pub(crate) trait HandshakeHandler: Send + Sync + 'static {
    fn on_register_tcp(&self, conn: &Arc<Connection>, connection_id: u32)
        -> Result<(), CloseReason>;
    fn is_registered(&self, conn: &Arc<Connection>) -> bool;
}

/// Reader task: accumulates bytes, dispatches whole frames in arrival order,
/// and runs the timer checks. All listener callbacks for inbound traffic on
/// this connection happen here.
pub(crate) async fn run_reader(
    conn: Arc<Connection>,
    mut socket: OwnedReadHalf,
    handshake: Arc<dyn HandshakeHandler>,
) {
    let mut shutdown = conn.subscribe_shutdown();
    let mut read_buf = ReadBuffer::new(conn.object_buffer_size);
    let mut timers = tokio::time::interval(std::time::Duration::from_millis(100));
    conn.touch_recv();

    loop {
        select! {
            result = socket.read(read_buf.unfilled_mut()) => match result {
                Ok(0) => {
                    conn.close_internal(CloseReason::PeerClosed);
                    return;
                }
                Ok(n) => {
                    read_buf.advance(n);
                    conn.touch_recv();
                    if let Err(reason) = process_frames(&conn, &mut read_buf, handshake.as_ref()) {
                        conn.close_internal(reason);
                        return;
                    }
                }
                Err(e) => {
                    conn.close_internal(CloseReason::Io(e));
                    return;
                }
            },
            _ = timers.tick() => {
                if conn.check_timers() {
                    return;
                }
            }
            _ = shutdown.wait_for(|closed| *closed) => {
                return;
            }
        }
    }
}

fn process_frames(
    conn: &Arc<Connection>,
    read_buf: &mut ReadBuffer,
    handshake: &dyn HandshakeHandler,
) -> Result<(), CloseReason> {
    loop {
        let (prefix_len, payload_len) = match wire::try_parse_length_prefix(read_buf.filled())
            .map_err(|e| CloseReason::Protocol(e.to_string()))?
        {
            Some(parsed) => parsed,
            None => break,
        };
        if payload_len > conn.object_buffer_size {
            return Err(CloseReason::FrameTooLarge {
                frame_len: payload_len,
                max: conn.object_buffer_size,
            });
        }
        if read_buf.filled().len() < prefix_len + payload_len {
            break;
        }

        if payload_len == 0 {
            trace!(connection = conn.id(), "received keep-alive");
            read_buf.consume(prefix_len);
            continue;
        }

        let frame = Frame::deser(&conn.registry, &read_buf.filled()[prefix_len..prefix_len + payload_len]);
        read_buf.consume(prefix_len + payload_len);
        match frame {
            Ok(frame) => handle_frame(conn, frame, handshake)?,
            Err(e) => {
                // decode failures are not fatal: the framing is intact, so
                // skipping the frame keeps the stream consistent
                warn!(connection = conn.id(), "discarding frame: {}", e);
            }
        }
    }
    read_buf.compact();
    Ok(())
}

fn handle_frame(
    conn: &Arc<Connection>,
    frame: Frame,
    handshake: &dyn HandshakeHandler,
) -> Result<(), CloseReason> {
    match frame {
        Frame::RegisterTcp { connection_id } => handshake.on_register_tcp(conn, connection_id),
        Frame::RegisterUdp { .. } => Err(CloseReason::Protocol(
            "RegisterUdp frame on the reliable channel".to_string(),
        )),
        Frame::App(object) => {
            if !handshake.is_registered(conn) {
                return Err(CloseReason::Protocol(
                    "application frame before registration".to_string(),
                ));
            }
            conn.notify_received(&object);
            Ok(())
        }
        Frame::InvokeMethod(msg) => {
            if !handshake.is_registered(conn) {
                return Err(CloseReason::Protocol(
                    "invocation frame before registration".to_string(),
                ));
            }
            rmi::handle_invoke(conn, msg);
            Ok(())
        }
        Frame::InvokeResult(msg) => {
            conn.rmi_complete(msg);
            Ok(())
        }
    }
}

/// Writer task: drains the write buffer whenever there is something to
/// write, fires `idle` when a drain leaves the buffer mostly free, and
/// half-closes the stream on shutdown after a final flush.
pub(crate) async fn run_writer(conn: Arc<Connection>, mut socket: OwnedWriteHalf) {
    let mut shutdown = conn.subscribe_shutdown();
    loop {
        let pending = conn.write.lock().unwrap().take_pending();
        if let Some(pending) = pending {
            if let Err(e) = socket.write_all(&pending).await {
                conn.close_internal(CloseReason::Io(e));
                return;
            }
            let free_ratio = conn.write.lock().unwrap().free_ratio();
            if free_ratio > conn.idle_threshold() {
                conn.notify_idle();
            }
        } else {
            select! {
                _ = conn.write_ready.notified() => {}
                _ = async { shutdown.wait_for(|closed| *closed).await.map(|r| *r) } => {
                    let pending = conn.write.lock().unwrap().take_pending();
                    if let Some(pending) = pending {
                        let _ = socket.write_all(&pending).await;
                    }
                    let _ = socket.shutdown().await;
                    return;
                }
            }
        }
    }
}

/// Handles one inbound datagram for an already-bound connection: decode,
/// then dispatch like a reliable frame. Datagrams that arrive before the
/// connection is up are dropped - the channel is lossy by contract.
pub(crate) fn dispatch_datagram(conn: &Arc<Connection>, payload: &[u8]) {
    conn.touch_recv();
    if payload.is_empty() {
        return;
    }
    if !conn.is_connected() {
        trace!("dropping datagram received before registration completed");
        return;
    }
    match Frame::deser(&conn.registry, payload) {
        Ok(Frame::App(object)) => conn.notify_received(&object),
        Ok(Frame::InvokeMethod(msg)) => rmi::handle_invoke(conn, msg),
        Ok(Frame::InvokeResult(msg)) => conn.rmi_complete(msg),
        Ok(frame) => trace!(connection = conn.id(), "ignoring datagram frame {:?}", frame),
        Err(e) => warn!(connection = conn.id(), "discarding datagram: {}", e),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingListener {
        disconnected: AtomicUsize,
    }
    impl CountingListener {
        fn new() -> Arc<CountingListener> {
            Arc::new(CountingListener {
                disconnected: AtomicUsize::new(0),
            })
        }
    }
    impl Listener for CountingListener {
        fn disconnected(&self, _connection: &Arc<Connection>) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_send_tcp_buffer_overflow_leaves_connection_open() {
        let config = EndpointConfig {
            object_buffer_size: 64,
            ..EndpointConfig::default()
        };
        let conn = Connection::stub_with_config(&config);
        conn.mark_connected();

        let oversize = "x".repeat(100);
        let result = conn.send_tcp(&oversize);
        assert!(matches!(result, Err(SendError::BufferOverflow { .. })));
        assert!(conn.is_connected());

        let small = "y".repeat(10);
        assert!(conn.send_tcp(&small).is_ok());
    }

    #[test]
    fn test_send_udp_without_channel() {
        let conn = Connection::stub();
        conn.mark_connected();
        assert!(matches!(
            conn.send_udp(&1i32),
            Err(SendError::NoDatagramChannel)
        ));
    }

    #[test]
    fn test_close_is_idempotent_and_fires_disconnected_once() {
        let conn = Connection::stub();
        let listener = CountingListener::new();
        conn.add_listener(listener.clone());
        conn.set_id(3);
        conn.mark_connected();

        conn.close();
        conn.close();
        conn.close_internal(CloseReason::PeerClosed);

        assert_eq!(listener.disconnected.load(Ordering::SeqCst), 1);
        assert!(!conn.is_connected());
        assert_eq!(conn.id(), 0);
        assert!(matches!(conn.send_tcp(&1i32), Err(SendError::Closed)));
    }

    #[test]
    fn test_send_after_close_fails() {
        let conn = Connection::stub();
        conn.mark_connected();
        conn.close();
        assert!(matches!(conn.send_tcp(&5i32), Err(SendError::Closed)));
        assert!(matches!(conn.send_udp(&5i32), Err(SendError::Closed)));
    }
}
