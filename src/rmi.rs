//! Remote method invocation: proxy objects whose calls are marshaled as
//! in-band [`InvokeMethod`](crate::wire::InvokeMethodMsg) messages and
//! correlated back by a 6-bit rolling response id.
//!
//! There is no runtime reflection: the serving side exposes objects through
//! an explicit method table ([`RmiTarget`]), and callers either use the
//! untyped [`RemoteObject`] handle directly or wrap it in a hand-written
//! typed proxy. Both peers must agree on the method indices, which they do
//! by construction when the table is written once per interface.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{RmiError, SendError};
use crate::registry::NetObject;
use crate::wire::{Frame, InvokeMethodMsg, InvokeOutcome, InvokeResultMsg};

pub(crate) const RESPONSE_ID_MASK: u8 = 0x3f;
pub(crate) const FLAG_RETURN_VALUE: u8 = 0x40;
pub(crate) const FLAG_TRANSMIT_EXCEPTIONS: u8 = 0x80;

/// What a completed invocation produced on the serving side: a value, no
/// value, or the remote error message.
pub(crate) type RemoteOutcome = Result<Option<NetObject>, String>;

/// Per-connection correlation state for outstanding invocations. Response
/// ids are 6 bits: 1..=63, with 0 reserved for "no response expected". Ids
/// are allocated from a rolling counter, skipping ids still outstanding, and
/// freed when the result is delivered or the call times out.
pub(crate) struct ResponseSlots {
    inner: Mutex<SlotsInner>,
}

struct SlotsInner {
    last_id: u8,
    outstanding: u64,
    waiters: FxHashMap<u8, oneshot::Sender<RemoteOutcome>>,
}

impl ResponseSlots {
    pub fn new() -> ResponseSlots {
        ResponseSlots {
            inner: Mutex::new(SlotsInner {
                last_id: 0,
                outstanding: 0,
                waiters: FxHashMap::default(),
            }),
        }
    }

    pub fn allocate(&self) -> Result<(u8, oneshot::Receiver<RemoteOutcome>), RmiError> {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..63 {
            inner.last_id = inner.last_id % 63 + 1;
            let bit = 1u64 << inner.last_id;
            if inner.outstanding & bit == 0 {
                inner.outstanding |= bit;
                let (tx, rx) = oneshot::channel();
                let id = inner.last_id;
                inner.waiters.insert(id, tx);
                return Ok((id, rx));
            }
        }
        Err(RmiError::Overload)
    }

    pub fn release(&self, id: u8) {
        let mut inner = self.inner.lock().unwrap();
        inner.outstanding &= !(1u64 << id);
        inner.waiters.remove(&id);
    }

    /// Delivers an outcome to the waiter for `id`, freeing the id. Returns
    /// false if the id is not outstanding.
    pub fn complete(&self, id: u8, outcome: RemoteOutcome) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.waiters.remove(&id) {
            Some(waiter) => {
                inner.outstanding &= !(1u64 << id);
                let _ = waiter.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drops all waiters, which unparks them with a disconnect error.
    pub fn fail_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.waiters.clear();
        inner.outstanding = 0;
    }
}

/// The serving side of one remotely invocable object: an explicit method
/// table. `invoke` runs off the connection's reader task; a returned `Err`
/// is propagated to callers that transmit exceptions.
pub trait RmiTarget: Send + Sync + 'static {
    fn invoke(&self, method_index: u8, args: &[NetObject]) -> Result<Option<NetObject>, String>;
}

/// A registry of invocable objects, owned by the endpoint that serves them.
/// Connections are attached explicitly; one endpoint may own several spaces
/// with distinct ids.
///
/// Invocations arriving on attached connections are executed by a worker in
/// arrival order per space, so a slow target method delays later invocations
/// on the same space but never the connection's reader.
pub struct ObjectSpace {
    self_ref: std::sync::Weak<ObjectSpace>,
    space_id: u16,
    objects: RwLock<FxHashMap<u32, Arc<dyn RmiTarget>>>,
    connections: Mutex<Vec<Arc<Connection>>>,
    invoke_tx: mpsc::UnboundedSender<(Arc<Connection>, InvokeMethodMsg)>,
}

impl ObjectSpace {
    pub fn new(space_id: u16) -> Arc<ObjectSpace> {
        let (invoke_tx, invoke_rx) = mpsc::unbounded_channel();
        let space = Arc::new_cyclic(|self_ref| ObjectSpace {
            self_ref: self_ref.clone(),
            space_id,
            objects: RwLock::new(FxHashMap::default()),
            connections: Mutex::new(Vec::new()),
            invoke_tx,
        });
        tokio::spawn(run_invocations(Arc::downgrade(&space), invoke_rx));
        space
    }

    pub fn space_id(&self) -> u16 {
        self.space_id
    }

    /// Exposes `target` under `object_id`, replacing any previous object
    /// with that id.
    pub fn register(&self, object_id: u32, target: Arc<dyn RmiTarget>) {
        self.objects.write().unwrap().insert(object_id, target);
    }

    pub fn remove(&self, object_id: u32) {
        self.objects.write().unwrap().remove(&object_id);
    }

    /// Makes this space reachable from the given connection's peer.
    pub fn add_connection(&self, connection: &Arc<Connection>) {
        connection.attach_object_space(self.space_id, self.self_ref.clone());
        self.connections.lock().unwrap().push(connection.clone());
        debug!(
            connection = connection.id(),
            space = self.space_id,
            "connection attached to object space"
        );
    }

    pub fn remove_connection(&self, connection: &Connection) {
        connection.detach_object_space(self.space_id);
        self.connections
            .lock()
            .unwrap()
            .retain(|c| !std::ptr::eq(c.as_ref(), connection));
    }

    pub(crate) fn enqueue(&self, connection: Arc<Connection>, msg: InvokeMethodMsg) {
        let _ = self.invoke_tx.send((connection, msg));
    }

    async fn process(&self, connection: Arc<Connection>, msg: InvokeMethodMsg) {
        let response_data = msg.response_data;
        let response_id = response_data & RESPONSE_ID_MASK;
        let target = self.objects.read().unwrap().get(&msg.object_id).cloned();

        let result: RemoteOutcome = match target {
            None => Err(format!(
                "no object {} in object space {}",
                msg.object_id, self.space_id
            )),
            Some(target) => {
                let method_index = msg.method_index;
                let args = msg.args;
                match tokio::task::spawn_blocking(move || target.invoke(method_index, &args)).await
                {
                    Ok(result) => result,
                    Err(e) => Err(format!("invocation panicked: {}", e)),
                }
            }
        };

        if response_id == 0 {
            if let Err(message) = &result {
                warn!(
                    connection = connection.id(),
                    space = self.space_id,
                    "invocation without response id failed: {}",
                    message
                );
            }
            return;
        }

        let transmit_value = response_data & FLAG_RETURN_VALUE != 0;
        let transmit_exceptions = response_data & FLAG_TRANSMIT_EXCEPTIONS != 0;
        let outcome = match result {
            Ok(Some(value)) if transmit_value => InvokeOutcome::Value(value),
            Ok(_) => InvokeOutcome::NoValue,
            Err(message) if transmit_exceptions => InvokeOutcome::Exception(message),
            Err(message) => {
                warn!(
                    connection = connection.id(),
                    space = self.space_id,
                    "invocation failed, caller does not transmit exceptions: {}",
                    message
                );
                InvokeOutcome::NoValue
            }
        };

        let send_result = connection.send_frame(&Frame::InvokeResult(InvokeResultMsg {
            response_data,
            outcome,
        }));
        match send_result {
            Ok(_) => {}
            Err(SendError::Serialization(e)) if transmit_exceptions => {
                // the return value's type is not registered on this side;
                // tell the caller instead of leaving it to time out
                let _ = connection.send_frame(&Frame::InvokeResult(InvokeResultMsg {
                    response_data,
                    outcome: InvokeOutcome::Exception(format!("result not serializable: {}", e)),
                }));
            }
            Err(e) => warn!(
                connection = connection.id(),
                "sending invocation result failed: {}",
                e
            ),
        }
    }
}

async fn run_invocations(
    space: std::sync::Weak<ObjectSpace>,
    mut invoke_rx: mpsc::UnboundedReceiver<(Arc<Connection>, InvokeMethodMsg)>,
) {
    while let Some((connection, msg)) = invoke_rx.recv().await {
        let Some(space) = space.upgrade() else {
            return;
        };
        space.process(connection, msg).await;
    }
}

/// Routes an inbound `InvokeMethod` to the object space it addresses.
pub(crate) fn handle_invoke(connection: &Arc<Connection>, msg: InvokeMethodMsg) {
    match connection.lookup_object_space(msg.object_space_id) {
        Some(space) => space.enqueue(connection.clone(), msg),
        None => {
            warn!(
                connection = connection.id(),
                "invocation for object space {} which is not attached to this connection",
                msg.object_space_id
            );
            let response_id = msg.response_data & RESPONSE_ID_MASK;
            if response_id == 0 {
                return;
            }
            let outcome = if msg.response_data & FLAG_TRANSMIT_EXCEPTIONS != 0 {
                InvokeOutcome::Exception(format!(
                    "no object space {} attached to this connection",
                    msg.object_space_id
                ))
            } else {
                InvokeOutcome::NoValue
            };
            let result = connection.send_frame(&Frame::InvokeResult(InvokeResultMsg {
                response_data: msg.response_data,
                outcome,
            }));
            if let Err(e) = result {
                warn!(
                    connection = connection.id(),
                    "sending invocation error result failed: {}",
                    e
                );
            }
        }
    }
}

#[derive(Clone)]
struct ProxyConfig {
    non_blocking: bool,
    transmit_return_value: bool,
    transmit_exceptions: bool,
    use_udp: bool,
    response_timeout: Duration,
    remember_last_response: bool,
}

impl Default for ProxyConfig {
    fn default() -> ProxyConfig {
        ProxyConfig {
            non_blocking: false,
            transmit_return_value: true,
            transmit_exceptions: true,
            use_udp: false,
            response_timeout: Duration::from_millis(3000),
            remember_last_response: false,
        }
    }
}

/// Client-side control handle for one remote object. Typed proxies wrap this
/// and translate method calls into [`RemoteObject::invoke`] with their
/// method-table index.
pub struct RemoteObject {
    connection: Arc<Connection>,
    object_space_id: u16,
    object_id: u32,
    config: Mutex<ProxyConfig>,
    pending: Mutex<Option<(u8, oneshot::Receiver<RemoteOutcome>)>>,
    last_response: Mutex<Option<RemoteOutcome>>,
}

impl RemoteObject {
    pub fn new(connection: Arc<Connection>, object_space_id: u16, object_id: u32) -> RemoteObject {
        RemoteObject {
            connection,
            object_space_id,
            object_id,
            config: Mutex::new(ProxyConfig::default()),
            pending: Mutex::new(None),
            last_response: Mutex::new(None),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Non-blocking invocations return `Ok(None)` immediately; retrieve the
    /// result later through [`RemoteObject::wait_for_last_response`].
    pub fn set_non_blocking(&self, non_blocking: bool) {
        self.config.lock().unwrap().non_blocking = non_blocking;
    }

    pub fn set_transmit_return_value(&self, transmit: bool) {
        self.config.lock().unwrap().transmit_return_value = transmit;
    }

    pub fn set_transmit_exceptions(&self, transmit: bool) {
        self.config.lock().unwrap().transmit_exceptions = transmit;
    }

    /// Sends invocations on the datagram channel. Such calls never expect a
    /// response: they may be lost, and the response id stays 0.
    pub fn set_use_udp(&self, use_udp: bool) {
        self.config.lock().unwrap().use_udp = use_udp;
    }

    pub fn set_response_timeout(&self, timeout: Duration) {
        self.config.lock().unwrap().response_timeout = timeout;
    }

    pub fn set_remember_last_response(&self, remember: bool) {
        self.config.lock().unwrap().remember_last_response = remember;
    }

    /// The last completed response, if `remember_last_response` is set.
    pub fn last_response(&self) -> Option<Result<Option<NetObject>, RmiError>> {
        self.last_response
            .lock()
            .unwrap()
            .clone()
            .map(|outcome| outcome.map_err(RmiError::Remote))
    }

    /// Invokes `method_index` with `args` on the remote object.
    ///
    /// Blocking mode (the default) parks until the result arrives, the
    /// response timeout elapses, or the connection closes. Non-blocking mode
    /// returns immediately after the send.
    pub async fn invoke(
        &self,
        method_index: u8,
        args: Vec<NetObject>,
    ) -> Result<Option<NetObject>, RmiError> {
        let config = self.config.lock().unwrap().clone();
        let needs_response = !config.use_udp
            && (config.transmit_return_value || config.transmit_exceptions || !config.non_blocking);

        let (response_id, receiver) = if needs_response {
            let (id, rx) = self.connection.response_slots.allocate()?;
            (id, Some(rx))
        } else {
            (0, None)
        };
        let mut response_data = response_id;
        if config.transmit_return_value {
            response_data |= FLAG_RETURN_VALUE;
        }
        if config.transmit_exceptions {
            response_data |= FLAG_TRANSMIT_EXCEPTIONS;
        }

        let frame = Frame::InvokeMethod(InvokeMethodMsg {
            object_space_id: self.object_space_id,
            object_id: self.object_id,
            method_index,
            response_data,
            args,
        });
        let send_result = if config.use_udp {
            self.connection.send_frame_udp(&frame)
        } else {
            self.connection.send_frame(&frame)
        };
        if let Err(e) = send_result {
            if response_id != 0 {
                self.connection.response_slots.release(response_id);
            }
            return Err(RmiError::Send(e));
        }

        let Some(receiver) = receiver else {
            return Ok(None);
        };
        if config.non_blocking {
            *self.pending.lock().unwrap() = Some((response_id, receiver));
            return Ok(None);
        }
        self.await_outcome(receiver, response_id, &config).await
    }

    /// Parks on the response of the most recent non-blocking invocation.
    pub async fn wait_for_last_response(&self) -> Result<Option<NetObject>, RmiError> {
        let pending = self.pending.lock().unwrap().take();
        let config = self.config.lock().unwrap().clone();
        match pending {
            Some((response_id, receiver)) => {
                self.await_outcome(receiver, response_id, &config).await
            }
            None => self.last_response().unwrap_or(Err(RmiError::Timeout)),
        }
    }

    async fn await_outcome(
        &self,
        receiver: oneshot::Receiver<RemoteOutcome>,
        response_id: u8,
        config: &ProxyConfig,
    ) -> Result<Option<NetObject>, RmiError> {
        match tokio::time::timeout(config.response_timeout, receiver).await {
            Err(_elapsed) => {
                if response_id != 0 {
                    self.connection.response_slots.release(response_id);
                }
                Err(RmiError::Timeout)
            }
            Ok(Err(_sender_dropped)) => Err(RmiError::Disconnected),
            Ok(Ok(outcome)) => {
                if config.remember_last_response {
                    *self.last_response.lock().unwrap() = Some(outcome.clone());
                }
                outcome.map_err(RmiError::Remote)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_allocate_rolls_and_skips_outstanding() {
        let slots = ResponseSlots::new();
        let (first, _rx1) = slots.allocate().unwrap();
        let (second, _rx2) = slots.allocate().unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        // freeing the first id does not hand it out again immediately - the
        // counter keeps rolling forward
        slots.release(first);
        let (third, _rx3) = slots.allocate().unwrap();
        assert_eq!(third, 3);
    }

    #[test]
    fn test_allocate_exhaustion_and_reuse() {
        let slots = ResponseSlots::new();
        let mut receivers = Vec::new();
        for expected in 1..=63u8 {
            let (id, rx) = slots.allocate().unwrap();
            assert_eq!(id, expected);
            receivers.push(rx);
        }
        assert!(matches!(slots.allocate(), Err(RmiError::Overload)));

        slots.release(17);
        let (id, _rx) = slots.allocate().unwrap();
        assert_eq!(id, 17);
    }

    #[test]
    fn test_wraparound_after_63() {
        let slots = ResponseSlots::new();
        for _ in 0..63 {
            let (id, _rx) = slots.allocate().unwrap();
            slots.release(id);
        }
        // counter wrapped: the next id is 1 again
        let (id, _rx) = slots.allocate().unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn test_complete_delivers_and_frees() {
        let slots = ResponseSlots::new();
        let (id, rx) = slots.allocate().unwrap();

        assert!(slots.complete(id, Ok(None)));
        assert!(rx.blocking_recv().unwrap().is_ok());

        // completing again reports an unknown id
        assert!(!slots.complete(id, Ok(None)));
    }

    #[test]
    fn test_fail_all_unparks_waiters() {
        let slots = ResponseSlots::new();
        let (_id, rx) = slots.allocate().unwrap();
        slots.fail_all();
        assert!(rx.blocking_recv().is_err());
    }
}
