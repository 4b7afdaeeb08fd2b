//! Listener callbacks and the wrappers that move dispatch off the
//! connection's reader task.
//!
//! Dispatch ordering guarantee, for every wrapper in this module: per
//! connection, `connected` strictly precedes any `received`, which strictly
//! precedes `disconnected`.

use std::any::{Any, TypeId};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::registry::NetObject;

/// Callbacks for connection events. All methods default to no-ops.
///
/// `connected`, `received` and `idle` run on the connection's reader or
/// writer task: they must not block for long, or other traffic on the
/// connection will stall. `disconnected` may run on any task. Wrap a listener
/// in [`ThreadedListener`] to move processing off the I/O tasks.
pub trait Listener: Send + Sync + 'static {
    fn connected(&self, _connection: &Arc<Connection>) {}
    fn disconnected(&self, _connection: &Arc<Connection>) {}
    fn received(&self, _connection: &Arc<Connection>, _object: &NetObject) {}
    fn idle(&self, _connection: &Arc<Connection>) {}
}

/// Ordered listener collection with snapshot iteration: mutations replace
/// the collection, dispatch iterates the snapshot taken when it starts.
pub(crate) struct ListenerSet {
    listeners: RwLock<Arc<Vec<Arc<dyn Listener>>>>,
}

impl ListenerSet {
    pub fn new() -> ListenerSet {
        ListenerSet {
            listeners: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn add(&self, listener: Arc<dyn Listener>) {
        let mut guard = self.listeners.write().unwrap();
        let mut next = (**guard).clone();
        next.push(listener);
        *guard = Arc::new(next);
    }

    pub fn remove(&self, listener: &Arc<dyn Listener>) {
        let mut guard = self.listeners.write().unwrap();
        let mut next = (**guard).clone();
        next.retain(|l| !Arc::ptr_eq(l, listener));
        *guard = Arc::new(next);
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn Listener>>> {
        self.listeners.read().unwrap().clone()
    }
}

/// One captured callback, for wrappers that defer dispatch.
pub enum ListenerEvent {
    Connected(Arc<Connection>),
    Disconnected(Arc<Connection>),
    Received(Arc<Connection>, NetObject),
    Idle(Arc<Connection>),
}

impl ListenerEvent {
    pub fn dispatch(self, target: &dyn Listener) {
        match self {
            ListenerEvent::Connected(c) => target.connected(&c),
            ListenerEvent::Disconnected(c) => target.disconnected(&c),
            ListenerEvent::Received(c, obj) => target.received(&c, &obj),
            ListenerEvent::Idle(c) => target.idle(&c),
        }
    }
}

/// Routes `received` objects to one handler per concrete message type.
/// Objects without a matching handler are silently dropped. Registering a
/// type twice replaces the previous handler.
pub struct TypeListener {
    handlers: RwLock<Arc<FxHashMap<TypeId, Arc<TypeHandler>>>>,
}

type TypeHandler = dyn Fn(&Arc<Connection>, &NetObject) + Send + Sync;

impl TypeListener {
    pub fn new() -> TypeListener {
        TypeListener {
            handlers: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    pub fn add_type_handler<T, F>(&self, handler: F)
    where
        T: Any + Send + Sync,
        F: Fn(&Arc<Connection>, &T) + Send + Sync + 'static,
    {
        let erased: Arc<TypeHandler> = Arc::new(move |connection, object| {
            if let Some(typed) = object.downcast_ref::<T>() {
                handler(connection, typed);
            }
        });
        self.mutate(|map| {
            map.insert(TypeId::of::<T>(), erased);
        });
    }

    pub fn remove_type_handler<T: Any>(&self) {
        self.mutate(|map| {
            map.remove(&TypeId::of::<T>());
        });
    }

    pub fn size(&self) -> usize {
        self.handlers.read().unwrap().len()
    }

    pub fn clear(&self) {
        self.mutate(|map| map.clear());
    }

    fn mutate(&self, f: impl FnOnce(&mut FxHashMap<TypeId, Arc<TypeHandler>>)) {
        let mut guard = self.handlers.write().unwrap();
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }
}

impl Default for TypeListener {
    fn default() -> Self {
        Self::new()
    }
}

impl Listener for TypeListener {
    fn received(&self, connection: &Arc<Connection>, object: &NetObject) {
        let snapshot = self.handlers.read().unwrap().clone();
        if let Some(handler) = snapshot.get(&(**object).type_id()) {
            handler(connection, object);
        }
    }
}

/// Wraps a delegate listener and an enqueue strategy: every callback is
/// captured as a [`ListenerEvent`] and handed to the sink instead of running
/// inline. [`ThreadedListener`] and [`LagListener`] are built on this.
pub struct QueuedListener {
    sink: Box<dyn Fn(ListenerEvent) + Send + Sync>,
}

impl QueuedListener {
    pub fn new(sink: impl Fn(ListenerEvent) + Send + Sync + 'static) -> QueuedListener {
        QueuedListener {
            sink: Box::new(sink),
        }
    }
}

impl Listener for QueuedListener {
    fn connected(&self, connection: &Arc<Connection>) {
        (self.sink)(ListenerEvent::Connected(connection.clone()));
    }
    fn disconnected(&self, connection: &Arc<Connection>) {
        (self.sink)(ListenerEvent::Disconnected(connection.clone()));
    }
    fn received(&self, connection: &Arc<Connection>, object: &NetObject) {
        (self.sink)(ListenerEvent::Received(connection.clone(), object.clone()));
    }
    fn idle(&self, connection: &Arc<Connection>) {
        (self.sink)(ListenerEvent::Idle(connection.clone()));
    }
}

/// Processes the delegate's callbacks on a worker pool so the connection's
/// I/O tasks are never blocked by application code. With the default pool
/// size of 1, per-connection event order is preserved; larger pools trade
/// ordering for throughput.
pub struct ThreadedListener {
    queued: QueuedListener,
}

impl ThreadedListener {
    pub fn new(delegate: Arc<dyn Listener>) -> ThreadedListener {
        Self::with_pool_size(delegate, 1)
    }

    pub fn with_pool_size(delegate: Arc<dyn Listener>, pool_size: usize) -> ThreadedListener {
        let (tx, rx) = mpsc::unbounded_channel::<ListenerEvent>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..pool_size.max(1) {
            let delegate = delegate.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let event = rx.lock().await.recv().await;
                    match event {
                        Some(event) => event.dispatch(delegate.as_ref()),
                        None => return,
                    }
                }
            });
        }
        ThreadedListener {
            queued: QueuedListener::new(move |event| {
                let _ = tx.send(event);
            }),
        }
    }
}

impl Listener for ThreadedListener {
    fn connected(&self, connection: &Arc<Connection>) {
        self.queued.connected(connection);
    }
    fn disconnected(&self, connection: &Arc<Connection>) {
        self.queued.disconnected(connection);
    }
    fn received(&self, connection: &Arc<Connection>, object: &NetObject) {
        self.queued.received(connection, object);
    }
    fn idle(&self, connection: &Arc<Connection>) {
        self.queued.idle(connection);
    }
}

/// Delays every event by a uniformly random duration in `[lag_min, lag_max]`
/// to simulate network lag on incoming traffic. Events are delivered in
/// enqueue order: a later event with a shorter delay waits for earlier ones,
/// so per-connection ordering survives the added lag.
pub struct LagListener {
    queued: QueuedListener,
}

impl LagListener {
    pub fn new(lag_min: Duration, lag_max: Duration, delegate: Arc<dyn Listener>) -> LagListener {
        let (tx, mut rx) = mpsc::unbounded_channel::<(tokio::time::Instant, ListenerEvent)>();
        tokio::spawn(async move {
            while let Some((deadline, event)) = rx.recv().await {
                tokio::time::sleep_until(deadline).await;
                event.dispatch(delegate.as_ref());
            }
        });
        LagListener {
            queued: QueuedListener::new(move |event| {
                let lag = rand::thread_rng().gen_range(lag_min..=lag_max);
                let _ = tx.send((tokio::time::Instant::now() + lag, event));
            }),
        }
    }
}

impl Listener for LagListener {
    fn connected(&self, connection: &Arc<Connection>) {
        self.queued.connected(connection);
    }
    fn disconnected(&self, connection: &Arc<Connection>) {
        self.queued.disconnected(connection);
    }
    fn received(&self, connection: &Arc<Connection>, object: &NetObject) {
        self.queued.received(connection, object);
    }
    fn idle(&self, connection: &Arc<Connection>) {
        self.queued.idle(connection);
    }
}

/// Records received payloads, for tests.
#[cfg(test)]
pub(crate) struct RecordingListener {
    pub received: std::sync::Mutex<Vec<i32>>,
}

#[cfg(test)]
impl RecordingListener {
    pub fn new() -> Arc<RecordingListener> {
        Arc::new(RecordingListener {
            received: std::sync::Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
impl Listener for RecordingListener {
    fn received(&self, _connection: &Arc<Connection>, object: &NetObject) {
        if let Some(value) = object.downcast_ref::<i32>() {
            self.received.lock().unwrap().push(*value);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_type_listener_routing_and_overwrite() {
        let connection = Connection::stub();
        let listener = TypeListener::new();
        assert_eq!(listener.size(), 0);

        let seen = Arc::new(Mutex::new(Vec::<String>::new()));

        let sink = seen.clone();
        listener.add_type_handler::<String, _>(move |_, s| {
            sink.lock().unwrap().push(s.clone());
        });
        let object: NetObject = Arc::new("first".to_string());
        listener.received(&connection, &object);
        assert_eq!(listener.size(), 1);
        assert_eq!(seen.lock().unwrap().as_slice(), &["first".to_string()]);

        // second registration for the same type replaces the first
        let sink = seen.clone();
        listener.add_type_handler::<String, _>(move |_, s| {
            sink.lock().unwrap().push(format!("{}!", s));
        });
        assert_eq!(listener.size(), 1);
        let object: NetObject = Arc::new("second".to_string());
        listener.received(&connection, &object);
        assert_eq!(seen.lock().unwrap().last().unwrap(), "second!");

        // a second type is routed independently
        let ints = Arc::new(Mutex::new(0i32));
        let sink = ints.clone();
        listener.add_type_handler::<i32, _>(move |_, v| {
            *sink.lock().unwrap() = *v;
        });
        assert_eq!(listener.size(), 2);
        let object: NetObject = Arc::new(9i32);
        listener.received(&connection, &object);
        assert_eq!(*ints.lock().unwrap(), 9);

        listener.remove_type_handler::<String>();
        assert_eq!(listener.size(), 1);
        listener.clear();
        assert_eq!(listener.size(), 0);

        // with no handler registered the object is dropped silently
        let object: NetObject = Arc::new(13i32);
        listener.received(&connection, &object);
        assert_eq!(*ints.lock().unwrap(), 9);
    }

    #[tokio::test]
    async fn test_threaded_listener_preserves_order() {
        let connection = Connection::stub();
        let recorder = RecordingListener::new();
        let threaded = ThreadedListener::new(recorder.clone());

        for i in 0..100 {
            let object: NetObject = Arc::new(i as i32);
            threaded.received(&connection, &object);
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        let received = recorder.received.lock().unwrap();
        assert_eq!(received.as_slice(), (0..100).collect::<Vec<_>>().as_slice());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lag_listener_delays_but_preserves_order() {
        let connection = Connection::stub();
        let recorder = RecordingListener::new();
        let lagged = LagListener::new(
            Duration::from_millis(50),
            Duration::from_millis(300),
            recorder.clone(),
        );

        for i in 0..20 {
            let object: NetObject = Arc::new(i as i32);
            lagged.received(&connection, &object);
        }
        assert!(recorder.received.lock().unwrap().is_empty());

        // even though later events may have drawn shorter lags, delivery
        // keeps the enqueue order
        tokio::time::sleep(Duration::from_secs(10)).await;
        let received = recorder.received.lock().unwrap();
        assert_eq!(received.as_slice(), (0..20).collect::<Vec<_>>().as_slice());
    }
}
