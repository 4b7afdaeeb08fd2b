//! End-to-end remote method invocation: blocking calls, response-id
//! recycling, timeouts, and exception propagation.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tracing::Level;

use objnet::client::Client;
use objnet::config::EndpointConfig;
use objnet::connection::Connection;
use objnet::error::RmiError;
use objnet::listener::Listener;
use objnet::registry::{NetObject, ObjectRegistry};
use objnet::rmi::{ObjectSpace, RemoteObject, RmiTarget};
use objnet::server::Server;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const CALCULATOR_ID: u32 = 42;

const METHOD_ADD: u8 = 0;
const METHOD_SLOW_ADD: u8 = 1;
const METHOD_FAIL: u8 = 2;

/// Method table shared by both peers: 0 add, 1 slow_add, 2 fail.
struct Calculator;

impl Calculator {
    fn args(args: &[NetObject]) -> Result<(i32, i32), String> {
        let a = args
            .first()
            .and_then(|a| a.downcast_ref::<i32>())
            .ok_or_else(|| "argument 0 must be an i32".to_string())?;
        let b = args
            .get(1)
            .and_then(|b| b.downcast_ref::<i32>())
            .ok_or_else(|| "argument 1 must be an i32".to_string())?;
        Ok((*a, *b))
    }
}

impl RmiTarget for Calculator {
    fn invoke(&self, method_index: u8, args: &[NetObject]) -> Result<Option<NetObject>, String> {
        match method_index {
            METHOD_ADD => {
                let (a, b) = Self::args(args)?;
                Ok(Some(Arc::new(a + b)))
            }
            METHOD_SLOW_ADD => {
                let (a, b) = Self::args(args)?;
                std::thread::sleep(Duration::from_millis(2000));
                Ok(Some(Arc::new(a + b)))
            }
            METHOD_FAIL => Err("arithmetic is on strike".to_string()),
            other => Err(format!("unknown method index {}", other)),
        }
    }
}

/// Client-side typed proxy over the untyped control handle.
struct CalculatorProxy {
    remote: RemoteObject,
}

impl CalculatorProxy {
    fn new(connection: Arc<Connection>, space_id: u16) -> CalculatorProxy {
        CalculatorProxy {
            remote: RemoteObject::new(connection, space_id, CALCULATOR_ID),
        }
    }

    async fn add(&self, a: i32, b: i32) -> Result<i32, RmiError> {
        self.call(METHOD_ADD, a, b).await
    }

    async fn slow_add(&self, a: i32, b: i32) -> Result<i32, RmiError> {
        self.call(METHOD_SLOW_ADD, a, b).await
    }

    async fn call(&self, method_index: u8, a: i32, b: i32) -> Result<i32, RmiError> {
        let result = self
            .remote
            .invoke(method_index, vec![Arc::new(a), Arc::new(b)])
            .await?;
        let value = result.expect("the calculator transmits return values");
        Ok(*value.downcast_ref::<i32>().expect("the result is an i32"))
    }
}

struct AttachSpace {
    space: Arc<ObjectSpace>,
}

impl Listener for AttachSpace {
    fn connected(&self, connection: &Arc<Connection>) {
        self.space.add_connection(connection);
    }
}

async fn start_pair(tcp_port: u16) -> (Server, Client, Arc<Connection>) {
    let server = Server::new(EndpointConfig::default(), ObjectRegistry::new()).unwrap();
    let space = ObjectSpace::new(0);
    space.register(CALCULATOR_ID, Arc::new(Calculator));
    server.add_listener(Arc::new(AttachSpace { space }));
    server
        .start(SocketAddr::new(LOCALHOST, tcp_port), None)
        .await
        .unwrap();

    let client = Client::new(EndpointConfig::default(), ObjectRegistry::new()).unwrap();
    let connection = client
        .connect(Duration::from_secs(5), LOCALHOST, tcp_port, None)
        .await
        .unwrap();
    (server, client, connection)
}

#[tokio::test]
async fn blocking_call_returns_value_and_frees_response_id() {
    let (server, client, connection) = start_pair(54565).await;
    let proxy = CalculatorProxy::new(connection, 0);

    assert_eq!(proxy.add(2, 3).await.unwrap(), 5);

    // ids are released on completion: far more sequential calls than the 63
    // available ids succeed only if every call frees its id
    for i in 0..100 {
        assert_eq!(proxy.add(i, 1).await.unwrap(), i + 1);
    }

    client.stop();
    server.stop().await;
}

#[tokio::test]
async fn timed_out_call_frees_its_id_and_proxy_recovers() {
    let (server, client, connection) = start_pair(54566).await;
    let proxy = CalculatorProxy::new(connection, 0);

    proxy.remote.set_response_timeout(Duration::from_millis(200));
    let result = proxy.slow_add(1, 2).await;
    assert!(matches!(result, Err(RmiError::Timeout)));

    // the next call queues behind the still-sleeping invocation on the
    // server; with a large enough timeout it succeeds on a freed id
    proxy.remote.set_response_timeout(Duration::from_secs(10));
    assert_eq!(proxy.add(4, 5).await.unwrap(), 9);

    client.stop();
    server.stop().await;
}

#[tokio::test]
async fn remote_errors_propagate_as_exceptions() {
    let (server, client, connection) = start_pair(54567).await;
    let proxy = CalculatorProxy::new(connection.clone(), 0);

    let result = proxy.remote.invoke(METHOD_FAIL, vec![]).await;
    match result {
        Err(RmiError::Remote(message)) => assert_eq!(message, "arithmetic is on strike"),
        other => panic!("expected a remote exception, got {:?}", other.map(|_| ())),
    }

    // an unknown object id is reported the same way
    let missing = RemoteObject::new(connection, 0, 4711);
    let result = missing.invoke(METHOD_ADD, vec![]).await;
    assert!(matches!(result, Err(RmiError::Remote(_))));

    client.stop();
    server.stop().await;
}

#[tokio::test]
async fn non_blocking_call_parks_result_for_later() {
    let (server, client, connection) = start_pair(54568).await;
    let proxy = CalculatorProxy::new(connection, 0);

    proxy.remote.set_non_blocking(true);
    proxy.remote.set_remember_last_response(true);
    let immediate = proxy
        .remote
        .invoke(METHOD_ADD, vec![Arc::new(20i32), Arc::new(22i32)])
        .await
        .unwrap();
    assert!(immediate.is_none());

    let value = proxy.remote.wait_for_last_response().await.unwrap();
    assert_eq!(
        value.expect("add returns a value").downcast_ref::<i32>(),
        Some(&42)
    );
    assert!(proxy.remote.last_response().is_some());

    client.stop();
    server.stop().await;
}

#[tokio::test]
async fn disconnect_unparks_waiters() {
    let (server, client, connection) = start_pair(54569).await;
    let proxy = Arc::new(CalculatorProxy::new(connection.clone(), 0));

    let call = {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.slow_add(1, 1).await })
    };
    // let the invocation reach the server before pulling the plug
    tokio::time::sleep(Duration::from_millis(300)).await;
    connection.close();

    let result = call.await.unwrap();
    assert!(matches!(result, Err(RmiError::Disconnected)));

    client.stop();
    server.stop().await;
}
