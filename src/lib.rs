//! Client/server library for exchanging serialized objects over a pair of
//! channels: a reliable, ordered TCP stream and an optional lossy UDP
//! datagram channel. A remote method invocation facility is layered on top of
//! the same wire format.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *objects*: applications register
//!   their message types with an [`registry::ObjectRegistry`] (in the same
//!   order on both peers) and receive decoded objects through
//!   [`listener::Listener`] callbacks
//! * All traffic on the reliable channel is framed with a varint length
//!   prefix; one whole frame is committed to a bounded per-connection write
//!   buffer per send call, or the send fails - there are no partial frames
//! * The datagram channel carries one message per datagram with no delivery
//!   or ordering guarantees; sends on it never block
//! * Connection lifecycle (handshake, keep-alive, receive timeout, orderly
//!   close) is owned by the library; applications observe it through
//!   `connected` / `disconnected` / `received` / `idle` events
//! * Servers on a LAN can be located by a single-datagram broadcast probe
//!   that works without any class registration
//! * Remote method calls are marshaled as regular in-band messages and
//!   correlated by a 6-bit rolling response id
//!
//! ## Wire format
//!
//! Reliable frame:
//! ```ascii
//! 0: payload length (varint u32, 1-5 bytes, little-endian base 128 with
//!     continuation bits). A length of 0 is a keep-alive frame.
//! *: payload
//! ```
//!
//! Frame payload / datagram payload:
//! ```ascii
//! 0: class id (varint u32). Ids 1-4 are reserved for framework messages
//!     (RegisterTcp, RegisterUdp, InvokeMethod, InvokeResult); registered
//!     classes start at 16.
//! *: body, as serialized by the class's registered codec
//! ```
//!
//! Discovery probes and responses are raw byte ranges and deliberately do not
//! go through the object serializer.

pub mod buf;
pub mod buffers;
pub mod client;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod listener;
pub mod registry;
pub mod rmi;
pub mod server;
pub mod wire;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
