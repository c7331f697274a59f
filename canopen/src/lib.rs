//! Async CANopen master/slave protocol stack over a pluggable CAN transport.
//!
//! [`Network`] owns the transport and dispatch table. Everything else is a cheap handle into it:
//! [`sdo_client::SdoClient`] and [`sdo_server::SdoServer`] implement the SDO transfer protocol,
//! [`pdo`] implements bit-packed process data, [`nmt`] the node state machine and heartbeat,
//! [`emcy`]/[`sync`]/[`time`] the remaining CiA 301 producers and consumers, and [`node::Node`]
//! binds one node-id's endpoints to an [`canopen_common::object_dictionary::ObjectDictionary`].

pub mod emcy;
pub mod error;
pub mod network;
pub mod nmt;
pub mod node;
pub mod pdo;
pub mod sdo_client;
pub mod sdo_server;
pub mod sync;
pub mod time;

pub use error::Error;
pub use network::Network;
pub use node::Node;
