//! A synchronous D-Bus client and local-object core: signature parsing, the
//! typed value model, the buffer codec, message assembly, the SASL
//! handshake, and a connection that correlates replies, dispatches signals
//! to subscribers, and answers incoming calls against locally registered
//! objects.
//!
//! The transport is supplied by the host as anything implementing
//! [`transport::Socket`] (`Read + Write`); this crate never opens a socket
//! itself.

#![deny(clippy::all, clippy::missing_inline_in_public_items)]

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate lazy_static;

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod address;
pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod names;
pub mod protocol;
pub mod signature;
pub mod subscription;
pub mod transport;
pub mod value;

pub use address::BusAddress;
pub use connection::{Connection, NameFlags, ReleaseNameReply, RequestNameReply};
pub use dispatch::{Interface, Method, Property, PropertyAccess};
pub use error::{Error, Result};
pub use message::{HeaderFlags, Message, MessageType, Serial};
pub use signature::Type;
pub use subscription::{Subscription, SubscriptionSpec};
pub use transport::Socket;
pub use value::Value;
