//! A minimal native D-Bus client.
//!
//! This crate speaks the D-Bus wire protocol over a local stream socket: it
//! connects to a bus, performs the line-based SASL handshake, then exchanges
//! framed binary messages with the bus daemon. Marshalling is done by a
//! self-contained codec following the strict alignment rules of the wire
//! format; heterogeneous values travel as self-describing [`Variant`]s.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use nanobus::{Connection, Message};
//!
//! fn main() -> nanobus::Result<()> {
//!     let mut bus = Connection::system()?;
//!
//!     let mut msg = Message::new();
//!     let serial = msg.prepare_call(
//!         "org.freedesktop.DBus",
//!         "/org/freedesktop/DBus",
//!         "org.freedesktop.DBus",
//!         "GetNameOwner",
//!     )?;
//!     msg.add_argument(&"org.freedesktop.DBus")?;
//!     bus.send(msg)?;
//!
//!     let mut reply = bus.wait_reply(serial, Duration::from_millis(2000))?;
//!     let owner: String = reply.extract_argument()?;
//!     println!("the bus driver is owned by {owner}");
//!     Ok(())
//! }
//! ```

mod error;
pub use error::{Error, Result};

pub mod protocol;
pub use protocol::{dbus_type_of, DbusType, ObjectPath, Signature, TypeCode};

mod variant;
pub use variant::{FromVariant, Variant};

pub mod codec;
pub use codec::{Append, Basic, Get};

pub mod message;
pub use message::Message;

pub mod connection;
/// Alias for `connection` module, for convenience.
pub use connection as conn;
pub use connection::{Bus, Connection};
