//! Connection API.
use std::path::Path;
use std::time::{Duration, Instant};

use log::trace;

pub mod socket;
pub use socket::{Socket, UnixSocket};

pub(crate) mod handshake;
pub use handshake::AuthMechanism;

use crate::codec::padding_for_8_bytes;
use crate::message::header::{MAX_MESSAGE_SIZE, MIN_MESSAGE_SIZE};
use crate::message::Message;
use crate::{Error, Result};

/// Well-known endpoint of the system message bus.
const SYSTEM_BUS_PATH: &str = "/var/run/dbus/system_bus_socket";

/// The bus driver, peer of the `Hello` call.
const DBUS_SERVICE: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";

/// Deadline applied to outbound writes.
const SEND_TIMEOUT: Duration = Duration::from_millis(2000);

/// Deadline for the `Hello` reply during connection setup.
const HELLO_TIMEOUT: Duration = Duration::from_millis(2000);

/// The kind of message bus to reach.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bus {
    /// The system-wide message bus.
    System,
    /// The per-session message bus.
    Session,
    /// The per-user message bus.
    User,
}

/// A connection to a message bus.
///
/// A connection exclusively owns its socket for its whole lifetime and
/// closes it on drop. It is not shared across threads; layering a mutex
/// above it is the caller's business.
#[derive(Debug)]
pub struct Connection {
    socket: Box<dyn Socket>,
    unique_name: Option<String>,
}

impl Connection {
    /// Connect to the system-wide message bus.
    pub fn system() -> Result<Self> {
        Self::connect(Bus::System)
    }

    /// Connect to a well-known bus.
    ///
    /// Only the system bus endpoint is implemented; reaching the session or
    /// user bus takes address resolution this crate does not perform.
    pub fn connect(bus: Bus) -> Result<Self> {
        match bus {
            Bus::System => Self::connect_unix(SYSTEM_BUS_PATH),
            Bus::Session => Err(Error::UnsupportedBus(
                "session bus address resolution is not implemented".into(),
            )),
            Bus::User => Err(Error::UnsupportedBus(
                "user bus address resolution is not implemented".into(),
            )),
        }
    }

    /// Connect to a caller-supplied Unix socket endpoint.
    ///
    /// Opens the stream, sends the NUL byte that precedes SASL, runs the
    /// authentication dialog, then performs the `Hello` exchange to learn
    /// our unique name.
    pub fn connect_unix<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut socket = UnixSocket::connect(path)?;
        socket::write_all(&mut socket, b"\0", Instant::now() + SEND_TIMEOUT)?;
        handshake::authenticate(&mut socket)?;

        let mut connection = Self::new(Box::new(socket));
        connection.hello()?;
        Ok(connection)
    }

    pub(crate) fn new(socket: Box<dyn Socket>) -> Self {
        Self {
            socket,
            unique_name: None,
        }
    }

    /// The unique name assigned by the bus, once the `Hello` exchange has
    /// completed.
    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name.as_deref()
    }

    /// Send `msg` to the peer, stamping our unique name as SENDER when it
    /// is known.
    pub fn send(&mut self, mut msg: Message) -> Result<()> {
        if let Some(name) = &self.unique_name {
            msg.set_sender(name);
        }
        let header = msg.serialize()?;

        trace!("Sending message: {msg:?}");
        let deadline = Instant::now() + SEND_TIMEOUT;
        socket::write_all(self.socket.as_mut(), &header, deadline)?;
        socket::write_all(self.socket.as_mut(), msg.body(), deadline)?;
        trace!("Sent message with serial: {}", msg.serial());

        Ok(())
    }

    /// Receive one framed message within `timeout`.
    ///
    /// Reads the fixed header and the fields-array length, then the rest of
    /// the message those announce: fields, padding to 8, body.
    pub fn recv(&mut self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;

        let mut bytes = vec![0u8; MIN_MESSAGE_SIZE];
        socket::read_exact(self.socket.as_mut(), &mut bytes, deadline)?;

        let (header, fields_len) = crate::message::PrimaryHeader::read(&bytes)?;
        let header_len = MIN_MESSAGE_SIZE + fields_len as usize;
        let body_padding = padding_for_8_bytes(header_len);
        let body_len = header.body_len() as usize;
        let total_len = header_len + body_padding + body_len;
        if total_len > MAX_MESSAGE_SIZE {
            return Err(Error::Malformed(format!(
                "message of {total_len} bytes exceeds the 128 MiB limit"
            )));
        }

        bytes.resize(total_len, 0);
        socket::read_exact(self.socket.as_mut(), &mut bytes[MIN_MESSAGE_SIZE..], deadline)?;

        let msg = Message::from_bytes(&bytes)?;
        trace!("Received message: {msg:?}");
        Ok(msg)
    }

    /// Wait for the message answering `serial`, skipping interleaved
    /// replies and signals the daemon may deliver first.
    pub fn wait_reply(&mut self, serial: u32, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!("waiting for reply to {serial}")));
            }
            let msg = self.recv(remaining)?;
            if msg.reply_serial().ok() == Some(serial) {
                return Ok(msg);
            }
            trace!("Skipping message while waiting for reply {serial}: {msg:?}");
        }
    }

    // Acquire our unique name from the bus driver.
    fn hello(&mut self) -> Result<()> {
        let mut hello = Message::new();
        let serial = hello.prepare_call(DBUS_SERVICE, DBUS_PATH, DBUS_SERVICE, "Hello")?;
        self.send(hello)?;

        let mut reply = self.wait_reply(serial, HELLO_TIMEOUT)?;
        if reply.is_error() {
            let name = reply
                .error_name()
                .unwrap_or("org.freedesktop.DBus.Error.Failed")
                .to_owned();
            return Err(Error::Malformed(format!("Hello failed: {name}")));
        }

        let name: String = reply.extract_argument()?;
        trace!("Connected to the bus as {name}");
        self.unique_name = Some(name);
        Ok(())
    }
}
