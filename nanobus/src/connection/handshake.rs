//! The client side of the SASL authentication dialog.
//!
//! A line-oriented ASCII exchange terminated by CR-LF, run over the same
//! non-blocking socket that later carries the binary framing. See
//! [Authentication Protocol] in the D-Bus specification.
//!
//! [Authentication Protocol]: https://dbus.freedesktop.org/doc/dbus-specification.html#auth-protocol

use std::fmt;
use std::io;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use log::trace;

use super::socket::{write_all, Socket, POLL_INTERVAL};
use crate::{Error, Result};

/// Upper bound for each step of the authentication dialog.
pub(crate) const AUTH_TIMEOUT: Duration = Duration::from_millis(2000);

/// Authentication mechanisms.
///
/// Only EXTERNAL is spoken: on a Unix socket the kernel transfers our
/// credentials out-of-band, and the payload merely names the expected uid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMechanism {
    /// Credentials-passing authentication.
    External,
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMechanism::External => f.write_str("EXTERNAL"),
        }
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EXTERNAL" => Ok(AuthMechanism::External),
            _ => Err(Error::Malformed(format!("unknown mechanism: {s}"))),
        }
    }
}

// The subset of the SASL command vocabulary this client exchanges.
#[derive(Debug, PartialEq)]
enum Command {
    Auth(Option<(AuthMechanism, Vec<u8>)>),
    Begin,
    NegotiateUnixFD,
    Rejected(Vec<String>),
    Ok(String),
    AgreeUnixFD,
    Error(String),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Auth(None) => write!(f, "AUTH"),
            Command::Auth(Some((mech, resp))) => {
                write!(f, "AUTH {mech} {}", hex::encode(resp))
            }
            Command::Begin => write!(f, "BEGIN"),
            Command::NegotiateUnixFD => write!(f, "NEGOTIATE_UNIX_FD"),
            Command::Rejected(mechs) => write!(f, "REJECTED {}", mechs.join(" ")),
            Command::Ok(guid) => write!(f, "OK {guid}"),
            Command::AgreeUnixFD => write!(f, "AGREE_UNIX_FD"),
            Command::Error(expl) => write!(f, "ERROR {expl}"),
        }?;
        write!(f, "\r\n")
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut words = s.split_ascii_whitespace();
        let cmd = match words.next() {
            Some("REJECTED") => Command::Rejected(words.map(str::to_owned).collect()),
            Some("OK") => {
                let guid = words
                    .next()
                    .ok_or_else(|| Error::Malformed("OK line carries no server GUID".into()))?;
                Command::Ok(guid.to_owned())
            }
            Some("AGREE_UNIX_FD") => Command::AgreeUnixFD,
            Some("ERROR") => Command::Error(s.into()),
            _ => return Err(Error::Malformed(format!("unknown SASL command: {s}"))),
        };
        Ok(cmd)
    }
}

// Accumulates bytes until CR-LF is the suffix of a received line.
#[derive(Debug, Default)]
struct LineReader {
    buf: Vec<u8>,
}

impl LineReader {
    fn read_line(&mut self, socket: &mut dyn Socket, deadline: Instant) -> Result<String> {
        loop {
            if let Some(nl) = self.buf.iter().position(|b| *b == b'\n') {
                if nl == 0 || self.buf[nl - 1] != b'\r' {
                    return Err(Error::Malformed(
                        "invalid line ending in SASL stream".into(),
                    ));
                }
                let rest = self.buf.split_off(nl + 1);
                let mut line = std::mem::replace(&mut self.buf, rest);
                line.truncate(nl - 1);
                let line = String::from_utf8(line)
                    .map_err(|_| Error::Malformed("SASL line is not valid ASCII".into()))?;
                trace!("Reading {line}");
                return Ok(line);
            }

            let mut chunk = [0u8; 256];
            match socket.recv(&mut chunk) {
                Ok(0) => {
                    return Err(Error::InputOutput(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed during authentication",
                    )))
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout("authentication".into()));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Init,
    WaitingForMechanisms,
    WaitingForOk,
    WaitingForAgreeUnixFd,
    Done,
}

/// Run the client handshake; after it returns the socket carries only
/// framed binary messages. Returns the server GUID.
pub(crate) fn authenticate(socket: &mut dyn Socket) -> Result<String> {
    authenticate_with_timeout(socket, AUTH_TIMEOUT)
}

pub(crate) fn authenticate_with_timeout(
    socket: &mut dyn Socket,
    step_timeout: Duration,
) -> Result<String> {
    let mut reader = LineReader::default();
    let mut step = Step::Init;
    let mut server_guid = None;

    loop {
        let (next_step, cmd) = match step {
            Step::Init => {
                trace!("Discovering supported mechanisms");
                (Step::WaitingForMechanisms, Command::Auth(None))
            }
            Step::WaitingForMechanisms => {
                let reply = read_command(&mut reader, socket, step_timeout)?;
                match reply {
                    Command::Rejected(offered) => {
                        if !offered.iter().any(|m| m.parse::<AuthMechanism>().is_ok()) {
                            return Err(Error::AuthRejected(format!(
                                "server offers no supported mechanism (got: {})",
                                offered.join(" ")
                            )));
                        }
                        trace!("Server offers: {}", offered.join(" "));
                        let id = sasl_auth_id().into_bytes();
                        (
                            Step::WaitingForOk,
                            Command::Auth(Some((AuthMechanism::External, id))),
                        )
                    }
                    reply => {
                        return Err(Error::Malformed(format!(
                            "expected a mechanism list, got: {reply:?}"
                        )))
                    }
                }
            }
            Step::WaitingForOk => {
                let reply = read_command(&mut reader, socket, step_timeout)?;
                match reply {
                    Command::Ok(guid) => {
                        trace!("Authenticated, server GUID {guid}");
                        server_guid = Some(guid);
                        (Step::WaitingForAgreeUnixFd, Command::NegotiateUnixFD)
                    }
                    Command::Rejected(_) => {
                        return Err(Error::AuthRejected(
                            "server rejected EXTERNAL authentication".into(),
                        ))
                    }
                    reply => {
                        return Err(Error::Malformed(format!(
                            "unexpected AUTH reply: {reply:?}"
                        )))
                    }
                }
            }
            Step::WaitingForAgreeUnixFd => {
                let reply = read_command(&mut reader, socket, step_timeout)?;
                match reply {
                    // Either outcome is fine, fd passing is never relied on.
                    Command::AgreeUnixFD => trace!("Unix FD passing agreed"),
                    Command::Error(_) => trace!("Unix FD passing refused"),
                    reply => {
                        return Err(Error::Malformed(format!(
                            "unexpected NEGOTIATE_UNIX_FD reply: {reply:?}"
                        )))
                    }
                }
                (Step::Done, Command::Begin)
            }
            Step::Done => unreachable!("the loop returns right after BEGIN"),
        };

        write_command(socket, cmd, step_timeout)?;
        if next_step == Step::Done {
            trace!("Handshake done");
            return Ok(server_guid.unwrap_or_default());
        }
        step = next_step;
    }
}

fn read_command(
    reader: &mut LineReader,
    socket: &mut dyn Socket,
    timeout: Duration,
) -> Result<Command> {
    let line = reader.read_line(socket, Instant::now() + timeout)?;
    line.parse()
}

fn write_command(socket: &mut dyn Socket, cmd: Command, timeout: Duration) -> Result<()> {
    let line = cmd.to_string();
    trace!("Sending {}", line.trim_end());
    write_all(socket, line.as_bytes(), Instant::now() + timeout)
}

// The decimal effective uid, hex-encoded digit by digit on the wire.
fn sasl_auth_id() -> String {
    rustix::process::geteuid().as_raw().to_string()
}
