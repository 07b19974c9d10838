//! Non-blocking stream socket with deadline-bounded I/O.

use std::io;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use rustix::net::{RecvFlags, SendFlags};

use crate::{Error, Result};

/// Interval slept between retries while the socket has nothing ready.
///
/// A sleep-spin is adequate for a client; readiness notification would be
/// the next step up.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A non-blocking byte stream carrying the bus dialog.
///
/// Both the line-based SASL handshake and the binary framing run over this
/// trait, so tests can substitute a scripted peer.
pub trait Socket: std::fmt::Debug {
    /// Read available bytes; `WouldBlock` when none are ready.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write some bytes; `WouldBlock` when the kernel buffer is full.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// A Unix stream socket connected to a local bus endpoint.
///
/// The stream is exclusively owned and closed on drop.
#[derive(Debug)]
pub struct UnixSocket {
    stream: UnixStream,
}

impl UnixSocket {
    /// Connect to `path` and switch the stream to non-blocking mode.
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let stream = UnixStream::connect(path)?;
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }
}

impl Socket for UnixSocket {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        rustix::net::recv(&self.stream, buf, RecvFlags::empty())
            .map(|(n, _)| n)
            .map_err(io::Error::from)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        rustix::net::send(&self.stream, buf, SendFlags::empty()).map_err(io::Error::from)
    }
}

/// Fill `buf` before `deadline`, sleep-spinning on `WouldBlock`.
pub(crate) fn read_exact(
    socket: &mut dyn Socket,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        match socket.recv(&mut buf[pos..]) {
            Ok(0) => {
                return Err(Error::InputOutput(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )))
            }
            Ok(n) => pos += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout("socket read".into()));
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Write all of `buf` before `deadline`, sleep-spinning on `WouldBlock`.
pub(crate) fn write_all(socket: &mut dyn Socket, buf: &[u8], deadline: Instant) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        match socket.send(&buf[pos..]) {
            Ok(0) => {
                return Err(Error::InputOutput(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write to socket",
                )))
            }
            Ok(n) => pos += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout("socket write".into()));
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io;
    use std::rc::Rc;

    use super::Socket;

    /// A socket whose peer side is a pre-loaded script.
    ///
    /// Reads drain the scripted bytes in order and report `WouldBlock` once
    /// they run out; writes land in a shared buffer the test can inspect.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedSocket {
        incoming: Rc<RefCell<VecDeque<u8>>>,
        outgoing: Rc<RefCell<Vec<u8>>>,
    }

    impl ScriptedSocket {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue bytes the peer will "send" to us.
        pub fn push_reply(&self, bytes: &[u8]) {
            self.incoming.borrow_mut().extend(bytes.iter().copied());
        }

        /// A handle observing everything written so far.
        pub fn written(&self) -> Rc<RefCell<Vec<u8>>> {
            Rc::clone(&self.outgoing)
        }
    }

    impl Socket for ScriptedSocket {
        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut incoming = self.incoming.borrow_mut();
            if incoming.is_empty() {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = buf.len().min(incoming.len());
            for slot in buf.iter_mut().take(n) {
                *slot = incoming.pop_front().unwrap_or_default();
            }
            Ok(n)
        }

        fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outgoing.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedSocket;
    use super::*;

    #[test]
    fn read_exact_assembles_partial_reads() {
        let mut socket = ScriptedSocket::new();
        socket.push_reply(b"hello world");
        let mut buf = [0u8; 5];
        read_exact(&mut socket, &mut buf, Instant::now() + POLL_INTERVAL).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_exact_times_out_when_idle() {
        let mut socket = ScriptedSocket::new();
        let mut buf = [0u8; 4];
        let deadline = Instant::now() + Duration::from_millis(5);
        assert!(matches!(
            read_exact(&mut socket, &mut buf, deadline),
            Err(Error::Timeout(_))
        ));
    }

    #[test]
    fn write_all_captures_bytes() {
        let mut socket = ScriptedSocket::new();
        let written = socket.written();
        write_all(&mut socket, b"BEGIN\r\n", Instant::now() + POLL_INTERVAL).unwrap();
        assert_eq!(written.borrow().as_slice(), b"BEGIN\r\n");
    }
}
