use std::sync::atomic::{AtomicU32, Ordering::SeqCst};

use enumflags2::{bitflags, BitFlags};

use crate::codec::{Decoder, Encoder};
use crate::{Error, Result};

pub(crate) const PRIMARY_HEADER_SIZE: usize = 12;
pub(crate) const MIN_MESSAGE_SIZE: usize = PRIMARY_HEADER_SIZE + 4;
pub(crate) const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024; // 128 MiB

/// D-Bus code for endianness.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EndianSig {
    /// The message is in big-endian (network) byte order.
    Big = b'B',

    /// The message is in little-endian byte order.
    Little = b'l',
}

impl TryFrom<u8> for EndianSig {
    type Error = Error;

    fn try_from(value: u8) -> Result<EndianSig> {
        match value {
            b'B' => Ok(EndianSig::Big),
            b'l' => Ok(EndianSig::Little),
            other => Err(Error::Malformed(format!(
                "invalid endianness byte 0x{other:02x}"
            ))),
        }
    }
}

/// Message header representing the D-Bus type of the message.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// Never sent; the state of a message before it is prepared.
    Invalid = 0,
    /// Method call. This message type may prompt a reply.
    MethodCall = 1,
    /// A reply to a method call.
    MethodReturn = 2,
    /// An error in response to a method call.
    Error = 3,
    /// Signal emission.
    Signal = 4,
}

impl TryFrom<u8> for Type {
    type Error = Error;

    fn try_from(value: u8) -> Result<Type> {
        match value {
            0 => Ok(Type::Invalid),
            1 => Ok(Type::MethodCall),
            2 => Ok(Type::MethodReturn),
            3 => Ok(Type::Error),
            4 => Ok(Type::Signal),
            other => Err(Error::Malformed(format!("unknown message type {other}"))),
        }
    }
}

/// Pre-defined flags that can be passed in the message header.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Flags {
    /// This message does not expect method return replies or error replies,
    /// even if it is of a type that can have a reply; the reply should be
    /// omitted.
    NoReplyExpected = 0x1,
    /// The bus must not launch an owner for the destination name in response
    /// to this message.
    NoAutoStart = 0x2,
    /// This flag may be set on a method call message to inform the receiving
    /// side that the caller is prepared to wait for interactive
    /// authorization, which might take a considerable time to complete.
    AllowInteractiveAuth = 0x4,
}

/// The fixed 12-byte header present in every D-Bus message.
#[derive(Clone, Debug, PartialEq)]
pub struct PrimaryHeader {
    endian_sig: EndianSig,
    msg_type: Type,
    flags: BitFlags<Flags>,
    protocol_version: u8,
    body_len: u32,
    serial_num: u32,
}

impl PrimaryHeader {
    /// Create a little-endian header of the given type, allocating the next
    /// process-wide serial.
    pub fn new(msg_type: Type) -> Self {
        Self {
            endian_sig: EndianSig::Little,
            msg_type,
            flags: BitFlags::empty(),
            protocol_version: 1,
            body_len: 0,
            serial_num: next_serial(),
        }
    }

    /// The header of a message that has not been prepared or received yet.
    pub(crate) fn empty() -> Self {
        Self {
            endian_sig: EndianSig::Little,
            msg_type: Type::Invalid,
            flags: BitFlags::empty(),
            protocol_version: 1,
            body_len: 0,
            serial_num: 0,
        }
    }

    /// Parse the fixed header and the fields-array length that follows it.
    ///
    /// `buf` must hold at least [`MIN_MESSAGE_SIZE`] bytes; the multi-byte
    /// words are read in the endianness the first byte announces. Unknown
    /// flag bits are ignored, as the wire format requires.
    pub(crate) fn read(buf: &[u8]) -> Result<(PrimaryHeader, u32)> {
        if buf.len() < MIN_MESSAGE_SIZE {
            return Err(Error::ShortRead {
                needed: MIN_MESSAGE_SIZE,
                available: buf.len(),
            });
        }
        let endian_sig = EndianSig::try_from(buf[0])?;
        let msg_type = Type::try_from(buf[1])?;
        let flags = BitFlags::from_bits_truncate(buf[2]);
        let protocol_version = buf[3];
        if protocol_version != 1 {
            return Err(Error::Malformed(format!(
                "unsupported protocol version {protocol_version}"
            )));
        }

        let mut dec = Decoder::new(buf, endian_sig);
        dec.seek(4);
        let body_len = dec.get_u32()?;
        let serial_num = dec.get_u32()?;
        let fields_len = dec.get_u32()?;

        Ok((
            Self {
                endian_sig,
                msg_type,
                flags,
                protocol_version,
                body_len,
                serial_num,
            },
            fields_len,
        ))
    }

    /// Write the fixed 12 bytes.
    pub(crate) fn write(&self, enc: &mut Encoder<'_>) {
        enc.put_u8(self.endian_sig as u8);
        enc.put_u8(self.msg_type as u8);
        enc.put_u8(self.flags.bits());
        enc.put_u8(self.protocol_version);
        enc.put_u32(self.body_len);
        enc.put_u32(self.serial_num);
    }

    /// D-Bus code for endian encoding of the message.
    pub fn endian_sig(&self) -> EndianSig {
        self.endian_sig
    }

    /// The message type.
    pub fn msg_type(&self) -> Type {
        self.msg_type
    }

    /// The message flags.
    pub fn flags(&self) -> BitFlags<Flags> {
        self.flags
    }

    /// Set the message flags.
    pub fn set_flags(&mut self, flags: BitFlags<Flags>) {
        self.flags = flags;
    }

    /// The major version of the protocol the message is compliant to.
    ///
    /// Currently only `1` is valid.
    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    /// The byte length of the message body.
    pub fn body_len(&self) -> u32 {
        self.body_len
    }

    /// Set the byte length of the message body.
    pub(crate) fn set_body_len(&mut self, len: u32) {
        self.body_len = len;
    }

    /// The serial number of the message.
    ///
    /// This is used to match a reply to a method call.
    pub fn serial_num(&self) -> u32 {
        self.serial_num
    }
}

static SERIAL_NUM: AtomicU32 = AtomicU32::new(1);

/// Allocate the next call serial. Strictly monotonic per process.
fn next_serial() -> u32 {
    SERIAL_NUM.fetch_add(1, SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serials_are_strictly_monotonic() {
        let first = PrimaryHeader::new(Type::MethodCall).serial_num();
        let second = PrimaryHeader::new(Type::MethodCall).serial_num();
        assert!(second > first);
    }

    #[test]
    fn fixed_header_roundtrip() {
        let header = PrimaryHeader::new(Type::MethodCall);
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        header.write(&mut enc);
        buf.extend_from_slice(&[0, 0, 0, 0]); // empty fields array

        let (back, fields_len) = PrimaryHeader::read(&buf).unwrap();
        assert_eq!(back, header);
        assert_eq!(fields_len, 0);
    }

    #[test]
    fn big_endian_header_is_parsed() {
        let buf = [
            b'B', 2, 0, 1, // endianness, METHOD_RETURN, flags, version
            0, 0, 0, 0, // body length
            0, 0, 0, 7, // serial
            0, 0, 0, 0, // fields length
        ];
        let (header, fields_len) = PrimaryHeader::read(&buf).unwrap();
        assert_eq!(header.endian_sig(), EndianSig::Big);
        assert_eq!(header.msg_type(), Type::MethodReturn);
        assert_eq!(header.serial_num(), 7);
        assert_eq!(fields_len, 0);
    }

    #[test]
    fn unknown_flag_bits_are_ignored() {
        let buf = [
            b'l', 4, 0xf8, 1, //
            0, 0, 0, 0, //
            1, 0, 0, 0, //
            0, 0, 0, 0, //
        ];
        let (header, _) = PrimaryHeader::read(&buf).unwrap();
        assert!(header.flags().is_empty());
    }

    #[test]
    fn bad_endianness_byte_is_rejected() {
        let buf = [
            b'X', 1, 0, 1, //
            0, 0, 0, 0, //
            1, 0, 0, 0, //
            0, 0, 0, 0, //
        ];
        assert!(matches!(
            PrimaryHeader::read(&buf),
            Err(Error::Malformed(_))
        ));
    }
}
