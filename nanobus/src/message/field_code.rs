use std::fmt;

use crate::codec::{Append, Basic, Decoder, Encoder, Get};
use crate::protocol::{DbusType, TypeCode};
use crate::{Error, Result};

/// The message field code.
///
/// Every header field is marshalled as a `(code, variant)` dict entry in the
/// array that follows the fixed header. The message type determines which
/// fields are required.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FieldCode {
    /// The object to send a call to, or the object a signal is emitted from.
    Path = 1,
    /// The interface to invoke a method call on, or that a signal is emitted
    /// from.
    Interface = 2,
    /// The member, either the method name or signal name.
    Member = 3,
    /// The name of the error that occurred, for errors.
    ErrorName = 4,
    /// The serial number of the message this message is a reply to.
    ReplySerial = 5,
    /// The name of the connection this message is intended for.
    Destination = 6,
    /// Unique name of the sending connection.
    Sender = 7,
    /// The signature of the message body.
    Signature = 8,
    /// The number of Unix file descriptors that accompany the message.
    UnixFds = 9,
}

impl TryFrom<u8> for FieldCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        let code = match value {
            1 => FieldCode::Path,
            2 => FieldCode::Interface,
            3 => FieldCode::Member,
            4 => FieldCode::ErrorName,
            5 => FieldCode::ReplySerial,
            6 => FieldCode::Destination,
            7 => FieldCode::Sender,
            8 => FieldCode::Signature,
            9 => FieldCode::UnixFds,
            other => return Err(Error::Malformed(format!("invalid field code {other}"))),
        };
        Ok(code)
    }
}

impl fmt::Display for FieldCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldCode::Path => "Path",
            FieldCode::Interface => "Interface",
            FieldCode::Member => "Member",
            FieldCode::ErrorName => "Error name",
            FieldCode::ReplySerial => "Reply serial",
            FieldCode::Destination => "Destination",
            FieldCode::Sender => "Sender",
            FieldCode::Signature => "Signature",
            FieldCode::UnixFds => "UNIX FDs",
        };
        f.write_str(name)
    }
}

// Field codes marshal as plain bytes, which also lets them act as dict keys.
impl DbusType for FieldCode {
    const CODE: TypeCode = TypeCode::Byte;
}

impl Append for FieldCode {
    fn append(&self, enc: &mut Encoder<'_>) -> Result<()> {
        enc.put_u8(*self as u8);
        Ok(())
    }
}

impl Get for FieldCode {
    fn get(dec: &mut Decoder<'_>) -> Result<Self> {
        Self::try_from(dec.get_u8()?)
    }
}

impl Basic for FieldCode {}
