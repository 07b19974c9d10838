//! D-Bus Message.
use std::fmt;

use log::trace;

use crate::codec::{padding_for_8_bytes, Append, Basic, Decoder, Encoder, Get};
use crate::protocol::{ObjectPath, Signature, TypeCode};
use crate::variant::Variant;
use crate::{Error, Result};

mod field_code;
pub use field_code::FieldCode;

mod fields;
use fields::Fields;

pub(crate) mod header;
pub use header::{EndianSig, Flags, PrimaryHeader, Type};
use header::{MAX_MESSAGE_SIZE, MIN_MESSAGE_SIZE};

/// A D-Bus message.
///
/// A message owns its fixed header, the header-field dictionary, the body
/// signature and the body bytes. Outbound messages are built with
/// [`Message::prepare_call`] followed by [`Message::add_argument`] calls;
/// received messages are drained with [`Message::extract_argument`], which
/// validates each requested type against the signature announced by the
/// peer.
#[derive(Clone, PartialEq)]
pub struct Message {
    header: PrimaryHeader,
    fields: Fields,
    signature: Signature,
    body: Vec<u8>,
    // Parser cursors, only meaningful on the receive side.
    body_pos: usize,
    sig_pos: usize,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    /// An empty message, ready to be prepared.
    pub fn new() -> Self {
        Self {
            header: PrimaryHeader::empty(),
            fields: Fields::new(),
            signature: Signature::new(),
            body: Vec::new(),
            body_pos: 0,
            sig_pos: 0,
        }
    }

    /// Reset this message to a little-endian method call, allocating the
    /// next process-wide serial.
    ///
    /// The field dictionary is populated with DESTINATION, PATH, INTERFACE
    /// and MEMBER; body, signature and cursors are cleared. Returns the
    /// assigned serial.
    pub fn prepare_call(
        &mut self,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Result<u32> {
        self.header = PrimaryHeader::new(Type::MethodCall);
        self.fields.clear();
        self.fields
            .replace(FieldCode::Destination, Variant::from(destination));
        self.fields
            .replace(FieldCode::Path, Variant::Path(ObjectPath::new(path)?));
        self.fields
            .replace(FieldCode::Interface, Variant::from(interface));
        self.fields.replace(FieldCode::Member, Variant::from(member));
        self.signature.clear();
        self.body.clear();
        self.body_pos = 0;
        self.sig_pos = 0;
        Ok(self.header.serial_num())
    }

    /// Append one argument to the body, extending the signature.
    pub fn add_argument<T: Append>(&mut self, arg: &T) -> Result<()> {
        let mut enc = Encoder::new(&mut self.body);
        arg.append(&mut enc)?;
        self.signature.push(T::CODE);
        Ok(())
    }

    /// Append a dictionary as `a{KV}`: a back-patched byte length, then
    /// 8-aligned key/value entries.
    ///
    /// Entries are encoded in slice order. As the wire format requires, the
    /// length counts the entry bytes only, not the padding that aligns the
    /// first entry.
    pub fn add_dict<K, V>(&mut self, entries: &[(K, V)]) -> Result<()>
    where
        K: Append + Basic,
        V: Append,
    {
        let mut enc = Encoder::new(&mut self.body);
        let slot = enc.reserve_u32();
        enc.pad(8);
        let start = enc.position();
        for (key, value) in entries {
            enc.pad(8);
            key.append(&mut enc)?;
            value.append(&mut enc)?;
        }
        let len = enc.position() - start;
        enc.patch_u32(slot, len as u32);

        for code in [
            TypeCode::Array,
            TypeCode::DictBegin,
            K::CODE,
            V::CODE,
            TypeCode::DictEnd,
        ] {
            self.signature.push(code);
        }
        Ok(())
    }

    /// Extract the next argument, validating it against the body signature.
    pub fn extract_argument<T: Get>(&mut self) -> Result<T> {
        self.check_signature(T::CODE)?;
        let mut dec = Decoder::new(&self.body, self.header.endian_sig());
        dec.seek(self.body_pos);
        let value = T::get(&mut dec)?;
        self.body_pos = dec.position();
        Ok(value)
    }

    /// Extract a dictionary encoded as `a{KV}`.
    pub fn extract_dict<K, V>(&mut self) -> Result<Vec<(K, V)>>
    where
        K: Get + Basic,
        V: Get,
    {
        let expected = [
            TypeCode::Array,
            TypeCode::DictBegin,
            K::CODE,
            V::CODE,
            TypeCode::DictEnd,
        ];
        for (i, code) in expected.iter().enumerate() {
            match self.signature.code_at(self.sig_pos + i) {
                Some(actual) if actual == *code => {}
                Some(actual) => {
                    return Err(Error::WrongSignature {
                        expected: *code,
                        actual,
                    })
                }
                None => {
                    return Err(Error::Malformed(format!(
                        "no dictionary left in signature `{}`",
                        self.signature
                    )))
                }
            }
        }
        self.sig_pos += expected.len();

        let mut dec = Decoder::new(&self.body, self.header.endian_sig());
        dec.seek(self.body_pos);
        let len = dec.get_u32()? as usize;
        dec.align(8)?;
        let end = dec.position() + len;
        let mut entries = Vec::new();
        while dec.position() < end {
            dec.align(8)?;
            let key = K::get(&mut dec)?;
            let value = V::get(&mut dec)?;
            entries.push((key, value));
        }
        self.body_pos = dec.position();
        Ok(entries)
    }

    fn check_signature(&mut self, expected: TypeCode) -> Result<()> {
        match self.signature.code_at(self.sig_pos) {
            Some(actual) if actual == expected => {
                self.sig_pos += 1;
                Ok(())
            }
            Some(actual) => Err(Error::WrongSignature { expected, actual }),
            None => Err(Error::Malformed(format!(
                "no argument left in signature `{}`",
                self.signature
            ))),
        }
    }

    /// Marshal the header image: fixed header, back-patched fields array,
    /// padding to an 8-byte boundary.
    ///
    /// The body is transmitted separately, right after the returned buffer.
    /// A SIGNATURE field is inserted first when the body is non-empty and
    /// none is present yet.
    pub fn serialize(&mut self) -> Result<Vec<u8>> {
        if !self.body.is_empty() && self.fields.get(FieldCode::Signature).is_none() {
            self.fields
                .replace(FieldCode::Signature, Variant::Sig(self.signature.clone()));
        }
        self.header.set_body_len(self.body.len() as u32);

        let mut buf = Vec::with_capacity(MIN_MESSAGE_SIZE + 256);
        let mut enc = Encoder::new(&mut buf);
        self.header.write(&mut enc);
        let slot = enc.reserve_u32();
        for (code, value) in self.fields.iter() {
            enc.pad(8);
            enc.put_u8(*code as u8);
            enc.put_variant(value)?;
        }
        let fields_len = enc.position() - (slot + 4);
        enc.patch_u32(slot, fields_len as u32);
        enc.pad(8);

        if buf.len() + self.body.len() > MAX_MESSAGE_SIZE {
            return Err(Error::Malformed(format!(
                "message of {} bytes exceeds the 128 MiB limit",
                buf.len() + self.body.len()
            )));
        }
        Ok(buf)
    }

    /// Parse a complete wire image: fixed header, fields array, padding to
    /// 8, then the body the header announced. Accepts either endianness.
    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        let (header, fields_len) = PrimaryHeader::read(bytes)?;
        let header_len = MIN_MESSAGE_SIZE + fields_len as usize;
        let body_offset = header_len + padding_for_8_bytes(header_len);
        let body_len = header.body_len() as usize;
        let total_len = body_offset + body_len;
        if total_len > MAX_MESSAGE_SIZE {
            return Err(Error::Malformed(format!(
                "message of {total_len} bytes exceeds the 128 MiB limit"
            )));
        }
        if bytes.len() < total_len {
            return Err(Error::ShortRead {
                needed: total_len,
                available: bytes.len(),
            });
        }

        let mut fields = Fields::new();
        let mut dec = Decoder::new(&bytes[..header_len], header.endian_sig());
        dec.seek(MIN_MESSAGE_SIZE);
        while dec.position() < header_len {
            dec.align(8)?;
            let code = dec.get_u8()?;
            let value = dec.get_variant()?;
            match FieldCode::try_from(code) {
                Ok(code) => fields.replace(code, value),
                // Unknown fields must be ignored.
                Err(_) => trace!("Ignoring unknown header field {code}"),
            }
        }

        let signature = match fields.get(FieldCode::Signature) {
            Some(value) => value.get::<Signature>()?.clone(),
            None => Signature::new(),
        };

        Ok(Message {
            header,
            fields,
            signature,
            body: bytes[body_offset..total_len].to_vec(),
            body_pos: 0,
            sig_pos: 0,
        })
    }

    /// The fixed header.
    pub fn primary_header(&self) -> &PrimaryHeader {
        &self.header
    }

    /// The message type.
    pub fn message_type(&self) -> Type {
        self.header.msg_type()
    }

    /// The serial number of this message.
    pub fn serial(&self) -> u32 {
        self.header.serial_num()
    }

    /// Whether this is a reply to a method call.
    pub fn is_reply(&self) -> bool {
        self.message_type() == Type::MethodReturn
    }

    /// Whether this is an error reply.
    pub fn is_error(&self) -> bool {
        self.message_type() == Type::Error
    }

    /// Whether this is a signal emission.
    pub fn is_signal(&self) -> bool {
        self.message_type() == Type::Signal
    }

    /// The serial of the message this message is a reply to.
    pub fn reply_serial(&self) -> Result<u32> {
        Ok(*self.require(FieldCode::ReplySerial)?.get::<u32>()?)
    }

    /// The name of the error that occurred, for errors.
    pub fn error_name(&self) -> Result<&str> {
        Ok(self.require(FieldCode::ErrorName)?.get::<String>()?)
    }

    /// The object to send a call to, or the object a signal is emitted from.
    pub fn path(&self) -> Result<&ObjectPath> {
        self.require(FieldCode::Path)?.get::<ObjectPath>()
    }

    /// The interface to invoke a method call on, or that a signal is
    /// emitted from.
    pub fn interface(&self) -> Result<&str> {
        Ok(self.require(FieldCode::Interface)?.get::<String>()?)
    }

    /// The member, either the method name or signal name.
    pub fn member(&self) -> Result<&str> {
        Ok(self.require(FieldCode::Member)?.get::<String>()?)
    }

    /// The name of the connection this message is intended for.
    pub fn destination(&self) -> Option<&str> {
        self.fields
            .get(FieldCode::Destination)
            .and_then(|v| v.get::<String>().ok())
            .map(String::as_str)
    }

    /// Unique name of the sending connection.
    pub fn sender(&self) -> Option<&str> {
        self.fields
            .get(FieldCode::Sender)
            .and_then(|v| v.get::<String>().ok())
            .map(String::as_str)
    }

    /// Set the unique name of the sending connection.
    pub fn set_sender(&mut self, sender: &str) {
        self.fields.replace(FieldCode::Sender, Variant::from(sender));
    }

    /// The signature of the message body.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub(crate) fn body(&self) -> &[u8] {
        &self.body
    }

    pub(crate) fn fields_mut(&mut self) -> &mut Fields {
        &mut self.fields
    }

    fn require(&self, code: FieldCode) -> Result<&Variant> {
        self.fields.get(code).ok_or(Error::MissingField(code))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut msg = f.debug_struct("Msg");
        msg.field("type", &self.message_type());
        msg.field("serial", &self.serial());
        if let Some(sender) = self.sender() {
            msg.field("sender", &sender);
        }
        if let Ok(serial) = self.reply_serial() {
            msg.field("reply-serial", &serial);
        }
        if let Ok(path) = self.path() {
            msg.field("path", &path);
        }
        if let Ok(iface) = self.interface() {
            msg.field("iface", &iface);
        }
        if let Ok(member) = self.member() {
            msg.field("member", &member);
        }
        msg.field("body", &self.signature.as_str());
        msg.finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message_type() {
            Type::Invalid => write!(f, "Invalid message")?,
            Type::MethodCall => {
                write!(f, "Method call")?;
                if let Ok(member) = self.member() {
                    write!(f, " {member}")?;
                }
            }
            Type::MethodReturn => write!(f, "Method return")?,
            Type::Error => {
                write!(f, "Error")?;
                if let Ok(name) = self.error_name() {
                    write!(f, " {name}")?;
                }
            }
            Type::Signal => {
                write!(f, "Signal")?;
                if let Ok(member) = self.member() {
                    write!(f, " {member}")?;
                }
            }
        }

        if let Some(sender) = self.sender() {
            write!(f, " from {sender}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DBUS_SERVICE: &str = "org.freedesktop.DBus";
    const DBUS_PATH: &str = "/org/freedesktop/DBus";

    fn hello() -> (Message, u32) {
        let mut msg = Message::new();
        let serial = msg
            .prepare_call(DBUS_SERVICE, DBUS_PATH, DBUS_SERVICE, "Hello")
            .unwrap();
        (msg, serial)
    }

    #[test]
    fn hello_serialization() {
        let (mut msg, serial) = hello();
        let buf = msg.serialize().unwrap();

        // Little-endian METHOD_CALL, flags 0, version 1, empty body.
        assert_eq!(&buf[..4], &[0x6c, 0x01, 0x00, 0x01]);
        assert_eq!(&buf[4..8], &[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(buf[8..12], serial.to_le_bytes());
        // The four Hello fields marshal to exactly 110 bytes.
        assert_eq!(buf[12..16], 110u32.to_le_bytes());
        assert_eq!(buf.len(), 128);
        assert_eq!(buf.len() % 8, 0);
    }

    #[test]
    fn serialize_length_is_a_multiple_of_8() {
        let mut msg = Message::new();
        msg.prepare_call(DBUS_SERVICE, DBUS_PATH, DBUS_SERVICE, "GetNameOwner")
            .unwrap();
        msg.add_argument(&"org.freedesktop.DBus").unwrap();
        let buf = msg.serialize().unwrap();
        assert_eq!(buf.len() % 8, 0);
    }

    #[test]
    fn fields_length_matches_serialized_fields() {
        let (mut msg, _) = hello();
        let buf = msg.serialize().unwrap();
        let mut len = [0u8; 4];
        len.copy_from_slice(&buf[12..16]);
        let fields_len = u32::from_le_bytes(len) as usize;
        let unpadded = MIN_MESSAGE_SIZE + fields_len;
        assert!(buf.len() - unpadded < 8);
        assert!(buf[unpadded..].iter().all(|b| *b == 0));
    }

    #[test]
    fn byte_then_uint32_padding() {
        let mut msg = Message::new();
        msg.prepare_call(DBUS_SERVICE, DBUS_PATH, DBUS_SERVICE, "M")
            .unwrap();
        msg.add_argument(&0xaau8).unwrap();
        msg.add_argument(&0xdeadbeefu32).unwrap();

        assert_eq!(msg.signature().as_str(), "yu");
        assert_eq!(msg.body.len(), 8);
        assert_eq!(&msg.body[..4], &[0xaa, 0x00, 0x00, 0x00]);
        assert_eq!(msg.body[4..8], 0xdeadbeefu32.to_le_bytes());
    }

    #[test]
    fn string_argument_roundtrip() {
        let mut msg = Message::new();
        msg.prepare_call(DBUS_SERVICE, DBUS_PATH, DBUS_SERVICE, "M")
            .unwrap();
        msg.add_argument(&"abc").unwrap();
        assert_eq!(
            msg.body,
            [0x03, 0x00, 0x00, 0x00, 0x61, 0x62, 0x63, 0x00]
        );

        let s: String = msg.extract_argument().unwrap();
        assert_eq!(s, "abc");
        assert_eq!(msg.body_pos, 8);
    }

    #[test]
    fn serialize_parse_identity() {
        let mut msg = Message::new();
        msg.prepare_call(DBUS_SERVICE, DBUS_PATH, DBUS_SERVICE, "Mixed")
            .unwrap();
        msg.add_argument(&7u8).unwrap();
        msg.add_argument(&"payload").unwrap();
        msg.add_argument(&-1i64).unwrap();
        msg.add_argument(&Variant::from(13u16)).unwrap();

        let mut wire = msg.serialize().unwrap();
        wire.extend_from_slice(msg.body());

        let parsed = Message::from_bytes(&wire).unwrap();
        assert_eq!(parsed.primary_header(), msg.primary_header());
        assert_eq!(parsed.fields, msg.fields);
        assert_eq!(parsed.signature().as_str(), "ysxv");
        assert_eq!(parsed.body, msg.body);
    }

    #[test]
    fn parsed_arguments_match_added_ones() {
        let mut msg = Message::new();
        msg.prepare_call(DBUS_SERVICE, DBUS_PATH, DBUS_SERVICE, "M")
            .unwrap();
        msg.add_argument(&true).unwrap();
        msg.add_argument(&2.5f64).unwrap();
        msg.add_argument(&"hi").unwrap();

        let mut wire = msg.serialize().unwrap();
        wire.extend_from_slice(msg.body());
        let mut parsed = Message::from_bytes(&wire).unwrap();

        assert!(parsed.extract_argument::<bool>().unwrap());
        assert_eq!(parsed.extract_argument::<f64>().unwrap(), 2.5);
        assert_eq!(parsed.extract_argument::<String>().unwrap(), "hi");
    }

    #[test]
    fn serialize_inserts_signature_field() {
        let mut msg = Message::new();
        msg.prepare_call(DBUS_SERVICE, DBUS_PATH, DBUS_SERVICE, "M")
            .unwrap();
        msg.add_argument(&1u32).unwrap();
        msg.serialize().unwrap();

        let field = msg.fields.get(FieldCode::Signature).unwrap();
        assert_eq!(field.get::<Signature>().unwrap().as_str(), "u");
    }

    #[test]
    fn prepare_call_serials_are_monotonic() {
        let mut msg = Message::new();
        let first = msg
            .prepare_call(DBUS_SERVICE, DBUS_PATH, DBUS_SERVICE, "A")
            .unwrap();
        let second = msg
            .prepare_call(DBUS_SERVICE, DBUS_PATH, DBUS_SERVICE, "B")
            .unwrap();
        assert!(second > first);
    }

    #[test]
    fn dict_back_patched_length_is_exact() {
        let mut msg = Message::new();
        msg.prepare_call(DBUS_SERVICE, DBUS_PATH, DBUS_SERVICE, "M")
            .unwrap();
        let entries = [(
            FieldCode::Path,
            Variant::Path(ObjectPath::new("/a").unwrap()),
        )];
        msg.add_dict(&entries).unwrap();

        assert_eq!(msg.signature().as_str(), "a{yv}");
        // u32 length, padding to 8, then a single 11-byte entry.
        let mut len = [0u8; 4];
        len.copy_from_slice(&msg.body[..4]);
        assert_eq!(u32::from_le_bytes(len), 11);
        assert_eq!(msg.body.len(), 19);
    }

    #[test]
    fn dict_roundtrip() {
        let mut msg = Message::new();
        msg.prepare_call(DBUS_SERVICE, DBUS_PATH, DBUS_SERVICE, "M")
            .unwrap();
        let entries = vec![
            (String::from("one"), Variant::from(1u32)),
            (String::from("two"), Variant::from("second")),
        ];
        msg.add_dict(&entries).unwrap();

        let back: Vec<(String, Variant)> = msg.extract_dict().unwrap();
        assert_eq!(back, entries);
    }

    #[test]
    fn wrong_signature_is_reported() {
        let mut msg = Message::new();
        msg.prepare_call(DBUS_SERVICE, DBUS_PATH, DBUS_SERVICE, "M")
            .unwrap();
        msg.add_argument(&1u32).unwrap();

        match msg.extract_argument::<String>() {
            Err(Error::WrongSignature { expected, actual }) => {
                assert_eq!(expected, TypeCode::String);
                assert_eq!(actual, TypeCode::Uint32);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn exhausted_signature_is_reported() {
        let mut msg = Message::new();
        msg.prepare_call(DBUS_SERVICE, DBUS_PATH, DBUS_SERVICE, "M")
            .unwrap();
        assert!(matches!(
            msg.extract_argument::<u32>(),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn missing_required_field_is_reported() {
        let msg = Message::new();
        assert!(matches!(
            msg.reply_serial(),
            Err(Error::MissingField(FieldCode::ReplySerial))
        ));
        assert!(matches!(
            msg.error_name(),
            Err(Error::MissingField(FieldCode::ErrorName))
        ));
    }

    #[test]
    fn kind_predicates_follow_header_type() {
        let wire = {
            let buf = [
                b'l', 4, 0, 1, // SIGNAL
                0, 0, 0, 0, //
                9, 0, 0, 0, //
                0, 0, 0, 0, //
            ];
            Message::from_bytes(&buf).unwrap()
        };
        assert!(wire.is_signal());
        assert!(!wire.is_reply());
        assert!(!wire.is_error());
    }

    #[test]
    fn big_endian_message_is_parsed() {
        let buf = [
            b'B', 2, 0, 1, //
            0, 0, 0, 0, //
            0, 0, 0, 7, //
            0, 0, 0, 0, //
        ];
        let msg = Message::from_bytes(&buf).unwrap();
        assert_eq!(msg.serial(), 7);
        assert!(msg.is_reply());
    }
}
