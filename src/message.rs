//! Message assembly and parsing: header, field table, serial allocation
//! (§4.4). <https://dbus.freedesktop.org/doc/dbus-specification.html#message-protocol-marshaling>

use std::str::FromStr;

use crate::codec::{Decoder, Encoder, Endianness, MAX_MESSAGE_SIZE};
use crate::error::{Error, Result};
use crate::names::{BusOrUniqueName, ErrorName, InterfaceName, MemberName, UniqueName};
use crate::signature::{self, Type};
use crate::value::Value;

/// Major protocol version of the sending application (§3). Messages whose
/// major version doesn't match this must be rejected.
pub const PROTOCOL_VERSION: u8 = 1;

/// The serial of a message, used as a cookie to correlate a reply with its
/// call. Zero is reserved and never assigned to an outgoing message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Serial(pub u32);

/// Message type (§3): which of the four kinds of D-Bus traffic this is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageType {
    fn to_u8(self) -> u8 {
        match self {
            MessageType::MethodCall => 1,
            MessageType::MethodReturn => 2,
            MessageType::Error => 3,
            MessageType::Signal => 4,
        }
    }

    fn from_u8(v: u8) -> Result<MessageType> {
        match v {
            1 => Ok(MessageType::MethodCall),
            2 => Ok(MessageType::MethodReturn),
            3 => Ok(MessageType::Error),
            4 => Ok(MessageType::Signal),
            other => Err(Error::Protocol(format!(
                "unsupported message type {}",
                other
            ))),
        }
    }
}

bitflags! {
    /// Header flags (§3). Unknown bits are preserved but ignored.
    pub struct HeaderFlags: u8 {
        const NO_REPLY_EXPECTED = 0x1;
        const NO_AUTO_START = 0x2;
        const ALLOW_INTERACTIVE_AUTHORIZATION = 0x4;
    }
}

/// Header field codes (§3). `Invalid` (0) must never appear on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum FieldCode {
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
    UnixFds = 9,
}

/// The parsed header field table: one optional slot per recognized field
/// code (§3). Unrecognized field codes are preserved verbatim so that a
/// message can be forwarded without losing information the application
/// never asked to interpret.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeaderFields {
    pub path: Option<String>,
    pub interface: Option<InterfaceName>,
    pub member: Option<MemberName>,
    pub error_name: Option<ErrorName>,
    pub reply_serial: Option<u32>,
    pub destination: Option<BusOrUniqueName>,
    pub sender: Option<UniqueName>,
    pub signature: Option<Vec<Type>>,
    pub unix_fds: Option<u32>,
    unrecognized: Vec<(u8, Value)>,
}

impl HeaderFields {
    fn to_entries(&self, body_signature: &str) -> Result<Vec<Value>> {
        let mut entries = Vec::new();
        let push = |entries: &mut Vec<Value>, code: FieldCode, ty: Type, value: Value| {
            entries.push(Value::Struct(vec![
                Value::Byte(code as u8),
                Value::Variant(ty, Box::new(value)),
            ]));
        };
        if let Some(path) = &self.path {
            push(
                &mut entries,
                FieldCode::Path,
                Type::ObjectPath,
                Value::ObjectPath(path.clone()),
            );
        }
        if let Some(interface) = &self.interface {
            push(
                &mut entries,
                FieldCode::Interface,
                Type::String,
                Value::String(interface.to_string()),
            );
        }
        if let Some(member) = &self.member {
            push(
                &mut entries,
                FieldCode::Member,
                Type::String,
                Value::String(member.to_string()),
            );
        }
        if let Some(error_name) = &self.error_name {
            push(
                &mut entries,
                FieldCode::ErrorName,
                Type::String,
                Value::String(error_name.to_string()),
            );
        }
        if let Some(reply_serial) = self.reply_serial {
            push(
                &mut entries,
                FieldCode::ReplySerial,
                Type::Uint32,
                Value::Uint32(reply_serial),
            );
        }
        if let Some(destination) = &self.destination {
            push(
                &mut entries,
                FieldCode::Destination,
                Type::String,
                Value::String(destination.to_string()),
            );
        }
        if let Some(sender) = &self.sender {
            push(
                &mut entries,
                FieldCode::Sender,
                Type::String,
                Value::String(sender.to_string()),
            );
        }
        if !body_signature.is_empty() {
            push(
                &mut entries,
                FieldCode::Signature,
                Type::Signature,
                Value::Signature(body_signature.to_string()),
            );
        }
        if let Some(unix_fds) = self.unix_fds {
            push(
                &mut entries,
                FieldCode::UnixFds,
                Type::Uint32,
                Value::Uint32(unix_fds),
            );
        }
        for (code, value) in &self.unrecognized {
            entries.push(Value::Struct(vec![
                Value::Byte(*code),
                Value::Variant(value.ty(), Box::new(value.clone())),
            ]));
        }
        Ok(entries)
    }

    fn from_entries(entries: Vec<Value>) -> Result<HeaderFields> {
        let mut fields = HeaderFields::default();
        for entry in entries {
            let (code, value) = match entry {
                Value::Struct(mut parts) if parts.len() == 2 => {
                    let variant = parts.pop().unwrap();
                    let code = parts.pop().unwrap();
                    let code = match code {
                        Value::Byte(b) => b,
                        other => {
                            return Err(Error::Protocol(format!(
                                "header field code must be a byte, got {:?}",
                                other
                            )))
                        }
                    };
                    let inner = match variant {
                        Value::Variant(_, inner) => *inner,
                        other => {
                            return Err(Error::Protocol(format!(
                                "header field value must be a variant, got {:?}",
                                other
                            )))
                        }
                    };
                    (code, inner)
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "header field entry must be a (y,v) struct, got {:?}",
                        other
                    )))
                }
            };
            match code {
                c if c == FieldCode::Path as u8 => {
                    fields.path = Some(expect_object_path(value)?)
                }
                c if c == FieldCode::Interface as u8 => {
                    fields.interface = Some(expect_name(value, InterfaceName::from_str)?)
                }
                c if c == FieldCode::Member as u8 => {
                    fields.member = Some(expect_name(value, MemberName::from_str)?)
                }
                c if c == FieldCode::ErrorName as u8 => {
                    fields.error_name = Some(expect_name(value, ErrorName::from_str)?)
                }
                c if c == FieldCode::ReplySerial as u8 => {
                    fields.reply_serial = Some(expect_u32(value)?)
                }
                c if c == FieldCode::Destination as u8 => {
                    fields.destination = Some(expect_name(value, BusOrUniqueName::from_str)?)
                }
                c if c == FieldCode::Sender as u8 => {
                    fields.sender = Some(expect_name(value, UniqueName::from_str)?)
                }
                c if c == FieldCode::Signature as u8 => {
                    fields.signature = Some(expect_signature(value)?)
                }
                c if c == FieldCode::UnixFds as u8 => fields.unix_fds = Some(expect_u32(value)?),
                0 => return Err(Error::Protocol("header field code 0 is invalid".into())),
                other => fields.unrecognized.push((other, value)),
            }
        }
        Ok(fields)
    }
}

fn expect_object_path(value: Value) -> Result<String> {
    match value {
        Value::ObjectPath(s) => Ok(s),
        other => Err(Error::Protocol(format!(
            "expected object path header field, got {:?}",
            other
        ))),
    }
}

fn expect_u32(value: Value) -> Result<u32> {
    match value {
        Value::Uint32(v) => Ok(v),
        other => Err(Error::Protocol(format!(
            "expected uint32 header field, got {:?}",
            other
        ))),
    }
}

fn expect_signature(value: Value) -> Result<Vec<Type>> {
    match value {
        Value::Signature(s) => signature::parse(&s),
        other => Err(Error::Protocol(format!(
            "expected signature header field, got {:?}",
            other
        ))),
    }
}

fn expect_name<T, E: std::fmt::Display>(
    value: Value,
    parse: impl Fn(&str) -> std::result::Result<T, E>,
) -> Result<T> {
    match value {
        Value::String(s) => {
            parse(&s).map_err(|e| Error::Protocol(format!("invalid name `{}`: {}", s, e)))
        }
        other => Err(Error::Protocol(format!(
            "expected string header field, got {:?}",
            other
        ))),
    }
}

/// A complete D-Bus message: header plus body (§3).
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub flags: HeaderFlags,
    pub serial: Serial,
    pub fields: HeaderFields,
    pub body: Vec<Value>,
}

impl Message {
    /// Required/forbidden fields by message type (§4.4).
    fn validate_fields(message_type: MessageType, fields: &HeaderFields) -> Result<()> {
        let missing =
            |name: &str| Error::Protocol(format!("{:?} message missing {}", message_type, name));
        let forbidden = |name: &str| {
            Error::Protocol(format!("{:?} message must not carry {}", message_type, name))
        };
        match message_type {
            MessageType::MethodCall => {
                if fields.path.is_none() {
                    return Err(missing("PATH"));
                }
                if fields.member.is_none() {
                    return Err(missing("MEMBER"));
                }
                if fields.reply_serial.is_some() {
                    return Err(forbidden("REPLY_SERIAL"));
                }
                if fields.error_name.is_some() {
                    return Err(forbidden("ERROR_NAME"));
                }
            }
            MessageType::MethodReturn => {
                if fields.reply_serial.is_none() {
                    return Err(missing("REPLY_SERIAL"));
                }
                if fields.member.is_some() {
                    return Err(forbidden("MEMBER"));
                }
                if fields.error_name.is_some() {
                    return Err(forbidden("ERROR_NAME"));
                }
            }
            MessageType::Error => {
                if fields.reply_serial.is_none() {
                    return Err(missing("REPLY_SERIAL"));
                }
                if fields.error_name.is_none() {
                    return Err(missing("ERROR_NAME"));
                }
                if fields.member.is_some() {
                    return Err(forbidden("MEMBER"));
                }
            }
            MessageType::Signal => {
                if fields.path.is_none() {
                    return Err(missing("PATH"));
                }
                if fields.interface.is_none() {
                    return Err(missing("INTERFACE"));
                }
                if fields.member.is_none() {
                    return Err(missing("MEMBER"));
                }
                if fields.reply_serial.is_some() {
                    return Err(forbidden("REPLY_SERIAL"));
                }
                if fields.error_name.is_some() {
                    return Err(forbidden("ERROR_NAME"));
                }
            }
        }
        Ok(())
    }

    /// Serialize header and body into one contiguous buffer (§4.4). The
    /// header is padded to an 8-byte boundary before the body begins.
    pub fn serialize(&self, endian: Endianness) -> Result<Vec<u8>> {
        Self::validate_fields(self.message_type, &self.fields)?;
        if self.serial.0 == 0 {
            return Err(Error::Protocol("serial must be nonzero".into()));
        }

        let body_types: Vec<Type> = self.body.iter().map(Value::ty).collect();
        let body_signature = signature::render(&body_types);
        if let Some(declared) = &self.fields.signature {
            if signature::render(declared) != body_signature {
                return Err(Error::Protocol(
                    "SIGNATURE header field does not match body".into(),
                ));
            }
        }

        let mut body_enc = Encoder::new(endian);
        for value in &self.body {
            body_enc.write_value(value)?;
        }
        let body_bytes = body_enc.into_bytes();

        let field_entries = self.fields.to_entries(&body_signature)?;
        let fields_value =
            Value::Array(Type::Struct(vec![Type::Byte, Type::Variant]), field_entries);

        let mut header = Encoder::new(endian);
        header.write_u8(endian.tag());
        header.write_u8(self.message_type.to_u8());
        header.write_u8(self.flags.bits());
        header.write_u8(PROTOCOL_VERSION);
        header.write_u32(body_bytes.len() as u32);
        header.write_u32(self.serial.0);
        header.write_value(&fields_value)?;
        header.align_to(8);
        let mut bytes = header.into_bytes();
        bytes.extend_from_slice(&body_bytes);

        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(Error::Protocol(format!(
                "message of {} bytes exceeds maximum size of {}",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        Ok(bytes)
    }

    /// Parse a complete message out of a byte buffer previously framed by
    /// the transport (§4.4, §4.5). `bytes` must hold exactly one message.
    pub fn deserialize(bytes: &[u8]) -> Result<Message> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(Error::Protocol(format!(
                "message of {} bytes exceeds maximum size of {}",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        if bytes.len() < 16 {
            return Err(Error::read_buffer(0, "message shorter than fixed header"));
        }
        let endian = Endianness::from_tag(bytes[0])?;
        let mut dec = Decoder::new(bytes, endian);
        dec.read_u8()?; // endian tag, already resolved above
        let message_type = MessageType::from_u8(dec.read_u8()?)?;
        let flags = HeaderFlags::from_bits_truncate(dec.read_u8()?);
        let protocol_version = dec.read_u8()?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported protocol version {}",
                protocol_version
            )));
        }
        let body_length = dec.read_u32()?;
        let serial = dec.read_u32()?;
        if serial == 0 {
            return Err(Error::Protocol("serial must be nonzero".into()));
        }

        let fields_ty = Type::Array(Box::new(Type::Struct(vec![Type::Byte, Type::Variant])));
        let fields_value = dec.read_value(&fields_ty)?;
        let entries = match fields_value {
            Value::Array(_, entries) => entries,
            _ => unreachable!("array type always decodes to Value::Array"),
        };
        let fields = HeaderFields::from_entries(entries)?;
        dec.align_to(8)?;

        Self::validate_fields(message_type, &fields)?;

        let body_start = dec.offset();
        let body_end = body_start
            .checked_add(body_length as usize)
            .ok_or_else(|| Error::read_buffer(body_start, "body length overflow"))?;
        if body_end != bytes.len() {
            return Err(Error::read_buffer(
                body_start,
                "declared body length does not match framed message size",
            ));
        }

        let body_types = fields.signature.clone().unwrap_or_default();
        if body_types.is_empty() && body_length != 0 {
            return Err(Error::Protocol(
                "message has a body but no SIGNATURE header field".into(),
            ));
        }
        let mut body = Vec::with_capacity(body_types.len());
        for ty in &body_types {
            body.push(dec.read_value(ty)?);
        }
        if dec.offset() != body_end {
            return Err(Error::read_buffer(
                dec.offset(),
                "body did not consume exactly the declared length",
            ));
        }

        Ok(Message {
            message_type,
            flags,
            serial: Serial(serial),
            fields,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn hello_call() -> Message {
        Message {
            message_type: MessageType::MethodCall,
            flags: HeaderFlags::empty(),
            serial: Serial(1),
            fields: HeaderFields {
                path: Some("/org/freedesktop/DBus".into()),
                interface: Some(InterfaceName::from_str("org.freedesktop.DBus").unwrap()),
                member: Some(MemberName::from_str("Hello").unwrap()),
                destination: Some(BusOrUniqueName::from_str("org.freedesktop.DBus").unwrap()),
                ..Default::default()
            },
            body: vec![],
        }
    }

    #[test]
    fn round_trips_header_and_empty_body() {
        let msg = hello_call();
        let bytes = msg.serialize(Endianness::Little).unwrap();
        let parsed = Message::deserialize(&bytes).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn round_trips_with_body_and_big_endian() {
        let mut msg = hello_call();
        msg.body = vec![Value::String("hi".into()), Value::Uint32(7)];
        let bytes = msg.serialize(Endianness::Big).unwrap();
        let parsed = Message::deserialize(&bytes).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn rejects_method_call_missing_member() {
        let mut msg = hello_call();
        msg.fields.member = None;
        assert!(msg.serialize(Endianness::Little).is_err());
    }

    #[test]
    fn rejects_method_return_with_member() {
        let msg = Message {
            message_type: MessageType::MethodReturn,
            flags: HeaderFlags::empty(),
            serial: Serial(2),
            fields: HeaderFields {
                reply_serial: Some(1),
                member: Some(MemberName::from_str("Oops").unwrap()),
                ..Default::default()
            },
            body: vec![],
        };
        assert!(msg.serialize(Endianness::Little).is_err());
    }

    #[test]
    fn rejects_zero_serial() {
        let mut msg = hello_call();
        msg.serial = Serial(0);
        assert!(msg.serialize(Endianness::Little).is_err());
    }

    #[test]
    fn signal_requires_path_interface_member() {
        let msg = Message {
            message_type: MessageType::Signal,
            flags: HeaderFlags::empty(),
            serial: Serial(3),
            fields: HeaderFields {
                path: Some("/dev".into()),
                interface: Some(InterfaceName::from_str("iface").unwrap()),
                ..Default::default()
            },
            body: vec![],
        };
        assert!(msg.serialize(Endianness::Little).is_err());
    }
}
