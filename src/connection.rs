//! Connection core: serial allocation, reply correlation, and routing of
//! everything that isn't a reply to the signal subscription index or the
//! local object dispatcher (§4.6).
//!
//! A [`Connection`] owns the transport and drives it synchronously. The
//! only points where it blocks are a transport read, a transport write, and
//! waiting for a call's reply (§5) — there is no background thread pumping
//! the socket on the application's behalf.

use std::io;
use std::str::FromStr;
use std::time::Instant;

use crate::codec::Endianness;
use crate::dispatch::{Interface, ObjectTree};
use crate::error::{Error, Result};
use crate::message::{HeaderFields, HeaderFlags, Message, MessageType, Serial};
use crate::names::{BusName, BusOrUniqueName, InterfaceName, UniqueName};
use crate::subscription::{RuleChange, Subscription, SubscriptionIndex, SubscriptionSpec};
use crate::transport::{self, Socket};
use crate::value::Value;

const BUS_DESTINATION: &str = "org.freedesktop.DBus";
const BUS_PATH: &str = "/org/freedesktop/DBus";
const BUS_INTERFACE: &str = "org.freedesktop.DBus";

bitflags! {
    /// Flags accepted by `RequestName` (§6).
    pub struct NameFlags: u32 {
        const ALLOW_REPLACEMENT = 0x1;
        const REPLACE_EXISTING = 0x2;
        const DO_NOT_QUEUE = 0x4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

impl RequestNameReply {
    fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(RequestNameReply::PrimaryOwner),
            2 => Ok(RequestNameReply::InQueue),
            3 => Ok(RequestNameReply::Exists),
            4 => Ok(RequestNameReply::AlreadyOwner),
            other => Err(Error::Protocol(format!(
                "unrecognized RequestName reply code {}",
                other
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
}

impl ReleaseNameReply {
    fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(ReleaseNameReply::Released),
            2 => Ok(ReleaseNameReply::NonExistent),
            3 => Ok(ReleaseNameReply::NotOwner),
            other => Err(Error::Protocol(format!(
                "unrecognized ReleaseName reply code {}",
                other
            ))),
        }
    }
}

/// A connection to a D-Bus daemon (or any peer speaking the protocol) over
/// a caller-supplied transport. The core never dials a socket itself; the
/// host connects it and hands ownership over here (§1, §4.5).
pub struct Connection {
    socket: Box<dyn Socket>,
    endian: Endianness,
    unique_name: Option<UniqueName>,
    next_serial: u32,
    subscriptions: SubscriptionIndex,
    objects: ObjectTree,
}

impl Connection {
    /// Perform the SASL handshake over `socket` and call `Hello` to obtain
    /// this connection's unique name. `uid` is used for the EXTERNAL and
    /// DBUS_COOKIE_SHA1 mechanisms.
    pub fn connect(socket: Box<dyn Socket>, uid: u32) -> Result<Connection> {
        let mut socket = socket;
        transport::handshake(socket.as_mut(), uid)?;
        let mut conn = Connection {
            socket,
            endian: Endianness::native(),
            unique_name: None,
            next_serial: 0,
            subscriptions: SubscriptionIndex::new(),
            objects: ObjectTree::new(),
        };
        conn.hello()?;
        Ok(conn)
    }

    fn hello(&mut self) -> Result<()> {
        let call = self.daemon_call("Hello", vec![]);
        let reply = self.call(call)?;
        match reply.body.first() {
            Some(Value::String(name)) => {
                self.unique_name = Some(
                    UniqueName::from_str(name)
                        .map_err(|e| Error::Protocol(format!("Hello returned {}: {}", name, e)))?,
                );
                Ok(())
            }
            other => Err(Error::Protocol(format!(
                "Hello reply must carry a single string, got {:?}",
                other
            ))),
        }
    }

    /// The unique name (`:N.M`) this daemon assigned to the connection.
    pub fn unique_name(&self) -> Option<&UniqueName> {
        self.unique_name.as_ref()
    }

    fn unique_name_str(&self) -> String {
        self.unique_name
            .as_ref()
            .map(|n| n.to_string())
            .unwrap_or_default()
    }

    fn next_serial(&mut self) -> Serial {
        loop {
            self.next_serial = self.next_serial.wrapping_add(1);
            if self.next_serial != 0 {
                return Serial(self.next_serial);
            }
        }
    }

    fn write_message(&mut self, msg: &Message) -> Result<()> {
        let bytes = msg.serialize(self.endian)?;
        transport::write_frame(self.socket.as_mut(), &bytes)
    }

    fn read_message(&mut self) -> Result<Message> {
        let bytes = transport::read_frame(self.socket.as_mut())?;
        Message::deserialize(&bytes)
    }

    fn is_timeout(err: &Error) -> bool {
        matches!(
            err,
            Error::Io(io_err) if matches!(
                io_err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            )
        )
    }

    /// Send a method call and block until its reply arrives, dispatching
    /// anything else that comes in first (signals to subscribers, method
    /// calls to locally registered objects). This is the "awaiting call
    /// completion" suspension point of §5.
    pub fn call(&mut self, mut message: Message) -> Result<Message> {
        message.flags.remove(HeaderFlags::NO_REPLY_EXPECTED);
        let serial = self.next_serial();
        message.serial = serial;
        self.write_message(&message)?;
        self.await_reply(serial)
    }

    /// As [`Connection::call`], but gives up with [`Error::Timeout`] once
    /// `deadline` passes. Enforcement between frames is best-effort unless
    /// the host has also set a read timeout on the underlying socket — a
    /// blocking read already in flight can only be interrupted by the
    /// socket itself timing out.
    pub fn call_with_deadline(&mut self, mut message: Message, deadline: Instant) -> Result<Message> {
        message.flags.remove(HeaderFlags::NO_REPLY_EXPECTED);
        let serial = self.next_serial();
        message.serial = serial;
        self.write_message(&message)?;
        loop {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            match self.read_message() {
                Ok(incoming) => {
                    if let Some(reply) = self.correlate(serial, incoming)? {
                        return Ok(reply);
                    }
                }
                Err(e) if Self::is_timeout(&e) => return Err(Error::Timeout),
                Err(e) => return Err(e),
            }
        }
    }

    fn await_reply(&mut self, serial: Serial) -> Result<Message> {
        loop {
            let incoming = match self.read_message() {
                Ok(msg) => msg,
                Err(e) if Self::is_timeout(&e) => return Err(Error::Timeout),
                Err(e) => return Err(e),
            };
            if let Some(reply) = self.correlate(serial, incoming)? {
                return Ok(reply);
            }
        }
    }

    /// If `incoming` is the reply to `serial`, consume it and return it;
    /// otherwise route it and report that the wait continues.
    fn correlate(&mut self, serial: Serial, incoming: Message) -> Result<Option<Message>> {
        if incoming.fields.reply_serial == Some(serial.0) {
            return match incoming.message_type {
                MessageType::MethodReturn => Ok(Some(incoming)),
                MessageType::Error => Err(self.remote_error(incoming)),
                other => Err(Error::Protocol(format!(
                    "message correlated to our serial has unexpected type {:?}",
                    other
                ))),
            };
        }
        self.route_incoming(incoming)?;
        Ok(None)
    }

    fn remote_error(&self, incoming: Message) -> Error {
        let name = incoming
            .fields
            .error_name
            .clone()
            .unwrap_or_else(|| crate::names::FAILED_ERROR_NAME.clone());
        let message = match incoming.body.first() {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        };
        Error::Remote { name, message }
    }

    /// Pump the connection once: flush any subscription rule changes queued
    /// up by dropped [`Subscription`] handles, then block for the next
    /// incoming message and route it. Hosts that aren't making calls of
    /// their own (pure servers) drive the connection by calling this in a
    /// loop.
    pub fn pump(&mut self) -> Result<()> {
        self.flush_subscription_changes()?;
        let incoming = self.read_message()?;
        self.route_incoming(incoming)
    }

    fn route_incoming(&mut self, msg: Message) -> Result<()> {
        match msg.message_type {
            MessageType::MethodCall => {
                let our_name = self.unique_name_str();
                let outcome = self.objects.dispatch(&msg, &our_name);
                if let Some(reply) = outcome.reply {
                    self.send_prepared(reply)?;
                }
                for signal in outcome.signals {
                    self.send_prepared(signal)?;
                }
                Ok(())
            }
            MessageType::Signal => {
                self.observe_name_owner_changed(&msg);
                self.subscriptions.dispatch_signal(&msg);
                Ok(())
            }
            MessageType::MethodReturn | MessageType::Error => {
                log::debug!(
                    "dropping message with reply_serial {:?} that matches no pending call",
                    msg.fields.reply_serial
                );
                Ok(())
            }
        }
    }

    fn observe_name_owner_changed(&mut self, msg: &Message) {
        let is_name_owner_changed = msg
            .fields
            .interface
            .as_ref()
            .map(|i| i.as_ref() == BUS_INTERFACE)
            .unwrap_or(false)
            && msg
                .fields
                .member
                .as_ref()
                .map(|m| m.as_ref() == "NameOwnerChanged")
                .unwrap_or(false);
        if !is_name_owner_changed {
            return;
        }
        if let [Value::String(name), _, Value::String(new_owner)] = msg.body.as_slice() {
            let owner = if new_owner.is_empty() {
                None
            } else {
                Some(new_owner.as_str())
            };
            self.subscriptions.update_name_owner(name, owner);
        }
    }

    fn send_prepared(&mut self, mut msg: Message) -> Result<()> {
        let serial = self.next_serial();
        msg.serial = serial;
        self.write_message(&msg)
    }

    /// Send a signal without waiting for (or expecting) a reply.
    pub fn emit_signal(&mut self, mut message: Message) -> Result<()> {
        message.flags.insert(HeaderFlags::NO_REPLY_EXPECTED);
        let serial = self.next_serial();
        message.serial = serial;
        self.write_message(&message)
    }

    fn flush_subscription_changes(&mut self) -> Result<()> {
        let changes = self.subscriptions.drain_removals();
        for change in changes {
            if let RuleChange::NoLongerNeeded(rule) = change {
                self.remove_match(&rule)?;
            }
        }
        Ok(())
    }

    /// Subscribe to signals matching `spec`, issuing `AddMatch` at the
    /// daemon if this is the first subscriber for that exact rule (§4.7).
    pub fn subscribe(
        &mut self,
        spec: SubscriptionSpec,
        sink: Box<dyn FnMut(&Message)>,
    ) -> Result<Subscription> {
        self.flush_subscription_changes()?;
        let (subscription, change) = self.subscriptions.subscribe(spec, sink);
        if let Some(RuleChange::NowNeeded(rule)) = change {
            self.add_match(&rule)?;
        }
        Ok(subscription)
    }

    /// Register an interface's methods/properties/signals at `path`, and
    /// emit `InterfacesAdded` if an ancestor path has object-manager
    /// semantics enabled (§4.8).
    pub fn register_interface(
        &mut self,
        path: &str,
        name: InterfaceName,
        interface: Interface,
    ) -> Result<()> {
        let our_name = self.unique_name_str();
        if let Some(signal) = self
            .objects
            .register_interface(path, name, interface, &our_name)?
        {
            self.emit_signal(signal)?;
        }
        Ok(())
    }

    pub fn enable_object_manager(&mut self, path: &str) -> Result<()> {
        self.objects.enable_object_manager(path)
    }

    pub fn unregister_interface(&mut self, path: &str, name: &InterfaceName) -> Result<()> {
        let our_name = self.unique_name_str();
        if let Some(signal) = self.objects.unregister_interface(path, name, &our_name) {
            self.emit_signal(signal)?;
        }
        Ok(())
    }

    fn daemon_call(&self, member: &str, body: Vec<Value>) -> Message {
        Message {
            message_type: MessageType::MethodCall,
            flags: HeaderFlags::empty(),
            serial: Serial(0),
            fields: HeaderFields {
                path: Some(BUS_PATH.to_string()),
                interface: Some(InterfaceName::from_str(BUS_INTERFACE).unwrap()),
                member: Some(member.parse().unwrap()),
                destination: Some(BusOrUniqueName::from_str(BUS_DESTINATION).unwrap()),
                ..Default::default()
            },
            body,
        }
    }

    /// `org.freedesktop.DBus.RequestName` (§6).
    pub fn request_name(&mut self, name: &BusName, flags: NameFlags) -> Result<RequestNameReply> {
        let call = self.daemon_call(
            "RequestName",
            vec![Value::String(name.to_string()), Value::Uint32(flags.bits())],
        );
        let reply = self.call(call)?;
        match reply.body.first() {
            Some(Value::Uint32(code)) => RequestNameReply::from_u32(*code),
            other => Err(Error::Protocol(format!(
                "RequestName reply must carry a uint32, got {:?}",
                other
            ))),
        }
    }

    /// `org.freedesktop.DBus.ReleaseName` (§6).
    pub fn release_name(&mut self, name: &BusName) -> Result<ReleaseNameReply> {
        let call = self.daemon_call("ReleaseName", vec![Value::String(name.to_string())]);
        let reply = self.call(call)?;
        match reply.body.first() {
            Some(Value::Uint32(code)) => ReleaseNameReply::from_u32(*code),
            other => Err(Error::Protocol(format!(
                "ReleaseName reply must carry a uint32, got {:?}",
                other
            ))),
        }
    }

    /// `org.freedesktop.DBus.ListNames` (§6).
    pub fn list_names(&mut self) -> Result<Vec<String>> {
        let call = self.daemon_call("ListNames", vec![]);
        let reply = self.call(call)?;
        extract_string_array(&reply, "ListNames")
    }

    /// `org.freedesktop.DBus.ListActivatableNames` (§6).
    pub fn list_activatable_names(&mut self) -> Result<Vec<String>> {
        let call = self.daemon_call("ListActivatableNames", vec![]);
        let reply = self.call(call)?;
        extract_string_array(&reply, "ListActivatableNames")
    }

    /// `org.freedesktop.DBus.NameHasOwner` (§6).
    pub fn name_has_owner(&mut self, name: &str) -> Result<bool> {
        let call = self.daemon_call("NameHasOwner", vec![Value::String(name.to_string())]);
        let reply = self.call(call)?;
        match reply.body.first() {
            Some(Value::Boolean(b)) => Ok(*b),
            other => Err(Error::Protocol(format!(
                "NameHasOwner reply must carry a boolean, got {:?}",
                other
            ))),
        }
    }

    /// `org.freedesktop.DBus.GetNameOwner` (§6). Also primes the
    /// subscription index's name-owner cache, since this is the usual way
    /// an application learns a well-known name's current owner.
    pub fn get_name_owner(&mut self, name: &str) -> Result<UniqueName> {
        let call = self.daemon_call("GetNameOwner", vec![Value::String(name.to_string())]);
        let reply = self.call(call)?;
        match reply.body.first() {
            Some(Value::String(owner)) => {
                let unique = UniqueName::from_str(owner)
                    .map_err(|e| Error::Protocol(format!("invalid unique name: {}", e)))?;
                self.subscriptions.update_name_owner(name, Some(owner));
                Ok(unique)
            }
            other => Err(Error::Protocol(format!(
                "GetNameOwner reply must carry a string, got {:?}",
                other
            ))),
        }
    }

    /// `org.freedesktop.DBus.GetConnectionUnixProcessID` (§6).
    pub fn get_connection_unix_process_id(&mut self, name: &str) -> Result<u32> {
        let call = self.daemon_call(
            "GetConnectionUnixProcessID",
            vec![Value::String(name.to_string())],
        );
        let reply = self.call(call)?;
        match reply.body.first() {
            Some(Value::Uint32(pid)) => Ok(*pid),
            other => Err(Error::Protocol(format!(
                "GetConnectionUnixProcessID reply must carry a uint32, got {:?}",
                other
            ))),
        }
    }

    fn add_match(&mut self, rule: &str) -> Result<()> {
        let call = self.daemon_call("AddMatch", vec![Value::String(rule.to_string())]);
        self.call(call)?;
        Ok(())
    }

    fn remove_match(&mut self, rule: &str) -> Result<()> {
        let call = self.daemon_call("RemoveMatch", vec![Value::String(rule.to_string())]);
        self.call(call)?;
        Ok(())
    }
}

fn extract_string_array(reply: &Message, member: &str) -> Result<Vec<String>> {
    match reply.body.first() {
        Some(Value::Array(_, items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(Error::Protocol(format!(
                    "{} reply array must hold strings, got {:?}",
                    member, other
                ))),
            })
            .collect(),
        other => Err(Error::Protocol(format!(
            "{} reply must carry a string array, got {:?}",
            member, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{Read, Write};

    #[derive(Default)]
    struct MockSocket {
        inbound: VecDeque<u8>,
        outbound: Vec<u8>,
    }

    impl Read for MockSocket {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inbound.is_empty() {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no more data"));
            }
            let n = buf.len().min(self.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbound.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockSocket {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn push_line(socket: &mut MockSocket, line: &str) {
        socket.inbound.extend(line.as_bytes());
        socket.inbound.extend(b"\r\n");
    }

    fn push_message(socket: &mut MockSocket, msg: &Message) {
        let bytes = msg.serialize(Endianness::native()).unwrap();
        socket.inbound.extend(bytes);
    }

    fn fresh_connection() -> Connection {
        let mut socket = MockSocket::default();
        push_line(&mut socket, "OK 1234deadbeef00000000000000000000");
        let hello_reply = Message {
            message_type: MessageType::MethodReturn,
            flags: HeaderFlags::empty(),
            serial: Serial(1),
            fields: HeaderFields {
                reply_serial: Some(1),
                destination: Some(BusOrUniqueName::from_str(":1.1").unwrap()),
                ..Default::default()
            },
            body: vec![Value::String(":1.42".to_string())],
        };
        push_message(&mut socket, &hello_reply);
        Connection::connect(Box::new(socket), 1000).unwrap()
    }

    #[test]
    fn connect_performs_anonymous_handshake_and_hello() {
        let conn = fresh_connection();
        assert_eq!(conn.unique_name().unwrap().to_string(), ":1.42");
    }

    #[test]
    fn call_correlates_reply_by_serial_skipping_unrelated_traffic() {
        let mut conn = fresh_connection();

        let unrelated_signal = Message {
            message_type: MessageType::Signal,
            flags: HeaderFlags::empty(),
            serial: Serial(1),
            fields: HeaderFields {
                path: Some("/dev".into()),
                interface: Some(InterfaceName::from_str("com.example.Iface").unwrap()),
                member: Some("Tick".parse().unwrap()),
                ..Default::default()
            },
            body: vec![],
        };
        let reply = Message {
            message_type: MessageType::MethodReturn,
            flags: HeaderFlags::empty(),
            serial: Serial(2),
            fields: HeaderFields {
                reply_serial: Some(2),
                ..Default::default()
            },
            body: vec![Value::Uint32(7)],
        };

        // Stuff both into the mock socket's read queue ahead of time by
        // reaching into the connection's private socket field via a second
        // mock swap is not possible from here, so we drive `call` against a
        // connection whose socket already has the right bytes queued.
        let serial_of_next_call = conn.next_serial;
        let _ = serial_of_next_call;

        // Re-derive a connection with both messages preloaded, since the
        // handshake consumes the mock socket's constructor-time queue.
        let mut socket = MockSocket::default();
        push_line(&mut socket, "OK 1234deadbeef00000000000000000000");
        let hello_reply = Message {
            message_type: MessageType::MethodReturn,
            flags: HeaderFlags::empty(),
            serial: Serial(1),
            fields: HeaderFields {
                reply_serial: Some(1),
                ..Default::default()
            },
            body: vec![Value::String(":1.42".to_string())],
        };
        push_message(&mut socket, &hello_reply);
        push_message(&mut socket, &unrelated_signal);
        push_message(&mut socket, &reply);
        let mut conn = Connection::connect(Box::new(socket), 1000).unwrap();

        let call_msg = Message {
            message_type: MessageType::MethodCall,
            flags: HeaderFlags::empty(),
            serial: Serial(0),
            fields: HeaderFields {
                path: Some("/obj".into()),
                member: Some("DoThing".parse().unwrap()),
                ..Default::default()
            },
            body: vec![],
        };
        let result = conn.call(call_msg).unwrap();
        assert_eq!(result.body, vec![Value::Uint32(7)]);
    }

    #[test]
    fn remote_error_reply_surfaces_as_error_remote() {
        let mut socket = MockSocket::default();
        push_line(&mut socket, "OK 1234deadbeef00000000000000000000");
        let hello_reply = Message {
            message_type: MessageType::MethodReturn,
            flags: HeaderFlags::empty(),
            serial: Serial(1),
            fields: HeaderFields {
                reply_serial: Some(1),
                ..Default::default()
            },
            body: vec![Value::String(":1.42".to_string())],
        };
        push_message(&mut socket, &hello_reply);
        let error_reply = Message {
            message_type: MessageType::Error,
            flags: HeaderFlags::empty(),
            serial: Serial(2),
            fields: HeaderFields {
                reply_serial: Some(2),
                error_name: Some(crate::names::FAILED_ERROR_NAME.clone()),
                ..Default::default()
            },
            body: vec![Value::String("nope".to_string())],
        };
        push_message(&mut socket, &error_reply);
        let mut conn = Connection::connect(Box::new(socket), 1000).unwrap();

        let call_msg = Message {
            message_type: MessageType::MethodCall,
            flags: HeaderFlags::empty(),
            serial: Serial(0),
            fields: HeaderFields {
                path: Some("/obj".into()),
                member: Some("DoThing".parse().unwrap()),
                ..Default::default()
            },
            body: vec![],
        };
        let err = conn.call(call_msg).unwrap_err();
        assert!(matches!(err, Error::Remote { .. }));
    }
}
