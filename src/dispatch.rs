//! Local object dispatch: routing incoming method calls to registered
//! handlers, plus the four standard interfaces every object answers to
//! without application code (§4.8, §6).

use std::collections::BTreeMap;
use std::fs;
use std::process;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec::validate_object_path;
use crate::error::{Error, Result};
use crate::message::{HeaderFields, HeaderFlags, Message, MessageType, Serial};
use crate::names::{
    ErrorName, InterfaceName, MemberName, FAILED_ERROR_NAME, UNKNOWN_INTERFACE_ERROR_NAME,
    UNKNOWN_METHOD_ERROR_NAME, UNKNOWN_OBJECT_ERROR_NAME, UNKNOWN_PROPERTY_ERROR_NAME,
};
use crate::signature::Type;
use crate::value::Value;

const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";
const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";

const RESERVED_INTERFACES: [&str; 4] = [
    PEER_INTERFACE,
    INTROSPECTABLE_INTERFACE,
    PROPERTIES_INTERFACE,
    OBJECT_MANAGER_INTERFACE,
];

pub type MethodHandler = Box<dyn FnMut(Vec<Value>) -> Result<Vec<Value>>>;

/// A single registered method: its signatures (used for introspection and,
/// eventually, argument validation) and the handler invoked on a call.
pub struct Method {
    pub input_signature: Vec<Type>,
    pub output_signature: Vec<Type>,
    pub handler: MethodHandler,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyAccess {
    Read,
    Write,
    ReadWrite,
}

impl PropertyAccess {
    fn is_readable(self) -> bool {
        matches!(self, PropertyAccess::Read | PropertyAccess::ReadWrite)
    }

    fn is_writable(self) -> bool {
        matches!(self, PropertyAccess::Write | PropertyAccess::ReadWrite)
    }
}

pub struct Property {
    pub ty: Type,
    pub access: PropertyAccess,
    pub get: Option<Box<dyn FnMut() -> Result<Value>>>,
    pub set: Option<Box<dyn FnMut(Value) -> Result<()>>>,
    /// Whether a successful `Set` should emit `PropertiesChanged` (§4.8).
    pub emits_changed: bool,
}

#[derive(Default)]
pub struct Interface {
    pub methods: BTreeMap<MemberName, Method>,
    pub properties: BTreeMap<String, Property>,
    pub signals: Vec<MemberName>,
}

impl Interface {
    pub fn new() -> Self {
        Interface::default()
    }
}

#[derive(Default)]
pub struct LocalObject {
    pub interfaces: BTreeMap<InterfaceName, Interface>,
    pub object_manager: bool,
}

/// The full set of objects registered on a connection, plus the standard
/// interfaces layered transparently in front of them (§4.8).
pub struct ObjectTree {
    objects: BTreeMap<String, LocalObject>,
    machine_id: String,
}

impl ObjectTree {
    pub fn new() -> Self {
        ObjectTree {
            objects: BTreeMap::new(),
            machine_id: read_machine_id(),
        }
    }

    /// Register an interface's methods/properties/signals at `path`.
    /// Rejected if `name` collides with one of the four standard interfaces
    /// the dispatcher already implements (§4.8).
    pub fn register_interface(
        &mut self,
        path: &str,
        name: InterfaceName,
        interface: Interface,
        our_unique_name: &str,
    ) -> Result<Option<Message>> {
        validate_object_path(path).map_err(|reason| Error::Protocol(reason))?;
        if RESERVED_INTERFACES.contains(&name.as_ref()) {
            return Err(Error::Protocol(format!(
                "`{}` is a standard interface and cannot be overridden",
                name
            )));
        }
        self.objects
            .entry(path.to_string())
            .or_default()
            .interfaces
            .insert(name, interface);
        let signal = self.interfaces_added_signal(path, our_unique_name);
        Ok(signal)
    }

    /// Opt a path into `org.freedesktop.DBus.ObjectManager` (§4.8).
    pub fn enable_object_manager(&mut self, path: &str) -> Result<()> {
        validate_object_path(path).map_err(|reason| Error::Protocol(reason))?;
        self.objects.entry(path.to_string()).or_default().object_manager = true;
        Ok(())
    }

    pub fn unregister_interface(
        &mut self,
        path: &str,
        name: &InterfaceName,
        our_unique_name: &str,
    ) -> Option<Message> {
        if let Some(object) = self.objects.get_mut(path) {
            object.interfaces.remove(name);
            let empty = object.interfaces.is_empty();
            let signal = self.interfaces_removed_signal(path, name, our_unique_name);
            if empty {
                self.objects.remove(path);
            }
            return signal;
        }
        None
    }

    fn find_manager_path(&self, path: &str) -> Option<String> {
        let mut candidate = path.to_string();
        loop {
            if let Some(object) = self.objects.get(&candidate) {
                if object.object_manager {
                    return Some(candidate);
                }
            }
            if candidate == "/" {
                return None;
            }
            match candidate.rfind('/') {
                Some(0) => candidate = "/".to_string(),
                Some(idx) => candidate.truncate(idx),
                None => return None,
            }
        }
    }

    fn interfaces_added_signal(&mut self, path: &str, our_unique_name: &str) -> Option<Message> {
        let manager_path = self.find_manager_path(path)?;
        let object = self.objects.get_mut(path)?;
        let interfaces_value = render_interfaces_and_properties(object);
        Some(signal_message(
            &manager_path,
            OBJECT_MANAGER_INTERFACE,
            "InterfacesAdded",
            vec![Value::ObjectPath(path.to_string()), interfaces_value],
            our_unique_name,
        ))
    }

    fn interfaces_removed_signal(
        &mut self,
        path: &str,
        removed: &InterfaceName,
        our_unique_name: &str,
    ) -> Option<Message> {
        let manager_path = self.find_manager_path(path)?;
        Some(signal_message(
            &manager_path,
            OBJECT_MANAGER_INTERFACE,
            "InterfacesRemoved",
            vec![
                Value::ObjectPath(path.to_string()),
                Value::Array(Type::String, vec![Value::String(removed.to_string())]),
            ],
            our_unique_name,
        ))
    }

    /// Route one incoming method call. Returns the reply (if one is owed)
    /// and any signals the dispatch itself must emit (`PropertiesChanged`).
    /// `our_unique_name` becomes the SENDER of generated messages; their
    /// `serial` field is left at the placeholder value for the connection
    /// to assign before writing it to the transport.
    pub fn dispatch(&mut self, call: &Message, our_unique_name: &str) -> DispatchOutcome {
        let reply_expected = !call.flags.contains(HeaderFlags::NO_REPLY_EXPECTED);
        match self.dispatch_inner(call, our_unique_name) {
            Ok(Outcome::Return(body)) => DispatchOutcome {
                reply: reply_expected.then(|| method_return(call, body, our_unique_name)),
                signals: Vec::new(),
            },
            Ok(Outcome::ReturnWithSignal(body, signal)) => DispatchOutcome {
                reply: reply_expected.then(|| method_return(call, body, our_unique_name)),
                signals: vec![signal],
            },
            Err(e) => DispatchOutcome {
                reply: reply_expected.then(|| error_return(call, e, our_unique_name)),
                signals: Vec::new(),
            },
        }
    }

    fn dispatch_inner(&mut self, call: &Message, our_unique_name: &str) -> Result<Outcome> {
        let path = call
            .fields
            .path
            .clone()
            .ok_or_else(|| Error::Protocol("method call missing PATH".into()))?;
        let member = call
            .fields
            .member
            .clone()
            .ok_or_else(|| Error::Protocol("method call missing MEMBER".into()))?;

        if let Some(interface) = &call.fields.interface {
            match interface.as_ref() {
                PEER_INTERFACE => return self.handle_peer(&member),
                INTROSPECTABLE_INTERFACE => return self.handle_introspectable(&path, &member),
                PROPERTIES_INTERFACE => {
                    return self.handle_properties(&path, &member, &call.body, our_unique_name)
                }
                OBJECT_MANAGER_INTERFACE => return self.handle_object_manager(&path, &member, our_unique_name),
                _ => {}
            }
        }

        let interface_name = match &call.fields.interface {
            Some(i) => i.clone(),
            None => {
                let object = self
                    .objects
                    .get(&path)
                    .ok_or_else(|| unknown_object(&path))?;
                object
                    .interfaces
                    .iter()
                    .find(|(_, iface)| iface.methods.contains_key(&member))
                    .map(|(name, _)| name.clone())
                    .ok_or_else(|| unknown_method(&member))?
            }
        };

        let object = self
            .objects
            .get_mut(&path)
            .ok_or_else(|| unknown_object(&path))?;
        let interface = object
            .interfaces
            .get_mut(&interface_name)
            .ok_or_else(|| unknown_interface(&interface_name))?;
        let method = interface
            .methods
            .get_mut(&member)
            .ok_or_else(|| unknown_method(&member))?;
        let outputs = (method.handler)(call.body.clone())?;
        Ok(Outcome::Return(outputs))
    }

    fn handle_peer(&self, member: &MemberName) -> Result<Outcome> {
        match member.as_ref() {
            "Ping" => Ok(Outcome::Return(vec![])),
            "GetMachineId" => Ok(Outcome::Return(vec![Value::String(self.machine_id.clone())])),
            _ => Err(unknown_method(member)),
        }
    }

    fn handle_introspectable(&self, path: &str, member: &MemberName) -> Result<Outcome> {
        if member.as_ref() != "Introspect" {
            return Err(unknown_method(member));
        }
        Ok(Outcome::Return(vec![Value::String(self.render_introspection(path))]))
    }

    fn handle_properties(
        &mut self,
        path: &str,
        member: &MemberName,
        body: &[Value],
        our_unique_name: &str,
    ) -> Result<Outcome> {
        match member.as_ref() {
            "Get" => {
                let (interface, prop_name) = two_strings(body)?;
                let interface = InterfaceName::from_str(&interface)
                    .map_err(|e| Error::Protocol(e.to_string()))?;
                let object = self
                    .objects
                    .get_mut(path)
                    .ok_or_else(|| unknown_object(path))?;
                let iface = object
                    .interfaces
                    .get_mut(&interface)
                    .ok_or_else(|| unknown_interface(&interface))?;
                let prop = iface
                    .properties
                    .get_mut(&prop_name)
                    .ok_or_else(|| unknown_property(&prop_name))?;
                if !prop.access.is_readable() {
                    return Err(unknown_property(&prop_name));
                }
                let getter = prop
                    .get
                    .as_mut()
                    .ok_or_else(|| unknown_property(&prop_name))?;
                let value = getter()?;
                let ty = prop.ty.clone();
                Ok(Outcome::Return(vec![Value::Variant(ty, Box::new(value))]))
            }
            "Set" => {
                if body.len() != 3 {
                    return Err(Error::Protocol("Set expects (s,s,v)".into()));
                }
                let (interface, prop_name) = two_strings(&body[..2])?;
                let interface = InterfaceName::from_str(&interface)
                    .map_err(|e| Error::Protocol(e.to_string()))?;
                let inner = match &body[2] {
                    Value::Variant(_, inner) => (**inner).clone(),
                    other => {
                        return Err(Error::Protocol(format!(
                            "Set value must be a variant, got {:?}",
                            other
                        )))
                    }
                };
                let object = self
                    .objects
                    .get_mut(path)
                    .ok_or_else(|| unknown_object(path))?;
                let iface = object
                    .interfaces
                    .get_mut(&interface)
                    .ok_or_else(|| unknown_interface(&interface))?;
                let prop = iface
                    .properties
                    .get_mut(&prop_name)
                    .ok_or_else(|| unknown_property(&prop_name))?;
                if !prop.access.is_writable() {
                    return Err(unknown_property(&prop_name));
                }
                let setter = prop
                    .set
                    .as_mut()
                    .ok_or_else(|| unknown_property(&prop_name))?;
                setter(inner.clone())?;

                if prop.emits_changed {
                    let mut changed = Vec::new();
                    changed.push(Value::DictEntry(
                        Box::new(Value::String(prop_name.clone())),
                        Box::new(Value::Variant(prop.ty.clone(), Box::new(inner))),
                    ));
                    let changed_value = Value::Array(
                        Type::DictEntry(Box::new(Type::String), Box::new(Type::Variant)),
                        changed,
                    );
                    let signal = signal_message(
                        path,
                        PROPERTIES_INTERFACE,
                        "PropertiesChanged",
                        vec![
                            Value::String(interface.to_string()),
                            changed_value,
                            Value::Array(Type::String, vec![]),
                        ],
                        our_unique_name,
                    );
                    return Ok(Outcome::ReturnWithSignal(vec![], signal));
                }
                Ok(Outcome::Return(vec![]))
            }
            "GetAll" => {
                let interface_str = one_string(body)?;
                let interface = InterfaceName::from_str(&interface_str)
                    .map_err(|e| Error::Protocol(e.to_string()))?;
                let object = self
                    .objects
                    .get_mut(path)
                    .ok_or_else(|| unknown_object(path))?;
                let iface = object
                    .interfaces
                    .get_mut(&interface)
                    .ok_or_else(|| unknown_interface(&interface))?;
                let mut entries = Vec::new();
                for (name, prop) in iface.properties.iter_mut() {
                    if !prop.access.is_readable() {
                        continue;
                    }
                    if let Some(getter) = prop.get.as_mut() {
                        let value = getter()?;
                        entries.push(Value::DictEntry(
                            Box::new(Value::String(name.clone())),
                            Box::new(Value::Variant(prop.ty.clone(), Box::new(value))),
                        ));
                    }
                }
                Ok(Outcome::Return(vec![Value::Array(
                    Type::DictEntry(Box::new(Type::String), Box::new(Type::Variant)),
                    entries,
                )]))
            }
            _ => Err(unknown_method(member)),
        }
    }

    fn handle_object_manager(
        &mut self,
        path: &str,
        member: &MemberName,
        _our_unique_name: &str,
    ) -> Result<Outcome> {
        if member.as_ref() != "GetManagedObjects" {
            return Err(unknown_method(member));
        }
        let prefix = if path == "/" {
            String::new()
        } else {
            path.to_string()
        };
        let matching_paths: Vec<String> = self
            .objects
            .keys()
            .filter(|object_path| {
                object_path.as_str() == path
                    || object_path
                        .strip_prefix(prefix.as_str())
                        .map(|rest| rest.starts_with('/'))
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        let mut entries = Vec::new();
        for object_path in matching_paths {
            let object = self.objects.get_mut(&object_path).expect("just listed");
            entries.push(Value::DictEntry(
                Box::new(Value::ObjectPath(object_path)),
                Box::new(render_interfaces_and_properties(object)),
            ));
        }
        Ok(Outcome::Return(vec![Value::Array(
            Type::DictEntry(
                Box::new(Type::ObjectPath),
                Box::new(Type::Array(Box::new(Type::DictEntry(
                    Box::new(Type::String),
                    Box::new(Type::Array(Box::new(Type::DictEntry(
                        Box::new(Type::String),
                        Box::new(Type::Variant),
                    )))),
                )))),
            ),
            entries,
        )]))
    }

    fn render_introspection(&self, path: &str) -> String {
        let mut xml = String::from("<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n<node>\n");

        for reserved in RESERVED_INTERFACES {
            xml.push_str(&format!("  <interface name=\"{}\">\n", reserved));
            xml.push_str("  </interface>\n");
        }

        if let Some(object) = self.objects.get(path) {
            for (name, interface) in &object.interfaces {
                xml.push_str(&format!("  <interface name=\"{}\">\n", name));
                for (method_name, method) in &interface.methods {
                    xml.push_str(&format!("    <method name=\"{}\">\n", method_name));
                    for arg_ty in &method.input_signature {
                        xml.push_str(&format!(
                            "      <arg type=\"{}\" direction=\"in\"/>\n",
                            arg_ty.render()
                        ));
                    }
                    for arg_ty in &method.output_signature {
                        xml.push_str(&format!(
                            "      <arg type=\"{}\" direction=\"out\"/>\n",
                            arg_ty.render()
                        ));
                    }
                    xml.push_str("    </method>\n");
                }
                for (prop_name, prop) in &interface.properties {
                    let access = match prop.access {
                        PropertyAccess::Read => "read",
                        PropertyAccess::Write => "write",
                        PropertyAccess::ReadWrite => "readwrite",
                    };
                    xml.push_str(&format!(
                        "    <property name=\"{}\" type=\"{}\" access=\"{}\"/>\n",
                        prop_name,
                        prop.ty.render(),
                        access
                    ));
                }
                for signal_name in &interface.signals {
                    xml.push_str(&format!("    <signal name=\"{}\"/>\n", signal_name));
                }
                xml.push_str("  </interface>\n");
            }
        }

        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let mut children = std::collections::BTreeSet::new();
        for object_path in self.objects.keys() {
            if let Some(rest) = object_path.strip_prefix(&prefix) {
                if !rest.is_empty() {
                    let child = rest.split('/').next().unwrap_or(rest);
                    children.insert(child.to_string());
                }
            }
        }
        for child in children {
            xml.push_str(&format!("  <node name=\"{}\"/>\n", child));
        }

        xml.push_str("</node>\n");
        xml
    }
}

fn render_interfaces_and_properties(object: &mut LocalObject) -> Value {
    let mut iface_entries = Vec::new();
    for (name, interface) in object.interfaces.iter_mut() {
        let mut prop_entries = Vec::new();
        for (prop_name, prop) in interface.properties.iter_mut() {
            if !prop.access.is_readable() {
                continue;
            }
            if let Some(getter) = prop.get.as_mut() {
                if let Ok(value) = getter() {
                    prop_entries.push(Value::DictEntry(
                        Box::new(Value::String(prop_name.clone())),
                        Box::new(Value::Variant(prop.ty.clone(), Box::new(value))),
                    ));
                }
            }
        }
        iface_entries.push(Value::DictEntry(
            Box::new(Value::String(name.to_string())),
            Box::new(Value::Array(
                Type::DictEntry(Box::new(Type::String), Box::new(Type::Variant)),
                prop_entries,
            )),
        ));
    }
    Value::Array(
        Type::DictEntry(
            Box::new(Type::String),
            Box::new(Type::Array(Box::new(Type::DictEntry(
                Box::new(Type::String),
                Box::new(Type::Variant),
            )))),
        ),
        iface_entries,
    )
}

enum Outcome {
    Return(Vec<Value>),
    ReturnWithSignal(Vec<Value>, Message),
}

pub struct DispatchOutcome {
    pub reply: Option<Message>,
    pub signals: Vec<Message>,
}

fn unknown_object(path: &str) -> Error {
    Error::Remote {
        name: UNKNOWN_OBJECT_ERROR_NAME.clone(),
        message: format!("No such object path '{}'", path),
    }
}

fn unknown_interface(name: &InterfaceName) -> Error {
    Error::Remote {
        name: UNKNOWN_INTERFACE_ERROR_NAME.clone(),
        message: format!("No such interface '{}'", name),
    }
}

fn unknown_method(name: &MemberName) -> Error {
    Error::Remote {
        name: UNKNOWN_METHOD_ERROR_NAME.clone(),
        message: format!("No such method '{}'", name),
    }
}

fn unknown_property(name: &str) -> Error {
    Error::Remote {
        name: UNKNOWN_PROPERTY_ERROR_NAME.clone(),
        message: format!("No such property '{}'", name),
    }
}

fn one_string(body: &[Value]) -> Result<String> {
    match body.first() {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(Error::Protocol("expected a single string argument".into())),
    }
}

fn two_strings(body: &[Value]) -> Result<(String, String)> {
    if body.len() < 2 {
        return Err(Error::Protocol("expected two string arguments".into()));
    }
    match (&body[0], &body[1]) {
        (Value::String(a), Value::String(b)) => Ok((a.clone(), b.clone())),
        _ => Err(Error::Protocol("expected two string arguments".into())),
    }
}

fn method_return(call: &Message, body: Vec<Value>, our_unique_name: &str) -> Message {
    let sender = call.fields.sender.clone();
    Message {
        message_type: MessageType::MethodReturn,
        flags: HeaderFlags::empty(),
        serial: Serial(0),
        fields: HeaderFields {
            reply_serial: Some(call.serial.0),
            destination: sender.map(crate::names::BusOrUniqueName::Unique),
            sender: crate::names::UniqueName::from_str(our_unique_name).ok(),
            ..Default::default()
        },
        body,
    }
}

fn error_return(call: &Message, err: Error, our_unique_name: &str) -> Message {
    let (name, message) = match err {
        Error::Remote { name, message } => (name, message),
        other => (FAILED_ERROR_NAME.clone(), other.to_string()),
    };
    let sender = call.fields.sender.clone();
    Message {
        message_type: MessageType::Error,
        flags: HeaderFlags::empty(),
        serial: Serial(0),
        fields: HeaderFields {
            reply_serial: Some(call.serial.0),
            error_name: Some(name),
            destination: sender.map(crate::names::BusOrUniqueName::Unique),
            sender: crate::names::UniqueName::from_str(our_unique_name).ok(),
            ..Default::default()
        },
        body: vec![Value::String(message)],
    }
}

fn signal_message(
    path: &str,
    interface: &str,
    member: &str,
    body: Vec<Value>,
    our_unique_name: &str,
) -> Message {
    Message {
        message_type: MessageType::Signal,
        flags: HeaderFlags::empty(),
        serial: Serial(0),
        fields: HeaderFields {
            path: Some(path.to_string()),
            interface: InterfaceName::from_str(interface).ok(),
            member: MemberName::from_str(member).ok(),
            sender: crate::names::UniqueName::from_str(our_unique_name).ok(),
            ..Default::default()
        },
        body,
    }
}

fn read_machine_id() -> String {
    for candidate in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(contents) = fs::read_to_string(candidate) {
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:032x}", (process::id() as u128) << 96 | (nanos & 0xffff_ffff_ffff_ffff_ffff_ffff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn method_call(path: &str, interface: Option<&str>, member: &str, body: Vec<Value>) -> Message {
        Message {
            message_type: MessageType::MethodCall,
            flags: HeaderFlags::empty(),
            serial: Serial(42),
            fields: HeaderFields {
                path: Some(path.to_string()),
                interface: interface.map(|i| InterfaceName::from_str(i).unwrap()),
                member: Some(MemberName::from_str(member).unwrap()),
                sender: Some(crate::names::UniqueName::from_str(":1.2").unwrap()),
                ..Default::default()
            },
            body,
        }
    }

    #[test]
    fn peer_ping_replies_empty() {
        let mut tree = ObjectTree::new();
        let call = method_call("/any", Some(PEER_INTERFACE), "Ping", vec![]);
        let outcome = tree.dispatch(&call, ":1.1");
        let reply = outcome.reply.unwrap();
        assert_eq!(reply.message_type, MessageType::MethodReturn);
        assert_eq!(reply.fields.reply_serial, Some(42));
        assert!(reply.body.is_empty());
    }

    #[test]
    fn unknown_object_returns_error() {
        let mut tree = ObjectTree::new();
        let call = method_call("/nope", Some("com.example.Iface"), "Do", vec![]);
        let outcome = tree.dispatch(&call, ":1.1");
        let reply = outcome.reply.unwrap();
        assert_eq!(reply.message_type, MessageType::Error);
        assert_eq!(
            reply.fields.error_name.unwrap().to_string(),
            "org.freedesktop.DBus.Error.UnknownObject"
        );
    }

    #[test]
    fn registered_method_dispatches_and_returns_value() {
        let mut tree = ObjectTree::new();
        let mut interface = Interface::new();
        interface.methods.insert(
            MemberName::from_str("Double").unwrap(),
            Method {
                input_signature: vec![Type::Int32],
                output_signature: vec![Type::Int32],
                handler: Box::new(|body| match body.first() {
                    Some(Value::Int32(n)) => Ok(vec![Value::Int32(n * 2)]),
                    _ => Err(Error::Protocol("expected int32".into())),
                }),
            },
        );
        tree.register_interface(
            "/obj",
            InterfaceName::from_str("com.example.Math").unwrap(),
            interface,
            ":1.1",
        )
        .unwrap();

        let call = method_call(
            "/obj",
            Some("com.example.Math"),
            "Double",
            vec![Value::Int32(21)],
        );
        let outcome = tree.dispatch(&call, ":1.1");
        let reply = outcome.reply.unwrap();
        assert_eq!(reply.body, vec![Value::Int32(42)]);
    }

    #[test]
    fn rejects_registering_reserved_interface() {
        let mut tree = ObjectTree::new();
        let result = tree.register_interface(
            "/obj",
            InterfaceName::from_str(PEER_INTERFACE).unwrap(),
            Interface::new(),
            ":1.1",
        );
        assert!(result.is_err());
    }

    #[test]
    fn properties_get_and_set_round_trip_with_change_signal() {
        let mut tree = ObjectTree::new();
        let stored = Rc::new(Cell::new(10i32));
        let stored_get = stored.clone();
        let stored_set = stored.clone();
        let mut interface = Interface::new();
        interface.properties.insert(
            "Count".to_string(),
            Property {
                ty: Type::Int32,
                access: PropertyAccess::ReadWrite,
                get: Some(Box::new(move || Ok(Value::Int32(stored_get.get())))),
                set: Some(Box::new(move |v| {
                    if let Value::Int32(n) = v {
                        stored_set.set(n);
                    }
                    Ok(())
                })),
                emits_changed: true,
            },
        );
        tree.register_interface(
            "/obj",
            InterfaceName::from_str("com.example.Counter").unwrap(),
            interface,
            ":1.1",
        )
        .unwrap();

        let get_call = method_call(
            "/obj",
            Some(PROPERTIES_INTERFACE),
            "Get",
            vec![
                Value::String("com.example.Counter".into()),
                Value::String("Count".into()),
            ],
        );
        let outcome = tree.dispatch(&get_call, ":1.1");
        let reply = outcome.reply.unwrap();
        assert_eq!(
            reply.body,
            vec![Value::Variant(Type::Int32, Box::new(Value::Int32(10)))]
        );

        let set_call = method_call(
            "/obj",
            Some(PROPERTIES_INTERFACE),
            "Set",
            vec![
                Value::String("com.example.Counter".into()),
                Value::String("Count".into()),
                Value::Variant(Type::Int32, Box::new(Value::Int32(99))),
            ],
        );
        let outcome = tree.dispatch(&set_call, ":1.1");
        assert_eq!(stored.get(), 99);
        assert_eq!(outcome.signals.len(), 1);
        assert_eq!(outcome.signals[0].fields.member.as_ref().unwrap().as_ref(), "PropertiesChanged");
    }

    #[test]
    fn introspect_lists_registered_method() {
        let mut tree = ObjectTree::new();
        let mut interface = Interface::new();
        interface.methods.insert(
            MemberName::from_str("Do").unwrap(),
            Method {
                input_signature: vec![],
                output_signature: vec![],
                handler: Box::new(|_| Ok(vec![])),
            },
        );
        tree.register_interface(
            "/obj",
            InterfaceName::from_str("com.example.Iface").unwrap(),
            interface,
            ":1.1",
        )
        .unwrap();
        let call = method_call("/obj", Some(INTROSPECTABLE_INTERFACE), "Introspect", vec![]);
        let outcome = tree.dispatch(&call, ":1.1");
        let reply = outcome.reply.unwrap();
        match &reply.body[0] {
            Value::String(xml) => {
                assert!(xml.contains("com.example.Iface"));
                assert!(xml.contains("Do"));
            }
            other => panic!("expected string body, got {:?}", other),
        }
    }
}
