//! Bus address strings: `<transport>:key=value[,key=value]*[;…]`.
//!
//! The core never dials a socket itself (per §1, per-platform socket
//! plumbing is an external collaborator); this module only parses the
//! address grammar and resolves the well-known environment variables, so a
//! host can open the corresponding stream and hand it to [`crate::connection`].

use std::env;

use crate::error::{Error, Result};

/// The address of the system message bus is given in the
/// DBUS_SYSTEM_BUS_ADDRESS environment variable. If that variable is not
/// set, applications should try to connect to the well-known address
/// unix:path=/var/run/dbus/system_bus_socket
const WELL_KNOWN_DBUS_SYSTEM_BUS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";
const WELL_KNOWN_DBUS_SYSTEM_BUS_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";
const DBUS_SESSION_BUS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";

/// One transport alternative within a bus address. A full address is a
/// semicolon-separated list of these; a client tries each in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    Unix(UnixAddr),
    Tcp(TcpAddr),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnixAddr {
    Path(String),
    Abstract(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpAddr {
    pub host: String,
    pub port: u16,
}

/// A parsed bus address: an ordered list of transport alternatives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusAddress {
    transports: Vec<Transport>,
}

impl BusAddress {
    pub fn transports(&self) -> &[Transport] {
        &self.transports
    }

    /// Parse `<transport>:key=value[,key=value]*[;<transport>:...]*`.
    pub fn parse(address: &str) -> Result<BusAddress> {
        let mut transports = Vec::new();
        for entry in address.split(';') {
            if entry.is_empty() {
                continue;
            }
            transports.push(parse_transport(entry)?);
        }
        if transports.is_empty() {
            return Err(Error::Connection(format!(
                "empty or unparseable bus address `{}`",
                address
            )));
        }
        Ok(BusAddress { transports })
    }

    /// Resolve the session bus address from `DBUS_SESSION_BUS_ADDRESS`.
    /// Looked up fresh at connect time; never cached process-wide.
    pub fn session() -> Result<BusAddress> {
        let raw = env::var(DBUS_SESSION_BUS_ENV).map_err(|_| {
            Error::Connection(format!("{} is not set", DBUS_SESSION_BUS_ENV))
        })?;
        BusAddress::parse(&raw)
    }

    /// Resolve the system bus address from `DBUS_SYSTEM_BUS_ADDRESS`,
    /// falling back to the well-known socket path.
    pub fn system() -> Result<BusAddress> {
        match env::var(WELL_KNOWN_DBUS_SYSTEM_BUS_ENV) {
            Ok(raw) => BusAddress::parse(&raw),
            Err(_) => BusAddress::parse(WELL_KNOWN_DBUS_SYSTEM_BUS_ADDRESS),
        }
    }
}

fn parse_transport(entry: &str) -> Result<Transport> {
    let (kind, params) = entry.split_once(':').ok_or_else(|| {
        Error::Connection(format!("missing ':' in bus address entry `{}`", entry))
    })?;

    let pairs: Vec<(&str, &str)> = params
        .split(',')
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.split_once('=').ok_or_else(|| {
                Error::Connection(format!("malformed key=value pair `{}`", p))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let get = |key: &str| pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v);

    match kind {
        "unix" => {
            if let Some(path) = get("path") {
                Ok(Transport::Unix(UnixAddr::Path(unescape(path))))
            } else if let Some(abstract_path) = get("abstract") {
                Ok(Transport::Unix(UnixAddr::Abstract(unescape(abstract_path))))
            } else {
                Err(Error::Connection(
                    "unix transport requires 'path' or 'abstract'".into(),
                ))
            }
        }
        "tcp" => {
            let host = get("host").unwrap_or("localhost").to_string();
            let port = get("port")
                .ok_or_else(|| Error::Connection("tcp transport requires 'port'".into()))?
                .parse::<u16>()
                .map_err(|e| Error::Connection(format!("invalid tcp port: {}", e)))?;
            Ok(Transport::Tcp(TcpAddr { host, port }))
        }
        other => Err(Error::Connection(format!("unsupported transport `{}`", other))),
    }
}

/// D-Bus addresses percent-encode reserved characters in values; we only
/// need to unescape the subset (`%XX`) that shows up in practice for paths.
fn unescape(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&value[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_path() {
        let addr = BusAddress::parse("unix:path=/run/dbus/system_bus_socket").unwrap();
        assert_eq!(
            addr.transports(),
            &[Transport::Unix(UnixAddr::Path(
                "/run/dbus/system_bus_socket".into()
            ))]
        );
    }

    #[test]
    fn parses_unix_abstract() {
        let addr = BusAddress::parse("unix:abstract=/tmp/dbus-abc123").unwrap();
        assert_eq!(
            addr.transports(),
            &[Transport::Unix(UnixAddr::Abstract("/tmp/dbus-abc123".into()))]
        );
    }

    #[test]
    fn parses_tcp() {
        let addr = BusAddress::parse("tcp:host=127.0.0.1,port=1234").unwrap();
        assert_eq!(
            addr.transports(),
            &[Transport::Tcp(TcpAddr {
                host: "127.0.0.1".into(),
                port: 1234
            })]
        );
    }

    #[test]
    fn parses_multiple_alternatives() {
        let addr =
            BusAddress::parse("unix:path=/a/b;tcp:host=localhost,port=1;").unwrap();
        assert_eq!(addr.transports().len(), 2);
    }

    #[test]
    fn rejects_missing_port() {
        assert!(BusAddress::parse("tcp:host=localhost").is_err());
    }

    #[test]
    fn unescapes_percent_encoding() {
        let addr = BusAddress::parse("unix:path=/tmp/has%20space").unwrap();
        assert_eq!(
            addr.transports(),
            &[Transport::Unix(UnixAddr::Path("/tmp/has space".into()))]
        );
    }
}
