//! The SASL line protocol exchanged before any D-Bus message: command
//! parsing/rendering and the mechanism priority order (§4.5).
//! <https://dbus.freedesktop.org/doc/dbus-specification.html#auth-protocol>

use std::fmt;

use crate::error::{Error, Result};

/// Authentication mechanisms, tried by the client in this priority order
/// until one succeeds or the list is exhausted (§4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMechanism {
    /// RFC 4422 appendix A. Recommended wherever credentials can be
    /// transferred out-of-band (e.g. `SO_PEERCRED` over a Unix socket).
    External,
    /// D-Bus-specific challenge/response mechanism backed by a shared
    /// keyring file under `~/.dbus-keyrings/`.
    DbusCookieSha1,
    /// RFC 4505. No authentication at all; a fallback of last resort.
    Anonymous,
}

impl AuthMechanism {
    /// The client's mechanism attempts, most preferred first.
    pub const PRIORITY_ORDER: [AuthMechanism; 3] = [
        AuthMechanism::External,
        AuthMechanism::DbusCookieSha1,
        AuthMechanism::Anonymous,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AuthMechanism::External => "EXTERNAL",
            AuthMechanism::DbusCookieSha1 => "DBUS_COOKIE_SHA1",
            AuthMechanism::Anonymous => "ANONYMOUS",
        }
    }

    fn from_name(name: &str) -> Option<AuthMechanism> {
        match name {
            "EXTERNAL" => Some(AuthMechanism::External),
            "DBUS_COOKIE_SHA1" => Some(AuthMechanism::DbusCookieSha1),
            "ANONYMOUS" => Some(AuthMechanism::Anonymous),
            _ => None,
        }
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A single line of the SASL exchange, without its `\r\n` terminator.
/// Covers both the commands a client sends and the replies a server sends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SaslLine {
    /// `AUTH [MECH [initial-hex-data]]`
    Auth {
        mechanism: Option<AuthMechanism>,
        initial_data: Option<String>,
    },
    /// `CANCEL`
    Cancel,
    /// `BEGIN`
    Begin,
    /// `DATA <hex>`
    Data(String),
    /// `ERROR [explanation]`
    Error(String),
    /// `NEGOTIATE_UNIX_FD`
    NegotiateUnixFd,
    /// `REJECTED [mech ...]`
    Rejected(Vec<AuthMechanism>),
    /// `OK <server-guid>`
    Ok(String),
    /// `AGREE_UNIX_FD`
    AgreeUnixFd,
}

impl SaslLine {
    /// Render this line as it goes out on the wire, without the `\r\n`
    /// terminator (the transport appends it).
    pub fn render(&self) -> String {
        match self {
            SaslLine::Auth {
                mechanism,
                initial_data,
            } => match (mechanism, initial_data) {
                (Some(m), Some(data)) => format!("AUTH {} {}", m.name(), data),
                (Some(m), None) => format!("AUTH {}", m.name()),
                (None, _) => "AUTH".to_string(),
            },
            SaslLine::Cancel => "CANCEL".to_string(),
            SaslLine::Begin => "BEGIN".to_string(),
            SaslLine::Data(hex) => format!("DATA {}", hex),
            SaslLine::Error(explanation) => {
                if explanation.is_empty() {
                    "ERROR".to_string()
                } else {
                    format!("ERROR {}", explanation)
                }
            }
            SaslLine::NegotiateUnixFd => "NEGOTIATE_UNIX_FD".to_string(),
            SaslLine::Rejected(mechs) => {
                let names: Vec<&str> = mechs.iter().map(|m| m.name()).collect();
                format!("REJECTED {}", names.join(" "))
            }
            SaslLine::Ok(guid) => format!("OK {}", guid),
            SaslLine::AgreeUnixFd => "AGREE_UNIX_FD".to_string(),
        }
    }

    /// Parse one line (already stripped of `\r\n`) received from the peer.
    pub fn parse(line: &str) -> Result<SaslLine> {
        let mut parts = line.split_ascii_whitespace();
        let command = parts
            .next()
            .ok_or_else(|| Error::Handshake("empty SASL line".into()))?;
        match command {
            "AUTH" => {
                let mechanism = parts
                    .next()
                    .map(|m| {
                        AuthMechanism::from_name(m)
                            .ok_or_else(|| Error::Handshake(format!("unknown mechanism `{}`", m)))
                    })
                    .transpose()?;
                let initial_data = parts.next().map(|s| s.to_string());
                Ok(SaslLine::Auth {
                    mechanism,
                    initial_data,
                })
            }
            "CANCEL" => Ok(SaslLine::Cancel),
            "BEGIN" => Ok(SaslLine::Begin),
            "DATA" => {
                let hex = parts
                    .next()
                    .ok_or_else(|| Error::Handshake("DATA with no payload".into()))?;
                Ok(SaslLine::Data(hex.to_string()))
            }
            "ERROR" => {
                let rest: Vec<&str> = parts.collect();
                Ok(SaslLine::Error(rest.join(" ")))
            }
            "NEGOTIATE_UNIX_FD" => Ok(SaslLine::NegotiateUnixFd),
            "REJECTED" => {
                let mechs = parts
                    .map(|m| {
                        AuthMechanism::from_name(m)
                            .ok_or_else(|| Error::Handshake(format!("unknown mechanism `{}`", m)))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(SaslLine::Rejected(mechs))
            }
            "OK" => {
                let guid = parts
                    .next()
                    .ok_or_else(|| Error::Handshake("OK with no server GUID".into()))?;
                Ok(SaslLine::Ok(guid.to_string()))
            }
            "AGREE_UNIX_FD" => Ok(SaslLine::AgreeUnixFd),
            other => Err(Error::Handshake(format!("unknown SASL command `{}`", other))),
        }
    }
}

/// Hex-encode the decimal-rendered UID, as required for the EXTERNAL
/// mechanism's initial response (§4.5).
pub fn external_initial_data(uid: u32) -> String {
    hex::encode(uid.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_and_parses_auth_with_data() {
        let line = SaslLine::Auth {
            mechanism: Some(AuthMechanism::External),
            initial_data: Some("31303030".to_string()),
        };
        let rendered = line.render();
        assert_eq!(rendered, "AUTH EXTERNAL 31303030");
        assert_eq!(SaslLine::parse(&rendered).unwrap(), line);
    }

    #[test]
    fn renders_and_parses_ok() {
        let line = SaslLine::Ok("1234deadbeef".to_string());
        assert_eq!(line.render(), "OK 1234deadbeef");
        assert_eq!(SaslLine::parse("OK 1234deadbeef").unwrap(), line);
    }

    #[test]
    fn parses_rejected_mechanism_list() {
        let line = SaslLine::parse("REJECTED EXTERNAL DBUS_COOKIE_SHA1 ANONYMOUS").unwrap();
        assert_eq!(
            line,
            SaslLine::Rejected(vec![
                AuthMechanism::External,
                AuthMechanism::DbusCookieSha1,
                AuthMechanism::Anonymous
            ])
        );
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(SaslLine::parse("WAT").is_err());
    }

    #[test]
    fn external_initial_data_is_hex_of_decimal_uid() {
        assert_eq!(external_initial_data(1000), hex::encode(b"1000"));
    }
}
