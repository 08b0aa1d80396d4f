//! Byte-stream framing and the SASL handshake (§4.5).
//!
//! The core never dials a socket itself — per-platform socket plumbing is
//! an external collaborator (§1) — so everything here operates over a
//! host-supplied [`Socket`]. [`crate::address`] is metadata the host uses to
//! open that stream; this module only speaks the bytes once it has one.

use std::env;
use std::fs;
use std::io::{Read, Write};
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use sha1::{Digest, Sha1};

use crate::codec::Endianness;
use crate::error::{Error, Result};
use crate::protocol::{external_initial_data, AuthMechanism, SaslLine};

/// A full-duplex byte stream, supplied by the host. A blanket impl covers
/// any concrete type that already implements `Read + Write` (a `UnixStream`,
/// a `TcpStream`, a test double, ...).
pub trait Socket: Read + Write {}
impl<T: Read + Write> Socket for T {}

fn align_up(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) / alignment * alignment
}

/// Read one complete, framed D-Bus message off the wire and return its raw
/// bytes, ready for [`crate::message::Message::deserialize`].
///
/// Per §4.5: as soon as the fixed 16-byte prefix is available, the
/// field-table length (at offset 12) and body length (at offset 4) are
/// enough to compute the whole message's size.
pub fn read_frame(socket: &mut dyn Socket) -> Result<Vec<u8>> {
    let mut prefix = [0u8; 16];
    socket.read_exact(&mut prefix)?;

    let endian = Endianness::from_tag(prefix[0])?;
    let read_u32 = |b: &[u8]| -> u32 {
        match endian {
            Endianness::Little => LittleEndian::read_u32(b),
            Endianness::Big => BigEndian::read_u32(b),
        }
    };
    let body_len = read_u32(&prefix[4..8]) as usize;
    let fields_len = read_u32(&prefix[12..16]) as usize;

    let header_len = 16usize
        .checked_add(fields_len)
        .ok_or_else(|| Error::read_buffer(12, "field table length overflow"))?;
    let aligned_header_len = align_up(header_len, 8);
    let total_len = aligned_header_len
        .checked_add(body_len)
        .ok_or_else(|| Error::read_buffer(4, "body length overflow"))?;

    let mut bytes = Vec::with_capacity(total_len);
    bytes.extend_from_slice(&prefix);
    bytes.resize(total_len, 0);
    socket.read_exact(&mut bytes[16..])?;
    Ok(bytes)
}

/// Write one already-serialized message's bytes in a single call, so that
/// two messages written back to back never interleave on the wire.
pub fn write_frame(socket: &mut dyn Socket, bytes: &[u8]) -> Result<()> {
    socket.write_all(bytes)?;
    Ok(())
}

fn read_line(socket: &mut dyn Socket) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        socket.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            break;
        }
        line.push(byte[0]);
        if line.len() > 16 * 1024 {
            return Err(Error::Handshake("SASL line exceeds 16KiB".into()));
        }
    }
    String::from_utf8(line).map_err(|_| Error::Handshake("SASL line was not valid UTF-8".into()))
}

fn write_line(socket: &mut dyn Socket, line: &SaslLine) -> Result<()> {
    let mut rendered = line.render();
    rendered.push_str("\r\n");
    socket.write_all(rendered.as_bytes())?;
    Ok(())
}

/// Drive the client side of the SASL handshake to completion and return the
/// server's GUID. `uid` is the numeric user id to present for EXTERNAL.
pub fn handshake(socket: &mut dyn Socket, uid: u32) -> Result<String> {
    socket.write_all(&[0])?;

    let mut remaining: Vec<AuthMechanism> = AuthMechanism::PRIORITY_ORDER.to_vec();
    remaining.reverse(); // pop() takes the highest-priority mechanism first

    while let Some(mechanism) = remaining.pop() {
        log::debug!("attempting SASL mechanism {}", mechanism);
        match try_mechanism(socket, mechanism, uid) {
            Ok(guid) => {
                write_line(socket, &SaslLine::Begin)?;
                log::debug!("handshake complete, server guid {}", guid);
                return Ok(guid);
            }
            Err(MechanismOutcome::Rejected) => continue,
            Err(MechanismOutcome::Fatal(e)) => return Err(e),
        }
    }
    Err(Error::Handshake(
        "every authentication mechanism was rejected".into(),
    ))
}

enum MechanismOutcome {
    Rejected,
    Fatal(Error),
}

impl From<Error> for MechanismOutcome {
    fn from(e: Error) -> Self {
        MechanismOutcome::Fatal(e)
    }
}

fn try_mechanism(
    socket: &mut dyn Socket,
    mechanism: AuthMechanism,
    uid: u32,
) -> std::result::Result<String, MechanismOutcome> {
    match mechanism {
        AuthMechanism::External => {
            write_line(
                socket,
                &SaslLine::Auth {
                    mechanism: Some(mechanism),
                    initial_data: Some(external_initial_data(uid)),
                },
            )?;
            await_ok(socket)
        }
        AuthMechanism::Anonymous => {
            write_line(
                socket,
                &SaslLine::Auth {
                    mechanism: Some(mechanism),
                    initial_data: Some(hex::encode(b"dbus-core")),
                },
            )?;
            await_ok(socket)
        }
        AuthMechanism::DbusCookieSha1 => {
            let username = whoami()?;
            write_line(
                socket,
                &SaslLine::Auth {
                    mechanism: Some(mechanism),
                    initial_data: Some(hex::encode(username.as_bytes())),
                },
            )?;
            let challenge_hex = match read_reply(socket)? {
                SaslLine::Data(hex) => hex,
                SaslLine::Rejected(_) => return Err(MechanismOutcome::Rejected),
                SaslLine::Error(e) => {
                    return Err(Error::Handshake(format!("server error: {}", e)).into())
                }
                other => {
                    return Err(Error::Handshake(format!(
                        "unexpected SASL reply during DBUS_COOKIE_SHA1: {:?}",
                        other
                    ))
                    .into())
                }
            };
            let decoded = hex::decode(&challenge_hex)
                .map_err(|_| Error::Handshake("server challenge was not valid hex".into()))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|_| Error::Handshake("server challenge was not UTF-8".into()))?;
            let mut parts = decoded.split_ascii_whitespace();
            let context = parts
                .next()
                .ok_or_else(|| Error::Handshake("missing cookie context".into()))?;
            let cookie_id = parts
                .next()
                .ok_or_else(|| Error::Handshake("missing cookie id".into()))?;
            let server_challenge = parts
                .next()
                .ok_or_else(|| Error::Handshake("missing server challenge".into()))?;

            let cookie = match lookup_cookie(context, cookie_id) {
                Ok(c) => c,
                Err(_) => return Err(MechanismOutcome::Rejected),
            };
            let client_challenge = client_challenge_nonce();
            let mut hasher = Sha1::new();
            hasher.update(format!("{}:{}:{}", server_challenge, client_challenge, cookie));
            let digest = hex::encode(hasher.finalize());
            let response = hex::encode(format!("{} {}", client_challenge, digest).as_bytes());
            write_line(socket, &SaslLine::Data(response))?;
            await_ok(socket)
        }
    }
}

fn await_ok(socket: &mut dyn Socket) -> std::result::Result<String, MechanismOutcome> {
    match read_reply(socket)? {
        SaslLine::Ok(guid) => Ok(guid),
        SaslLine::Rejected(_) => Err(MechanismOutcome::Rejected),
        SaslLine::Error(e) => Err(Error::Handshake(format!("server error: {}", e)).into()),
        other => Err(Error::Handshake(format!("unexpected SASL reply: {:?}", other)).into()),
    }
}

fn read_reply(socket: &mut dyn Socket) -> Result<SaslLine> {
    let line = read_line(socket)?;
    SaslLine::parse(&line)
}

fn whoami() -> Result<String> {
    env::var("USER")
        .or_else(|_| env::var("LOGNAME"))
        .map_err(|_| Error::Handshake("could not determine local username".into()))
}

/// Not cryptographically strong, only unique enough to avoid the server
/// seeing the same client challenge twice: process id plus a monotonic
/// timestamp, exactly as much entropy as the wall clock gives us without
/// pulling in a random-number crate the rest of the stack doesn't use.
fn client_challenge_nonce() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}{:x}", process::id(), nanos)
}

fn lookup_cookie(context: &str, cookie_id: &str) -> Result<String> {
    let home = env::var("HOME")
        .map_err(|_| Error::Handshake("HOME is not set, cannot read keyring".into()))?;
    let path = format!("{}/.dbus-keyrings/{}", home, context);
    let contents = fs::read_to_string(&path)
        .map_err(|e| Error::Handshake(format!("cannot read keyring {}: {}", path, e)))?;
    for line in contents.lines() {
        let mut parts = line.split_ascii_whitespace();
        let id = parts.next();
        let _creation_time = parts.next();
        let cookie = parts.next();
        if let (Some(id), Some(cookie)) = (id, cookie) {
            if id == cookie_id {
                return Ok(cookie.to_string());
            }
        }
    }
    Err(Error::Handshake(format!(
        "no cookie with id {} in context {}",
        cookie_id, context
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// A pure in-memory duplex pipe, so the handshake state machine can be
    /// exercised without touching a real socket.
    struct MockSocket {
        inbound: VecDeque<u8>,
        outbound: Vec<u8>,
    }

    impl MockSocket {
        fn new(scripted_server_bytes: &[u8]) -> Self {
            MockSocket {
                inbound: scripted_server_bytes.iter().copied().collect(),
                outbound: Vec::new(),
            }
        }
    }

    impl Read for MockSocket {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut n = 0;
            while n < buf.len() {
                match self.inbound.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            if n == 0 && !buf.is_empty() {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
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

    #[test]
    fn handshake_succeeds_on_first_mechanism() {
        let mut socket = MockSocket::new(b"OK 1234deadbeef5678\r\n");
        let guid = handshake(&mut socket, 1000).unwrap();
        assert_eq!(guid, "1234deadbeef5678");
        let sent = String::from_utf8(socket.outbound).unwrap();
        assert!(sent.starts_with('\0'));
        assert!(sent.contains("AUTH EXTERNAL "));
        assert!(sent.ends_with("BEGIN\r\n"));
    }

    #[test]
    fn handshake_falls_through_rejected_mechanisms_to_anonymous() {
        let mut socket = MockSocket::new(
            b"REJECTED DBUS_COOKIE_SHA1 ANONYMOUS\r\nREJECTED ANONYMOUS\r\nOK cafe\r\n",
        );
        let guid = handshake(&mut socket, 1000).unwrap();
        assert_eq!(guid, "cafe");
    }

    #[test]
    fn handshake_fails_when_every_mechanism_is_rejected() {
        let mut socket = MockSocket::new(
            b"REJECTED DBUS_COOKIE_SHA1 ANONYMOUS\r\nREJECTED ANONYMOUS\r\nREJECTED \r\n",
        );
        assert!(handshake(&mut socket, 1000).is_err());
    }

    #[test]
    fn handshake_fails_on_error_line() {
        let mut socket = MockSocket::new(b"ERROR unsupported\r\n");
        assert!(handshake(&mut socket, 1000).is_err());
    }

    #[test]
    fn read_frame_computes_total_length_from_prefix() {
        use crate::message::{HeaderFields, Message, MessageType, Serial};
        use crate::names::{InterfaceName, MemberName};
        use std::str::FromStr;

        let msg = Message {
            message_type: MessageType::Signal,
            flags: crate::message::HeaderFlags::empty(),
            serial: Serial(1),
            fields: HeaderFields {
                path: Some("/a".into()),
                interface: Some(InterfaceName::from_str("a.b").unwrap()),
                member: Some(MemberName::from_str("C").unwrap()),
                ..Default::default()
            },
            body: vec![],
        };
        let bytes = msg.serialize(Endianness::Little).unwrap();
        let mut socket = MockSocket::new(&bytes);
        let framed = read_frame(&mut socket).unwrap();
        assert_eq!(framed, bytes);
    }
}
