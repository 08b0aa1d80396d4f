//! Type-signature grammar: parsing a signature string into a tree of
//! [`Type`] nodes, and rendering a tree back to its canonical string.

use std::fmt;

use crate::error::{Error, Result};

/// Maximum signature length in bytes (D-Bus specification).
pub const MAX_SIGNATURE_LENGTH: usize = 255;

/// Maximum container nesting depth (D-Bus specification).
pub const MAX_NESTING_DEPTH: u8 = 32;

/// A single D-Bus type, forming a tree for container types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Type {
    Byte,
    Boolean,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
    Array(Box<Type>),
    Struct(Vec<Type>),
    DictEntry(Box<Type>, Box<Type>),
    Variant,
}

impl Type {
    /// The single-character type code for this type, as it appears in a
    /// signature string (the opening bracket for containers).
    pub fn code(&self) -> char {
        match self {
            Type::Byte => 'y',
            Type::Boolean => 'b',
            Type::Int16 => 'n',
            Type::Uint16 => 'q',
            Type::Int32 => 'i',
            Type::Uint32 => 'u',
            Type::Int64 => 'x',
            Type::Uint64 => 't',
            Type::Double => 'd',
            Type::String => 's',
            Type::ObjectPath => 'o',
            Type::Signature => 'g',
            Type::UnixFd => 'h',
            Type::Array(_) => 'a',
            Type::Struct(_) => '(',
            Type::DictEntry(_, _) => '{',
            Type::Variant => 'v',
        }
    }

    /// Alignment, in bytes, required before a value of this type (§4.3).
    pub fn alignment(&self) -> usize {
        match self {
            Type::Byte | Type::Signature | Type::Variant => 1,
            Type::Int16 | Type::Uint16 => 2,
            Type::Boolean
            | Type::Int32
            | Type::Uint32
            | Type::UnixFd
            | Type::String
            | Type::ObjectPath
            | Type::Array(_) => 4,
            Type::Int64
            | Type::Uint64
            | Type::Double
            | Type::Struct(_)
            | Type::DictEntry(_, _) => 8,
        }
    }

    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Type::Array(_) | Type::Struct(_) | Type::DictEntry(_, _) | Type::Variant
        )
    }

    /// Render this single type back to its canonical signature fragment.
    pub fn render(&self) -> String {
        let mut out = String::new();
        render_into(self, &mut out);
        out
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

fn render_into(ty: &Type, out: &mut String) {
    match ty {
        Type::Array(elem) => {
            out.push('a');
            render_into(elem, out);
        }
        Type::Struct(fields) => {
            out.push('(');
            for field in fields {
                render_into(field, out);
            }
            out.push(')');
        }
        Type::DictEntry(key, value) => {
            out.push('{');
            render_into(key, out);
            render_into(value, out);
            out.push('}');
        }
        other => out.push(other.code()),
    }
}

/// Render a sequence of types (e.g. a method's whole argument list) to its
/// canonical signature string.
pub fn render(types: &[Type]) -> String {
    let mut out = String::new();
    for ty in types {
        render_into(ty, &mut out);
    }
    out
}

/// Parse a signature string into its sequence of top-level types.
///
/// Errors: unknown code, unexpected end, nesting beyond
/// [`MAX_NESTING_DEPTH`], signature longer than [`MAX_SIGNATURE_LENGTH`],
/// a dict-entry outside of an array, or a dict-entry whose key is not a
/// basic type.
pub fn parse(signature: &str) -> Result<Vec<Type>> {
    if signature.len() > MAX_SIGNATURE_LENGTH {
        return Err(Error::signature(signature, "exceeds maximum length of 255 bytes"));
    }
    if !signature.is_ascii() {
        return Err(Error::signature(signature, "signature must be ASCII"));
    }

    let bytes = signature.as_bytes();
    let mut parser = Parser {
        bytes,
        pos: 0,
        signature,
    };
    let mut types = Vec::new();
    while parser.pos < bytes.len() {
        types.push(parser.parse_one(0, false)?);
    }
    Ok(types)
}

/// Parse a signature that must describe exactly one type (used for variant
/// inner signatures).
pub fn parse_single(signature: &str) -> Result<Type> {
    let types = parse(signature)?;
    if types.len() != 1 {
        return Err(Error::signature(
            signature,
            "variant signature must describe exactly one type",
        ));
    }
    Ok(types.into_iter().next().unwrap())
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    signature: &'a str,
}

impl<'a> Parser<'a> {
    fn err(&self, reason: impl Into<String>) -> Error {
        Error::signature(self.signature, reason)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn next(&mut self) -> Result<u8> {
        let b = self.peek().ok_or_else(|| self.err("unexpected end of signature"))?;
        self.pos += 1;
        Ok(b)
    }

    /// Parse a single complete type starting at the current position.
    /// `depth` is the current container nesting depth; `in_array` is true
    /// when this type is the direct child of an array (so a dict-entry is
    /// legal here).
    fn parse_one(&mut self, depth: u8, in_array: bool) -> Result<Type> {
        if depth > MAX_NESTING_DEPTH {
            return Err(self.err(format!("nesting exceeds {} levels", MAX_NESTING_DEPTH)));
        }
        let code = self.next()?;
        match code {
            b'y' => Ok(Type::Byte),
            b'b' => Ok(Type::Boolean),
            b'n' => Ok(Type::Int16),
            b'q' => Ok(Type::Uint16),
            b'i' => Ok(Type::Int32),
            b'u' => Ok(Type::Uint32),
            b'x' => Ok(Type::Int64),
            b't' => Ok(Type::Uint64),
            b'd' => Ok(Type::Double),
            b's' => Ok(Type::String),
            b'o' => Ok(Type::ObjectPath),
            b'g' => Ok(Type::Signature),
            b'h' => Ok(Type::UnixFd),
            b'v' => Ok(Type::Variant),
            b'a' => {
                let elem = self.parse_one(depth + 1, true)?;
                Ok(Type::Array(Box::new(elem)))
            }
            b'(' => {
                let mut fields = Vec::new();
                loop {
                    match self.peek() {
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => fields.push(self.parse_one(depth + 1, false)?),
                        None => return Err(self.err("unterminated struct, missing ')'")),
                    }
                }
                if fields.is_empty() {
                    return Err(self.err("struct must have at least one field"));
                }
                Ok(Type::Struct(fields))
            }
            b'{' => {
                if !in_array {
                    return Err(self.err("dict-entry must appear directly inside an array"));
                }
                let key = self.parse_one(depth + 1, false)?;
                if !key.is_basic() {
                    return Err(self.err("dict-entry key must be a basic type"));
                }
                let value = self.parse_one(depth + 1, false)?;
                match self.next()? {
                    b'}' => Ok(Type::DictEntry(Box::new(key), Box::new(value))),
                    _ => Err(self.err("dict-entry must be followed by '}'")),
                }
            }
            b')' | b'}' => Err(self.err(format!("unexpected closing bracket '{}'", code as char))),
            other => Err(self.err(format!("unknown type code '{}'", other as char))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_types() {
        assert_eq!(parse("y").unwrap(), vec![Type::Byte]);
        assert_eq!(parse("b").unwrap(), vec![Type::Boolean]);
        assert_eq!(parse("n").unwrap(), vec![Type::Int16]);
        assert_eq!(parse("q").unwrap(), vec![Type::Uint16]);
        assert_eq!(parse("i").unwrap(), vec![Type::Int32]);
        assert_eq!(parse("u").unwrap(), vec![Type::Uint32]);
        assert_eq!(parse("x").unwrap(), vec![Type::Int64]);
        assert_eq!(parse("t").unwrap(), vec![Type::Uint64]);
        assert_eq!(parse("d").unwrap(), vec![Type::Double]);
        assert_eq!(parse("s").unwrap(), vec![Type::String]);
        assert_eq!(parse("o").unwrap(), vec![Type::ObjectPath]);
        assert_eq!(parse("g").unwrap(), vec![Type::Signature]);
        assert_eq!(parse("h").unwrap(), vec![Type::UnixFd]);
        assert_eq!(parse("v").unwrap(), vec![Type::Variant]);
    }

    #[test]
    fn parses_array_of_struct() {
        let parsed = parse("a(si)").unwrap();
        assert_eq!(
            parsed,
            vec![Type::Array(Box::new(Type::Struct(vec![
                Type::String,
                Type::Int32
            ])))]
        );
    }

    #[test]
    fn parses_dict_entry_array() {
        let parsed = parse("a{sv}").unwrap();
        assert_eq!(
            parsed,
            vec![Type::Array(Box::new(Type::DictEntry(
                Box::new(Type::String),
                Box::new(Type::Variant)
            )))]
        );
    }

    #[test]
    fn empty_signature_parses_to_empty_vec() {
        assert_eq!(parse("").unwrap(), Vec::<Type>::new());
    }

    #[test]
    fn rejects_unknown_code() {
        assert!(parse("z").is_err());
    }

    #[test]
    fn rejects_dict_entry_outside_array() {
        assert!(parse("{sv}").is_err());
    }

    #[test]
    fn rejects_dict_entry_with_container_key() {
        assert!(parse("a{(i)v}").is_err());
    }

    #[test]
    fn rejects_unterminated_struct() {
        assert!(parse("(si").is_err());
    }

    #[test]
    fn rejects_empty_struct() {
        assert!(parse("()").is_err());
    }

    #[test]
    fn rejects_oversized_signature() {
        let too_long = "y".repeat(MAX_SIGNATURE_LENGTH + 1);
        assert!(parse(&too_long).is_err());
    }

    #[test]
    fn rejects_excess_nesting() {
        let deep = format!(
            "{}y{}",
            "a".repeat((MAX_NESTING_DEPTH + 2) as usize),
            ""
        );
        assert!(parse(&deep).is_err());
    }

    #[test]
    fn round_trip_render_parse() {
        for sig in ["y", "as", "a{sv}", "(siu)", "a(ya{sv})", "v"] {
            let parsed = parse(sig).unwrap();
            let rendered = render(&parsed);
            assert_eq!(rendered, sig);
            assert_eq!(parse(&rendered).unwrap(), parsed);
        }
    }

    #[quickcheck_macros::quickcheck]
    fn round_trip_law(structured: SmallSignature) -> bool {
        let sig = structured.0;
        match parse(&sig) {
            Ok(types) => render(&types) == sig && parse(&render(&types)).unwrap() == types,
            Err(_) => true,
        }
    }

    /// A small generator biased toward valid-looking signatures, so the
    /// round-trip property test exercises the parser without spending all
    /// its budget on strings that are trivially rejected.
    #[derive(Clone, Debug)]
    pub struct SmallSignature(pub String);

    impl quickcheck::Arbitrary for SmallSignature {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            let alphabet = ['y', 'b', 'n', 'q', 'i', 'u', 'x', 't', 'd', 's', 'o', 'g', 'v'];
            let len = u8::arbitrary(g) % 6;
            let mut s = String::new();
            for _ in 0..len {
                let c = *g.choose(&alphabet).unwrap();
                s.push(c);
            }
            SmallSignature(s)
        }
    }
}
