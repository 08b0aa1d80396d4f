//! The typed value model: a tagged union holding one D-Bus value together
//! with its type, plus a structural projection to/from an untyped value
//! tree for application consumption (§4.2).

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::signature::{self, Type};

/// A single D-Bus value together with enough structure to recover its
/// type. Mirrors [`Type`] variant-for-variant (design note: "re-architect
/// as a tagged variant").
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    String(String),
    ObjectPath(String),
    Signature(String),
    UnixFd(u32),
    Array(Type, Vec<Value>),
    Struct(Vec<Value>),
    DictEntry(Box<Value>, Box<Value>),
    Variant(Type, Box<Value>),
}

impl Value {
    /// The [`Type`] of this value. For arrays the element type is taken
    /// from the value's own tag (it is not re-derived from the elements),
    /// since an empty array still carries a declared element type.
    pub fn ty(&self) -> Type {
        match self {
            Value::Byte(_) => Type::Byte,
            Value::Boolean(_) => Type::Boolean,
            Value::Int16(_) => Type::Int16,
            Value::Uint16(_) => Type::Uint16,
            Value::Int32(_) => Type::Int32,
            Value::Uint32(_) => Type::Uint32,
            Value::Int64(_) => Type::Int64,
            Value::Uint64(_) => Type::Uint64,
            Value::Double(_) => Type::Double,
            Value::String(_) => Type::String,
            Value::ObjectPath(_) => Type::ObjectPath,
            Value::Signature(_) => Type::Signature,
            Value::UnixFd(_) => Type::UnixFd,
            Value::Array(elem_ty, _) => Type::Array(Box::new(elem_ty.clone())),
            Value::Struct(fields) => Type::Struct(fields.iter().map(Value::ty).collect()),
            Value::DictEntry(key, value) => {
                Type::DictEntry(Box::new(key.ty()), Box::new(value.ty()))
            }
            Value::Variant(_, _) => Type::Variant,
        }
    }

    /// Structural projection to a plain, untyped value tree: variants and
    /// dict-entry arrays unwrap away, leaving only the data an application
    /// would want to consume.
    pub fn to_raw(&self) -> Raw {
        match self {
            Value::Byte(v) => Raw::Byte(*v),
            Value::Boolean(v) => Raw::Boolean(*v),
            Value::Int16(v) => Raw::Int64(*v as i64),
            Value::Uint16(v) => Raw::Uint64(*v as u64),
            Value::Int32(v) => Raw::Int64(*v as i64),
            Value::Uint32(v) => Raw::Uint64(*v as u64),
            Value::Int64(v) => Raw::Int64(*v),
            Value::Uint64(v) => Raw::Uint64(*v),
            Value::Double(v) => Raw::Double(*v),
            Value::String(v) | Value::ObjectPath(v) | Value::Signature(v) => {
                Raw::String(v.clone())
            }
            Value::UnixFd(v) => Raw::Uint64(*v as u64),
            Value::Array(elem_ty, items) => {
                if matches!(elem_ty, Type::DictEntry(_, _)) {
                    let mut map = BTreeMap::new();
                    for item in items {
                        if let Value::DictEntry(k, v) = item {
                            map.insert(raw_map_key(&k.to_raw()), v.to_raw());
                        }
                    }
                    Raw::Map(map)
                } else {
                    Raw::List(items.iter().map(Value::to_raw).collect())
                }
            }
            Value::Struct(fields) => Raw::List(fields.iter().map(Value::to_raw).collect()),
            Value::DictEntry(key, value) => {
                Raw::List(vec![key.to_raw(), value.to_raw()])
            }
            Value::Variant(_, inner) => inner.to_raw(),
        }
    }

    /// Attach types to a raw value tree given an explicit signature,
    /// the inverse of [`Value::to_raw`]. Guessing a type from a bare
    /// number is deliberately not supported (design note (a)): the caller
    /// must supply the signature.
    pub fn from_raw(ty: &Type, raw: &Raw) -> Result<Value> {
        match (ty, raw) {
            (Type::Byte, Raw::Byte(v)) => Ok(Value::Byte(*v)),
            (Type::Boolean, Raw::Boolean(v)) => Ok(Value::Boolean(*v)),
            (Type::Int16, Raw::Int64(v)) => to_range(*v, i16::MIN as i64, i16::MAX as i64)
                .map(|v| Value::Int16(v as i16)),
            (Type::Uint16, Raw::Uint64(v)) => to_range_u(*v, u16::MAX as u64)
                .map(|v| Value::Uint16(v as u16)),
            (Type::Int32, Raw::Int64(v)) => to_range(*v, i32::MIN as i64, i32::MAX as i64)
                .map(|v| Value::Int32(v as i32)),
            (Type::Uint32, Raw::Uint64(v)) => to_range_u(*v, u32::MAX as u64)
                .map(|v| Value::Uint32(v as u32)),
            (Type::Int64, Raw::Int64(v)) => Ok(Value::Int64(*v)),
            (Type::Uint64, Raw::Uint64(v)) => Ok(Value::Uint64(*v)),
            (Type::Double, Raw::Double(v)) => Ok(Value::Double(*v)),
            (Type::String, Raw::String(v)) => Ok(Value::String(v.clone())),
            (Type::ObjectPath, Raw::String(v)) => Ok(Value::ObjectPath(v.clone())),
            (Type::Signature, Raw::String(v)) => Ok(Value::Signature(v.clone())),
            (Type::UnixFd, Raw::Uint64(v)) => to_range_u(*v, u32::MAX as u64)
                .map(|v| Value::UnixFd(v as u32)),
            (Type::Array(elem_ty), Raw::List(items)) => {
                let values = items
                    .iter()
                    .map(|item| Value::from_raw(elem_ty, item))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Array((**elem_ty).clone(), values))
            }
            (Type::Array(elem_ty), Raw::Map(map)) => {
                let (key_ty, value_ty) = match elem_ty.as_ref() {
                    Type::DictEntry(k, v) => (k.as_ref(), v.as_ref()),
                    _ => return Err(raw_mismatch(ty, raw)),
                };
                let mut values = Vec::with_capacity(map.len());
                for (k, v) in map {
                    let key = Value::from_raw(key_ty, &raw_map_key_to_raw(key_ty, k)?)?;
                    let value = Value::from_raw(value_ty, v)?;
                    values.push(Value::DictEntry(Box::new(key), Box::new(value)));
                }
                Ok(Value::Array((**elem_ty).clone(), values))
            }
            (Type::Struct(field_tys), Raw::List(items)) => {
                if field_tys.len() != items.len() {
                    return Err(raw_mismatch(ty, raw));
                }
                let fields = field_tys
                    .iter()
                    .zip(items)
                    .map(|(t, v)| Value::from_raw(t, v))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Struct(fields))
            }
            (Type::Variant, _) => Err(Error::signature(
                "v",
                "variant requires an explicit inner type; use Value::Variant directly",
            )),
            _ => Err(raw_mismatch(ty, raw)),
        }
    }
}

fn raw_mismatch(ty: &Type, raw: &Raw) -> Error {
    Error::invalid_value(
        0,
        format!("raw value {:?} does not match type {}", raw, ty.render()),
    )
}

fn to_range(v: i64, min: i64, max: i64) -> Result<i64> {
    if v < min || v > max {
        return Err(Error::invalid_value(0, format!("{} out of range", v)));
    }
    Ok(v)
}

fn to_range_u(v: u64, max: u64) -> Result<u64> {
    if v > max {
        return Err(Error::invalid_value(0, format!("{} out of range", v)));
    }
    Ok(v)
}

/// A map key needs a total order to live in a `BTreeMap`; basic D-Bus types
/// are all naturally orderable, so we render them to a canonical string.
fn raw_map_key(raw: &Raw) -> String {
    match raw {
        Raw::Byte(v) => v.to_string(),
        Raw::Boolean(v) => v.to_string(),
        Raw::Int64(v) => v.to_string(),
        Raw::Uint64(v) => v.to_string(),
        Raw::Double(v) => v.to_string(),
        Raw::String(v) => v.clone(),
        other => format!("{:?}", other),
    }
}

fn raw_map_key_to_raw(key_ty: &Type, key: &str) -> Result<Raw> {
    Ok(match key_ty {
        Type::Byte => Raw::Byte(key.parse().map_err(|_| {
            Error::invalid_value(0, format!("invalid byte map key `{}`", key))
        })?),
        Type::Boolean => Raw::Boolean(key.parse().map_err(|_| {
            Error::invalid_value(0, format!("invalid boolean map key `{}`", key))
        })?),
        Type::Int16 | Type::Int32 | Type::Int64 => Raw::Int64(key.parse().map_err(|_| {
            Error::invalid_value(0, format!("invalid integer map key `{}`", key))
        })?),
        Type::Uint16 | Type::Uint32 | Type::Uint64 | Type::UnixFd => {
            Raw::Uint64(key.parse().map_err(|_| {
                Error::invalid_value(0, format!("invalid integer map key `{}`", key))
            })?)
        }
        Type::Double => Raw::Double(key.parse().map_err(|_| {
            Error::invalid_value(0, format!("invalid double map key `{}`", key))
        })?),
        Type::String | Type::ObjectPath | Type::Signature => Raw::String(key.to_string()),
        _ => {
            return Err(Error::signature(
                key_ty.render(),
                "dict-entry key must be a basic type",
            ))
        }
    })
}

/// An untyped value tree: what an application actually wants to read or
/// write, with variants and dict-entry arrays already unwrapped.
#[derive(Clone, Debug, PartialEq)]
pub enum Raw {
    Byte(u8),
    Boolean(bool),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    String(String),
    List(Vec<Raw>),
    Map(BTreeMap<String, Raw>),
}

/// Parse a variant's inner signature, which must describe exactly one
/// type (§4.3: "Variant signatures must describe exactly one type").
pub fn variant_type(inner_signature: &str) -> Result<Type> {
    signature::parse_single(inner_signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_raw_unwraps_variant() {
        let v = Value::Variant(Type::String, Box::new(Value::String("hi".into())));
        assert_eq!(v.to_raw(), Raw::String("hi".into()));
    }

    #[test]
    fn to_raw_collapses_dict_entry_array_to_map() {
        let entry = Value::DictEntry(
            Box::new(Value::String("key".into())),
            Box::new(Value::Variant(
                Type::String,
                Box::new(Value::String("value".into())),
            )),
        );
        let arr = Value::Array(
            Type::DictEntry(Box::new(Type::String), Box::new(Type::Variant)),
            vec![entry],
        );
        let mut expect = BTreeMap::new();
        expect.insert("key".to_string(), Raw::String("value".into()));
        assert_eq!(arr.to_raw(), Raw::Map(expect));
    }

    #[test]
    fn struct_projects_to_ordered_list() {
        let s = Value::Struct(vec![Value::Uint32(1), Value::String("a".into())]);
        assert_eq!(
            s.to_raw(),
            Raw::List(vec![Raw::Uint64(1), Raw::String("a".into())])
        );
    }

    #[test]
    fn from_raw_round_trips_struct() {
        let ty = Type::Struct(vec![Type::Uint32, Type::String]);
        let raw = Raw::List(vec![Raw::Uint64(7), Raw::String("x".into())]);
        let value = Value::from_raw(&ty, &raw).unwrap();
        assert_eq!(value, Value::Struct(vec![Value::Uint32(7), Value::String("x".into())]));
        assert_eq!(value.to_raw(), raw);
    }

    #[test]
    fn from_raw_rejects_out_of_range_integer() {
        let ty = Type::Byte;
        assert!(matches!(
            Value::from_raw(&ty, &Raw::Byte(10)),
            Ok(Value::Byte(10))
        ));
        let ty = Type::Uint16;
        assert!(Value::from_raw(&ty, &Raw::Uint64(70000)).is_err());
    }
}
