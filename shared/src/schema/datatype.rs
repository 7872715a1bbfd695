use std::collections::HashMap;

use log::error;
use thiserror::Error;

use crate::bundle::Bundle;
use crate::byte_stream::{ByteStream, StreamError};

/// Registry id of a wire data type. Ids 1..=20 are the engine's built-ins;
/// higher ids are aliases defined by the server's entity schema.
pub type TypeId = u16;

pub const DATATYPE_STRING: TypeId = 1;
pub const DATATYPE_UINT8: TypeId = 2;
pub const DATATYPE_UINT16: TypeId = 3;
pub const DATATYPE_UINT32: TypeId = 4;
pub const DATATYPE_UINT64: TypeId = 5;
pub const DATATYPE_INT8: TypeId = 6;
pub const DATATYPE_INT16: TypeId = 7;
pub const DATATYPE_INT32: TypeId = 8;
pub const DATATYPE_INT64: TypeId = 9;
pub const DATATYPE_PYTHON: TypeId = 10;
pub const DATATYPE_BLOB: TypeId = 11;
pub const DATATYPE_UNICODE: TypeId = 12;
pub const DATATYPE_FLOAT: TypeId = 13;
pub const DATATYPE_DOUBLE: TypeId = 14;
pub const DATATYPE_VECTOR2: TypeId = 15;
pub const DATATYPE_VECTOR3: TypeId = 16;
pub const DATATYPE_VECTOR4: TypeId = 17;
pub const DATATYPE_FIXED_DICT: TypeId = 18;
pub const DATATYPE_ARRAY: TypeId = 19;
pub const DATATYPE_ENTITYCALL: TypeId = 20;

/// Errors raised while importing or applying the entity schema. All of them
/// mean the schema blob and the client disagree; the connection that
/// produced the blob is not worth keeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// A type id that no built-in or imported alias answers to.
    #[error("no data type registered under id {id}")]
    UnknownType { id: TypeId },
    /// An alias whose base type name resolves to nothing.
    #[error("alias {name:?} references unknown base type {base:?}")]
    UnresolvedAlias { name: String, base: String },
    /// A fixed dict value handed in for encoding lacks a declared key.
    #[error("fixed dict value is missing key {key:?}")]
    MissingKey { key: String },
    /// A value whose shape cannot be written as the declared wire type.
    #[error("value does not match wire type {expected}")]
    WrongType { expected: &'static str },
}

pub(crate) type TypeTable = HashMap<TypeId, DataType>;

/// A property, method argument or nested value as carried on the wire.
///
/// The numeric variants are interchangeable where a numeric type is
/// expected, as long as the value fits the target's range.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Blob(Vec<u8>),
    Vector2([f32; 2]),
    Vector3([f32; 3]),
    Vector4([f32; 4]),
    /// Fixed dict values in declared key order.
    Dict(Vec<(String, Value)>),
    Array(Vec<Value>),
}

impl Value {
    /// The value as a number, when it holds one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int8(n) => Some(f64::from(*n)),
            Value::Int16(n) => Some(f64::from(*n)),
            Value::Int32(n) => Some(f64::from(*n)),
            Value::Int64(n) => Some(*n as f64),
            Value::UInt8(n) => Some(f64::from(*n)),
            Value::UInt16(n) => Some(f64::from(*n)),
            Value::UInt32(n) => Some(f64::from(*n)),
            Value::UInt64(n) => Some(*n as f64),
            Value::Float(n) => Some(f64::from(*n)),
            Value::Double(n) => Some(*n),
            _ => None,
        }
    }

    fn as_i64(&self) -> i64 {
        match self {
            Value::Int8(n) => i64::from(*n),
            Value::Int16(n) => i64::from(*n),
            Value::Int32(n) => i64::from(*n),
            Value::Int64(n) => *n,
            Value::UInt8(n) => i64::from(*n),
            Value::UInt16(n) => i64::from(*n),
            Value::UInt32(n) => i64::from(*n),
            Value::UInt64(n) => *n as i64,
            Value::Float(n) => *n as i64,
            Value::Double(n) => *n as i64,
            _ => 0,
        }
    }

    fn as_u64(&self) -> u64 {
        match self {
            Value::Int8(n) => *n as u64,
            Value::Int16(n) => *n as u64,
            Value::Int32(n) => *n as u64,
            Value::Int64(n) => *n as u64,
            Value::UInt8(n) => u64::from(*n),
            Value::UInt16(n) => u64::from(*n),
            Value::UInt32(n) => u64::from(*n),
            Value::UInt64(n) => *n,
            Value::Float(n) => *n as u64,
            Value::Double(n) => *n as u64,
            _ => 0,
        }
    }

    fn as_f64(&self) -> f64 {
        self.as_number().unwrap_or(0.0)
    }
}

/// One wire data type: a built-in scalar, or a server-declared FIXED_DICT
/// or ARRAY whose nested types are referenced by [`TypeId`].
#[derive(Clone, Debug, PartialEq)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    String,
    Unicode,
    Python,
    Blob,
    EntityCall,
    Vector2,
    Vector3,
    Vector4,
    FixedDict {
        implemented_by: String,
        /// Keyed values in wire order.
        keys: Vec<(String, TypeId)>,
    },
    Array {
        item: TypeId,
    },
}

fn in_range(v: &Value, min: f64, max: f64) -> bool {
    match v.as_number() {
        Some(n) => n >= min && n <= max,
        None => false,
    }
}

impl DataType {
    /// Whether `v` is an acceptable value for this wire type. Numerics are
    /// checked by range, everything else by shape.
    pub(crate) fn is_same_type(&self, types: &TypeTable, v: &Value) -> bool {
        match self {
            DataType::Int8 => in_range(v, f64::from(i8::MIN), f64::from(i8::MAX)),
            DataType::Int16 => in_range(v, f64::from(i16::MIN), f64::from(i16::MAX)),
            DataType::Int32 => in_range(v, f64::from(i32::MIN), f64::from(i32::MAX)),
            DataType::Int64 => in_range(v, i64::MIN as f64, i64::MAX as f64),
            DataType::UInt8 => in_range(v, 0.0, f64::from(u8::MAX)),
            DataType::UInt16 => in_range(v, 0.0, f64::from(u16::MAX)),
            DataType::UInt32 => in_range(v, 0.0, f64::from(u32::MAX)),
            DataType::UInt64 => in_range(v, 0.0, u64::MAX as f64),
            DataType::Float | DataType::Double => {
                matches!(v, Value::Float(_) | Value::Double(_))
            }
            DataType::String | DataType::Unicode => matches!(v, Value::String(_)),
            DataType::Python | DataType::Blob | DataType::EntityCall => {
                matches!(v, Value::Blob(_))
            }
            DataType::Vector2 => matches!(v, Value::Vector2(_)),
            DataType::Vector3 => matches!(v, Value::Vector3(_)),
            DataType::Vector4 => matches!(v, Value::Vector4(_)),
            DataType::FixedDict { keys, .. } => {
                let entries = match v {
                    Value::Dict(entries) => entries,
                    _ => return false,
                };
                for (key, type_id) in keys {
                    let nested = match types.get(type_id) {
                        Some(t) => t,
                        None => {
                            error!(
                                "DataType::is_same_type: fixed dict key({}) has no data type({})!",
                                key, type_id
                            );
                            return false;
                        }
                    };
                    match entries.iter().find(|(k, _)| k == key) {
                        Some((_, value)) if nested.is_same_type(types, value) => {}
                        _ => return false,
                    }
                }
                true
            }
            DataType::Array { item } => {
                let items = match v {
                    Value::Array(items) => items,
                    _ => return false,
                };
                let nested = match types.get(item) {
                    Some(t) => t,
                    None => {
                        error!("DataType::is_same_type: array has no item type({})!", item);
                        return false;
                    }
                };
                items.iter().all(|value| nested.is_same_type(types, value))
            }
        }
    }

    pub(crate) fn decode(
        &self,
        types: &TypeTable,
        stream: &mut ByteStream,
    ) -> Result<Value, SchemaError> {
        match self {
            DataType::Int8 => Ok(Value::Int8(stream.read_i8()?)),
            DataType::Int16 => Ok(Value::Int16(stream.read_i16()?)),
            DataType::Int32 => Ok(Value::Int32(stream.read_i32()?)),
            DataType::Int64 => Ok(Value::Int64(stream.read_i64()?)),
            DataType::UInt8 => Ok(Value::UInt8(stream.read_u8()?)),
            DataType::UInt16 => Ok(Value::UInt16(stream.read_u16()?)),
            DataType::UInt32 => Ok(Value::UInt32(stream.read_u32()?)),
            DataType::UInt64 => Ok(Value::UInt64(stream.read_u64()?)),
            DataType::Float => Ok(Value::Float(stream.read_f32()?)),
            DataType::Double => Ok(Value::Double(stream.read_f64()?)),
            DataType::String => Ok(Value::String(stream.read_string()?)),
            DataType::Unicode => Ok(Value::String(stream.read_utf8()?)),
            DataType::Python | DataType::Blob | DataType::EntityCall => {
                Ok(Value::Blob(stream.read_blob()?))
            }
            DataType::Vector2 => {
                let x = stream.read_f32()?;
                let y = stream.read_f32()?;
                Ok(Value::Vector2([x, y]))
            }
            DataType::Vector3 => {
                let x = stream.read_f32()?;
                let y = stream.read_f32()?;
                let z = stream.read_f32()?;
                Ok(Value::Vector3([x, y, z]))
            }
            DataType::Vector4 => {
                let x = stream.read_f32()?;
                let y = stream.read_f32()?;
                let z = stream.read_f32()?;
                let w = stream.read_f32()?;
                Ok(Value::Vector4([x, y, z, w]))
            }
            DataType::FixedDict { keys, .. } => {
                let mut entries = Vec::with_capacity(keys.len());
                for (key, type_id) in keys {
                    let nested = types
                        .get(type_id)
                        .ok_or(SchemaError::UnknownType { id: *type_id })?;
                    entries.push((key.clone(), nested.decode(types, stream)?));
                }
                Ok(Value::Dict(entries))
            }
            DataType::Array { item } => {
                let nested = types
                    .get(item)
                    .ok_or(SchemaError::UnknownType { id: *item })?;
                let mut count = stream.read_u32()?;
                let mut items = Vec::new();
                while count > 0 {
                    count -= 1;
                    items.push(nested.decode(types, stream)?);
                }
                Ok(Value::Array(items))
            }
        }
    }

    pub(crate) fn encode(
        &self,
        types: &TypeTable,
        bundle: &mut Bundle,
        v: &Value,
    ) -> Result<(), SchemaError> {
        match self {
            DataType::Int8 => bundle.write_i8(v.as_i64() as i8),
            DataType::Int16 => bundle.write_i16(v.as_i64() as i16),
            DataType::Int32 => bundle.write_i32(v.as_i64() as i32),
            DataType::Int64 => bundle.write_i64(v.as_i64()),
            DataType::UInt8 => bundle.write_u8(v.as_u64() as u8),
            DataType::UInt16 => bundle.write_u16(v.as_u64() as u16),
            DataType::UInt32 => bundle.write_u32(v.as_u64() as u32),
            DataType::UInt64 => bundle.write_u64(v.as_u64()),
            DataType::Float => bundle.write_f32(v.as_f64() as f32),
            DataType::Double => bundle.write_f64(v.as_f64()),
            DataType::String => match v {
                Value::String(s) => bundle.write_string(s),
                _ => return Err(SchemaError::WrongType { expected: "STRING" }),
            },
            DataType::Unicode => match v {
                Value::String(s) => bundle.write_utf8(s),
                _ => return Err(SchemaError::WrongType { expected: "UNICODE" }),
            },
            DataType::Python | DataType::Blob | DataType::EntityCall => match v {
                Value::Blob(bytes) => bundle.write_blob(bytes),
                _ => return Err(SchemaError::WrongType { expected: "BLOB" }),
            },
            DataType::Vector2 => match v {
                Value::Vector2(a) => {
                    bundle.write_f32(a[0]);
                    bundle.write_f32(a[1]);
                }
                _ => return Err(SchemaError::WrongType { expected: "VECTOR2" }),
            },
            DataType::Vector3 => match v {
                Value::Vector3(a) => {
                    bundle.write_f32(a[0]);
                    bundle.write_f32(a[1]);
                    bundle.write_f32(a[2]);
                }
                _ => return Err(SchemaError::WrongType { expected: "VECTOR3" }),
            },
            DataType::Vector4 => match v {
                Value::Vector4(a) => {
                    bundle.write_f32(a[0]);
                    bundle.write_f32(a[1]);
                    bundle.write_f32(a[2]);
                    bundle.write_f32(a[3]);
                }
                _ => return Err(SchemaError::WrongType { expected: "VECTOR4" }),
            },
            DataType::FixedDict { keys, .. } => {
                let entries = match v {
                    Value::Dict(entries) => entries,
                    _ => {
                        return Err(SchemaError::WrongType {
                            expected: "FIXED_DICT",
                        })
                    }
                };
                for (key, type_id) in keys {
                    let nested = types
                        .get(type_id)
                        .ok_or(SchemaError::UnknownType { id: *type_id })?;
                    let value = entries
                        .iter()
                        .find(|(k, _)| k == key)
                        .map(|(_, value)| value)
                        .ok_or_else(|| SchemaError::MissingKey { key: key.clone() })?;
                    nested.encode(types, bundle, value)?;
                }
            }
            DataType::Array { item } => {
                let items = match v {
                    Value::Array(items) => items,
                    _ => return Err(SchemaError::WrongType { expected: "ARRAY" }),
                };
                let nested = types
                    .get(item)
                    .ok_or(SchemaError::UnknownType { id: *item })?;
                bundle.write_u32(items.len() as u32);
                for value in items {
                    nested.encode(types, bundle, value)?;
                }
            }
        }
        Ok(())
    }

    /// The value a property starts with, parsed from the schema's default
    /// string. Unparsable numerics fall back to zero.
    pub(crate) fn default_value(&self, types: &TypeTable, s: &str) -> Value {
        match self {
            DataType::Int8 => Value::Int8(s.trim().parse().unwrap_or(0)),
            DataType::Int16 => Value::Int16(s.trim().parse().unwrap_or(0)),
            DataType::Int32 => Value::Int32(s.trim().parse().unwrap_or(0)),
            DataType::Int64 => Value::Int64(s.trim().parse().unwrap_or(0)),
            DataType::UInt8 => Value::UInt8(s.trim().parse().unwrap_or(0)),
            DataType::UInt16 => Value::UInt16(s.trim().parse().unwrap_or(0)),
            DataType::UInt32 => Value::UInt32(s.trim().parse().unwrap_or(0)),
            DataType::UInt64 => Value::UInt64(s.trim().parse().unwrap_or(0)),
            DataType::Float => Value::Float(s.trim().parse().unwrap_or(0.0)),
            DataType::Double => Value::Double(s.trim().parse().unwrap_or(0.0)),
            DataType::String | DataType::Unicode => Value::String(s.to_string()),
            DataType::Python | DataType::Blob | DataType::EntityCall => Value::Blob(Vec::new()),
            DataType::Vector2 => Value::Vector2([0.0; 2]),
            DataType::Vector3 => Value::Vector3([0.0; 3]),
            DataType::Vector4 => Value::Vector4([0.0; 4]),
            DataType::FixedDict { keys, .. } => {
                let mut entries = Vec::with_capacity(keys.len());
                for (key, type_id) in keys {
                    match types.get(type_id) {
                        Some(nested) => {
                            entries.push((key.clone(), nested.default_value(types, "")))
                        }
                        None => error!(
                            "DataType::default_value: fixed dict key({}) has no data type({})!",
                            key, type_id
                        ),
                    }
                }
                Value::Dict(entries)
            }
            DataType::Array { .. } => Value::Array(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{SegmentSink, SendError};
    use crate::catalog::{ArgsKind, MessageDescriptor};

    struct CollectSink(Vec<Vec<u8>>);

    impl SegmentSink for CollectSink {
        fn send_segment(&mut self, data: &[u8]) -> Result<(), SendError> {
            self.0.push(data.to_vec());
            Ok(())
        }
    }

    // Encodes one value through a variable-length message and returns the
    // body bytes past the 4-byte header.
    fn encode_body(types: &TypeTable, ty: &DataType, v: &Value) -> Vec<u8> {
        let msg = MessageDescriptor {
            id: 1000,
            name: "t".to_string(),
            length: -1,
            args_kind: ArgsKind::Raw,
            arg_types: Vec::new(),
        };
        let mut bundle = Bundle::new();
        bundle.start_message(&msg);
        ty.encode(types, &mut bundle, v).unwrap();
        let mut sink = CollectSink(Vec::new());
        assert!(bundle.send(&mut sink).is_ok());
        assert_eq!(sink.0.len(), 1);
        sink.0[0][4..].to_vec()
    }

    fn base_types() -> TypeTable {
        let mut types = TypeTable::new();
        types.insert(DATATYPE_UINT8, DataType::UInt8);
        types.insert(DATATYPE_INT32, DataType::Int32);
        types.insert(DATATYPE_UNICODE, DataType::Unicode);
        types
    }

    #[test]
    fn numerics_are_interchangeable_in_range() {
        let types = TypeTable::new();
        assert!(DataType::UInt8.is_same_type(&types, &Value::Int32(200)));
        assert!(!DataType::UInt8.is_same_type(&types, &Value::Int32(300)));
        assert!(!DataType::UInt8.is_same_type(&types, &Value::Int32(-1)));
        assert!(DataType::Int64.is_same_type(&types, &Value::UInt8(7)));
        assert!(!DataType::Int8.is_same_type(&types, &Value::String("7".into())));
    }

    #[test]
    fn float_accepts_only_floating_values() {
        let types = TypeTable::new();
        assert!(DataType::Float.is_same_type(&types, &Value::Double(1.0)));
        assert!(DataType::Double.is_same_type(&types, &Value::Float(1.0)));
        assert!(!DataType::Float.is_same_type(&types, &Value::Int32(1)));
    }

    #[test]
    fn fixed_dict_decodes_in_declared_order() {
        let mut types = base_types();
        let dict = DataType::FixedDict {
            implemented_by: String::new(),
            keys: vec![
                ("hp".to_string(), DATATYPE_INT32),
                ("name".to_string(), DATATYPE_UNICODE),
            ],
        };
        types.insert(100, dict.clone());

        let mut stream = ByteStream::new();
        stream.write_i32(42);
        stream.write_utf8("orc");

        let value = dict.decode(&types, &mut stream).unwrap();
        assert_eq!(
            value,
            Value::Dict(vec![
                ("hp".to_string(), Value::Int32(42)),
                ("name".to_string(), Value::String("orc".to_string())),
            ])
        );
    }

    #[test]
    fn array_encodes_count_then_items() {
        let types = base_types();
        let array = DataType::Array {
            item: DATATYPE_UINT8,
        };

        let body = encode_body(
            &types,
            &array,
            &Value::Array(vec![Value::UInt8(1), Value::UInt8(2), Value::UInt8(3)]),
        );
        assert_eq!(body, vec![3, 0, 0, 0, 1, 2, 3]);
    }

    #[test]
    fn fixed_dict_encode_requires_declared_keys() {
        let types = base_types();
        let dict = DataType::FixedDict {
            implemented_by: String::new(),
            keys: vec![("hp".to_string(), DATATYPE_INT32)],
        };

        let msg = MessageDescriptor {
            id: 1000,
            name: "t".to_string(),
            length: -1,
            args_kind: ArgsKind::Raw,
            arg_types: Vec::new(),
        };
        let mut bundle = Bundle::new();
        bundle.start_message(&msg);
        let err = dict
            .encode(&types, &mut bundle, &Value::Dict(vec![]))
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::MissingKey {
                key: "hp".to_string()
            }
        );
    }

    #[test]
    fn defaults_parse_leniently() {
        let types = base_types();
        assert_eq!(
            DataType::Int32.default_value(&types, "250"),
            Value::Int32(250)
        );
        assert_eq!(DataType::Int32.default_value(&types, ""), Value::Int32(0));
        assert_eq!(
            DataType::Float.default_value(&types, "1.5"),
            Value::Float(1.5)
        );
        assert_eq!(
            DataType::String.default_value(&types, "abc"),
            Value::String("abc".to_string())
        );
        assert_eq!(
            DataType::Vector3.default_value(&types, ""),
            Value::Vector3([0.0; 3])
        );
    }
}
