use std::fmt;

use crate::codec::{CodecError, PacketReader, PacketWriter};

/// Primitive kinds a field or remote-call argument may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    I32,
    U32,
    F32,
    Str,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I32(i32),
    U32(u32),
    F32(f32),
    Str(String),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::I32(_) => ValueKind::I32,
            Value::U32(_) => ValueKind::U32,
            Value::F32(_) => ValueKind::F32,
            Value::Str(_) => ValueKind::Str,
        }
    }

    pub fn write(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        match self {
            Value::I32(v) => writer.write_i32(*v),
            Value::U32(v) => writer.write_u32(*v),
            Value::F32(v) => writer.write_f32(*v),
            Value::Str(v) => writer.write_string(v)?,
        }
        Ok(())
    }

    pub fn read(kind: ValueKind, reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(match kind {
            ValueKind::I32 => Value::I32(reader.read_i32()?),
            ValueKind::U32 => Value::U32(reader.read_u32()?),
            ValueKind::F32 => Value::F32(reader.read_f32()?),
            ValueKind::Str => Value::Str(reader.read_string()?),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}u", v),
            Value::F32(v) => write!(f, "{}f", v),
            Value::Str(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::I32(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::U32(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::F32(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

/// Types a `Field` can hold.
pub trait FieldValue: Clone + PartialEq + fmt::Debug + Send + 'static {
    const KIND: ValueKind;

    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError>;
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError>;

    /// Whether writing `other` over `self` would put the same bytes on the wire.
    fn same(&self, other: &Self) -> bool {
        self == other
    }
}

impl FieldValue for i32 {
    const KIND: ValueKind = ValueKind::I32;

    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_i32(*self);
        Ok(())
    }

    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        reader.read_i32()
    }
}

impl FieldValue for u32 {
    const KIND: ValueKind = ValueKind::U32;

    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u32(*self);
        Ok(())
    }

    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        reader.read_u32()
    }
}

impl FieldValue for f32 {
    const KIND: ValueKind = ValueKind::F32;

    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_f32(*self);
        Ok(())
    }

    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        reader.read_f32()
    }

    fn same(&self, other: &Self) -> bool {
        self.to_bits() == other.to_bits()
    }
}

impl FieldValue for String {
    const KIND: ValueKind = ValueKind::Str;

    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_string(self)
    }

    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        reader.read_string()
    }
}

#[cfg(test)]
#[allow(clippy::approx_constant)]
mod tests {
    use super::*;

    #[test]
    fn test_value_round_trip() {
        let values = [
            Value::I32(i32::MIN),
            Value::I32(-1),
            Value::U32(u32::MAX),
            Value::F32(-0.0),
            Value::F32(f32::MAX),
            Value::Str(String::new()),
            Value::Str("こんにちは".into()),
        ];

        let mut writer = PacketWriter::new();
        for value in &values {
            value.write(&mut writer).unwrap();
        }

        let mut reader = PacketReader::new(writer.as_slice());
        for value in &values {
            let decoded = Value::read(value.kind(), &mut reader).unwrap();
            match (value, &decoded) {
                (Value::F32(a), Value::F32(b)) => assert_eq!(a.to_bits(), b.to_bits()),
                _ => assert_eq!(value, &decoded),
            }
        }
        assert!(reader.is_empty());
    }

    #[test]
    fn test_conversions() {
        assert_eq!(Value::from(42), Value::I32(42));
        assert_eq!(Value::from(7u32).kind(), ValueKind::U32);
        assert_eq!(Value::from("hi"), Value::Str("hi".into()));
        assert_eq!(Value::from(3.14f32).kind(), ValueKind::F32);
    }
}
