const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("buffer underrun: needed {needed} bytes, {remaining} remaining")]
    BufferUnderrun { needed: usize, remaining: usize },
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("string of {0} bytes exceeds the u16 length prefix")]
    StringTooLong(usize),
    #[error("negative blob length {0}")]
    NegativeLength(i32),
}

/// Little-endian writer over a growable byte buffer.
#[derive(Debug, Clone)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl Default for PacketWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buffer.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    pub fn write_string(&mut self, value: &str) -> Result<(), CodecError> {
        let len = value.len();
        if len > u16::MAX as usize {
            return Err(CodecError::StringTooLong(len));
        }
        self.write_u16(len as u16);
        self.buffer.extend_from_slice(value.as_bytes());
        Ok(())
    }

    /// Raw bytes with no prefix. The caller writes the length beforehand.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// `[i32 length][bytes]`, the blob layout used by field and call payloads.
    pub fn write_blob(&mut self, data: &[u8]) {
        self.write_i32(data.len() as i32);
        self.write_bytes(data);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

/// Bounds-checked little-endian reader over a borrowed datagram.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.remaining();
        if count > remaining {
            return Err(CodecError::BufferUnderrun {
                needed: count,
                remaining,
            });
        }
        let slice = &self.data[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_bits(u32::from_le_bytes(self.take_array()?)))
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u16()? as usize;
        if len == 0 {
            return Ok(String::new());
        }
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        self.take(count)
    }

    pub fn read_blob(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(CodecError::NegativeLength(len));
        }
        self.take(len as usize)
    }

    pub fn skip(&mut self, count: usize) -> Result<(), CodecError> {
        self.take(count).map(|_| ())
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.position..];
        self.position = self.data.len();
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_round_trip() {
        let mut writer = PacketWriter::new();
        for value in [0u32, 1, u32::MAX] {
            writer.write_u32(value);
        }
        for value in [0i32, -1, i32::MIN, i32::MAX] {
            writer.write_i32(value);
        }
        writer.write_u16(u16::MAX);
        writer.write_u8(7);

        let mut reader = PacketReader::new(writer.as_slice());
        assert_eq!(reader.read_u32().unwrap(), 0);
        assert_eq!(reader.read_u32().unwrap(), 1);
        assert_eq!(reader.read_u32().unwrap(), u32::MAX);
        assert_eq!(reader.read_i32().unwrap(), 0);
        assert_eq!(reader.read_i32().unwrap(), -1);
        assert_eq!(reader.read_i32().unwrap(), i32::MIN);
        assert_eq!(reader.read_i32().unwrap(), i32::MAX);
        assert_eq!(reader.read_u16().unwrap(), u16::MAX);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_float_round_trip_is_bit_exact() {
        let values = [0.0f32, -0.0, 3.14, -273.15, f32::MIN, f32::MAX, f32::EPSILON];
        let mut writer = PacketWriter::new();
        for value in values {
            writer.write_f32(value);
        }

        let mut reader = PacketReader::new(writer.as_slice());
        for value in values {
            assert_eq!(reader.read_f32().unwrap().to_bits(), value.to_bits());
        }
    }

    #[test]
    fn test_little_endian_layout() {
        let mut writer = PacketWriter::new();
        writer.write_u32(0x0403_0201);
        writer.write_u16(0x0605);
        assert_eq!(writer.as_slice(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_string_round_trip() {
        let mut writer = PacketWriter::new();
        writer.write_string("").unwrap();
        writer.write_string("hi").unwrap();
        writer.write_string("привет, 世界 🚀").unwrap();

        assert_eq!(&writer.as_slice()[..2], &[0, 0]);

        let mut reader = PacketReader::new(writer.as_slice());
        assert_eq!(reader.read_string().unwrap(), "");
        assert_eq!(reader.read_string().unwrap(), "hi");
        assert_eq!(reader.read_string().unwrap(), "привет, 世界 🚀");
        assert!(reader.is_empty());
    }

    #[test]
    fn test_string_too_long_rejected() {
        let mut writer = PacketWriter::new();
        let long = "x".repeat(u16::MAX as usize + 1);
        assert_eq!(
            writer.write_string(&long),
            Err(CodecError::StringTooLong(u16::MAX as usize + 1))
        );
        assert!(writer.is_empty());
    }

    #[test]
    fn test_underrun() {
        let mut reader = PacketReader::new(&[1, 2, 3]);
        assert_eq!(
            reader.read_u32(),
            Err(CodecError::BufferUnderrun {
                needed: 4,
                remaining: 3
            })
        );
        assert_eq!(reader.position(), 0);

        let mut reader = PacketReader::new(&[5, 0, b'a']);
        assert!(matches!(
            reader.read_string(),
            Err(CodecError::BufferUnderrun { .. })
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut reader = PacketReader::new(&[2, 0, 0xff, 0xfe]);
        assert_eq!(reader.read_string(), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn test_blob() {
        let mut writer = PacketWriter::new();
        writer.write_blob(&[9, 8, 7]);
        writer.write_blob(&[]);

        let mut reader = PacketReader::new(writer.as_slice());
        assert_eq!(reader.read_blob().unwrap(), &[9, 8, 7]);
        assert_eq!(reader.read_blob().unwrap(), &[] as &[u8]);

        let mut writer = PacketWriter::new();
        writer.write_i32(-4);
        let mut reader = PacketReader::new(writer.as_slice());
        assert_eq!(reader.read_blob(), Err(CodecError::NegativeLength(-4)));
    }

    #[test]
    fn test_writer_grows() {
        let mut writer = PacketWriter::with_capacity(2);
        for i in 0..1000u32 {
            writer.write_u32(i);
        }
        assert_eq!(writer.len(), 4000);
    }
}
