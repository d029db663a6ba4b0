use bitflags::bitflags;

use crate::codec::{CodecError, PacketReader, PacketWriter};

pub const MAX_PACKET_SIZE: usize = 1200;
pub const FRAME_HEADER_SIZE: usize = 13;
pub const DEFAULT_PORT: u16 = 11000;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

/// Single-byte control datagrams exchanged during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Sentinel {
    Connect = 0x01,
    Welcome = 0x02,
    Disconnect = 0x03,
}

impl Sentinel {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Connect),
            0x02 => Some(Self::Welcome),
            0x03 => Some(Self::Disconnect),
            _ => None,
        }
    }

    pub fn as_datagram(self) -> [u8; 1] {
        [self as u8]
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const RELIABLE = 0b0000_0001;
        const ASSIGN = 0b0000_0010;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    ReliableOrdered,
    Unreliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub flags: FrameFlags,
    pub sequence: u32,
    pub ack: u32,
    pub ack_bits: u32,
}

impl FrameHeader {
    pub fn new(flags: FrameFlags, sequence: u32, ack: u32, ack_bits: u32) -> Self {
        Self {
            flags,
            sequence,
            ack,
            ack_bits,
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.flags.contains(FrameFlags::RELIABLE)
    }

    pub fn write(&self, writer: &mut PacketWriter) {
        writer.write_u8(self.flags.bits());
        writer.write_u32(self.sequence);
        writer.write_u32(self.ack);
        writer.write_u32(self.ack_bits);
    }

    pub fn read(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let flags = FrameFlags::from_bits_truncate(reader.read_u8()?);
        Ok(Self {
            flags,
            sequence: reader.read_u32()?,
            ack: reader.read_u32()?,
            ack_bits: reader.read_u32()?,
        })
    }
}

pub fn encode_frame(header: &FrameHeader, payload: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(FRAME_HEADER_SIZE + payload.len());
    header.write(&mut writer);
    writer.write_bytes(payload);
    writer.into_vec()
}

pub fn decode_frame(datagram: &[u8]) -> Result<(FrameHeader, &[u8]), CodecError> {
    let mut reader = PacketReader::new(datagram);
    let header = FrameHeader::read(&mut reader)?;
    Ok((header, reader.rest()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datagram<'a> {
    Control(Sentinel),
    Frame(FrameHeader, &'a [u8]),
    Malformed,
}

/// Sentinels are exactly one byte; anything shorter than a frame header is noise.
pub fn classify(datagram: &[u8]) -> Datagram<'_> {
    if datagram.len() == 1 {
        return Sentinel::from_byte(datagram[0])
            .map(Datagram::Control)
            .unwrap_or(Datagram::Malformed);
    }
    if datagram.len() < FRAME_HEADER_SIZE {
        return Datagram::Malformed;
    }
    match decode_frame(datagram) {
        Ok((header, payload)) => Datagram::Frame(header, payload),
        Err(_) => Datagram::Malformed,
    }
}

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}
