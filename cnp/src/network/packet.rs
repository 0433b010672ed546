//! CNP 报文格式
//!
//! * keepalive: 1 字节，只有类型
//! * service / open / data: 类型, 端口, 长度, 校验和，后跟长度个字节的负载
//! * close / timeout / ack / nak: 类型, 端口
//!
//! 长度字节为 0 表示 256 字节，校验和为负载所有字节的异或

use bytes::{BufMut, Bytes, BytesMut};

pub(crate) use assembler::Assembler;

mod assembler;

/// 单个报文负载的最大长度
pub const MAX_PAYLOAD_LENGTH: usize = 0x100;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),
    #[error("Checksum mismatch on {packet_type:?} packet for port {port}")]
    Checksum { packet_type: PacketType, port: u8 },
    #[error("Payload size incorrect: {0}")]
    PayloadSizeIncorrect(usize),
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    KeepAlive = 0x2D,
    KeepAliveAlt = 0x2B,
    Service = 0x53,
    Open = 0x4F,
    Close = 0x43,
    Timeout = 0x54,
    Ack = 0x41,
    Nak = 0x4E,
    Data = 0x44,
}

impl PacketType {
    /// 报文头长度
    #[inline]
    pub fn header_len(&self) -> usize {
        match self {
            PacketType::KeepAlive | PacketType::KeepAliveAlt => 1,
            PacketType::Close | PacketType::Timeout | PacketType::Ack | PacketType::Nak => 2,
            PacketType::Service | PacketType::Open | PacketType::Data => 4,
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x2D => Ok(PacketType::KeepAlive),
            0x2B => Ok(PacketType::KeepAliveAlt),
            0x53 => Ok(PacketType::Service),
            0x4F => Ok(PacketType::Open),
            0x43 => Ok(PacketType::Close),
            0x54 => Ok(PacketType::Timeout),
            0x41 => Ok(PacketType::Ack),
            0x4E => Ok(PacketType::Nak),
            0x44 => Ok(PacketType::Data),
            other => Err(Error::InvalidPacketType(other)),
        }
    }
}

/// 一个完整的报文
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    KeepAlive,
    Service { port: u8, data: Bytes },
    Open { port: u8, data: Bytes },
    Data { port: u8, data: Bytes },
    Close { port: u8 },
    Timeout { port: u8 },
    Ack { port: u8 },
    Nak { port: u8 },
}

impl Packet {
    #[inline]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::KeepAlive => PacketType::KeepAlive,
            Packet::Service { .. } => PacketType::Service,
            Packet::Open { .. } => PacketType::Open,
            Packet::Data { .. } => PacketType::Data,
            Packet::Close { .. } => PacketType::Close,
            Packet::Timeout { .. } => PacketType::Timeout,
            Packet::Ack { .. } => PacketType::Ack,
            Packet::Nak { .. } => PacketType::Nak,
        }
    }

    pub fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        match self {
            Packet::KeepAlive => stream.put_u8(PacketType::KeepAlive as u8),
            Packet::Service { port, data }
            | Packet::Open { port, data }
            | Packet::Data { port, data } => {
                if data.is_empty() || data.len() > MAX_PAYLOAD_LENGTH {
                    return Err(Error::PayloadSizeIncorrect(data.len()));
                }
                write_body(stream, self.packet_type(), *port, data);
            }
            Packet::Close { port }
            | Packet::Timeout { port }
            | Packet::Ack { port }
            | Packet::Nak { port } => {
                stream.put_u8(self.packet_type() as u8);
                stream.put_u8(*port);
            }
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut stream = BytesMut::new();
        self.write(&mut stream)?;
        Ok(stream.freeze())
    }
}

fn write_body(stream: &mut BytesMut, packet_type: PacketType, port: u8, payload: &[u8]) {
    stream.reserve(4 + payload.len());
    stream.put_u8(packet_type as u8);
    stream.put_u8(port);
    stream.put_u8(encode_len(payload.len()));
    stream.put_u8(checksum(payload));
    stream.extend_from_slice(payload);
}

/// 长度字节 0 表示 256
#[inline]
pub fn decode_len(byte: u8) -> usize {
    match byte {
        0 => MAX_PAYLOAD_LENGTH,
        n => n as usize,
    }
}

#[inline]
pub fn encode_len(len: usize) -> u8 {
    (len % MAX_PAYLOAD_LENGTH) as u8
}

pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, byte| acc ^ byte)
}
