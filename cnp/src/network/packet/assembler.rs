use bytes::{Buf, Bytes, BytesMut};

use super::{decode_len, Error, Packet, PacketType};

/// 从物理连接的字节流中组装报文
///
/// 不完整的报文头和负载会保存在这里，等待下一批数据到来
#[derive(Debug, Default)]
pub(crate) struct Assembler {
    /// 报文头缓冲区
    header: [u8; 4],
    /// 已读取的报文头字节数
    header_index: usize,
    /// 正在接收负载的报文，同一时间最多一个
    body: Option<Body>,
}

/// 正在接收负载的报文
#[derive(Debug)]
struct Body {
    packet_type: PacketType,
    port: u8,
    /// 报文头中声明的负载长度
    len: usize,
    /// 报文头中携带的校验和
    checksum: u8,
    /// 已接收字节的异或
    xor: u8,
    data: BytesMut,
}

impl Body {
    fn new(packet_type: PacketType, header: &[u8; 4]) -> Self {
        let len = decode_len(header[2]);
        Self {
            packet_type,
            port: header[1],
            len,
            checksum: header[3],
            xor: 0,
            data: BytesMut::with_capacity(len),
        }
    }

    /// 尽可能多地消耗输入，返回负载是否已经收齐
    fn fill(&mut self, input: &mut Bytes) -> bool {
        let take = (self.len - self.data.len()).min(input.len());
        let chunk = input.split_to(take);
        self.xor = chunk.iter().fold(self.xor, |acc, byte| acc ^ byte);
        self.data.extend_from_slice(&chunk);

        self.data.len() == self.len
    }

    fn finish(self) -> Result<Packet, Error> {
        let Body {
            packet_type,
            port,
            checksum,
            xor,
            data,
            ..
        } = self;

        if checksum != xor {
            return Err(Error::Checksum { packet_type, port });
        }

        let data = data.freeze();
        match packet_type {
            PacketType::Service => Ok(Packet::Service { port, data }),
            PacketType::Open => Ok(Packet::Open { port, data }),
            _ => Ok(Packet::Data { port, data }),
        }
    }
}

impl Assembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 从输入中取出下一个报文
    ///
    /// 返回 `None` 说明输入已经耗尽，未完成的部分保留到下一次调用。
    /// 无法识别的类型字节会被丢弃，从下一个字节重新同步
    pub(crate) fn next(&mut self, input: &mut Bytes) -> Option<Result<Packet, Error>> {
        loop {
            if let Some(mut body) = self.body.take() {
                if !body.fill(input) {
                    self.body = Some(body);
                    return None;
                }
                return Some(body.finish());
            }

            if !input.has_remaining() {
                return None;
            }

            self.header[self.header_index] = input.get_u8();
            self.header_index += 1;

            let packet_type = match PacketType::try_from(self.header[0]) {
                Ok(packet_type) => packet_type,
                Err(e) => {
                    self.header_index = 0;
                    return Some(Err(e));
                }
            };

            if self.header_index < packet_type.header_len() {
                continue;
            }
            self.header_index = 0;

            let port = self.header[1];
            let packet = match packet_type {
                PacketType::KeepAlive | PacketType::KeepAliveAlt => Packet::KeepAlive,
                PacketType::Close => Packet::Close { port },
                PacketType::Timeout => Packet::Timeout { port },
                PacketType::Ack => Packet::Ack { port },
                PacketType::Nak => Packet::Nak { port },
                PacketType::Service | PacketType::Open | PacketType::Data => {
                    self.body = Some(Body::new(packet_type, &self.header));
                    continue;
                }
            };

            return Some(Ok(packet));
        }
    }

    /// 是否有未完成的报文
    #[cfg(test)]
    pub(crate) fn is_pending(&self) -> bool {
        self.header_index > 0 || self.body.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::checksum;

    fn drain(assembler: &mut Assembler, mut input: Bytes) -> Vec<Result<Packet, Error>> {
        let mut packets = Vec::new();
        while let Some(packet) = assembler.next(&mut input) {
            packets.push(packet);
        }
        assert!(input.is_empty());
        packets
    }

    fn body_frame(packet_type: u8, port: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![
            packet_type,
            port,
            (payload.len() % 256) as u8,
            checksum(payload),
        ];
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn multiple_packets_in_one_chunk() {
        let mut stream = vec![0x2D, 0x41, 3];
        stream.extend(body_frame(0x44, 3, b"hello"));
        stream.extend([0x2B, 0x43, 4]);

        let mut assembler = Assembler::new();
        let packets = drain(&mut assembler, Bytes::from(stream));

        let packets: Vec<Packet> = packets.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            packets,
            vec![
                Packet::KeepAlive,
                Packet::Ack { port: 3 },
                Packet::Data {
                    port: 3,
                    data: Bytes::from_static(b"hello")
                },
                Packet::KeepAlive,
                Packet::Close { port: 4 },
            ]
        );
        assert!(!assembler.is_pending());
    }

    #[test]
    fn packet_split_across_chunks() {
        let frame = body_frame(0x4F, 7, b"example.com:80");
        let mut assembler = Assembler::new();

        // 报文头和负载都被切开
        assert!(drain(&mut assembler, Bytes::copy_from_slice(&frame[..2])).is_empty());
        assert!(assembler.is_pending());
        assert!(drain(&mut assembler, Bytes::copy_from_slice(&frame[2..9])).is_empty());

        let packets = drain(&mut assembler, Bytes::copy_from_slice(&frame[9..]));
        assert_eq!(packets.len(), 1);
        assert_eq!(
            packets[0].as_ref().unwrap(),
            &Packet::Open {
                port: 7,
                data: Bytes::from_static(b"example.com:80")
            }
        );
        assert!(!assembler.is_pending());
    }

    #[test]
    fn byte_at_a_time() {
        let frame = body_frame(0x53, 0, b"ENDSESSION");
        let mut assembler = Assembler::new();

        let mut packets = Vec::new();
        for byte in frame {
            packets.extend(drain(&mut assembler, Bytes::from(vec![byte])));
        }
        assert_eq!(packets.len(), 1);
        assert!(matches!(
            packets[0].as_ref().unwrap(),
            Packet::Service { data, .. } if data.as_ref() == b"ENDSESSION"
        ));
    }

    #[test]
    fn zero_length_byte_reads_256_bytes() {
        let payload = vec![0x5Au8; 256];
        let frame = body_frame(0x44, 1, &payload);
        assert_eq!(frame[2], 0x00);

        let mut assembler = Assembler::new();
        let mut stream = frame;
        stream.extend([0x41, 1]);
        let packets = drain(&mut assembler, Bytes::from(stream));

        assert_eq!(packets.len(), 2);
        match packets[0].as_ref().unwrap() {
            Packet::Data { port, data } => {
                assert_eq!(*port, 1);
                assert_eq!(data.len(), 256);
            }
            other => panic!("unexpected packet {:?}", other),
        }
        assert_eq!(packets[1].as_ref().unwrap(), &Packet::Ack { port: 1 });
    }

    #[test]
    fn flipped_bit_fails_checksum() {
        let mut frame = body_frame(0x44, 5, b"payload");
        frame[6] ^= 0b0000_0100;

        let mut assembler = Assembler::new();
        let packets = drain(&mut assembler, Bytes::from(frame));

        assert_eq!(packets.len(), 1);
        assert!(matches!(
            packets[0],
            Err(Error::Checksum {
                packet_type: PacketType::Data,
                port: 5
            })
        ));
        assert!(!assembler.is_pending());
    }

    #[test]
    fn unrecognized_byte_resynchronizes() {
        let mut assembler = Assembler::new();
        let packets = drain(&mut assembler, Bytes::from_static(&[0x0D, 0x41, 2]));

        assert_eq!(packets.len(), 2);
        assert!(matches!(packets[0], Err(Error::InvalidPacketType(0x0D))));
        assert_eq!(packets[1].as_ref().unwrap(), &Packet::Ack { port: 2 });
    }
}
