use anyhow::bail;
use byteorder::{ByteOrder, LittleEndian};

use crate::packet::Packet;

/// Security options applied to a freshly accepted client connection,
/// mirroring what the backend itself negotiates.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeConfig {
    pub blowfish: bool,
    pub security_bytes: bool,
    pub handshake: bool,
}

impl HandshakeConfig {
    /// What the relay asks of every accepted client (the backend does
    /// the same on its side).
    pub fn server_default() -> Self {
        Self {
            blowfish: true,
            security_bytes: true,
            handshake: true,
        }
    }

    pub fn none() -> Self {
        Self {
            blowfish: false,
            security_bytes: false,
            handshake: false,
        }
    }
}

/// The protocol framing/encryption context of one socket. Opaque to the
/// relay: it only moves bytes in and packets out (and back). The real
/// security implementation plugs in here; [`PlainCodec`] serves
/// unsecured deployments and tests.
pub trait Codec: Send {
    /// Select handshake behaviour for this connection. Called once,
    /// before any byte is exchanged.
    fn configure(&mut self, config: HandshakeConfig);

    /// Consume raw bytes off the socket, returning every packet that
    /// became complete. Partial frames are buffered internally.
    fn feed(&mut self, bytes: &[u8]) -> anyhow::Result<Vec<Packet>>;

    /// Serialize a packet into zero or more ready-to-write buffers.
    fn encode(&mut self, packet: &Packet) -> anyhow::Result<Vec<Vec<u8>>>;

    /// Buffers the codec generated on its own (handshake replies). Must
    /// be drained and written after every `feed` and after `configure`.
    fn take_pending(&mut self) -> Vec<Vec<u8>>;
}

/// Frame cap shared by encode and decode. A length field above this is
/// an unrecoverable framing state and closes the transport.
const MAX_PAYLOAD: usize = 8192;

const FLAG_ENCRYPTED: u16 = 0x8000;
const FLAG_MASSIVE: u16 = 0x4000;
const LEN_MASK: u16 = 0x3FFF;
const HEADER_LEN: usize = 4;

/// Plain framing with no encryption: `size: u16` (bit 15 = encrypted,
/// bit 14 = massive, low 14 bits = payload length), `opcode: u16`, then
/// the payload, all little endian.
#[derive(Default)]
pub struct PlainCodec {
    buffer: Vec<u8>,
}

impl PlainCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Codec for PlainCodec {
    fn configure(&mut self, _config: HandshakeConfig) {
        // No handshake in plain framing.
    }

    fn feed(&mut self, bytes: &[u8]) -> anyhow::Result<Vec<Packet>> {
        self.buffer.extend_from_slice(bytes);

        let mut packets = Vec::new();
        while self.buffer.len() >= HEADER_LEN {
            let size = LittleEndian::read_u16(&self.buffer[0..2]);
            let len = (size & LEN_MASK) as usize;
            if len > MAX_PAYLOAD {
                bail!("frame length {len} exceeds cap {MAX_PAYLOAD}");
            }
            if self.buffer.len() < HEADER_LEN + len {
                break;
            }
            let opcode = LittleEndian::read_u16(&self.buffer[2..4]);
            let payload = self.buffer[HEADER_LEN..HEADER_LEN + len].to_vec();
            self.buffer.drain(..HEADER_LEN + len);
            packets.push(Packet {
                opcode,
                payload,
                encrypted: size & FLAG_ENCRYPTED != 0,
                massive: size & FLAG_MASSIVE != 0,
            });
        }
        Ok(packets)
    }

    fn encode(&mut self, packet: &Packet) -> anyhow::Result<Vec<Vec<u8>>> {
        if packet.payload.len() > MAX_PAYLOAD {
            bail!(
                "payload of 0x{:04X} is {} bytes, over the {MAX_PAYLOAD} cap",
                packet.opcode,
                packet.payload.len()
            );
        }
        let mut size = packet.payload.len() as u16;
        if packet.encrypted {
            size |= FLAG_ENCRYPTED;
        }
        if packet.massive {
            size |= FLAG_MASSIVE;
        }
        let mut out = Vec::with_capacity(HEADER_LEN + packet.payload.len());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&packet.opcode.to_le_bytes());
        out.extend_from_slice(&packet.payload);
        Ok(vec![out])
    }

    fn take_pending(&mut self) -> Vec<Vec<u8>> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_one(codec: &mut PlainCodec, packet: &Packet) -> Vec<u8> {
        codec.encode(packet).unwrap().remove(0)
    }

    #[test]
    fn split_feeds_reassemble_in_wire_order() -> anyhow::Result<()> {
        let mut codec = PlainCodec::new();
        let first = Packet::new(0x2001, vec![1, 2, 3]);
        let second = Packet {
            opcode: 0xA102,
            payload: vec![9; 5],
            encrypted: true,
            massive: true,
        };
        let mut wire = encode_one(&mut codec, &first);
        wire.extend(encode_one(&mut codec, &second));

        // Feed in awkward chunks: header split, then the rest.
        assert!(codec.feed(&wire[..3])?.is_empty());
        let got = codec.feed(&wire[3..])?;
        assert_eq!(got, vec![first, second]);
        Ok(())
    }

    #[test]
    fn flags_survive_framing() -> anyhow::Result<()> {
        let mut codec = PlainCodec::new();
        let packet = Packet {
            opcode: 0xA100,
            payload: vec![2, 2],
            encrypted: true,
            massive: false,
        };
        let wire = encode_one(&mut codec, &packet);
        let got = codec.feed(&wire)?;
        assert_eq!(got.len(), 1);
        assert!(got[0].encrypted);
        assert!(!got[0].massive);
        Ok(())
    }

    #[test]
    fn oversized_payload_refused_on_encode() {
        let mut codec = PlainCodec::new();
        let packet = Packet::new(0x0001, vec![0; MAX_PAYLOAD + 1]);
        assert!(codec.encode(&packet).is_err());
    }
}
