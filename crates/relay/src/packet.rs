use std::io::Cursor;
use std::io::Read;

use anyhow::Context;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// One decoded protocol packet. Immutable once built; the payload is a
/// flat byte block whose meaning depends on the opcode.
///
/// `encrypted` and `massive` are out-of-band framing flags consumed by
/// the codec, never part of the logical payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub opcode: u16,
    pub payload: Vec<u8>,
    pub encrypted: bool,
    pub massive: bool,
}

impl Packet {
    pub fn new(opcode: u16, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            payload,
            encrypted: false,
            massive: false,
        }
    }

    pub fn reader(&self) -> PacketReader<'_> {
        PacketReader {
            cursor: Cursor::new(&self.payload),
        }
    }
}

/// Sequential field reader over a packet payload. Fields must be read in
/// the exact order the wire schema defines for that opcode; a truncated
/// read surfaces as an error, a misordered one is a caller bug.
pub struct PacketReader<'a> {
    cursor: Cursor<&'a Vec<u8>>,
}

impl PacketReader<'_> {
    pub fn read_u8(&mut self) -> anyhow::Result<u8> {
        self.cursor.read_u8().context("packet payload truncated (u8)")
    }

    pub fn read_u16(&mut self) -> anyhow::Result<u16> {
        self.cursor
            .read_u16::<LittleEndian>()
            .context("packet payload truncated (u16)")
    }

    pub fn read_u32(&mut self) -> anyhow::Result<u32> {
        self.cursor
            .read_u32::<LittleEndian>()
            .context("packet payload truncated (u32)")
    }

    /// Length-prefixed (u16) ASCII string.
    pub fn read_ascii(&mut self) -> anyhow::Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        if !bytes.is_ascii() {
            anyhow::bail!("packet string is not valid ASCII");
        }
        String::from_utf8(bytes).context("packet string is not valid ASCII")
    }

    pub fn read_bytes(&mut self, count: usize) -> anyhow::Result<Vec<u8>> {
        let mut out = vec![0u8; count];
        self.cursor
            .read_exact(&mut out)
            .context("packet payload truncated (bytes)")?;
        Ok(out)
    }

    /// Bytes left unread in the payload.
    pub fn remaining(&self) -> usize {
        self.cursor.get_ref().len() - self.cursor.position() as usize
    }

    pub fn read_remaining(&mut self) -> anyhow::Result<Vec<u8>> {
        let left = self.remaining();
        self.read_bytes(left)
    }
}

/// Sequential field writer producing a [`Packet`]. The write order must
/// match the wire schema for the opcode.
pub struct PacketWriter {
    opcode: u16,
    encrypted: bool,
    massive: bool,
    payload: Vec<u8>,
}

impl PacketWriter {
    pub fn new(opcode: u16) -> Self {
        Self {
            opcode,
            encrypted: false,
            massive: false,
            payload: Vec::new(),
        }
    }

    /// Carry over the framing flags of the packet being rewritten.
    pub fn with_flags(opcode: u16, encrypted: bool, massive: bool) -> Self {
        Self {
            opcode,
            encrypted,
            massive,
            payload: Vec::new(),
        }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.payload.push(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        // Writing to a Vec cannot fail.
        let _ = self.payload.write_u16::<LittleEndian>(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        let _ = self.payload.write_u32::<LittleEndian>(value);
        self
    }

    pub fn write_ascii(&mut self, value: &str) -> &mut Self {
        self.write_u16(value.len() as u16);
        self.payload.extend_from_slice(value.as_bytes());
        self
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.payload.extend_from_slice(value);
        self
    }

    pub fn finish(self) -> Packet {
        Packet {
            opcode: self.opcode,
            payload: self.payload,
            encrypted: self.encrypted,
            massive: self.massive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_round_trip_in_write_order() -> anyhow::Result<()> {
        let mut w = PacketWriter::with_flags(0xA102, true, false);
        w.write_u8(1)
            .write_u32(0xDEAD_BEEF)
            .write_ascii("10.0.0.7")
            .write_u16(15884)
            .write_bytes(&[9, 9, 9]);
        let packet = w.finish();
        assert!(packet.encrypted);
        assert!(!packet.massive);

        let mut r = packet.reader();
        assert_eq!(r.read_u8()?, 1);
        assert_eq!(r.read_u32()?, 0xDEAD_BEEF);
        assert_eq!(r.read_ascii()?, "10.0.0.7");
        assert_eq!(r.read_u16()?, 15884);
        assert_eq!(r.remaining(), 3);
        assert_eq!(r.read_remaining()?, vec![9, 9, 9]);
        assert_eq!(r.remaining(), 0);
        Ok(())
    }

    #[test]
    fn non_ascii_string_bytes_are_an_error() {
        // Valid UTF-8 ("é"), but outside ASCII.
        let mut w = PacketWriter::new(0xA102);
        w.write_u16(2).write_bytes(&[0xC3, 0xA9]);
        let packet = w.finish();
        assert!(packet.reader().read_ascii().is_err());
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let packet = Packet::new(0xA100, vec![2]);
        let mut r = packet.reader();
        assert_eq!(r.read_u8().unwrap(), 2);
        assert!(r.read_u16().is_err());
    }
}
