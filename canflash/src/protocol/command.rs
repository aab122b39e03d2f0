//! Bootloader command protocol.
//!
//! Every command is a single extended CAN frame addressed to the device with
//! the command bit set. The payload is always 8 bytes, opcode first; bytes the
//! command does not use are zero.
//!
//! ```text
//! +--------+----------------------------------------------+
//! | Opcode |                  Arguments                   |
//! +--------+----------------------------------------------+
//! |  0x01  | pointer high, pointer low          (set Z)   |
//! |  0x02  | length (1..=8)                     (read)    |
//! |  0x03  | -                                  (erase)   |
//! |  0x04  | word count, up to 6 data bytes     (load)    |
//! |  0x05  | -                                  (write)   |
//! |  0x06  | -                                  (reset)   |
//! +--------+----------------------------------------------+
//! ```
//!
//! The device answers only `read`, with a frame from its own identifier
//! whose first `length` payload bytes are the flash contents.

use crate::bus::BusFrame;
use crate::device::{DeviceAddress, is_command_id};
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};

/// Payload broadcast by a device that waits for firmware.
pub const BOOT_MAGIC: [u8; 8] = *b"BOOTMAGC";

/// Length of every command payload.
pub const PAYLOAD_LEN: usize = 8;

/// Largest `load_buffer` chunk (three 16-bit words).
pub const MAX_LOAD_CHUNK: usize = 6;

/// Largest `read` chunk.
pub const MAX_READ_CHUNK: usize = 8;

/// Command opcodes understood by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Set the device's flash pointer (0x01).
    SetPointer = 0x01,
    /// Read flash at the pointer (0x02).
    Read = 0x02,
    /// Erase the page at the pointer (0x03).
    Erase = 0x03,
    /// Append words to the page write buffer (0x04).
    LoadBuffer = 0x04,
    /// Commit the write buffer to flash (0x05).
    Write = 0x05,
    /// Leave the bootloader (0x06).
    Reset = 0x06,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::SetPointer),
            0x02 => Ok(Self::Read),
            0x03 => Ok(Self::Erase),
            0x04 => Ok(Self::LoadBuffer),
            0x05 => Ok(Self::Write),
            0x06 => Ok(Self::Reset),
            v => Err(Error::Protocol(format!("unknown opcode 0x{v:02X}"))),
        }
    }
}

/// A decoded bootloader command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Set the flash pointer to a byte offset.
    SetPointer(u16),
    /// Read `n` bytes at the pointer.
    Read(u8),
    /// Erase the page at the pointer.
    Erase,
    /// Append bytes (an even count, at most 6) to the write buffer.
    LoadBuffer(Vec<u8>),
    /// Commit the write buffer.
    Write,
    /// Reset into the application.
    Reset,
}

impl Command {
    /// Opcode of this command.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::SetPointer(_) => Opcode::SetPointer,
            Self::Read(_) => Opcode::Read,
            Self::Erase => Opcode::Erase,
            Self::LoadBuffer(_) => Opcode::LoadBuffer,
            Self::Write => Opcode::Write,
            Self::Reset => Opcode::Reset,
        }
    }

    /// Build the 8-byte payload.
    ///
    /// Chunk limits are checked here, so an invalid command never reaches
    /// the bus.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Result<[u8; PAYLOAD_LEN]> {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[0] = self.opcode() as u8;

        match self {
            Self::SetPointer(offset) => {
                BigEndian::write_u16(&mut payload[1..3], *offset);
            },
            Self::Read(len) => {
                check_read_len(usize::from(*len))?;
                payload[1] = *len;
            },
            Self::LoadBuffer(data) => {
                check_load_len(data.len())?;
                // Safe cast: at most 3 words
                payload[1] = (data.len() / 2) as u8;
                payload[2..2 + data.len()].copy_from_slice(data);
            },
            Self::Erase | Self::Write | Self::Reset => {},
        }

        Ok(payload)
    }

    /// Decode a command payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (&opcode, args) = payload
            .split_first()
            .ok_or_else(|| Error::MalformedFrame("empty command payload".into()))?;

        let need = |n: usize| {
            if args.len() < n {
                Err(Error::MalformedFrame(format!(
                    "command 0x{opcode:02X} needs {n} argument bytes, got {}",
                    args.len()
                )))
            } else {
                Ok(())
            }
        };

        match Opcode::try_from(opcode)? {
            Opcode::SetPointer => {
                need(2)?;
                Ok(Self::SetPointer(BigEndian::read_u16(&args[..2])))
            },
            Opcode::Read => {
                need(1)?;
                check_read_len(usize::from(args[0]))?;
                Ok(Self::Read(args[0]))
            },
            Opcode::Erase => Ok(Self::Erase),
            Opcode::LoadBuffer => {
                need(1)?;
                let len = usize::from(args[0]) * 2;
                check_load_len(len)?;
                need(1 + len)?;
                Ok(Self::LoadBuffer(args[1..=len].to_vec()))
            },
            Opcode::Write => Ok(Self::Write),
            Opcode::Reset => Ok(Self::Reset),
        }
    }

    /// Build the bus frame carrying this command to `addr`.
    pub fn to_frame(&self, addr: DeviceAddress) -> Result<BusFrame> {
        BusFrame::extended(addr.command_id(), &self.encode()?)
    }
}

fn check_load_len(len: usize) -> Result<()> {
    if len > MAX_LOAD_CHUNK {
        return Err(Error::InvalidChunk(format!(
            "load of {len} bytes exceeds {MAX_LOAD_CHUNK}"
        )));
    }
    if len % 2 != 0 {
        return Err(Error::InvalidChunk(format!(
            "load of {len} bytes is not a whole number of words"
        )));
    }
    Ok(())
}

fn check_read_len(len: usize) -> Result<()> {
    if len == 0 || len > MAX_READ_CHUNK {
        return Err(Error::InvalidChunk(format!(
            "read of {len} bytes outside 1..={MAX_READ_CHUNK}"
        )));
    }
    Ok(())
}

/// Check whether a frame is a boot request and return the requesting device.
///
/// Only extended data frames from the device identifier space qualify, and
/// the payload must be exactly [`BOOT_MAGIC`].
pub fn parse_boot_request(frame: &BusFrame) -> Option<DeviceAddress> {
    if !frame.is_extended() || frame.is_remote() || is_command_id(frame.id()) {
        return None;
    }
    if frame.data() != BOOT_MAGIC {
        return None;
    }
    Some(DeviceAddress::from_identifier(frame.id()))
}

/// Extract the first `len` bytes of a read reply from `addr`.
pub fn parse_read_reply(frame: &BusFrame, addr: DeviceAddress, len: usize) -> Result<&[u8]> {
    if !frame.is_extended() || frame.is_remote() || frame.id() != addr.device_id() {
        return Err(Error::MalformedFrame(format!(
            "expected read reply from {addr}, got {frame:?}"
        )));
    }
    frame.data().get(..len).ok_or_else(|| {
        Error::MalformedFrame(format!(
            "read reply from {addr} carries {} bytes, expected {len}",
            frame.data().len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> DeviceAddress {
        DeviceAddress::new(0x42).unwrap()
    }

    #[test]
    fn test_set_pointer_is_big_endian() {
        let payload = Command::SetPointer(0x1E40).encode().unwrap();
        assert_eq!(payload, [0x01, 0x1E, 0x40, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_single_byte_commands() {
        assert_eq!(Command::Erase.encode().unwrap()[0], 0x03);
        assert_eq!(Command::Write.encode().unwrap()[0], 0x05);
        assert_eq!(Command::Reset.encode().unwrap(), [0x06, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_load_buffer_counts_words() {
        let payload = Command::LoadBuffer(vec![0xAA, 0xBB, 0xCC, 0xDD])
            .encode()
            .unwrap();
        assert_eq!(payload, [0x04, 0x02, 0xAA, 0xBB, 0xCC, 0xDD, 0, 0]);
    }

    #[test]
    fn test_load_buffer_rejects_odd_and_oversized() {
        assert!(matches!(
            Command::LoadBuffer(vec![1, 2, 3]).encode(),
            Err(Error::InvalidChunk(_))
        ));
        assert!(matches!(
            Command::LoadBuffer(vec![0; 8]).encode(),
            Err(Error::InvalidChunk(_))
        ));
    }

    #[test]
    fn test_read_limits() {
        assert_eq!(Command::Read(8).encode().unwrap()[..2], [0x02, 0x08]);
        assert!(Command::Read(0).encode().is_err());
        assert!(Command::Read(9).encode().is_err());
    }

    #[test]
    fn test_decode_matches_encode() {
        for cmd in [
            Command::SetPointer(0x0140),
            Command::Read(3),
            Command::Erase,
            Command::LoadBuffer(vec![1, 2, 3, 4, 5, 6]),
            Command::Write,
            Command::Reset,
        ] {
            let payload = cmd.encode().unwrap();
            assert_eq!(Command::decode(&payload).unwrap(), cmd);
        }
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        assert!(Command::decode(&[0x07, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(Command::decode(&[]).is_err());
    }

    #[test]
    fn test_command_frame_uses_command_identifier() {
        let frame = Command::Erase.to_frame(addr()).unwrap();
        assert!(frame.is_extended());
        assert_eq!(frame.id(), addr().command_id());
        assert_eq!(frame.data().len(), PAYLOAD_LEN);
    }

    #[test]
    fn test_boot_request_accepted() {
        let frame = BusFrame::extended(0x0000_1234, &BOOT_MAGIC).unwrap();
        assert_eq!(
            parse_boot_request(&frame),
            Some(DeviceAddress::new(0x1234).unwrap())
        );
    }

    #[test]
    fn test_boot_request_with_command_identifier_ignored() {
        let frame = BusFrame::extended(addr().command_id(), &BOOT_MAGIC).unwrap();
        assert_eq!(parse_boot_request(&frame), None);
    }

    #[test]
    fn test_boot_request_shape_checks() {
        let standard = BusFrame::standard(0x42, &BOOT_MAGIC).unwrap();
        assert_eq!(parse_boot_request(&standard), None);

        let remote = BusFrame::extended(0x42, &BOOT_MAGIC).unwrap().into_remote();
        assert_eq!(parse_boot_request(&remote), None);

        let wrong = BusFrame::extended(0x42, b"BOOTMAGX").unwrap();
        assert_eq!(parse_boot_request(&wrong), None);

        let short = BusFrame::extended(0x42, b"BOOTMAG").unwrap();
        assert_eq!(parse_boot_request(&short), None);
    }

    #[test]
    fn test_read_reply_checks() {
        let reply = BusFrame::extended(0x42, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(parse_read_reply(&reply, addr(), 3).unwrap(), &[1, 2, 3]);

        let short = BusFrame::extended(0x42, &[1, 2]).unwrap();
        assert!(parse_read_reply(&short, addr(), 3).is_err());

        let echo = BusFrame::extended(addr().command_id(), &[0; 8]).unwrap();
        assert!(parse_read_reply(&echo, addr(), 3).is_err());
    }
}
