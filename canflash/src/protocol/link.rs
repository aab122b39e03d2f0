//! Command exchange with a single device.

use crate::bus::{BusFrame, BusPort};
use crate::device::DeviceAddress;
use crate::error::{Error, Result};
use crate::protocol::command::{Command, MAX_READ_CHUNK, parse_read_reply};
use log::trace;
use std::time::{Duration, Instant};

/// Default time to wait for a read reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(1000);

/// Sends bootloader commands to one device over a bus port.
///
/// Every command except `read` is fire-and-forget.
pub struct DeviceLink<'a, P: BusPort> {
    port: &'a mut P,
    addr: DeviceAddress,
    reply_timeout: Duration,
}

impl<'a, P: BusPort> DeviceLink<'a, P> {
    /// Create a link to `addr` over `port`.
    pub fn new(port: &'a mut P, addr: DeviceAddress) -> Self {
        Self {
            port,
            addr,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    /// Set how long `read` waits for the reply.
    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Address of the device behind this link.
    pub fn address(&self) -> DeviceAddress {
        self.addr
    }

    fn send(&mut self, command: &Command) -> Result<()> {
        let frame = command.to_frame(self.addr)?;
        trace!("{} <- {command:?}", self.addr);
        self.port.send(&frame)
    }

    /// Set the device's flash pointer.
    pub fn set_pointer(&mut self, offset: u16) -> Result<()> {
        self.send(&Command::SetPointer(offset))
    }

    /// Erase the page at the pointer.
    pub fn erase(&mut self) -> Result<()> {
        self.send(&Command::Erase)
    }

    /// Append up to 6 bytes (whole words) to the device's write buffer.
    pub fn load_buffer(&mut self, data: &[u8]) -> Result<()> {
        self.send(&Command::LoadBuffer(data.to_vec()))
    }

    /// Commit the write buffer to the page at the pointer.
    pub fn write(&mut self) -> Result<()> {
        self.send(&Command::Write)
    }

    /// Leave the bootloader and start the application.
    pub fn reset(&mut self) -> Result<()> {
        self.send(&Command::Reset)
    }

    /// Read `buf.len()` bytes (1..=8) at the pointer.
    ///
    /// Waits for exactly one reply frame from the device.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let len = u8::try_from(buf.len())
            .map_err(|_| Error::InvalidChunk(format!("read of {} bytes", buf.len())))?;
        self.send(&Command::Read(len))?;

        let frame = self.receive_reply()?;
        buf.copy_from_slice(parse_read_reply(&frame, self.addr, buf.len())?);
        trace!("{} -> {:02X?}", self.addr, buf);
        Ok(())
    }

    /// Wait for the next frame carrying the device's identifier.
    ///
    /// Frames from other identifiers are dropped until the reply timeout.
    fn receive_reply(&mut self) -> Result<BusFrame> {
        let deadline = Instant::now() + self.reply_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = self.port.receive(remaining)?.ok_or(Error::DeviceUnresponsive {
                address: self.addr,
                timeout: self.reply_timeout,
            })?;

            if frame.is_extended() && frame.id() == self.addr.device_id() {
                return Ok(frame);
            }
            trace!("{}: skipping {frame:?} while waiting for reply", self.addr);
        }
    }

    /// Read `len` bytes starting at flash offset `start`.
    pub fn read_range<F>(&mut self, start: u16, len: usize, mut progress: F) -> Result<Vec<u8>>
    where
        F: FnMut(usize, usize),
    {
        self.set_pointer(start)?;

        let mut out = vec![0u8; len];
        let mut done = 0;
        for chunk in out.chunks_mut(MAX_READ_CHUNK) {
            self.read(chunk)?;
            done += chunk.len();
            progress(done, len);
        }

        Ok(out)
    }
}
