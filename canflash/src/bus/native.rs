//! Native SocketCAN transport using the `socketcan` crate.
//!
//! Each [`SocketCanPort`] owns one `CAN_RAW` socket bound to an interface.
//! Session sockets carry a kernel receive filter that only lets through data
//! frames whose extended identifier equals the device's own address, so the
//! host never sees its own command traffic or other nodes on those sockets.

use {
    crate::{
        bus::{BusConnector, BusFrame, BusPort, RetryPolicy},
        device::DeviceAddress,
        error::{Error, Result},
    },
    log::{debug, trace},
    socketcan::{
        CanFilter, CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, SocketOptions,
        StandardId,
    },
    std::{
        io::ErrorKind,
        time::{Duration, Instant},
    },
};

/// Opens SocketCAN connections on one interface.
#[derive(Debug, Clone)]
pub struct SocketCanConnector {
    interface: String,
    retry: RetryPolicy,
}

impl SocketCanConnector {
    /// Create a connector for the given interface (e.g. `can0`).
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Set the transmit retry policy used by every opened port.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Interface name.
    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl BusConnector for SocketCanConnector {
    type Port = SocketCanPort;

    fn open(&self, filter: Option<DeviceAddress>) -> Result<SocketCanPort> {
        SocketCanPort::open(&self.interface, filter, self.retry.clone())
    }
}

/// SocketCAN port implementation.
pub struct SocketCanPort {
    socket: Option<CanSocket>,
    name: String,
    retry: RetryPolicy,
}

impl SocketCanPort {
    /// Open a raw CAN socket, optionally filtered to a single device.
    pub fn open(interface: &str, filter: Option<DeviceAddress>, retry: RetryPolicy) -> Result<Self> {
        let socket = CanSocket::open(interface)?;

        if let Some(addr) = filter {
            let filter = CanFilter::new(
                addr.device_id() | libc::CAN_EFF_FLAG,
                libc::CAN_EFF_MASK | libc::CAN_EFF_FLAG | libc::CAN_RTR_FLAG,
            );
            socket.set_filters(&[filter])?;
            let dropped = drain(&socket)?;
            debug!("Opened {interface} filtered to {addr} ({dropped} stale frames dropped)");
        } else {
            debug!("Opened {interface}");
        }

        Ok(Self {
            socket: Some(socket),
            name: interface.to_string(),
            retry,
        })
    }

    fn socket(&self) -> Result<&CanSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| Error::Protocol(format!("{} is closed", self.name)))
    }
}

impl BusPort for SocketCanPort {
    fn send(&mut self, frame: &BusFrame) -> Result<()> {
        let can_frame = to_can_frame(frame)?;
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| Error::Protocol(format!("{} is closed", self.name)))?;

        trace!("TX {frame:?}");
        self.retry.run(|| socket.write_frame(&can_frame))
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<BusFrame>> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let socket = self.socket()?;
            socket.set_read_timeout(remaining)?;

            match socket.read_frame() {
                Ok(CanFrame::Error(_)) => {
                    trace!("Ignoring bus error frame on {}", self.name);
                },
                Ok(frame) => {
                    let frame = from_can_frame(&frame)?;
                    trace!("RX {frame:?}");
                    return Ok(Some(frame));
                },
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None);
                },
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        if self.socket.take().is_some() {
            trace!("Closed {}", self.name);
        }
        Ok(())
    }
}

/// Discard frames queued before the receive filter was installed.
fn drain(socket: &CanSocket) -> Result<usize> {
    socket.set_nonblocking(true)?;
    let mut dropped = 0;
    let result = loop {
        match socket.read_frame() {
            Ok(_) => dropped += 1,
            Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(dropped),
            Err(e) => break Err(Error::Io(e)),
        }
    };
    socket.set_nonblocking(false)?;
    result
}

fn to_can_frame(frame: &BusFrame) -> Result<CanFrame> {
    let id = if frame.is_extended() {
        ExtendedId::new(frame.id()).map(Id::Extended)
    } else {
        u16::try_from(frame.id())
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard)
    }
    .ok_or_else(|| Error::MalformedFrame(format!("invalid identifier 0x{:X}", frame.id())))?;

    let can_frame = if frame.is_remote() {
        CanFrame::new_remote(id, frame.data().len())
    } else {
        CanFrame::new(id, frame.data())
    };

    can_frame.ok_or_else(|| Error::MalformedFrame(format!("cannot encode {frame:?}")))
}

fn from_can_frame(frame: &CanFrame) -> Result<BusFrame> {
    let bus_frame = match frame.id() {
        Id::Standard(id) => BusFrame::standard(id.as_raw(), frame.data())?,
        Id::Extended(id) => BusFrame::extended(id.as_raw(), frame.data())?,
    };

    if frame.is_remote_frame() {
        Ok(bus_frame.into_remote())
    } else {
        Ok(bus_frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_conversion_keeps_identifier_and_payload() {
        let frame = BusFrame::extended(0x1000_00AB, &[0x01, 0x02, 0x03]).unwrap();
        let can_frame = to_can_frame(&frame).unwrap();
        assert!(can_frame.is_extended());
        assert_eq!(from_can_frame(&can_frame).unwrap(), frame);
    }

    #[test]
    fn test_open_missing_interface_fails() {
        let result = SocketCanPort::open("canflash-none0", None, RetryPolicy::default());
        assert!(result.is_err());
    }
}
