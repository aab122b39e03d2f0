//! In-memory bus with simulated bootloader nodes for tests.
//!
//! Frames sent by the host are logged, looped back to unfiltered ports (as
//! SocketCAN does for other sockets on the same interface) and handed to the
//! addressed device, which models the page buffer, erase and read pointer of
//! the real bootloader.

use crate::bus::{BusConnector, BusFrame, BusPort};
use crate::device::{DeviceAddress, is_command_id};
use crate::error::{Error, Result};
use crate::protocol::command::Command;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

/// Simulated bootloader node.
#[derive(Debug, Clone)]
pub(crate) struct SimDevice {
    addr: DeviceAddress,
    page_size: usize,
    flash: Vec<u8>,
    pointer: usize,
    load_cursor: usize,
    pending: Vec<(usize, u8)>,
    corrupt_at: Option<usize>,
    reply_limit: Option<usize>,
    silent: bool,
    resets: usize,
}

impl SimDevice {
    /// Device with erased (0xFF) flash of `flash_size` bytes.
    pub(crate) fn new(addr: DeviceAddress, page_size: usize, flash_size: usize) -> Self {
        Self::with_flash(addr, page_size, vec![0xFF; flash_size])
    }

    /// Device with preset flash contents.
    pub(crate) fn with_flash(addr: DeviceAddress, page_size: usize, flash: Vec<u8>) -> Self {
        Self {
            addr,
            page_size,
            flash,
            pointer: 0,
            load_cursor: 0,
            pending: Vec::new(),
            corrupt_at: None,
            reply_limit: None,
            silent: false,
            resets: 0,
        }
    }

    /// Store a wrong value whenever the byte at `address` is written.
    pub(crate) fn corrupt_byte_at(&mut self, address: usize) {
        self.corrupt_at = Some(address);
    }

    /// Send read replies with at most `len` payload bytes.
    pub(crate) fn truncate_replies_to(&mut self, len: usize) {
        self.reply_limit = Some(len);
    }

    /// Never answer read requests.
    pub(crate) fn go_silent(&mut self) {
        self.silent = true;
    }

    fn handle(&mut self, command: Command) -> Option<Vec<u8>> {
        match command {
            Command::SetPointer(offset) => {
                self.pointer = usize::from(offset);
                self.load_cursor = self.pointer;
            },
            Command::Erase => {
                let base = self.pointer - self.pointer % self.page_size;
                let end = (base + self.page_size).min(self.flash.len());
                if base < end {
                    self.flash[base..end].fill(0xFF);
                }
            },
            Command::LoadBuffer(data) => {
                for b in data {
                    self.pending.push((self.load_cursor, b));
                    self.load_cursor += 1;
                }
            },
            Command::Write => {
                for (address, b) in self.pending.drain(..) {
                    let value = if self.corrupt_at == Some(address) { !b } else { b };
                    if let Some(cell) = self.flash.get_mut(address) {
                        *cell = value;
                    }
                }
            },
            Command::Read(len) => {
                if self.silent {
                    return None;
                }
                let len = usize::from(len);
                let mut data: Vec<u8> = (self.pointer..self.pointer + len)
                    .map(|a| self.flash.get(a).copied().unwrap_or(0xFF))
                    .collect();
                self.pointer += len;
                if let Some(limit) = self.reply_limit {
                    data.truncate(limit);
                }
                return Some(data);
            },
            Command::Reset => self.resets += 1,
        }
        None
    }
}

#[derive(Default)]
struct SimState {
    devices: Vec<SimDevice>,
    sent: Vec<BusFrame>,
    broadcast: VecDeque<BusFrame>,
    replies: HashMap<DeviceAddress, VecDeque<BusFrame>>,
    opened: Vec<Option<DeviceAddress>>,
    open_ports: usize,
}

/// Shared handle to the simulated bus.
#[derive(Clone, Default)]
pub(crate) struct SimBus {
    state: Rc<RefCell<SimState>>,
}

impl SimBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Put a device on the bus.
    pub(crate) fn attach(&self, device: SimDevice) {
        self.state.borrow_mut().devices.push(device);
    }

    /// Queue a frame for unfiltered ports, as if another node sent it.
    pub(crate) fn inject(&self, frame: BusFrame) {
        self.state.borrow_mut().broadcast.push_back(frame);
    }

    /// Queue a frame on the session connection of `addr` ahead of any reply.
    pub(crate) fn queue_reply(&self, addr: DeviceAddress, frame: BusFrame) {
        self.state
            .borrow_mut()
            .replies
            .entry(addr)
            .or_default()
            .push_back(frame);
    }

    /// Frames waiting for unfiltered ports.
    pub(crate) fn pending_broadcast(&self) -> usize {
        self.state.borrow().broadcast.len()
    }

    /// Open a port directly.
    pub(crate) fn port(&self, filter: Option<DeviceAddress>) -> SimPort {
        let mut state = self.state.borrow_mut();
        state.opened.push(filter);
        state.open_ports += 1;
        SimPort {
            state: Rc::clone(&self.state),
            filter,
            open: true,
        }
    }

    /// Connector handing out ports on this bus.
    pub(crate) fn connector(&self) -> SimConnector {
        SimConnector { bus: self.clone() }
    }

    /// Commands the host sent to `addr`, in order.
    pub(crate) fn sent_commands(&self, addr: DeviceAddress) -> Vec<Command> {
        self.state
            .borrow()
            .sent
            .iter()
            .filter(|f| f.id() == addr.command_id())
            .filter_map(|f| Command::decode(f.data()).ok())
            .collect()
    }

    /// Every frame the host sent.
    pub(crate) fn sent_frames(&self) -> Vec<BusFrame> {
        self.state.borrow().sent.clone()
    }

    /// Current flash contents of `addr`.
    pub(crate) fn flash(&self, addr: DeviceAddress) -> Vec<u8> {
        self.with_device(addr, |d| d.flash.clone())
    }

    /// Number of reset commands `addr` has received.
    pub(crate) fn resets(&self, addr: DeviceAddress) -> usize {
        self.with_device(addr, |d| d.resets)
    }

    /// Filters of every port opened so far.
    pub(crate) fn opened_filters(&self) -> Vec<Option<DeviceAddress>> {
        self.state.borrow().opened.clone()
    }

    /// Ports opened and not yet closed.
    pub(crate) fn open_ports(&self) -> usize {
        self.state.borrow().open_ports
    }

    fn with_device<T>(&self, addr: DeviceAddress, f: impl FnOnce(&SimDevice) -> T) -> T {
        let state = self.state.borrow();
        let device = state
            .devices
            .iter()
            .find(|d| d.addr == addr)
            .unwrap_or_else(|| panic!("no simulated device {addr}"));
        f(device)
    }
}

/// Connector for [`SimBus`].
pub(crate) struct SimConnector {
    bus: SimBus,
}

impl BusConnector for SimConnector {
    type Port = SimPort;

    fn open(&self, filter: Option<DeviceAddress>) -> Result<SimPort> {
        Ok(self.bus.port(filter))
    }
}

/// Port on a [`SimBus`].
pub(crate) struct SimPort {
    state: Rc<RefCell<SimState>>,
    filter: Option<DeviceAddress>,
    open: bool,
}

impl BusPort for SimPort {
    fn send(&mut self, frame: &BusFrame) -> Result<()> {
        if !self.open {
            return Err(Error::Protocol("port is closed".into()));
        }

        let mut state = self.state.borrow_mut();
        state.sent.push(*frame);
        state.broadcast.push_back(*frame);

        if !frame.is_extended() || !is_command_id(frame.id()) {
            return Ok(());
        }
        let addr = DeviceAddress::from_identifier(frame.id());
        let Ok(command) = Command::decode(frame.data()) else {
            return Ok(());
        };

        let reply = state
            .devices
            .iter_mut()
            .find(|d| d.addr == addr)
            .and_then(|d| d.handle(command));

        if let Some(data) = reply {
            let reply = BusFrame::extended(addr.device_id(), &data)?;
            state.broadcast.push_back(reply);
            state.replies.entry(addr).or_default().push_back(reply);
        }
        Ok(())
    }

    fn receive(&mut self, _timeout: Duration) -> Result<Option<BusFrame>> {
        let mut state = self.state.borrow_mut();
        let frame = match self.filter {
            Some(addr) => state.replies.get_mut(&addr).and_then(VecDeque::pop_front),
            None => state.broadcast.pop_front(),
        };
        Ok(frame)
    }

    fn name(&self) -> &str {
        "sim0"
    }

    fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.state.borrow_mut().open_ports -= 1;
        }
        Ok(())
    }
}
