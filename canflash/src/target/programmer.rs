//! Page programming with read-back verification.
//!
//! The data records of a [`ValidatedImage`] are laid out into page buffers
//! before the device is touched. Each page is then programmed with
//!
//! ```text
//! set_pointer(base) -> erase -> load_buffer x N (6 bytes) -> write
//!                   -> read x M (8 bytes, from base) -> compare
//! ```
//!
//! A mismatch anywhere in a page aborts the whole run. Pages are never
//! retried and later pages are left alone.

use crate::bus::BusPort;
use crate::error::{Error, Result};
use crate::image::ihex::ValidatedImage;
use crate::protocol::command::{MAX_LOAD_CHUNK, MAX_READ_CHUNK};
use crate::protocol::link::DeviceLink;
use crate::target::profile::ControllerProfile;
use log::{debug, warn};
use std::collections::BTreeMap;

/// Contents of one flash page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBuffer {
    base_address: u32,
    bytes: Vec<u8>,
}

impl PageBuffer {
    fn new(base_address: u32) -> Self {
        Self {
            base_address,
            bytes: Vec::new(),
        }
    }

    /// Page-aligned flash address of the first byte.
    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    /// Bytes to program, starting at the page base.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of bytes to program.
    pub fn fill_count(&self) -> usize {
        self.bytes.len()
    }

    fn put(&mut self, index: usize, byte: u8) {
        if index < self.bytes.len() {
            self.bytes[index] = byte;
        } else {
            self.bytes.resize(index, 0);
            self.bytes.push(byte);
        }
    }

    /// Pad to whole words. Page sizes are even, so this never overflows a page.
    fn finish(mut self) -> Self {
        if self.bytes.len() % 2 != 0 {
            self.bytes.push(0);
        }
        self
    }
}

/// Lay out an image's data records as page buffers, in address order.
///
/// Gaps inside a page are zero-filled and a record that overlaps earlier
/// data overwrites it, whichever page the earlier data landed in.
pub fn layout_pages(image: &ValidatedImage) -> Vec<PageBuffer> {
    layout_records(
        image.profile(),
        image.records().iter().map(|r| (r.offset, r.bytes.as_slice())),
    )
}

fn layout_records<'a, I>(profile: &ControllerProfile, records: I) -> Vec<PageBuffer>
where
    I: IntoIterator<Item = (u32, &'a [u8])>,
{
    let mut pages: BTreeMap<u32, PageBuffer> = BTreeMap::new();

    for (offset, bytes) in records {
        for (address, &byte) in (offset..).zip(bytes) {
            let base = profile.page_floor(address);
            pages
                .entry(base)
                .or_insert_with(|| PageBuffer::new(base))
                .put((address - base) as usize, byte);
        }
    }

    pages.into_values().map(PageBuffer::finish).collect()
}

/// Programs page buffers into a device.
pub struct PageProgrammer<'l, 'p, P: BusPort> {
    link: &'l mut DeviceLink<'p, P>,
}

impl<'l, 'p, P: BusPort> PageProgrammer<'l, 'p, P> {
    /// Create a programmer driving `link`.
    pub fn new(link: &'l mut DeviceLink<'p, P>) -> Self {
        Self { link }
    }

    /// Lay out and program a whole image.
    ///
    /// The layout is computed before the first frame is sent. `progress` is called with `(pages_done, pages_total)` after every
    /// verified page.
    pub fn program_image<F>(&mut self, image: &ValidatedImage, progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let pages = layout_pages(image);
        self.program(&pages, progress)
    }

    /// Program and verify pages in order, stopping at the first failure.
    pub fn program<F>(&mut self, pages: &[PageBuffer], mut progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let total = pages.len();
        for (i, page) in pages.iter().enumerate() {
            self.flash_page(page).inspect_err(|e| {
                warn!(
                    "Flashing page 0x{:X} failed: {e}",
                    page.base_address() / 2
                );
            })?;
            progress(i + 1, total);
        }
        Ok(())
    }

    /// Erase, load, write and verify one page.
    pub fn flash_page(&mut self, page: &PageBuffer) -> Result<()> {
        let base = u16::try_from(page.base_address()).map_err(|_| {
            Error::Protocol(format!(
                "page 0x{:X} is outside the 16-bit pointer range",
                page.base_address()
            ))
        })?;

        debug!(
            "{}: flashing page 0x{base:04X} ({} bytes)",
            self.link.address(),
            page.fill_count()
        );

        self.link.set_pointer(base)?;
        self.link.erase()?;
        for chunk in page.bytes().chunks(MAX_LOAD_CHUNK) {
            self.link.load_buffer(chunk)?;
        }
        self.link.write()?;

        self.verify_page(page)
    }

    /// Read a page back from its base and compare it with the buffer.
    ///
    /// Relies on the device pointer being at the page base, as it is right
    /// after `write`.
    pub fn verify_page(&mut self, page: &PageBuffer) -> Result<()> {
        let mut buf = [0u8; MAX_READ_CHUNK];
        let mut address = page.base_address();

        for expected in page.bytes().chunks(MAX_READ_CHUNK) {
            let actual = &mut buf[..expected.len()];
            self.link.read(actual)?;

            for (&e, &a) in expected.iter().zip(actual.iter()) {
                if e != a {
                    return Err(Error::VerifyMismatch {
                        address,
                        expected: e,
                        actual: a,
                    });
                }
                address += 1;
            }
        }

        Ok(())
    }
}
