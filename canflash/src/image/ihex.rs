//! Firmware description files.
//!
//! A firmware file is line-oriented text naming the target controller and
//! carrying Intel HEX records:
//!
//! ```text
//! # comment
//! C atmega88
//! :100000000C9434000C943E000C943E000C943E0082
//! :00000001FF
//! ```
//!
//! Only data (`00`) and end-of-file (`01`) records are accepted. Every record
//! must carry a valid checksum. The controller directive must come before
//! the first record and may appear only once.
//!
//! Parsing and validation happen in one pass, so an image that reaches the
//! programmer is known to be ordered and clear of the bootloader region.

use crate::device::DeviceAddress;
use crate::error::Result;
use crate::target::profile::ControllerProfile;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extension of firmware files.
pub const FIRMWARE_EXTENSION: &str = "hex";

/// Reasons a firmware file is rejected.
///
/// Line numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    /// The controller directive names no registered controller.
    #[error("line {line}: unknown controller type \"{name}\"")]
    UnknownController {
        /// Line of the directive.
        line: usize,
        /// Name as written in the file.
        name: String,
    },

    /// A second controller directive.
    #[error("line {line}: controller type already set")]
    DuplicateController {
        /// Line of the second directive.
        line: usize,
    },

    /// A record appears before the controller directive.
    #[error("line {line}: record before controller type")]
    RecordBeforeController {
        /// Line of the record.
        line: usize,
    },

    /// The file ends without a controller directive.
    #[error("controller type needs to be specified")]
    MissingController,

    /// A data record starts below the previous one.
    #[error("line {line}: offset 0x{offset:04X} is below previous offset 0x{previous:04X}")]
    NonMonotonic {
        /// Line of the record.
        line: usize,
        /// Offset of the record.
        offset: u32,
        /// Offset of the previous data record.
        previous: u32,
    },

    /// A data record reaches into the bootloader region.
    #[error("line {line}: data up to 0x{end:04X} reaches into bootloader area at 0x{boundary:04X}")]
    BootloaderOverlap {
        /// Line of the record.
        line: usize,
        /// First byte past the record.
        end: u32,
        /// First protected byte.
        boundary: u32,
    },

    /// A record type other than data or end-of-file.
    #[error("line {line}: unsupported record type {record_type:02X}")]
    UnsupportedRecord {
        /// Line of the record.
        line: usize,
        /// Record type byte.
        record_type: u8,
    },

    /// The record checksum does not match its contents.
    #[error("line {line}: checksum 0x{found:02X} does not match 0x{expected:02X}")]
    BadChecksum {
        /// Line of the record.
        line: usize,
        /// Checksum computed from the record.
        expected: u8,
        /// Checksum written in the file.
        found: u8,
    },

    /// The record carries fewer bytes than its length field announces.
    #[error("line {line}: record too short")]
    TooShort {
        /// Line of the record.
        line: usize,
    },

    /// A record follows the end-of-file record.
    #[error("line {line}: record after end of file")]
    RecordAfterEof {
        /// Line of the record.
        line: usize,
    },

    /// A line that is neither comment, directive nor record.
    #[error("line {line}: invalid line \"{content}\"")]
    InvalidLine {
        /// Line number.
        line: usize,
        /// Offending text.
        content: String,
    },

    /// The file is not valid UTF-8 text.
    #[error("line {line}: invalid UTF-8")]
    InvalidEncoding {
        /// Line holding the first invalid byte.
        line: usize,
    },
}

/// Intel HEX record types.
const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;

/// One line of a firmware file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// `C <name>` controller directive.
    Controller(String),
    /// Data bytes at an offset.
    Data {
        /// Flash byte offset.
        offset: u16,
        /// Payload.
        bytes: Vec<u8>,
    },
    /// End-of-file record.
    EndOfFile,
}

impl Record {
    /// Parse one line.
    ///
    /// Returns `Ok(None)` for empty lines and comments.
    pub fn parse(line_no: usize, line: &str) -> std::result::Result<Option<Self>, ImageError> {
        let line = line.trim_end_matches(['\r', '\n']);

        if line.trim().is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        if let Some(rest) = line.strip_prefix('C') {
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                return Ok(Some(Self::Controller(rest.trim().to_string())));
            }
        }

        if let Some(body) = line.strip_prefix(':') {
            return Self::parse_hex(line_no, line, body.trim_end()).map(Some);
        }

        Err(invalid(line_no, line))
    }

    fn parse_hex(line_no: usize, line: &str, body: &str) -> std::result::Result<Self, ImageError> {
        let raw = decode_hex(body).ok_or_else(|| invalid(line_no, line))?;

        // Length, offset (2), type and checksum
        if raw.len() < 5 {
            return Err(ImageError::TooShort { line: line_no });
        }
        let len = usize::from(raw[0]);
        if raw.len() < len + 5 {
            return Err(ImageError::TooShort { line: line_no });
        }
        if raw.len() > len + 5 {
            return Err(invalid(line_no, line));
        }

        let (contents, checksum) = raw.split_at(len + 4);
        let expected = contents
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b))
            .wrapping_neg();
        if expected != checksum[0] {
            return Err(ImageError::BadChecksum {
                line: line_no,
                expected,
                found: checksum[0],
            });
        }

        let offset = u16::from_be_bytes([raw[1], raw[2]]);
        match raw[3] {
            RECORD_DATA => Ok(Self::Data {
                offset,
                bytes: contents[4..].to_vec(),
            }),
            RECORD_EOF => Ok(Self::EndOfFile),
            record_type => Err(ImageError::UnsupportedRecord {
                line: line_no,
                record_type,
            }),
        }
    }
}

fn invalid(line: usize, content: &str) -> ImageError {
    ImageError::InvalidLine {
        line,
        content: content.to_string(),
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// A data record that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    /// Source line.
    pub line: usize,
    /// Flash byte offset.
    pub offset: u32,
    /// Payload.
    pub bytes: Vec<u8>,
}

impl DataRecord {
    /// First byte past this record.
    // Safe cast: a record carries at most 255 bytes
    #[allow(clippy::cast_possible_truncation)]
    pub fn end(&self) -> u32 {
        self.offset + self.bytes.len() as u32
    }
}

/// A firmware image that is safe to program.
///
/// Data records are in file order, their offsets never decrease and none
/// of them reaches past [`ControllerProfile::boundary`].
#[derive(Debug, Clone)]
pub struct ValidatedImage {
    profile: &'static ControllerProfile,
    records: Vec<DataRecord>,
}

impl ValidatedImage {
    /// Parse and validate firmware file contents.
    pub fn parse(text: &str) -> std::result::Result<Self, ImageError> {
        let mut profile: Option<&'static ControllerProfile> = None;
        let mut records = Vec::new();
        let mut last_offset = 0u32;
        let mut seen_eof = false;

        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let Some(record) = Record::parse(line_no, line)? else {
                continue;
            };

            if seen_eof {
                return Err(ImageError::RecordAfterEof { line: line_no });
            }

            match record {
                Record::Controller(name) => {
                    if profile.is_some() {
                        return Err(ImageError::DuplicateController { line: line_no });
                    }
                    let found = ControllerProfile::lookup(&name).ok_or(
                        ImageError::UnknownController {
                            line: line_no,
                            name,
                        },
                    )?;
                    profile = Some(found);
                },
                Record::Data { offset, bytes } => {
                    let profile =
                        profile.ok_or(ImageError::RecordBeforeController { line: line_no })?;
                    let offset = u32::from(offset);
                    if offset < last_offset {
                        return Err(ImageError::NonMonotonic {
                            line: line_no,
                            offset,
                            previous: last_offset,
                        });
                    }
                    last_offset = offset;

                    let record = DataRecord {
                        line: line_no,
                        offset,
                        bytes,
                    };
                    if record.end() > profile.boundary() {
                        return Err(ImageError::BootloaderOverlap {
                            line: line_no,
                            end: record.end(),
                            boundary: profile.boundary(),
                        });
                    }
                    records.push(record);
                },
                Record::EndOfFile => {
                    if profile.is_none() {
                        return Err(ImageError::RecordBeforeController { line: line_no });
                    }
                    seen_eof = true;
                },
            }
        }

        let profile = profile.ok_or(ImageError::MissingController)?;
        Ok(Self { profile, records })
    }

    /// Read and validate a firmware file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read(path)?;
        let text = String::from_utf8(raw).map_err(|e| {
            let valid = &e.as_bytes()[..e.utf8_error().valid_up_to()];
            ImageError::InvalidEncoding {
                line: line_of_end(valid),
            }
        })?;
        Ok(Self::parse(&text)?)
    }

    /// Controller the image targets.
    pub fn profile(&self) -> &'static ControllerProfile {
        self.profile
    }

    /// Data records in file order.
    pub fn records(&self) -> &[DataRecord] {
        &self.records
    }

    /// Total number of data bytes.
    pub fn data_len(&self) -> usize {
        self.records.iter().map(|r| r.bytes.len()).sum()
    }
}

/// 1-based line number of the byte following `prefix`.
fn line_of_end(prefix: &[u8]) -> usize {
    prefix.iter().filter(|&&b| b == b'\n').count() + 1
}

/// Path of the firmware file for `addr` under `dir`.
pub fn firmware_path(dir: &Path, addr: DeviceAddress) -> PathBuf {
    dir.join(format!("{addr}.{FIRMWARE_EXTENSION}"))
}
