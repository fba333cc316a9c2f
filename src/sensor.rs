//! Sensor Status telemetry decoding.
//!
//! A Sensor Status parameter field is a run of concatenated property entries.
//! Each entry is one of:
//!
//! - **Vendor custom**: 4 bytes, lead byte `0b0000_001x`. Emitted by some node
//!   firmware for the ambient temperature property.
//! - **Format A**: lead bit clear, 4-bit length code, 11-bit property id,
//!   value after a 2 byte header.
//! - **Format B**: lead bit set, 7-bit length code, 16-bit little-endian
//!   property id, value after a 3 byte header.
//!
//! Decoding never fails. Unknown properties are stepped over, unsupported
//! value lengths are skipped, and a truncated entry ends the scan with the
//! readings found so far.

use std::iter::FusedIterator;

use tracing::{debug, trace};

use crate::utils::{celsius_to_fahrenheit, hex_preview};

/// Present Ambient Temperature property id.
pub const PRESENT_AMBIENT_TEMPERATURE: u16 = 0x004F;

const VENDOR_MARKER_MASK: u8 = 0xFE;
const VENDOR_MARKER: u8 = 0x02;
const VENDOR_ENTRY_LEN: usize = 4;

const FORMAT_B_FLAG: u8 = 0x80;
const FORMAT_A_HEADER_LEN: usize = 2;
const FORMAT_B_HEADER_LEN: usize = 3;
const FORMAT_A_LENGTH_ONE: u8 = 0x0F;
const FORMAT_B_LENGTH_ONE: u8 = 0x7F;

/// Encoding of a property entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SensorFormat {
    /// Standard Format A (short header).
    A,
    /// Standard Format B (long header).
    B,
    /// Firmware specific 4 byte encoding.
    VendorCustom,
}

/// Header of one property entry, located in a parameter buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorProperty {
    /// Property id.
    pub property_id: u16,
    /// Entry encoding.
    pub format: SensorFormat,
    /// Value length in bytes.
    pub length: u8,
    /// Offset of the first value byte in the buffer.
    pub value_offset: usize,
}

impl SensorProperty {
    /// Parse the entry header starting at `offset`.
    ///
    /// Returns `None` when the buffer ends inside the header. The value bytes
    /// are not checked; compare [`entry_end`](Self::entry_end) with the
    /// buffer length for that.
    pub fn parse(data: &[u8], offset: usize) -> Option<Self> {
        let header = data.get(offset..)?;
        let &b0 = header.first()?;

        if b0 & VENDOR_MARKER_MASK == VENDOR_MARKER && header.len() >= VENDOR_ENTRY_LEN {
            let tag = vendor_tag(b0, header[1], header[2]);
            if tag == PRESENT_AMBIENT_TEMPERATURE || tag == 0 {
                return Some(Self {
                    property_id: PRESENT_AMBIENT_TEMPERATURE,
                    format: SensorFormat::VendorCustom,
                    length: 2,
                    value_offset: offset + 2,
                });
            }
        }

        if b0 & FORMAT_B_FLAG == 0 {
            if header.len() < FORMAT_A_HEADER_LEN {
                return None;
            }
            let code = (b0 >> 3) & 0x0F;
            Some(Self {
                property_id: (u16::from(b0 & 0x07) << 8) | u16::from(header[1]),
                format: SensorFormat::A,
                length: if code == FORMAT_A_LENGTH_ONE { 1 } else { code + 1 },
                value_offset: offset + FORMAT_A_HEADER_LEN,
            })
        } else {
            if header.len() < FORMAT_B_HEADER_LEN {
                return None;
            }
            let code = b0 & 0x7F;
            Some(Self {
                property_id: u16::from_le_bytes([header[1], header[2]]),
                format: SensorFormat::B,
                length: if code == FORMAT_B_LENGTH_ONE { 1 } else { code + 1 },
                value_offset: offset + FORMAT_B_HEADER_LEN,
            })
        }
    }

    /// Offset one past the last byte of this entry.
    pub fn entry_end(&self) -> usize {
        self.value_offset + usize::from(self.length)
    }
}

/// Property id carried in a vendor entry: bit 0 of byte 0, byte 1, and the
/// top two bits of byte 2.
fn vendor_tag(b0: u8, b1: u8, b2: u8) -> u16 {
    (u16::from(b0 & 0x01) << 10) | (u16::from(b1) << 2) | u16::from(b2 >> 6)
}

/// Raw temperature of a vendor entry in half degrees.
///
/// Tagged entries carry 8 bits: the low 6 of byte 2 followed by the top 2 of
/// byte 3. Untagged entries (tag 0) carry a 6-bit two's complement value in
/// the low bits of byte 2.
fn vendor_raw(tag: u16, b2: u8, b3: u8) -> i8 {
    if tag == PRESENT_AMBIENT_TEMPERATURE {
        (((b2 & 0x3F) << 2) | (b3 >> 6)) as i8
    } else {
        ((b2 << 2) as i8) >> 2
    }
}

/// A decoded sensor value.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SensorReading {
    /// Unicast address of the reporting element.
    pub source_address: u16,
    /// Property id.
    pub property_id: u16,
    /// Value in the property's unit (°C for temperatures).
    pub value: f32,
}

impl SensorReading {
    /// Value in Fahrenheit, for temperature properties.
    pub fn fahrenheit(&self) -> Option<f32> {
        (self.property_id == PRESENT_AMBIENT_TEMPERATURE).then(|| celsius_to_fahrenheit(self.value))
    }
}

/// A problem found while decoding. Never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeIssue {
    /// A known property had a value length that cannot be interpreted.
    Skipped {
        /// Entry start offset.
        offset: usize,
        /// Property id.
        property_id: u16,
        /// Declared value length.
        length: u8,
    },
    /// An entry ran past the end of the buffer; the scan stopped there.
    MalformedTrailing {
        /// Entry start offset.
        offset: usize,
        /// Bytes left in the buffer at that offset.
        remaining: usize,
    },
}

/// Lazy iterator over the readings in one parameter buffer.
///
/// Created by [`decode`].
#[derive(Debug, Clone)]
pub struct Readings<'a> {
    source_address: u16,
    data: &'a [u8],
    offset: usize,
    finished: bool,
    issues: Vec<DecodeIssue>,
}

impl<'a> Readings<'a> {
    /// Issues found so far.
    pub fn issues(&self) -> &[DecodeIssue] {
        &self.issues
    }

    fn stop(&mut self, issue: Option<DecodeIssue>) {
        self.finished = true;
        if let Some(issue) = issue {
            debug!("Sensor decode stopped: {:?}", issue);
            self.issues.push(issue);
        }
    }

    fn ambient_temperature(&self, start: usize, property: &SensorProperty) -> Option<f32> {
        let entry = &self.data[start..property.entry_end()];
        let value = &self.data[property.value_offset..property.entry_end()];
        match (property.format, value) {
            (SensorFormat::VendorCustom, &[b2, b3]) => {
                let tag = vendor_tag(entry[0], entry[1], b2);
                Some(f32::from(vendor_raw(tag, b2, b3)) * 0.5)
            }
            (_, &[raw]) => Some(f32::from(raw as i8) * 0.5),
            (_, &[lo, hi]) => Some(f32::from(i16::from_le_bytes([lo, hi])) * 0.01),
            _ => None,
        }
    }
}

impl<'a> Iterator for Readings<'a> {
    type Item = SensorReading;

    fn next(&mut self) -> Option<SensorReading> {
        loop {
            if self.finished || self.offset >= self.data.len() {
                self.finished = true;
                return None;
            }

            let start = self.offset;
            let remaining = self.data.len() - start;
            let Some(property) = SensorProperty::parse(self.data, start) else {
                self.stop(Some(DecodeIssue::MalformedTrailing {
                    offset: start,
                    remaining,
                }));
                return None;
            };
            if property.entry_end() > self.data.len() {
                self.stop(Some(DecodeIssue::MalformedTrailing {
                    offset: start,
                    remaining,
                }));
                return None;
            }
            self.offset = property.entry_end();

            if property.property_id != PRESENT_AMBIENT_TEMPERATURE {
                trace!(
                    "Skipping property 0x{:04X} ({} bytes) at {}",
                    property.property_id,
                    property.length,
                    start
                );
                continue;
            }

            match self.ambient_temperature(start, &property) {
                Some(value) => {
                    trace!(
                        "Ambient temperature {:.2} from 0x{:04X} ({:?})",
                        value,
                        self.source_address,
                        property.format
                    );
                    return Some(SensorReading {
                        source_address: self.source_address,
                        property_id: property.property_id,
                        value,
                    });
                }
                None => {
                    let issue = DecodeIssue::Skipped {
                        offset: start,
                        property_id: property.property_id,
                        length: property.length,
                    };
                    debug!("Sensor decode skipped entry: {:?}", issue);
                    self.issues.push(issue);
                }
            }
        }
    }
}

impl<'a> FusedIterator for Readings<'a> {}

/// Decode a Sensor Status parameter field reported by `source_address`.
///
/// # Example
///
/// ```
/// use mesh_proxy_ble::sensor::{decode, PRESENT_AMBIENT_TEMPERATURE};
///
/// let readings: Vec<_> = decode(0x0002, &[0x00, 0x4F, 0x32]).collect();
/// assert_eq!(readings.len(), 1);
/// assert_eq!(readings[0].property_id, PRESENT_AMBIENT_TEMPERATURE);
/// assert_eq!(readings[0].value, 25.0);
/// ```
pub fn decode(source_address: u16, data: &[u8]) -> Readings<'_> {
    trace!(
        "Decoding sensor status from 0x{:04X}: {}",
        source_address,
        hex_preview(data, 20)
    );
    Readings {
        source_address,
        data,
        offset: 0,
        finished: false,
        issues: Vec::new(),
    }
}

/// Stateless Sensor Status decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct SensorTelemetryDecoder;

impl SensorTelemetryDecoder {
    /// See [`decode`].
    pub fn decode<'a>(&self, source_address: u16, data: &'a [u8]) -> Readings<'a> {
        decode(source_address, data)
    }
}
