//! Turns raw register bytes into typed, unit bearing values.

use crate::{
    error::DecodeError,
    register::{Category, DataKind, Endianness, PlausibleRange, RegisterDefinition},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Validated,
    /// Decoded fine, but outside the plausible range for its category.
    Suspect,
    Error(DecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedFlag {
    pub name: String,
    pub set: bool,
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedValue {
    pub address: u16,
    pub name: String,
    pub unit: String,
    /// Physical value, `None` for text registers and decode errors.
    pub value: Option<f64>,
    pub text: Option<String>,
    /// Only populated for bitfield registers.
    pub flags: Vec<DecodedFlag>,
    pub status: ValidationStatus,
}

impl DecodedValue {
    /// Whether the value can be used, suspect values included.
    pub fn is_decoded(&self) -> bool {
        !matches!(self.status, ValidationStatus::Error(_))
    }

    /// Set flags only.
    pub fn active_flags(&self) -> impl Iterator<Item = &DecodedFlag> {
        self.flags.iter().filter(|f| f.set)
    }
}

/// Plausible value ranges per register category. `None` means unchecked.
///
/// A register's own `range` always takes priority.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlausibilityTable {
    /// Volts. The default suits a single Li-ion cell, pack level registers override it.
    pub voltage: Option<PlausibleRange>,
    /// Amps.
    pub current: Option<PlausibleRange>,
    /// Degrees celsius.
    pub temperature: Option<PlausibleRange>,
    pub capacity: Option<PlausibleRange>,
    /// Milliohms.
    pub resistance: Option<PlausibleRange>,
    pub counter: Option<PlausibleRange>,
}

impl Default for PlausibilityTable {
    fn default() -> Self {
        Self {
            voltage: Some(PlausibleRange::new(2.0, 4.3)),
            current: Some(PlausibleRange::new(-300.0, 300.0)),
            temperature: Some(PlausibleRange::new(-40.0, 120.0)),
            capacity: Some(PlausibleRange::new(0.0, f64::INFINITY)),
            resistance: Some(PlausibleRange::new(0.0, 2000.0)),
            counter: Some(PlausibleRange::new(0.0, f64::INFINITY)),
        }
    }
}

impl PlausibilityTable {
    pub fn range_for(&self, category: Category) -> Option<PlausibleRange> {
        match category {
            Category::Voltage => self.voltage,
            Category::Current => self.current,
            Category::Temperature => self.temperature,
            Category::Capacity => self.capacity,
            Category::Resistance => self.resistance,
            Category::Counter => self.counter,
            Category::Flags | Category::Identity => None,
        }
    }
}

/// Decodes registers against a plausibility table.
#[derive(Debug, Clone, Default)]
pub struct Decoder {
    plausibility: PlausibilityTable,
}

impl Decoder {
    pub fn new(plausibility: PlausibilityTable) -> Self {
        Self { plausibility }
    }

    pub fn plausibility(&self) -> &PlausibilityTable {
        &self.plausibility
    }

    pub fn decode(&self, raw: &[u8], def: &RegisterDefinition) -> DecodedValue {
        let mut decoded = DecodedValue {
            address: def.address,
            name: def.name.clone(),
            unit: def.unit.clone(),
            value: None,
            text: None,
            flags: Vec::new(),
            status: ValidationStatus::Validated,
        };

        if raw.len() != def.width as usize {
            decoded.status = ValidationStatus::Error(DecodeError::WidthMismatch {
                expected: def.width,
                actual: raw.len(),
            });
            return decoded;
        }

        match &def.kind {
            DataKind::Ascii => match decode_text(raw) {
                Ok(text) => decoded.text = Some(text),
                Err(err) => decoded.status = ValidationStatus::Error(err),
            },
            DataKind::Bitfield { flags } => {
                let bits = unsigned(raw, def.endianness);
                decoded.value = Some(bits as f64);
                decoded.flags = flags
                    .iter()
                    .map(|flag| DecodedFlag {
                        name: flag.name.clone(),
                        set: (bits >> flag.bit) & 1 == 1,
                        critical: flag.critical,
                    })
                    .collect();
            }
            DataKind::Unsigned => {
                let value = unsigned(raw, def.endianness) as f64 * def.scale + def.offset;
                decoded.value = Some(value);
                decoded.status = self.check(value, def);
            }
            DataKind::Signed => {
                let value = signed(raw, def.endianness) as f64 * def.scale + def.offset;
                decoded.value = Some(value);
                decoded.status = self.check(value, def);
            }
        }

        decoded
    }

    fn check(&self, value: f64, def: &RegisterDefinition) -> ValidationStatus {
        match def.range.or_else(|| self.plausibility.range_for(def.category)) {
            Some(range) if !range.contains(value) => {
                tracing::debug!(address = def.address, name = %def.name, value, "value outside plausible range");
                ValidationStatus::Suspect
            }
            _ => ValidationStatus::Validated,
        }
    }
}

/// Decode with the default plausibility table.
pub fn decode(raw: &[u8], def: &RegisterDefinition) -> DecodedValue {
    Decoder::default().decode(raw, def)
}

/// Reassemble up to 8 bytes into an integer.
fn unsigned(raw: &[u8], endianness: Endianness) -> u64 {
    let fold = |acc: u64, byte: &u8| (acc << 8) | *byte as u64;
    match endianness {
        Endianness::Big => raw.iter().fold(0, fold),
        Endianness::Little => raw.iter().rev().fold(0, fold),
    }
}

fn signed(raw: &[u8], endianness: Endianness) -> i64 {
    let bits = raw.len() as u32 * 8;
    let value = unsigned(raw, endianness);
    if bits == 0 || bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

fn decode_text(raw: &[u8]) -> Result<String, DecodeError> {
    if !raw.is_ascii() {
        return Err(DecodeError::InvalidText);
    }
    let text = String::from_utf8_lossy(raw);
    Ok(text.trim_end_matches(['\0', ' ']).to_string())
}
