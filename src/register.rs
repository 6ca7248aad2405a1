//! Register definitions and manufacturer register maps.
//!
//! A [RegisterMap] is data, not code: it is built once (from one of the tables in
//! [registers](crate::registers), or from TOML) and shared read-only between sessions.

use crate::{error::ConfigError, frame::ChecksumKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::{Display, EnumIter};

/// Broad kind of quantity a register holds. Plausibility ranges are chosen per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumIter, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Category {
    Voltage,
    Current,
    Temperature,
    Capacity,
    Resistance,
    Counter,
    Flags,
    Identity,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

/// One named bit of a bitfield register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagDef {
    pub bit: u8,
    pub name: String,
    /// A set critical flag makes the pack's safety status critical.
    #[serde(default)]
    pub critical: bool,
}

impl FlagDef {
    pub fn new(bit: u8, name: impl Into<String>) -> Self {
        Self {
            bit,
            name: name.into(),
            critical: false,
        }
    }

    pub fn critical(bit: u8, name: impl Into<String>) -> Self {
        Self {
            critical: true,
            ..Self::new(bit, name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataKind {
    Unsigned,
    /// Two's complement.
    Signed,
    Bitfield { flags: Vec<FlagDef> },
    Ascii,
}

/// How bad a safety event counted by a register is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    High,
}

/// What the analytics use a register for. Registers without a role are only reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// 1 based cell position.
    CellVoltage(u8),
    PackVoltage,
    PackCurrent,
    Temperature,
    /// Capacity relative to new, in percent.
    StateOfHealth,
    FullChargeCapacity,
    DesignCapacity,
    InternalResistance,
    /// 0 based index of a fixed width discharge current bucket, value in seconds.
    DischargeBucket(u8),
    /// Count of recorded safety events.
    SafetyEvents(Severity),
    ProtectionFlags,
    CycleCount,
    TotalDischarge,
    BatteryType,
    /// The pack's electronic serial number.
    SerialNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlausibleRange {
    pub min: f64,
    pub max: f64,
}

impl PlausibleRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

fn default_scale() -> f64 {
    1.0
}

/// How to read and interpret one register.
///
/// Physical value is `raw * scale + offset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDefinition {
    pub address: u16,
    pub name: String,
    pub category: Category,
    pub kind: DataKind,
    /// Bytes, 1-8 for numeric kinds.
    pub width: u8,
    #[serde(default)]
    pub endianness: Endianness,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub unit: String,
    /// Overrides the category's plausibility range.
    #[serde(default)]
    pub range: Option<PlausibleRange>,
    #[serde(default)]
    pub role: Option<Role>,
}

impl RegisterDefinition {
    pub fn new(address: u16, name: impl Into<String>, category: Category, kind: DataKind, width: u8) -> Self {
        Self {
            address,
            name: name.into(),
            category,
            kind,
            width,
            endianness: Endianness::Big,
            scale: 1.0,
            offset: 0.0,
            unit: String::new(),
            range: None,
            role: None,
        }
    }

    pub fn unsigned(address: u16, name: impl Into<String>, category: Category, width: u8) -> Self {
        Self::new(address, name, category, DataKind::Unsigned, width)
    }

    pub fn signed(address: u16, name: impl Into<String>, category: Category, width: u8) -> Self {
        Self::new(address, name, category, DataKind::Signed, width)
    }

    pub fn ascii(address: u16, name: impl Into<String>, width: u8) -> Self {
        Self::new(address, name, Category::Identity, DataKind::Ascii, width)
    }

    pub fn bitfield(address: u16, name: impl Into<String>, width: u8, flags: Vec<FlagDef>) -> Self {
        Self::new(address, name, Category::Flags, DataKind::Bitfield { flags }, width)
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some(PlausibleRange::new(min, max));
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let address = self.address;
        let max_width = match self.kind {
            DataKind::Ascii => crate::frame::MAX_PAYLOAD as u8,
            _ => 8,
        };
        if self.width == 0 || self.width > max_width {
            return Err(ConfigError::InvalidWidth {
                address,
                width: self.width,
            });
        }
        if !self.scale.is_finite() || !self.offset.is_finite() {
            return Err(ConfigError::InvalidScale { address });
        }
        if let DataKind::Bitfield { flags } = &self.kind {
            if let Some(flag) = flags.iter().find(|f| f.bit >= self.width * 8) {
                return Err(ConfigError::FlagOutOfRange { address, bit: flag.bit });
            }
        }
        if let Some(range) = self.range {
            if !(range.min <= range.max) {
                return Err(ConfigError::InvalidRange { address });
            }
        }
        Ok(())
    }
}

/// Register table for one manufacturer/model, plus the per-model facts the analytics need.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterMap {
    manufacturer: String,
    model: String,
    checksum: ChecksumKind,
    resistance_baseline_mohm: f64,
    nominal_voltage: f64,
    registers: BTreeMap<u16, RegisterDefinition>,
}

impl RegisterMap {
    /// Load a map from TOML.
    ///
    /// ```toml
    /// manufacturer = "Acme"
    /// model = "20V"
    /// checksum = "xor"
    ///
    /// [[registers]]
    /// address = 0x21
    /// name = "cell_1"
    /// category = "voltage"
    /// kind = { type = "unsigned" }
    /// width = 2
    /// scale = 0.001
    /// unit = "V"
    /// role = { cell_voltage = 1 }
    /// ```
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let file: RegisterMapFile = toml::from_str(input)?;
        let mut builder = RegisterMapBuilder::new(file.manufacturer, file.model)
            .with_checksum(file.checksum);
        if let Some(baseline) = file.resistance_baseline_mohm {
            builder = builder.with_resistance_baseline(baseline);
        }
        if let Some(voltage) = file.nominal_voltage {
            builder = builder.with_nominal_voltage(voltage);
        }
        file.registers
            .into_iter()
            .fold(builder, |builder, def| builder.with_register(def))
            .build()
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn checksum(&self) -> ChecksumKind {
        self.checksum
    }

    /// Internal resistance of a healthy pack of this model, in milliohms.
    pub fn resistance_baseline_mohm(&self) -> f64 {
        self.resistance_baseline_mohm
    }

    /// Nominal pack voltage, used for energy estimates.
    pub fn nominal_voltage(&self) -> f64 {
        self.nominal_voltage
    }

    pub fn get(&self, address: u16) -> Option<&RegisterDefinition> {
        self.registers.get(&address)
    }

    /// Definitions in address order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisterDefinition> {
        self.registers.values()
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// The first register carrying `role`.
    pub fn find_role(&self, role: Role) -> Option<&RegisterDefinition> {
        self.iter().find(|def| def.role == Some(role))
    }
}

#[derive(Deserialize)]
struct RegisterMapFile {
    manufacturer: String,
    model: String,
    #[serde(default)]
    checksum: ChecksumKind,
    resistance_baseline_mohm: Option<f64>,
    nominal_voltage: Option<f64>,
    registers: Vec<RegisterDefinition>,
}

/// Builds and validates a [RegisterMap].
pub struct RegisterMapBuilder {
    manufacturer: String,
    model: String,
    checksum: ChecksumKind,
    resistance_baseline_mohm: f64,
    nominal_voltage: f64,
    definitions: Vec<RegisterDefinition>,
}

impl RegisterMapBuilder {
    pub const DEFAULT_RESISTANCE_BASELINE_MOHM: f64 = 100.0;
    pub const DEFAULT_NOMINAL_VOLTAGE: f64 = 18.0;

    pub fn new(manufacturer: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            manufacturer: manufacturer.into(),
            model: model.into(),
            checksum: ChecksumKind::default(),
            resistance_baseline_mohm: Self::DEFAULT_RESISTANCE_BASELINE_MOHM,
            nominal_voltage: Self::DEFAULT_NOMINAL_VOLTAGE,
            definitions: Vec::new(),
        }
    }

    pub fn with_checksum(mut self, checksum: ChecksumKind) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_resistance_baseline(mut self, mohm: f64) -> Self {
        self.resistance_baseline_mohm = mohm;
        self
    }

    pub fn with_nominal_voltage(mut self, volts: f64) -> Self {
        self.nominal_voltage = volts;
        self
    }

    pub fn with_register(mut self, definition: RegisterDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    pub fn build(self) -> Result<RegisterMap, ConfigError> {
        if self.definitions.is_empty() {
            return Err(ConfigError::EmptyMap);
        }
        if !(self.resistance_baseline_mohm.is_finite() && self.resistance_baseline_mohm > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "resistance_baseline_mohm",
                reason: "must be a positive number",
            });
        }
        if !(self.nominal_voltage.is_finite() && self.nominal_voltage > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "nominal_voltage",
                reason: "must be a positive number",
            });
        }

        let mut registers = BTreeMap::new();
        for definition in self.definitions {
            definition.validate()?;
            let address = definition.address;
            if registers.insert(address, definition).is_some() {
                return Err(ConfigError::DuplicateAddress(address));
            }
        }

        Ok(RegisterMap {
            manufacturer: self.manufacturer,
            model: self.model,
            checksum: self.checksum,
            resistance_baseline_mohm: self.resistance_baseline_mohm,
            nominal_voltage: self.nominal_voltage,
            registers,
        })
    }
}
