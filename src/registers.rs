//! Built-in register maps for supported pack families.
//!
//! Array registers (cell voltages, cell temperatures) are split into one definition per element,
//! addressed as `base << 8 | element` with elements counted from 1.
//!
//! Discharge time is recorded by the packs in 25A wide buckets. The last bucket is open ended.

use crate::{
    error::ConfigError,
    frame::ChecksumKind,
    register::{
        Category, Endianness, FlagDef, RegisterDefinition, RegisterMap, RegisterMapBuilder, Role,
        Severity,
    },
};
use serde::Serialize;

/// Width of each discharge current bucket in amps.
pub const DISCHARGE_BUCKET_WIDTH_A: f64 = 25.0;
/// Number of discharge buckets recorded by the built-in maps.
pub const DISCHARGE_BUCKETS: u8 = 8;
pub const CELLS_PER_PACK: u8 = 5;

fn element(base: u8, index: u8) -> u16 {
    ((base as u16) << 8) | index as u16
}

fn discharge_buckets(builder: RegisterMapBuilder, first_address: u16) -> RegisterMapBuilder {
    (0..DISCHARGE_BUCKETS).fold(builder, |builder, i| {
        let start = i as u32 * DISCHARGE_BUCKET_WIDTH_A as u32;
        let name = if i + 1 == DISCHARGE_BUCKETS {
            format!("discharge_{start}a_plus")
        } else {
            format!("discharge_{start}_{}a", start + DISCHARGE_BUCKET_WIDTH_A as u32)
        };
        builder.with_register(
            RegisterDefinition::unsigned(first_address + i as u16, name, Category::Counter, 4)
                .with_unit("s")
                .with_role(Role::DischargeBucket(i)),
        )
    })
}

/// Milwaukee M18 packs.
///
/// Multi-byte values are big endian except the cell voltage block, which the pack reports little
/// endian.
pub fn milwaukee_m18() -> Result<RegisterMap, ConfigError> {
    let mut builder = RegisterMapBuilder::new("Milwaukee", "M18")
        .with_checksum(ChecksumKind::Additive)
        .with_resistance_baseline(60.0)
        .with_nominal_voltage(18.0)
        .with_register(
            RegisterDefinition::unsigned(0x0000, "manufacture_date", Category::Identity, 4).with_unit("unix_s"),
        )
        .with_register(
            RegisterDefinition::unsigned(0x0001, "days_since_first_charge", Category::Counter, 2)
                .with_unit("days"),
        )
        .with_register(RegisterDefinition::ascii(0x0002, "type_and_serial", 16).with_role(Role::BatteryType))
        .with_register(
            RegisterDefinition::unsigned(0x000D, "temperature_adc", Category::Temperature, 2)
                .with_scale(0.1)
                .with_offset(-100.0)
                .with_unit("°C")
                .with_role(Role::Temperature),
        )
        .with_register(
            RegisterDefinition::unsigned(0x0012, "temperature_forge", Category::Temperature, 2)
                .with_scale(0.1)
                .with_offset(-100.0)
                .with_unit("°C"),
        )
        .with_register(
            RegisterDefinition::unsigned(0x0019, "days_since_tool_use", Category::Counter, 2).with_unit("days"),
        )
        .with_register(
            RegisterDefinition::unsigned(0x001A, "days_since_charge", Category::Counter, 2).with_unit("days"),
        )
        .with_register(
            RegisterDefinition::unsigned(0x001D, "total_discharge", Category::Capacity, 4)
                .with_unit("As")
                .with_role(Role::TotalDischarge),
        )
        .with_register(RegisterDefinition::unsigned(0x001F, "redlink_charge_count", Category::Counter, 2))
        .with_register(RegisterDefinition::unsigned(0x0020, "other_charge_count", Category::Counter, 2))
        .with_register(
            RegisterDefinition::unsigned(0x0021, "total_charge_count", Category::Counter, 2)
                .with_role(Role::CycleCount),
        )
        .with_register(
            RegisterDefinition::unsigned(0x0023, "total_charge_time", Category::Counter, 4).with_unit("s"),
        )
        .with_register(
            RegisterDefinition::unsigned(0x0024, "charger_idle_time", Category::Counter, 4).with_unit("s"),
        )
        .with_register(RegisterDefinition::unsigned(0x0026, "low_voltage_charges", Category::Counter, 2))
        .with_register(RegisterDefinition::unsigned(0x0027, "discharge_to_empty_count", Category::Counter, 2))
        .with_register(
            RegisterDefinition::unsigned(0x0028, "overheat_events", Category::Counter, 2)
                .with_role(Role::SafetyEvents(Severity::High)),
        )
        .with_register(
            RegisterDefinition::unsigned(0x0029, "overcurrent_events", Category::Counter, 2)
                .with_role(Role::SafetyEvents(Severity::High)),
        )
        .with_register(
            RegisterDefinition::unsigned(0x002A, "low_voltage_events", Category::Counter, 2)
                .with_role(Role::SafetyEvents(Severity::Low)),
        )
        .with_register(
            RegisterDefinition::unsigned(0x002B, "low_voltage_bounce", Category::Counter, 2)
                .with_role(Role::SafetyEvents(Severity::Low)),
        )
        .with_register(
            RegisterDefinition::unsigned(0x0040, "state_of_health", Category::Capacity, 1)
                .with_unit("%")
                .with_range(0.0, 100.0)
                .with_role(Role::StateOfHealth),
        )
        .with_register(
            RegisterDefinition::unsigned(0x0041, "internal_resistance", Category::Resistance, 2)
                .with_unit("mOhm")
                .with_role(Role::InternalResistance),
        )
        .with_register(
            RegisterDefinition::bitfield(
                0x0042,
                "protection_flags",
                1,
                vec![
                    FlagDef::critical(0, "overheat_lockout"),
                    FlagDef::new(1, "overcurrent"),
                    FlagDef::new(2, "undervoltage"),
                    FlagDef::new(3, "cell_imbalance"),
                    FlagDef::new(4, "charge_fault"),
                    FlagDef::critical(7, "permanent_failure"),
                ],
            )
            .with_role(Role::ProtectionFlags),
        );

    for cell in 1..=CELLS_PER_PACK {
        builder = builder.with_register(
            RegisterDefinition::unsigned(element(0x0C, cell), format!("cell_{cell}_voltage"), Category::Voltage, 2)
                .with_endianness(Endianness::Little)
                .with_scale(0.001)
                .with_unit("V")
                .with_role(Role::CellVoltage(cell)),
        );
    }

    discharge_buckets(builder, 0x002C).build()
}

/// Makita LXT packs.
pub fn makita_lxt() -> Result<RegisterMap, ConfigError> {
    let mut builder = RegisterMapBuilder::new("Makita", "LXT")
        .with_checksum(ChecksumKind::Xor)
        .with_resistance_baseline(80.0)
        .with_nominal_voltage(18.0)
        .with_register(RegisterDefinition::ascii(0x0010, "model_code", 8))
        .with_register(
            RegisterDefinition::unsigned(0x0011, "serial_number", Category::Identity, 4)
                .with_role(Role::SerialNumber),
        )
        .with_register(
            RegisterDefinition::unsigned(0x0012, "manufacture_date", Category::Identity, 2)
                .with_unit("days_since_2000"),
        )
        .with_register(
            RegisterDefinition::unsigned(0x0020, "pack_voltage", Category::Voltage, 2)
                .with_scale(0.001)
                .with_unit("V")
                .with_range(10.0, 21.5)
                .with_role(Role::PackVoltage),
        )
        .with_register(
            RegisterDefinition::signed(0x0025, "pack_current", Category::Current, 2)
                .with_scale(0.001)
                .with_unit("A")
                .with_role(Role::PackCurrent),
        )
        .with_register(
            RegisterDefinition::signed(0x0031, "pcb_temperature", Category::Temperature, 2)
                .with_scale(0.1)
                .with_unit("°C")
                .with_role(Role::Temperature),
        )
        .with_register(
            RegisterDefinition::unsigned(0x0040, "remaining_capacity", Category::Capacity, 2)
                .with_scale(0.001)
                .with_unit("Ah"),
        )
        .with_register(
            RegisterDefinition::unsigned(0x0041, "full_charge_capacity", Category::Capacity, 2)
                .with_scale(0.001)
                .with_unit("Ah")
                .with_role(Role::FullChargeCapacity),
        )
        .with_register(
            RegisterDefinition::unsigned(0x0042, "design_capacity", Category::Capacity, 2)
                .with_scale(0.001)
                .with_unit("Ah")
                .with_role(Role::DesignCapacity),
        )
        .with_register(
            RegisterDefinition::unsigned(0x0043, "state_of_charge", Category::Capacity, 1)
                .with_unit("%")
                .with_range(0.0, 100.0),
        )
        .with_register(
            RegisterDefinition::unsigned(0x0044, "state_of_health", Category::Capacity, 1)
                .with_unit("%")
                .with_range(0.0, 100.0)
                .with_role(Role::StateOfHealth),
        )
        .with_register(
            RegisterDefinition::unsigned(0x0050, "cycle_count", Category::Counter, 2)
                .with_unit("cycles")
                .with_role(Role::CycleCount),
        )
        .with_register(
            RegisterDefinition::unsigned(0x0051, "deep_discharge_count", Category::Counter, 2)
                .with_unit("events")
                .with_role(Role::SafetyEvents(Severity::Low)),
        )
        .with_register(RegisterDefinition::bitfield(
            0x0060,
            "battery_status",
            2,
            vec![
                FlagDef::new(0, "charging"),
                FlagDef::new(1, "discharging"),
                FlagDef::new(2, "fully_charged"),
                FlagDef::new(3, "low_battery"),
            ],
        ))
        .with_register(
            RegisterDefinition::bitfield(
                0x0061,
                "protection_status",
                2,
                vec![
                    FlagDef::new(0, "overvoltage"),
                    FlagDef::new(1, "undervoltage"),
                    FlagDef::new(2, "overcurrent"),
                    FlagDef::critical(3, "overtemperature"),
                    FlagDef::critical(4, "short_circuit"),
                    FlagDef::new(5, "cell_imbalance"),
                    FlagDef::critical(15, "permanent_lockout"),
                ],
            )
            .with_role(Role::ProtectionFlags),
        )
        .with_register(
            RegisterDefinition::unsigned(0x0070, "internal_resistance", Category::Resistance, 2)
                .with_unit("mOhm")
                .with_role(Role::InternalResistance),
        );

    for cell in 1..=CELLS_PER_PACK {
        builder = builder.with_register(
            RegisterDefinition::unsigned(element(0x21, cell), format!("cell_{cell}_voltage"), Category::Voltage, 2)
                .with_scale(0.001)
                .with_unit("V")
                .with_role(Role::CellVoltage(cell)),
        );
    }
    for sensor in 1..=3 {
        builder = builder.with_register(
            RegisterDefinition::signed(element(0x30, sensor), format!("cell_temperature_{sensor}"), Category::Temperature, 2)
                .with_scale(0.1)
                .with_unit("°C"),
        );
    }

    discharge_buckets(builder, 0x0080).build()
}

/// A known M18 pack type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct M18PackType {
    pub code: u16,
    pub capacity_ah: u8,
    pub description: &'static str,
}

const M18_PACK_TYPES: [M18PackType; 9] = [
    M18PackType { code: 37, capacity_ah: 2, description: "2Ah CP (5s1p 18650)" },
    M18PackType { code: 40, capacity_ah: 5, description: "5Ah XC (5s2p 18650)" },
    M18PackType { code: 165, capacity_ah: 5, description: "5Ah XC (5s2p 18650)" },
    M18PackType { code: 46, capacity_ah: 6, description: "6Ah XC (5s2p 18650)" },
    M18PackType { code: 104, capacity_ah: 3, description: "3Ah HO (5s1p 21700)" },
    M18PackType { code: 106, capacity_ah: 6, description: "6Ah HO (5s2p 21700)" },
    M18PackType { code: 107, capacity_ah: 8, description: "8Ah HO (5s2p 21700)" },
    M18PackType { code: 108, capacity_ah: 12, description: "12Ah HO (5s3p 21700)" },
    M18PackType { code: 384, capacity_ah: 12, description: "12Ah Forge (5s3p 21700 tabless)" },
];

/// Split M18 type/serial text, e.g. `"107-4521734"`, into the type code and the electronic serial.
pub fn m18_type_and_serial(text: &str) -> Option<(u16, String)> {
    let mut numbers = text
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty());
    let code: u16 = numbers.next()?.parse().ok()?;
    let serial = numbers.next()?.to_string();
    Some((code, serial))
}

/// Parse the M18 type/serial text.
///
/// Returns the pack type, if known, and the electronic serial.
pub fn m18_pack_type(type_and_serial: &str) -> Option<(M18PackType, String)> {
    let (code, serial) = m18_type_and_serial(type_and_serial)?;
    let pack_type = M18_PACK_TYPES.iter().find(|t| t.code == code)?;
    Some((*pack_type, serial))
}

/// Equivalent full cycles from lifetime discharge.
pub fn estimated_cycles(total_discharge_as: f64, capacity_ah: f64) -> Option<f64> {
    (capacity_ah > 0.0).then(|| total_discharge_as / 3600.0 / capacity_ah)
}
