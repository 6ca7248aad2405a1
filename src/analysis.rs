//! Pack analysis: pulls analytic inputs out of a sealed session by register role, and runs cell
//! balance, usage and health scoring over them.

use crate::{
    cells::{CellHistory, CellVoltageSet},
    config::DiagConfig,
    decoder::DecodedValue,
    health::{self, HealthMetrics, HealthScore, SafetyEvents},
    register::{RegisterMap, Role, Severity},
    registers::{M18PackType, estimated_cycles, m18_pack_type},
    session::{DiagnosticSession, SessionId},
    usage::{DischargeHistogram, StressLevel},
};
use serde::Serialize;

/// Analytic inputs found in one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PackMetrics {
    /// Cell voltages in mV, in cell order. `None` unless every cell in the map was read.
    pub cell_voltages_mv: Option<Vec<f64>>,
    /// Seconds per discharge bucket. `None` unless every bucket in the map was read.
    pub discharge_seconds: Option<Vec<f64>>,
    pub capacity_percentage: Option<f64>,
    pub internal_resistance_mohm: Option<f64>,
    pub safety_events: SafetyEvents,
    pub critical_flags: Vec<String>,
    pub cycle_count: Option<f64>,
    /// Lifetime discharge in amp seconds.
    pub total_discharge_as: Option<f64>,
    pub temperature_c: Option<f64>,
    pub pack_voltage_v: Option<f64>,
    pub battery_type: Option<String>,
}

fn to_millivolts(value: f64, unit: &str) -> f64 {
    match unit {
        "mV" => value,
        _ => value * 1000.0,
    }
}

impl PackMetrics {
    pub fn from_session(session: &DiagnosticSession, map: &RegisterMap) -> Self {
        let decoded = |def_address: u16| session.value(def_address).filter(|v| v.is_decoded());
        let numeric = |role: Role| {
            map.find_role(role)
                .and_then(|def| decoded(def.address))
                .and_then(|v| v.value)
        };

        let mut metrics = PackMetrics {
            internal_resistance_mohm: numeric(Role::InternalResistance),
            cycle_count: numeric(Role::CycleCount),
            total_discharge_as: numeric(Role::TotalDischarge),
            temperature_c: numeric(Role::Temperature),
            pack_voltage_v: numeric(Role::PackVoltage),
            battery_type: map
                .find_role(Role::BatteryType)
                .and_then(|def| decoded(def.address))
                .and_then(|v| v.text.clone()),
            ..PackMetrics::default()
        };

        metrics.capacity_percentage = numeric(Role::StateOfHealth).or_else(|| {
            let full = numeric(Role::FullChargeCapacity)?;
            let design = numeric(Role::DesignCapacity)?;
            (design > 0.0).then(|| full / design * 100.0)
        });

        let mut cells: Vec<(u8, Option<f64>)> = Vec::new();
        let mut buckets: Vec<(u8, Option<f64>)> = Vec::new();
        for def in map.iter() {
            let value: Option<&DecodedValue> = decoded(def.address);
            match def.role {
                Some(Role::CellVoltage(n)) => {
                    cells.push((n, value.and_then(|v| v.value).map(|mv| to_millivolts(mv, &def.unit))));
                }
                Some(Role::DischargeBucket(n)) => buckets.push((n, value.and_then(|v| v.value))),
                Some(Role::SafetyEvents(severity)) => {
                    let count = value.and_then(|v| v.value).unwrap_or(0.0).max(0.0) as u32;
                    match severity {
                        Severity::High => metrics.safety_events.high += count,
                        Severity::Low => metrics.safety_events.low += count,
                    }
                }
                Some(Role::ProtectionFlags) => {
                    if let Some(value) = value {
                        metrics.critical_flags.extend(
                            value.active_flags().filter(|f| f.critical).map(|f| f.name.clone()),
                        );
                    }
                }
                _ => {}
            }
        }
        metrics.cell_voltages_mv = complete_series(cells, "cell voltage");
        metrics.discharge_seconds = complete_series(buckets, "discharge bucket");
        metrics
    }
}

/// Values ordered by their role index, or `None` when any is missing.
fn complete_series(mut entries: Vec<(u8, Option<f64>)>, what: &str) -> Option<Vec<f64>> {
    if entries.is_empty() {
        return None;
    }
    entries.sort_by_key(|(index, _)| *index);
    let series: Option<Vec<f64>> = entries.iter().map(|(_, v)| *v).collect();
    if series.is_none() {
        tracing::warn!(what, "incomplete series, skipping analysis");
    }
    series
}

/// Everything known about a pack after one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackReport {
    pub session_id: SessionId,
    pub completeness: f64,
    pub metrics: PackMetrics,
    pub cells: Option<CellVoltageSet>,
    pub histogram: Option<DischargeHistogram>,
    /// `None` when the pack reported no capacity.
    pub health: Option<HealthScore>,
    pub pack_type: Option<M18PackType>,
    pub serial: Option<String>,
    pub estimated_cycles: Option<f64>,
}

/// Analyse a sealed session.
pub fn analyze(
    session: &DiagnosticSession,
    map: &RegisterMap,
    config: &DiagConfig,
    history: Option<&dyn CellHistory>,
) -> PackReport {
    let metrics = PackMetrics::from_session(session, map);

    let cells = metrics
        .cell_voltages_mv
        .as_deref()
        .and_then(|v| CellVoltageSet::analyze_with_history(v, history, &config.cells));
    let histogram = metrics
        .discharge_seconds
        .as_deref()
        .map(|s| DischargeHistogram::from_seconds(s, map.nominal_voltage(), &config.usage));

    let health_metrics = HealthMetrics {
        capacity_percentage: metrics.capacity_percentage,
        internal_resistance_mohm: metrics.internal_resistance_mohm,
        resistance_baseline_mohm: map.resistance_baseline_mohm(),
        cell_spread_mv: cells.as_ref().map(|c| c.spread_mv),
        imbalance_threshold_mv: config.cells.imbalance_threshold_mv,
        stress: histogram.as_ref().map_or(StressLevel::Easy, |h| h.stress),
        safety_events: metrics.safety_events,
        critical_flags: metrics.critical_flags.clone(),
    };
    let health = health::score(&health_metrics, &config.scoring);
    if health.is_none() {
        tracing::warn!(session_id = %session.id(), "pack capacity unknown, no health score");
    }

    let identified = metrics.battery_type.as_deref().and_then(m18_pack_type);
    let estimated = identified
        .as_ref()
        .zip(metrics.total_discharge_as)
        .and_then(|((pack_type, _), total)| estimated_cycles(total, pack_type.capacity_ah as f64));
    let (pack_type, serial) = identified.unzip();

    tracing::info!(
        session_id = %session.id(),
        score = health.as_ref().map(|h| h.score),
        imbalanced = cells.as_ref().map(|c| c.imbalanced),
        "pack analysed"
    );
    PackReport {
        session_id: session.id(),
        completeness: session.completeness(),
        metrics,
        cells,
        histogram,
        health,
        pack_type,
        serial,
        estimated_cycles: estimated,
    }
}
