//! Cell balance for one session, with optional comparison against earlier sessions.

use serde::{Deserialize, Serialize};
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceSettings {
    /// Spread between highest and lowest cell above which a pack is imbalanced.
    pub imbalance_threshold_mv: f64,
    /// Sessions, including the current one, needed before a consistency class is given.
    pub min_history_sessions: usize,
}

impl Default for BalanceSettings {
    fn default() -> Self {
        Self {
            imbalance_threshold_mv: 50.0,
            min_history_sessions: 3,
        }
    }
}

/// Read-only access to earlier cell voltage readings of the same pack.
pub trait CellHistory {
    /// Cell voltages in mV of earlier sessions, one entry per session, cells in index order.
    fn previous_sessions(&self) -> Vec<Vec<f64>>;
}

impl CellHistory for Vec<Vec<f64>> {
    fn previous_sessions(&self) -> Vec<Vec<f64>> {
        self.clone()
    }
}

/// Where a cell tends to sit across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Lowest cell in every session.
    AlwaysLow,
    /// Highest cell in every session.
    AlwaysHigh,
    /// Rank moved by more than one place.
    Variable,
    Stable,
    /// Not enough sessions.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellReading {
    /// 1 based cell position.
    pub index: usize,
    pub voltage_mv: f64,
    /// 1 is the highest voltage.
    pub rank: usize,
    pub deviation_mv: f64,
    pub is_lowest: bool,
    pub is_highest: bool,
    pub consistency: Consistency,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellVoltageSet {
    pub cells: Vec<CellReading>,
    pub mean_mv: f64,
    pub min_mv: f64,
    pub max_mv: f64,
    pub spread_mv: f64,
    pub imbalanced: bool,
}

impl CellVoltageSet {
    /// Analyse one session. Returns `None` for an empty set.
    pub fn analyze(voltages_mv: &[f64], settings: &BalanceSettings) -> Option<Self> {
        Self::analyze_with_history(voltages_mv, None, settings)
    }

    pub fn analyze_with_history(
        voltages_mv: &[f64],
        history: Option<&dyn CellHistory>,
        settings: &BalanceSettings,
    ) -> Option<Self> {
        if voltages_mv.is_empty() {
            return None;
        }
        let mean_mv = voltages_mv.iter().sum::<f64>() / voltages_mv.len() as f64;
        let min_mv = voltages_mv.iter().copied().fold(f64::INFINITY, f64::min);
        let max_mv = voltages_mv.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let spread_mv = max_mv - min_mv;
        let ranks = ranks(voltages_mv);
        let consistency = consistency(voltages_mv, history, settings);

        let cells = voltages_mv
            .iter()
            .enumerate()
            .map(|(i, &voltage_mv)| CellReading {
                index: i + 1,
                voltage_mv,
                rank: ranks[i],
                deviation_mv: voltage_mv - mean_mv,
                is_lowest: voltage_mv == min_mv,
                is_highest: voltage_mv == max_mv,
                consistency: consistency[i],
            })
            .collect();

        let imbalanced = spread_mv > settings.imbalance_threshold_mv;
        if imbalanced {
            tracing::info!(spread_mv, threshold_mv = settings.imbalance_threshold_mv, "cell imbalance detected");
        }
        Some(Self {
            cells,
            mean_mv,
            min_mv,
            max_mv,
            spread_mv,
            imbalanced,
        })
    }

    pub fn lowest(&self) -> Option<&CellReading> {
        self.cells.iter().find(|c| c.is_lowest)
    }

    pub fn highest(&self) -> Option<&CellReading> {
        self.cells.iter().find(|c| c.is_highest)
    }
}

/// 1 based ranks, highest voltage first, ties in cell order.
fn ranks(voltages: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..voltages.len()).collect();
    order.sort_by(|&a, &b| voltages[b].total_cmp(&voltages[a]).then(a.cmp(&b)));
    let mut ranks = vec![0; voltages.len()];
    for (rank, cell) in order.into_iter().enumerate() {
        ranks[cell] = rank + 1;
    }
    ranks
}

fn consistency(current: &[f64], history: Option<&dyn CellHistory>, settings: &BalanceSettings) -> Vec<Consistency> {
    let unknown = vec![Consistency::Unknown; current.len()];
    let Some(history) = history else {
        return unknown;
    };
    let mut sessions: Vec<Vec<f64>> = history
        .previous_sessions()
        .into_iter()
        .filter(|s| s.len() == current.len())
        .collect();
    sessions.push(current.to_vec());
    if sessions.len() < settings.min_history_sessions.max(1) {
        return unknown;
    }

    let session_ranks: Vec<Vec<usize>> = sessions.iter().map(|s| ranks(s)).collect();
    let count = current.len();
    (0..count)
        .map(|cell| {
            let positions: Vec<usize> = session_ranks.iter().map(|r| r[cell]).collect();
            let lowest = positions.iter().copied().min().unwrap_or(0);
            let highest = positions.iter().copied().max().unwrap_or(0);
            if count > 1 && positions.iter().all(|&r| r == count) {
                Consistency::AlwaysLow
            } else if count > 1 && positions.iter().all(|&r| r == 1) {
                Consistency::AlwaysHigh
            } else if highest - lowest > 1 {
                Consistency::Variable
            } else {
                Consistency::Stable
            }
        })
        .collect()
}
