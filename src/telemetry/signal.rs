//! Signal strength normalization

use serde::{Deserialize, Serialize};

/// dBm range mapped linearly onto 0..=100 %
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRange {
    pub min_dbm: i32,
    pub max_dbm: i32,
}

impl Default for SignalRange {
    fn default() -> Self {
        Self {
            min_dbm: -95,
            max_dbm: -35,
        }
    }
}

impl SignalRange {
    pub fn new(min_dbm: i32, max_dbm: i32) -> Self {
        Self { min_dbm, max_dbm }
    }

    /// Percentage for `dbm`, clamped at both ends
    pub fn percent(&self, dbm: f64) -> u8 {
        let span = (self.max_dbm - self.min_dbm) as f64;
        if span <= 0.0 {
            return if dbm >= self.max_dbm as f64 { 100 } else { 0 };
        }
        let pct = (dbm - self.min_dbm as f64) / span * 100.0;
        pct.round().clamp(0.0, 100.0) as u8
    }
}
