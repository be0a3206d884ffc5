use std::{collections::BTreeMap, fmt::Display};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// One point of a series.  The timestamp is always a UTC instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: Timestamp,
    pub value: f64,
}

impl Reading {
    pub fn new(timestamp: Timestamp, value: f64) -> Reading {
        Reading { timestamp, value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Series {
    Consumption,
    Production,
    SpotPrice,
}

/// How readings sharing one timestamp are collapsed into a single row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum,
    Max,
}

/// What happens when a merged timestamp already exists in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    Overwrite,
    KeepExisting,
}

impl Series {
    pub const ALL: [Series; 3] = [Series::Consumption, Series::Production, Series::SpotPrice];

    pub fn table_name(&self) -> &'static str {
        match self {
            Series::Consumption => "energy_consumption",
            Series::Production => "energy_production",
            Series::SpotPrice => "energy_spot_price",
        }
    }

    pub fn value_column(&self) -> &'static str {
        match self {
            Series::Consumption | Series::Production => "value",
            Series::SpotPrice => "price",
        }
    }

    /// The source may emit several partial records for one instant.  Metered
    /// energy is additive, a price is not.
    pub fn aggregation(&self) -> Aggregation {
        match self {
            Series::Consumption | Series::Production => Aggregation::Sum,
            Series::SpotPrice => Aggregation::Max,
        }
    }

    /// Metered readings get corrected by the provider after the fact,
    /// published day-ahead prices never change.
    pub fn conflict_policy(&self) -> ConflictPolicy {
        match self {
            Series::Consumption | Series::Production => ConflictPolicy::Overwrite,
            Series::SpotPrice => ConflictPolicy::KeepExisting,
        }
    }
}

impl Display for Series {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Series::*;
        match self {
            Consumption => write!(f, "consumption"),
            Production => write!(f, "production"),
            SpotPrice => write!(f, "spot price"),
        }
    }
}

/// Collapse readings with an identical timestamp into one reading.
/// The result is sorted by timestamp.
pub fn dedup(readings: &[Reading], aggregation: Aggregation) -> Vec<Reading> {
    let mut by_time: BTreeMap<Timestamp, f64> = BTreeMap::new();
    for r in readings {
        by_time
            .entry(r.timestamp)
            .and_modify(|v| {
                *v = match aggregation {
                    Aggregation::Sum => *v + r.value,
                    Aggregation::Max => v.max(r.value),
                }
            })
            .or_insert(r.value);
    }
    by_time
        .into_iter()
        .map(|(timestamp, value)| Reading { timestamp, value })
        .collect()
}
