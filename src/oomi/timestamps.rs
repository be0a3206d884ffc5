//! The portal reports epoch milliseconds that are skewed by the Helsinki
//! UTC offset.  The correction below was found empirically.  At a DST
//! transition it maps two hours onto one instant (spring) or skips an
//! hour (autumn).

use jiff::{tz::TimeZone, SignedDuration, Timestamp};

use crate::{error::SyncError, reading::Reading};

pub const PROVIDER_TZ: &str = "Europe/Helsinki";

pub fn provider_tz() -> Result<TimeZone, SyncError> {
    TimeZone::get(PROVIDER_TZ)
        .map_err(|e| SyncError::Config(format!("time zone {} unavailable: {}", PROVIDER_TZ, e)))
}

/// Convert raw `(epoch ms, value)` pairs into UTC readings.
///
/// Each epoch is localized to `tz` and the zone's UTC offset at that
/// instant is subtracted.  Order and values are preserved.
pub fn normalize(pairs: &[(i64, f64)], tz: &TimeZone) -> Result<Vec<Reading>, SyncError> {
    pairs
        .iter()
        .map(|&(ms, value)| {
            let raw = Timestamp::from_millisecond(ms)
                .map_err(|e| SyncError::Parse(format!("invalid epoch {}: {}", ms, e)))?;
            let offset = raw.to_zoned(tz.clone()).offset();
            let timestamp = raw
                .checked_sub(SignedDuration::from_secs(i64::from(offset.seconds())))
                .map_err(|e| SyncError::Parse(format!("invalid epoch {}: {}", ms, e)))?;
            Ok(Reading { timestamp, value })
        })
        .collect()
}

/// Keep the readings strictly after `after` and at or before `up_to`.
/// A missing bound is unbounded on that side.  Bounds are compared in `tz`.
pub fn filter(
    readings: Vec<Reading>,
    after: Option<Timestamp>,
    up_to: Option<Timestamp>,
    tz: &TimeZone,
) -> Vec<Reading> {
    let after = after.map(|t| t.to_zoned(tz.clone()));
    let up_to = up_to.map(|t| t.to_zoned(tz.clone()));
    readings
        .into_iter()
        .filter(|r| {
            let zoned = r.timestamp.to_zoned(tz.clone());
            after.as_ref().map_or(true, |a| &zoned > a)
                && up_to.as_ref().map_or(true, |u| &zoned <= u)
        })
        .collect()
}
