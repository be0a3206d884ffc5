use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use flate2::{write::GzEncoder, Compression};
use jiff::Timestamp;
use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;
use reqwest::StatusCode;

use super::session::AuthenticatedSession;
use crate::error::SyncError;

/// `[epoch ms, value]`, the value may be negative or in exponent notation.
const PAIR_PATTERN: &str = r"\[\s*(-?\d+)\s*,\s*(-?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)\s*\]";

lazy_static! {
    static ref MODEL: Regex = Regex::new(r"var model = (\{.+\});").unwrap();
    static ref DATA_START: Regex = Regex::new(r#""Data"\s*:\s*\["#).unwrap();
    static ref PAIR: Regex = Regex::new(PAIR_PATTERN).unwrap();
    static ref PAIR_LIST: Regex =
        Regex::new(&format!(r"^\s*(?:{p}\s*(?:,\s*{p}\s*)*)?$", p = PAIR_PATTERN)).unwrap();
}

/// The dataset embedded in a consumption report page.
#[derive(Debug, PartialEq)]
pub struct Dataset<'a> {
    /// Content of the `Data` array, without the outer brackets.
    pub raw: &'a str,
    /// `(epoch ms, value)` pairs in source order.
    pub pairs: Vec<(i64, f64)>,
}

impl AuthenticatedSession {
    pub fn report_url(&self, metering_point: &str) -> String {
        format!(
            "{}/Reporting/CustomerConsumption?meteringPointCode={}&showOldContracts=null",
            self.base_url, metering_point
        )
    }

    /// Get the report page for a metering point.  Returns the html body.
    pub fn fetch_report(&self, metering_point: &str) -> Result<String, SyncError> {
        info!("Getting data for meteringpoint {}", metering_point);
        let url = self.report_url(metering_point);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| SyncError::fetch(&url, e))?;
        if response.status() != StatusCode::OK {
            return Err(SyncError::fetch(&url, format!("status code {}", response.status())));
        }
        response.text().map_err(|e| SyncError::fetch(&url, e))
    }

    /// Fetch and parse the `(epoch ms, value)` pairs for a metering point.
    pub fn fetch_dataset(&self, metering_point: &str) -> Result<Vec<(i64, f64)>, SyncError> {
        let html = self.fetch_report(metering_point)?;
        Ok(parse_dataset(&html)?.pairs)
    }
}

/// Pull the first `Data` array out of the `var model = {...};` script
/// assignment.  A missing model or `Data` field is an error, an empty
/// array is not.
pub fn parse_dataset(html: &str) -> Result<Dataset<'_>, SyncError> {
    let model = MODEL
        .captures(html)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| SyncError::Parse("no model assignment found".to_string()))?;
    let raw = first_data_array(model.as_str())?;
    if !PAIR_LIST.is_match(raw) {
        return Err(SyncError::Parse(format!(
            "Data array is not a list of [epoch, value] pairs: {}",
            raw
        )));
    }

    let pairs = PAIR
        .captures_iter(raw)
        .map(|caps| {
            let ms = caps[1]
                .parse::<i64>()
                .map_err(|e| SyncError::Parse(format!("bad epoch {}: {}", &caps[1], e)))?;
            let value = caps[2]
                .parse::<f64>()
                .map_err(|e| SyncError::Parse(format!("bad value {}: {}", &caps[2], e)))?;
            Ok((ms, value))
        })
        .collect::<Result<Vec<_>, SyncError>>()?;
    debug!("parsed {} pairs", pairs.len());
    Ok(Dataset { raw, pairs })
}

/// Contents of the first `Data` array, without the outer brackets.  Only
/// the first one counts, later arrays belong to other chart series.
fn first_data_array(model: &str) -> Result<&str, SyncError> {
    let start = DATA_START
        .find(model)
        .ok_or_else(|| SyncError::Parse("no Data array found in model".to_string()))?
        .end();
    let mut depth = 1;
    for (i, c) in model[start..].char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(&model[start..start + i]);
                }
            }
            _ => {}
        }
    }
    Err(SyncError::Parse("unterminated Data array".to_string()))
}

/// Save the raw dataset as `{dir}/Raw/{year}/{metering point}_{timestamp}.json.gz`.
pub fn archive_raw(
    dir: &Path,
    metering_point: &str,
    raw: &str,
    now: Timestamp,
) -> Result<PathBuf, SyncError> {
    let path = dir
        .join("Raw")
        .join(now.strftime("%Y").to_string())
        .join(format!(
            "{}_{}.json.gz",
            metering_point,
            now.strftime("%Y%m%dT%H%M%SZ")
        ));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut encoder = GzEncoder::new(File::create(&path)?, Compression::default());
    encoder.write_all(b"[")?;
    encoder.write_all(raw.as_bytes())?;
    encoder.write_all(b"]")?;
    encoder.finish()?;
    Ok(path)
}
