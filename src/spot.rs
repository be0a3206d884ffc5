//! Day-ahead spot prices for Finland from https://spot-hinta.fi
//! The `Today` endpoint returns all prices of the current day, VAT included.

use std::time::Duration;

use jiff::Timestamp;
use log::info;
use reqwest::{blocking::Client, header::ACCEPT, StatusCode};
use serde::Deserialize;

use crate::{error::SyncError, reading::Reading};

#[derive(Debug, Deserialize)]
struct PriceRow {
    #[serde(rename = "DateTime")]
    date_time: Timestamp,
    #[serde(rename = "PriceWithTax")]
    price_with_tax: f64,
}

pub struct SpotPriceClient {
    client: Client,
    pub url: String,
}

impl SpotPriceClient {
    pub fn new(url: &str) -> Result<SpotPriceClient, SyncError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| SyncError::Config(format!("cannot build http client: {}", e)))?;
        Ok(SpotPriceClient {
            client,
            url: url.to_string(),
        })
    }

    pub fn fetch_today(&self) -> Result<Vec<Reading>, SyncError> {
        let response = self
            .client
            .get(&self.url)
            .header(ACCEPT, "application/json")
            .send()
            .map_err(|e| SyncError::fetch(&self.url, e))?;
        if response.status() != StatusCode::OK {
            return Err(SyncError::fetch(
                &self.url,
                format!("status code {}", response.status()),
            ));
        }
        let body = response.text().map_err(|e| SyncError::fetch(&self.url, e))?;
        let prices = parse_prices(&body)?;
        info!("Got {} spot prices", prices.len());
        Ok(prices)
    }
}

pub fn parse_prices(json: &str) -> Result<Vec<Reading>, SyncError> {
    let rows: Vec<PriceRow> = serde_json::from_str(json)
        .map_err(|e| SyncError::Parse(format!("spot prices: {}", e)))?;
    Ok(rows
        .into_iter()
        .map(|row| Reading::new(row.date_time, row.price_with_tax))
        .collect())
}
