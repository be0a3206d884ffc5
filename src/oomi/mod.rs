//! Scraper for the Oomi online service (https://online.oomi.fi).
//!
//! There is no API.  Hourly consumption and production live in a script
//! block of the reporting page, see [`report::parse_dataset`].

pub mod report;
pub mod session;
pub mod timestamps;

pub use session::{AuthenticatedSession, Portal};
