pub mod config;
pub mod db;
pub mod error;
pub mod oomi;
pub mod reading;
pub mod spot;
pub mod sync;
