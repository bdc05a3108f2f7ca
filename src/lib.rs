//! # omoide-serial
//!
//! Serial operation queue for the Omoide media library.
//!
//! Background operations are rows in a database table. Worker processes take
//! a single-row lock, claim the oldest `created` operation, run the variant
//! registered under its name against the item catalog and record the outcome.
//! At most one operation runs at a time across all workers.

pub mod catalog;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod operations;
pub mod telemetry;
