//! SQLite persistence for jobs, entities and operator settings.

pub mod db;

pub use db::{DbHandle, HarvestDb, Statistics};
