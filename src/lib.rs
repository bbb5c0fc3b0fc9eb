//! Expose the OpenHR20 thermostat log as individual values for a smart-home hub.
//!
//! An independent logging daemon appends thermostat reports to an SQLite `log` table. This
//! crate polls the latest row of each configured thermostat, projects it onto one entity per
//! field (see [`fields::FIELDS`]) and publishes those entities as a Homie device.

pub mod commands;
pub mod config;
pub mod entity;
pub mod fields;
pub mod homie;
pub mod output;
pub mod store;
