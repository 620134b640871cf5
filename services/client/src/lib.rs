//! Terminal front end for the tutoring backend.
//!
//! Loads configuration, picks concrete speech and audio adapters for this
//! machine, and wires them to the realtime core in `tutor_core`.

pub mod capture;
pub mod commands;
pub mod config;
pub mod engines;
pub mod runtime;
