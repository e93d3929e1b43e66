//! IGS Dataplane Base Crate
//!
//! This crate contains shared type definitions, traits, and helper functions
//! used across the dataplane daemon, its control socket transport and the
//! `igs` shell. It does not contain any actual component / service
//! implementations.

pub mod api;
pub mod config;
pub mod control_socket;
pub mod error;
