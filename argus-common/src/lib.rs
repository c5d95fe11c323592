//! Argus Common - Shared configuration and backend wire types for the Argus proxy

pub mod config;
pub mod records;

pub use config::*;
pub use records::*;
