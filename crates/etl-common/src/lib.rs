//! ETL Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, error taxonomy and logging setup for the ETL orchestrator.
//!
//! # Overview
//!
//! - **Types**: communication modes, runtimes, pod stages, node and transfer ids
//! - **Error Handling**: one error type per failure class plus [`EtlError`]
//! - **Durations**: the `5m` / `45s` timeout notation used on the wire
//! - **Checksums**: content digests for idempotent ETL creation
//!
//! # Example
//!
//! ```no_run
//! use etl_common::types::CommMode;
//! use etl_common::duration::parse_duration;
//!
//! let mode: CommMode = "hpull".parse().unwrap();
//! let timeout = parse_duration("5m").unwrap();
//! assert!(!mode.is_ordered());
//! assert_eq!(timeout.as_secs(), 300);
//! ```

pub mod checksum;
pub mod duration;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{EtlError, Result};
