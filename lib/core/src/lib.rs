//! Core types shared by the weft crates.
//!
//! This crate provides the strongly-typed identifiers and the `Result`
//! alias used across the workflow engine and its hosts.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ParseIdError, RunId};
