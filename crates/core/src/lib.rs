#![deny(unused)]
//! Core types, traits, and error definitions for CodeRunner.
//!
//! This crate provides the building blocks shared by the sandbox workers and
//! the gateway: the execution data model, the HTTP contract, configuration
//! and the error taxonomy.

pub mod config;
pub mod error;
pub mod mocks;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::*;
pub use types::*;
