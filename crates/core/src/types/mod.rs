//! Core type definitions for CodeRunner.
//!
//! Broken down into submodules: the request and result data model, static
//! language profiles, and the HTTP contract shared by gateway and workers.

pub mod contract;
pub mod language;
pub mod request;
pub mod result;

pub use contract::*;
pub use language::*;
pub use request::*;
pub use result::*;
