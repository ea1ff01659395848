//! paw: an embeddable command/macro scripting runtime.
//!
//! The engine lives in [`script`]; the remaining modules support the `paw`
//! binary.

pub mod cli;
pub mod config;
pub mod diag;
pub mod error;
pub mod event_loop;
pub mod script;

mod sync;
