//! Request handlers.

pub mod admin;
pub mod health;
pub mod runner;

pub use health::*;
