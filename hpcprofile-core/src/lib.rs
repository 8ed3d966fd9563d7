//! hpcprofile library exports

pub mod assembly;
pub mod backend;
pub mod catalog;
pub mod client;
pub mod error;
pub mod merge;
pub mod orchestrator;
pub mod registry;
pub mod resources;

pub use error::{ProfileError, Result};
pub use orchestrator::{CreateOptions, Orchestrator};
