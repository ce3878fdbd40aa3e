//! Core types and traits for rust-qdaq.
//!
//! - [`error`]: the shared error taxonomy
//! - [`capabilities`]: instrument capability traits
//! - [`driver`]: driver factories and capability bags
//! - [`parameter`]: named, validated parameters
//! - [`config`]: the configuration store and timing constants
//! - [`data`]: sweep results and datasets
//! - [`derived`]: derived parameters built by composition
//! - [`cancel`]: cooperative cancellation

pub mod cancel;
pub mod capabilities;
pub mod config;
pub mod data;
pub mod derived;
pub mod driver;
pub mod error;
pub mod limits;
pub mod parameter;

pub use cancel::CancelToken;
pub use error::{QdaqError, QdaqResult, SequenceError};
