//! Shared scalar types and the error taxonomy used throughout the engine.

pub mod error;
pub mod ids;

pub use error::{QueueError, Result};
pub use ids::MessageId;
