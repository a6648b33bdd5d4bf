pub mod content;
pub mod handler;
pub mod json;
pub mod model;
pub mod multipart;

pub use content::{BatchContent, PREFERENCE_APPLIED};
pub use handler::{BatchError, BatchHandler, BatchState, CONTINUE_ON_ERROR};
pub use model::*;
