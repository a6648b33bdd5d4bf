//! Payload kinds, request body deserializers, paging and writer settings.

mod collection;
mod payload;
mod reference_link;
mod resource;
mod settings;

pub use collection::*;
pub use payload::*;
pub use reference_link::*;
pub use resource::*;
pub use settings::*;
