//! Path templates: typed segment templates, matching against request paths and the
//! ranked route table built from them.

mod path;
mod route_table;
mod segment;

pub use path::*;
pub use route_table::*;
pub use segment::*;
