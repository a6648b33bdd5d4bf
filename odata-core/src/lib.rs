pub mod content_id;
pub mod edm;
pub mod errors;
pub mod formatter;
pub mod segments;
pub mod template;
pub mod translator;
pub mod uri_parser;

pub use content_id::*;
pub use edm::*;
pub use errors::*;
pub use formatter::*;
pub use segments::*;
pub use template::*;
pub use translator::*;
pub use uri_parser::*;

pub type ODataResult<T> = Result<T, ODataError>;
