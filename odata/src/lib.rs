//! OData path templates, routing and batch processing.
//!
//! This crate provides a unified API over the core routing types and the server.
//!
//! # Example
//!
//! ```ignore
//! use odata::{EdmModel, RouteTableBuilder, UriParser};
//!
//! let mut routes = RouteTableBuilder::new();
//! routes.register_path(&model, "Customers({key})/Orders", "orders")?;
//! let table = routes.build();
//! let found = table.find(&UriParser::new(&model).parse_path("Customers('ALFKI')/Orders")?);
//! ```

// Re-export routing and payload types
pub use odata_core::{
    resolve_reference, translate, translate_path, ContentIdMapping, EdmModel, ODataError,
    ODataResult, ODataSegment, ODataVersion, PathTemplate, RouteTable, RouteTableBuilder,
    RouteValues, SegmentTemplate, UriParser, WriterSettings,
};

// Re-export server types
pub use odata_server::batch::{BatchContent, BatchError, BatchHandler};
pub use odata_server::config::ServerConfig;
pub use odata_server::pipeline::{RequestContext, RequestPipeline};
pub use odata_server::service::ODataService;
pub use odata_server::{router, AppState as Server};
