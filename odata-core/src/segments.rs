//! Concrete path segments: one resolved unit of a request path, bound to the model.

use std::fmt;
use std::sync::Arc;

use strum::{Display, EnumString};

use crate::edm::{
    EdmEntitySet, EdmEntityType, EdmNavigationProperty, EdmOperation, EdmOperationImport,
    EdmProperty, EdmSingleton, NavigationSource,
};

/// Kind tag of a concrete segment, named the way OData names segment types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum SegmentKind {
    #[strum(serialize = "EntitySetSegment")]
    EntitySet,
    #[strum(serialize = "SingletonSegment")]
    Singleton,
    #[strum(serialize = "KeySegment")]
    Key,
    #[strum(serialize = "NavigationPropertySegment")]
    Navigation,
    #[strum(serialize = "NavigationPropertyLinkSegment")]
    NavigationLink,
    #[strum(serialize = "TypeSegment")]
    TypeCast,
    #[strum(serialize = "PropertySegment")]
    Property,
    #[strum(serialize = "DynamicPathSegment")]
    DynamicPath,
    #[strum(serialize = "OperationImportSegment")]
    OperationImport,
    #[strum(serialize = "OperationSegment")]
    Operation,
    #[strum(serialize = "CountSegment")]
    Count,
    #[strum(serialize = "ValueSegment")]
    Value,
    #[strum(serialize = "MetadataSegment")]
    Metadata,
    #[strum(serialize = "BatchSegment")]
    Batch,
    #[strum(serialize = "BatchReferenceSegment")]
    BatchReference,
    #[strum(serialize = "PathTemplateSegment")]
    PathTemplate,
}

/// One `name=literal` pair of a key or an operation parameter list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedLiteral {
    pub name: String,
    /// Literal text exactly as written in the URL, e.g. `'ALFKI'`, `42` or `{key}`.
    pub literal: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySegment {
    pub entity_type: Arc<EdmEntityType>,
    pub source: Option<NavigationSource>,
    pub values: Vec<NamedLiteral>,
}

impl KeySegment {
    pub fn find(&self, property: &str) -> Option<&NamedLiteral> {
        self.values.iter().find(|v| v.name == property)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationSegment {
    pub property: EdmNavigationProperty,
    pub declaring_type: Arc<EdmEntityType>,
    pub target: Option<Arc<EdmEntitySet>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSegment {
    pub entity_type: Arc<EdmEntityType>,
    pub collection: bool,
    pub source: Option<NavigationSource>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertySegment {
    pub property: EdmProperty,
    pub declaring_type: Arc<EdmEntityType>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationImportSegment {
    /// Candidate imports in declaration order; never empty when built by the parser.
    pub imports: Vec<Arc<EdmOperationImport>>,
    pub parameters: Vec<NamedLiteral>,
    pub entity_set: Option<Arc<EdmEntitySet>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSegment {
    /// Candidate overloads in declaration order; never empty when built by the parser.
    pub operations: Vec<Arc<EdmOperation>>,
    pub parameters: Vec<NamedLiteral>,
    pub entity_set: Option<Arc<EdmEntitySet>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ODataSegment {
    EntitySet(Arc<EdmEntitySet>),
    Singleton(Arc<EdmSingleton>),
    Key(KeySegment),
    Navigation(NavigationSegment),
    NavigationLink(NavigationSegment),
    TypeCast(TypeSegment),
    Property(PropertySegment),
    DynamicPath(String),
    OperationImport(OperationImportSegment),
    Operation(OperationSegment),
    Count,
    Value,
    Metadata,
    Batch,
    /// `$<content-id>` that was not rewritten before parsing.
    BatchReference(String),
    /// `{name}` placeholder, only produced when parsing route templates.
    PathTemplate(String),
}

impl ODataSegment {
    pub fn kind(&self) -> SegmentKind {
        match self {
            ODataSegment::EntitySet(_) => SegmentKind::EntitySet,
            ODataSegment::Singleton(_) => SegmentKind::Singleton,
            ODataSegment::Key(_) => SegmentKind::Key,
            ODataSegment::Navigation(_) => SegmentKind::Navigation,
            ODataSegment::NavigationLink(_) => SegmentKind::NavigationLink,
            ODataSegment::TypeCast(_) => SegmentKind::TypeCast,
            ODataSegment::Property(_) => SegmentKind::Property,
            ODataSegment::DynamicPath(_) => SegmentKind::DynamicPath,
            ODataSegment::OperationImport(_) => SegmentKind::OperationImport,
            ODataSegment::Operation(_) => SegmentKind::Operation,
            ODataSegment::Count => SegmentKind::Count,
            ODataSegment::Value => SegmentKind::Value,
            ODataSegment::Metadata => SegmentKind::Metadata,
            ODataSegment::Batch => SegmentKind::Batch,
            ODataSegment::BatchReference(_) => SegmentKind::BatchReference,
            ODataSegment::PathTemplate(_) => SegmentKind::PathTemplate,
        }
    }

    /// The segment's text as it appears in a URL path.
    pub fn literal(&self) -> String {
        self.to_string()
    }
}

fn write_arguments(f: &mut fmt::Formatter<'_>, values: &[NamedLiteral]) -> fmt::Result {
    let rendered: Vec<String> = values
        .iter()
        .map(|v| format!("{}={}", v.name, v.literal))
        .collect();
    write!(f, "({})", rendered.join(","))
}

impl fmt::Display for ODataSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ODataSegment::EntitySet(set) => write!(f, "{}", set.name),
            ODataSegment::Singleton(singleton) => write!(f, "{}", singleton.name),
            ODataSegment::Key(key) => match key.values.as_slice() {
                [single] => write!(f, "({})", single.literal),
                values => write_arguments(f, values),
            },
            ODataSegment::Navigation(nav) => write!(f, "{}", nav.property.name),
            ODataSegment::NavigationLink(nav) => write!(f, "{}/$ref", nav.property.name),
            ODataSegment::TypeCast(cast) => write!(f, "{}", cast.entity_type.full_name()),
            ODataSegment::Property(property) => write!(f, "{}", property.property.name),
            ODataSegment::DynamicPath(name) => write!(f, "{}", name),
            ODataSegment::OperationImport(segment) => {
                let name = segment
                    .imports
                    .first()
                    .map(|i| i.name.clone())
                    .unwrap_or_default();
                write!(f, "{}", name)?;
                write_arguments(f, &segment.parameters)
            }
            ODataSegment::Operation(segment) => {
                let name = segment
                    .operations
                    .first()
                    .map(|o| o.full_name())
                    .unwrap_or_default();
                write!(f, "{}", name)?;
                write_arguments(f, &segment.parameters)
            }
            ODataSegment::Count => write!(f, "$count"),
            ODataSegment::Value => write!(f, "$value"),
            ODataSegment::Metadata => write!(f, "$metadata"),
            ODataSegment::Batch => write!(f, "$batch"),
            ODataSegment::BatchReference(id) => write!(f, "${}", id),
            ODataSegment::PathTemplate(name) => write!(f, "{{{}}}", name),
        }
    }
}
