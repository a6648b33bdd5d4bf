use std::fmt;
use std::sync::Arc;

use crate::edm::{
    EdmEntitySet, EdmEntityType, EdmNavigationProperty, EdmOperation, EdmOperationImport,
    EdmProperty, EdmSingleton,
};
use crate::segments::{NamedLiteral, ODataSegment};

use super::RouteValues;

/// Value side of a key entry or function parameter in a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateValue {
    /// Must equal the request literal exactly.
    Literal(String),
    /// Binds the request literal to a route value of this name.
    Parameter(String),
}

impl TemplateValue {
    /// `{name}` becomes a parameter, anything else stays a literal.
    pub fn from_literal(text: &str) -> Self {
        match text.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
            Some(name) if !name.is_empty() => TemplateValue::Parameter(name.to_string()),
            _ => TemplateValue::Literal(text.to_string()),
        }
    }

    pub fn parameter_name(&self) -> Option<&str> {
        match self {
            TemplateValue::Parameter(name) => Some(name),
            TemplateValue::Literal(_) => None,
        }
    }

    fn bind(&self, literal: &str, values: &mut RouteValues) -> bool {
        match self {
            TemplateValue::Literal(expected) => expected == literal,
            TemplateValue::Parameter(name) => {
                values.insert(name.clone(), literal.to_string());
                true
            }
        }
    }
}

impl fmt::Display for TemplateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateValue::Literal(text) => write!(f, "{}", text),
            TemplateValue::Parameter(name) => write!(f, "{{{}}}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    pub property: String,
    pub value: TemplateValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    pub entity_type: Arc<EdmEntityType>,
    pub entries: Vec<KeyEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationTemplate {
    pub property: EdmNavigationProperty,
    pub declaring_type: Arc<EdmEntityType>,
    pub target: Option<Arc<EdmEntitySet>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastTemplate {
    pub entity_type: Arc<EdmEntityType>,
    pub collection: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyTemplate {
    pub property: EdmProperty,
    pub declaring_type: Arc<EdmEntityType>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterTemplate {
    pub name: String,
    pub value: TemplateValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionImportTemplate {
    pub import: Arc<EdmOperationImport>,
    pub entity_set: Option<Arc<EdmEntitySet>>,
    pub parameters: Vec<ParameterTemplate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionTemplate {
    pub action: Arc<EdmOperation>,
    pub entity_set: Option<Arc<EdmEntitySet>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionTemplate {
    pub function: Arc<EdmOperation>,
    pub entity_set: Option<Arc<EdmEntitySet>>,
    pub parameters: Vec<ParameterTemplate>,
}

/// One element of a path template. Built by the translator, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentTemplate {
    EntitySet(Arc<EdmEntitySet>),
    Singleton(Arc<EdmSingleton>),
    Key(KeyTemplate),
    Navigation(NavigationTemplate),
    NavigationLink(NavigationTemplate),
    Cast(CastTemplate),
    Property(PropertyTemplate),
    Dynamic(String),
    ActionImport(Arc<EdmOperationImport>),
    FunctionImport(FunctionImportTemplate),
    Action(ActionTemplate),
    Function(FunctionTemplate),
    Count,
    Value,
    Metadata,
    /// `{name}`: matches any single segment.
    PathTemplate(String),
}

impl SegmentTemplate {
    /// Ranking used to order overlapping templates; lower is more specific.
    pub fn rank(&self) -> u8 {
        match self {
            SegmentTemplate::Dynamic(_) => 1,
            SegmentTemplate::PathTemplate(_) => 2,
            _ => 0,
        }
    }

    /// Route parameter names this segment binds, in template order.
    pub fn parameter_names(&self) -> Vec<&str> {
        match self {
            SegmentTemplate::Key(key) => key
                .entries
                .iter()
                .filter_map(|e| e.value.parameter_name())
                .collect(),
            SegmentTemplate::FunctionImport(FunctionImportTemplate { parameters, .. })
            | SegmentTemplate::Function(FunctionTemplate { parameters, .. }) => parameters
                .iter()
                .filter_map(|p| p.value.parameter_name())
                .collect(),
            SegmentTemplate::PathTemplate(name) => vec![name.as_str()],
            _ => Vec::new(),
        }
    }

    /// Tests one request segment against this template, adding bindings to `values`.
    /// `values` may hold partial bindings when this returns false.
    pub fn matches(&self, segment: &ODataSegment, values: &mut RouteValues) -> bool {
        match (self, segment) {
            (SegmentTemplate::EntitySet(expected), ODataSegment::EntitySet(actual)) => {
                expected.name == actual.name
            }
            (SegmentTemplate::Singleton(expected), ODataSegment::Singleton(actual)) => {
                expected.name == actual.name
            }
            (SegmentTemplate::Key(template), ODataSegment::Key(key)) => {
                template.entries.len() == key.values.len()
                    && template.entries.iter().all(|entry| {
                        key.find(&entry.property)
                            .is_some_and(|value| entry.value.bind(&value.literal, values))
                    })
            }
            (SegmentTemplate::Navigation(expected), ODataSegment::Navigation(actual))
            | (SegmentTemplate::NavigationLink(expected), ODataSegment::NavigationLink(actual)) => {
                expected.property.name == actual.property.name
            }
            (SegmentTemplate::Cast(expected), ODataSegment::TypeCast(actual)) => {
                expected.entity_type.full_name() == actual.entity_type.full_name()
            }
            (SegmentTemplate::Property(expected), ODataSegment::Property(actual)) => {
                expected.property.name == actual.property.name
            }
            (SegmentTemplate::Dynamic(expected), ODataSegment::DynamicPath(actual)) => {
                expected == actual
            }
            (SegmentTemplate::ActionImport(expected), ODataSegment::OperationImport(actual)) => {
                actual.imports.first().is_some_and(|import| {
                    import.is_action_import()
                        && import.name == expected.name
                        && import.operation.full_name() == expected.operation.full_name()
                })
            }
            (SegmentTemplate::FunctionImport(template), ODataSegment::OperationImport(actual)) => {
                actual.imports.first().is_some_and(|import| {
                    !import.is_action_import()
                        && import.name == template.import.name
                        && import.operation.full_name() == template.import.operation.full_name()
                }) && bind_parameters(&template.parameters, &actual.parameters, values)
            }
            (SegmentTemplate::Action(template), ODataSegment::Operation(actual)) => {
                actual.operations.first().is_some_and(|operation| {
                    operation.is_action() && operation.full_name() == template.action.full_name()
                })
            }
            (SegmentTemplate::Function(template), ODataSegment::Operation(actual)) => {
                actual.operations.first().is_some_and(|operation| {
                    !operation.is_action()
                        && operation.full_name() == template.function.full_name()
                }) && bind_parameters(&template.parameters, &actual.parameters, values)
            }
            (SegmentTemplate::Count, ODataSegment::Count)
            | (SegmentTemplate::Value, ODataSegment::Value)
            | (SegmentTemplate::Metadata, ODataSegment::Metadata) => true,
            (SegmentTemplate::PathTemplate(name), segment) => {
                values.insert(name.clone(), segment.literal());
                true
            }
            _ => false,
        }
    }
}

/// The request must supply exactly the template's parameter names.
fn bind_parameters(
    templates: &[ParameterTemplate],
    supplied: &[NamedLiteral],
    values: &mut RouteValues,
) -> bool {
    templates.len() == supplied.len()
        && templates.iter().all(|template| {
            supplied
                .iter()
                .find(|p| p.name == template.name)
                .is_some_and(|p| template.value.bind(&p.literal, values))
        })
}

fn write_parameters(f: &mut fmt::Formatter<'_>, parameters: &[ParameterTemplate]) -> fmt::Result {
    let rendered: Vec<String> = parameters
        .iter()
        .map(|p| format!("{}={}", p.name, p.value))
        .collect();
    write!(f, "({})", rendered.join(","))
}

impl fmt::Display for SegmentTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentTemplate::EntitySet(set) => write!(f, "{}", set.name),
            SegmentTemplate::Singleton(singleton) => write!(f, "{}", singleton.name),
            SegmentTemplate::Key(key) => match key.entries.as_slice() {
                [single] => write!(f, "({})", single.value),
                entries => {
                    let rendered: Vec<String> = entries
                        .iter()
                        .map(|e| format!("{}={}", e.property, e.value))
                        .collect();
                    write!(f, "({})", rendered.join(","))
                }
            },
            SegmentTemplate::Navigation(nav) => write!(f, "{}", nav.property.name),
            SegmentTemplate::NavigationLink(nav) => write!(f, "{}/$ref", nav.property.name),
            SegmentTemplate::Cast(cast) => write!(f, "{}", cast.entity_type.full_name()),
            SegmentTemplate::Property(property) => write!(f, "{}", property.property.name),
            SegmentTemplate::Dynamic(name) => write!(f, "{}", name),
            SegmentTemplate::ActionImport(import) => write!(f, "{}", import.name),
            SegmentTemplate::FunctionImport(template) => {
                write!(f, "{}", template.import.name)?;
                write_parameters(f, &template.parameters)
            }
            SegmentTemplate::Action(template) => write!(f, "{}", template.action.full_name()),
            SegmentTemplate::Function(template) => {
                write!(f, "{}", template.function.full_name())?;
                write_parameters(f, &template.parameters)
            }
            SegmentTemplate::Count => write!(f, "$count"),
            SegmentTemplate::Value => write!(f, "$value"),
            SegmentTemplate::Metadata => write!(f, "$metadata"),
            SegmentTemplate::PathTemplate(name) => write!(f, "{{{}}}", name),
        }
    }
}
