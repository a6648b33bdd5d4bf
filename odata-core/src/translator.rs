//! Translation of concrete path segments into segment templates.

use crate::edm::EdmOperation;
use crate::errors::ODataError;
use crate::segments::ODataSegment;
use crate::template::{
    ActionTemplate, CastTemplate, FunctionImportTemplate, FunctionTemplate, KeyEntry,
    KeyTemplate, NavigationTemplate, ParameterTemplate, PathTemplate, PropertyTemplate,
    SegmentTemplate, TemplateValue,
};
use crate::ODataResult;

/// Translates one concrete segment into the template of the same kind.
///
/// For operation and operation-import segments the first candidate decides between the
/// action and function forms. Function templates take their parameters from the
/// function's declared parameters, each bound to a route parameter of the same name;
/// parameter values written in the segment and optional parameters are not considered.
pub fn translate(segment: &ODataSegment) -> ODataResult<SegmentTemplate> {
    let template = match segment {
        ODataSegment::EntitySet(set) => SegmentTemplate::EntitySet(set.clone()),
        ODataSegment::Singleton(singleton) => SegmentTemplate::Singleton(singleton.clone()),
        ODataSegment::Key(key) => SegmentTemplate::Key(KeyTemplate {
            entity_type: key.entity_type.clone(),
            entries: key
                .values
                .iter()
                .map(|v| KeyEntry {
                    property: v.name.clone(),
                    value: TemplateValue::from_literal(&v.literal),
                })
                .collect(),
        }),
        ODataSegment::Navigation(nav) => SegmentTemplate::Navigation(NavigationTemplate {
            property: nav.property.clone(),
            declaring_type: nav.declaring_type.clone(),
            target: nav.target.clone(),
        }),
        ODataSegment::NavigationLink(nav) => SegmentTemplate::NavigationLink(NavigationTemplate {
            property: nav.property.clone(),
            declaring_type: nav.declaring_type.clone(),
            target: nav.target.clone(),
        }),
        ODataSegment::TypeCast(cast) => SegmentTemplate::Cast(CastTemplate {
            entity_type: cast.entity_type.clone(),
            collection: cast.collection,
        }),
        ODataSegment::Property(property) => SegmentTemplate::Property(PropertyTemplate {
            property: property.property.clone(),
            declaring_type: property.declaring_type.clone(),
        }),
        ODataSegment::DynamicPath(name) => SegmentTemplate::Dynamic(name.clone()),
        ODataSegment::OperationImport(segment) => {
            let import = segment
                .imports
                .first()
                .ok_or_else(|| ODataError::ArgumentNull("operationImports".to_string()))?;
            if import.is_action_import() {
                SegmentTemplate::ActionImport(import.clone())
            } else {
                SegmentTemplate::FunctionImport(FunctionImportTemplate {
                    import: import.clone(),
                    entity_set: segment.entity_set.clone(),
                    parameters: declared_parameters(&import.operation),
                })
            }
        }
        ODataSegment::Operation(segment) => {
            let operation = segment
                .operations
                .first()
                .ok_or_else(|| ODataError::ArgumentNull("operations".to_string()))?;
            if operation.is_action() {
                SegmentTemplate::Action(ActionTemplate {
                    action: operation.clone(),
                    entity_set: segment.entity_set.clone(),
                })
            } else {
                SegmentTemplate::Function(FunctionTemplate {
                    function: operation.clone(),
                    entity_set: segment.entity_set.clone(),
                    parameters: declared_parameters(operation),
                })
            }
        }
        ODataSegment::Count => SegmentTemplate::Count,
        ODataSegment::Value => SegmentTemplate::Value,
        ODataSegment::Metadata => SegmentTemplate::Metadata,
        ODataSegment::PathTemplate(name) => SegmentTemplate::PathTemplate(name.clone()),
        ODataSegment::Batch | ODataSegment::BatchReference(_) => {
            return Err(ODataError::UnsupportedSegmentKind(segment.kind()));
        }
    };
    Ok(template)
}

/// Translates a whole path; fails on the first segment that cannot be translated.
pub fn translate_path(segments: &[ODataSegment]) -> ODataResult<PathTemplate> {
    let templates = segments
        .iter()
        .map(translate)
        .collect::<ODataResult<Vec<_>>>()?;
    PathTemplate::new(templates)
}

fn declared_parameters(function: &EdmOperation) -> Vec<ParameterTemplate> {
    function
        .parameters
        .iter()
        .map(|p| ParameterTemplate {
            name: p.name.clone(),
            value: TemplateValue::Parameter(p.name.clone()),
        })
        .collect()
}
