//! Resolves a resource path against the model into concrete [`ODataSegment`]s.
//!
//! Request paths and route templates go through the same parser; template mode
//! additionally accepts `{name}` placeholders as whole segments, key values and
//! function parameter values.

use std::sync::Arc;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::edm::{parse_type_reference, EdmEntityType, EdmModel, NavigationSource};
use crate::errors::ODataError;
use crate::segments::{
    KeySegment, NamedLiteral, NavigationSegment, ODataSegment, OperationImportSegment,
    OperationSegment, PropertySegment, TypeSegment,
};
use crate::ODataResult;

/// What the segments parsed so far address.
#[derive(Default)]
struct ParseState {
    entity_type: Option<Arc<EdmEntityType>>,
    collection: bool,
    source: Option<NavigationSource>,
    /// Type information was lost (placeholder or unresolved reference).
    unknown: bool,
    /// Set once a segment that must be last has been read.
    terminal: Option<&'static str>,
}

pub struct UriParser<'a> {
    model: &'a EdmModel,
    allow_templates: bool,
}

impl<'a> UriParser<'a> {
    pub fn new(model: &'a EdmModel) -> Self {
        Self {
            model,
            allow_templates: false,
        }
    }

    /// Parser for route templates such as `Customers({key})/Orders`.
    pub fn for_templates(model: &'a EdmModel) -> Self {
        Self {
            model,
            allow_templates: true,
        }
    }

    /// Parses the path of `uri` relative to `service_root`. Query and fragment are ignored.
    pub fn parse_uri(&self, uri: &Url, service_root: &Url) -> ODataResult<Vec<ODataSegment>> {
        let relative = relative_path(uri, service_root).ok_or_else(|| {
            ODataError::InvalidPath(format!(
                "'{}' is not under the service root '{}'",
                uri, service_root
            ))
        })?;
        self.parse_path(relative)
    }

    pub fn parse_path(&self, path: &str) -> ODataResult<Vec<ODataSegment>> {
        let raw_segments = split_path(path)?;
        let mut segments = Vec::with_capacity(raw_segments.len());
        let mut state = ParseState::default();

        for (index, raw) in raw_segments.iter().enumerate() {
            if let Some(last) = state.terminal {
                return Err(ODataError::InvalidPath(format!(
                    "'{}' must be the last segment, found '{}' after it",
                    last, raw
                )));
            }
            if index == 0 {
                self.parse_first(raw, &mut segments, &mut state)?;
            } else {
                self.parse_next(raw, &mut segments, &mut state)?;
            }
        }

        Ok(segments)
    }

    fn parse_first(
        &self,
        raw: &str,
        segments: &mut Vec<ODataSegment>,
        state: &mut ParseState,
    ) -> ODataResult<()> {
        match raw {
            "$metadata" => {
                segments.push(ODataSegment::Metadata);
                state.terminal = Some("$metadata");
                return Ok(());
            }
            "$batch" => {
                segments.push(ODataSegment::Batch);
                state.terminal = Some("$batch");
                return Ok(());
            }
            _ => {}
        }

        if let Some(id) = raw.strip_prefix('$') {
            if id.is_empty() {
                return Err(ODataError::InvalidPath("Empty content-ID reference".to_string()));
            }
            segments.push(ODataSegment::BatchReference(id.to_string()));
            state.unknown = true;
            return Ok(());
        }

        if let Some(name) = self.placeholder(raw)? {
            segments.push(ODataSegment::PathTemplate(name));
            state.unknown = true;
            return Ok(());
        }

        let (identifier, arguments) = split_identifier(raw)?;

        if let Some(entity_set) = self.model.find_entity_set(identifier) {
            let source = NavigationSource::EntitySet(entity_set.clone());
            segments.push(ODataSegment::EntitySet(entity_set.clone()));
            state.entity_type = Some(entity_set.entity_type.clone());
            state.collection = true;
            state.source = Some(source);
            if let Some(arguments) = arguments {
                self.push_key(arguments, segments, state)?;
            }
            return Ok(());
        }

        if let Some(singleton) = self.model.find_singleton(identifier) {
            if arguments.is_some() {
                return Err(ODataError::InvalidKey(format!(
                    "Singleton '{}' cannot be addressed by key",
                    identifier
                )));
            }
            segments.push(ODataSegment::Singleton(singleton.clone()));
            state.entity_type = Some(singleton.entity_type.clone());
            state.collection = false;
            state.source = Some(NavigationSource::Singleton(singleton));
            return Ok(());
        }

        let imports = self.model.find_operation_imports(identifier);
        if !imports.is_empty() {
            let parameters = self.parse_parameters(arguments.unwrap_or(""))?;
            let entity_set = imports[0].entity_set.clone();
            let return_type = imports[0].operation.return_type.clone();
            segments.push(ODataSegment::OperationImport(OperationImportSegment {
                imports,
                parameters,
                entity_set: entity_set.clone(),
            }));
            self.apply_return_type(return_type.as_deref(), entity_set.map(NavigationSource::EntitySet), state);
            return Ok(());
        }

        Err(ODataError::UnresolvedSegment(identifier.to_string()))
    }

    fn parse_next(
        &self,
        raw: &str,
        segments: &mut Vec<ODataSegment>,
        state: &mut ParseState,
    ) -> ODataResult<()> {
        match raw {
            "$count" => {
                if !state.collection && !state.unknown {
                    return Err(ODataError::InvalidPath(
                        "$count can only follow a collection".to_string(),
                    ));
                }
                segments.push(ODataSegment::Count);
                state.terminal = Some("$count");
                return Ok(());
            }
            "$value" => {
                segments.push(ODataSegment::Value);
                state.terminal = Some("$value");
                return Ok(());
            }
            "$ref" => {
                return match segments.pop() {
                    Some(ODataSegment::Navigation(navigation)) => {
                        segments.push(ODataSegment::NavigationLink(navigation));
                        state.terminal = Some("$ref");
                        Ok(())
                    }
                    _ => Err(ODataError::InvalidPath(
                        "$ref must follow a navigation property".to_string(),
                    )),
                };
            }
            _ => {}
        }

        if raw.starts_with('$') {
            return Err(ODataError::InvalidPath(format!(
                "'{}' is not allowed at this position",
                raw
            )));
        }

        if let Some(name) = self.placeholder(raw)? {
            segments.push(ODataSegment::PathTemplate(name));
            *state = ParseState {
                unknown: true,
                ..ParseState::default()
            };
            return Ok(());
        }

        let (identifier, arguments) = split_identifier(raw)?;

        if state.unknown {
            return Err(ODataError::UnresolvedSegment(identifier.to_string()));
        }
        let entity_type = state.entity_type.clone().ok_or_else(|| {
            ODataError::InvalidPath(format!(
                "'{}' cannot follow a segment that does not address an entity",
                identifier
            ))
        })?;

        if identifier.contains('.') {
            return self.parse_qualified(identifier, arguments, &entity_type, segments, state);
        }

        if let Some(navigation) = entity_type.find_navigation_property(identifier) {
            if state.collection {
                return Err(ODataError::InvalidPath(format!(
                    "Navigation property '{}' cannot follow a collection",
                    identifier
                )));
            }
            let target = state
                .source
                .as_ref()
                .and_then(|source| self.model.find_navigation_target(source, identifier));
            let target_type = self
                .model
                .find_entity_type(&navigation.target_type)
                .ok_or_else(|| ODataError::UnresolvedSegment(navigation.target_type.clone()))?;

            segments.push(ODataSegment::Navigation(NavigationSegment {
                property: navigation.clone(),
                declaring_type: entity_type.clone(),
                target: target.clone(),
            }));
            state.entity_type = Some(target_type);
            state.collection = navigation.collection;
            state.source = target.map(NavigationSource::EntitySet);

            if let Some(arguments) = arguments {
                if !navigation.collection {
                    return Err(ODataError::InvalidKey(format!(
                        "Single-valued navigation '{}' cannot be addressed by key",
                        identifier
                    )));
                }
                self.push_key(arguments, segments, state)?;
            }
            return Ok(());
        }

        if state.collection {
            return Err(ODataError::InvalidPath(format!(
                "'{}' cannot follow a collection; address a single entity first",
                identifier
            )));
        }
        if arguments.is_some() {
            return Err(ODataError::InvalidPath(format!(
                "Property '{}' does not take arguments",
                identifier
            )));
        }

        if let Some(property) = entity_type.find_property(identifier) {
            segments.push(ODataSegment::Property(PropertySegment {
                property: property.clone(),
                declaring_type: entity_type.clone(),
            }));
        } else if entity_type.open {
            segments.push(ODataSegment::DynamicPath(identifier.to_string()));
        } else {
            return Err(ODataError::UnresolvedSegment(identifier.to_string()));
        }

        state.entity_type = None;
        state.source = None;
        Ok(())
    }

    /// Qualified names are either type casts or bound operations.
    fn parse_qualified(
        &self,
        identifier: &str,
        arguments: Option<&str>,
        current: &Arc<EdmEntityType>,
        segments: &mut Vec<ODataSegment>,
        state: &mut ParseState,
    ) -> ODataResult<()> {
        if let Some(cast_type) = self.model.find_entity_type(identifier) {
            if !cast_type.is_assignable_to(&current.full_name()) {
                return Err(ODataError::InvalidPath(format!(
                    "'{}' does not derive from '{}'",
                    identifier,
                    current.full_name()
                )));
            }
            segments.push(ODataSegment::TypeCast(TypeSegment {
                entity_type: cast_type.clone(),
                collection: state.collection,
                source: state.source.clone(),
            }));
            state.entity_type = Some(cast_type);
            if let Some(arguments) = arguments {
                if !state.collection {
                    return Err(ODataError::InvalidKey(format!(
                        "'{}' is not a collection and cannot be addressed by key",
                        identifier
                    )));
                }
                self.push_key(arguments, segments, state)?;
            }
            return Ok(());
        }

        let operations = self
            .model
            .find_bound_operations(identifier, current, state.collection);
        if operations.is_empty() {
            return Err(ODataError::UnresolvedSegment(identifier.to_string()));
        }

        let parameters = self.parse_parameters(arguments.unwrap_or(""))?;
        let entity_set = match &state.source {
            Some(NavigationSource::EntitySet(set)) => Some(set.clone()),
            _ => None,
        };
        let return_type = operations[0].return_type.clone();
        segments.push(ODataSegment::Operation(OperationSegment {
            operations,
            parameters,
            entity_set: entity_set.clone(),
        }));
        self.apply_return_type(
            return_type.as_deref(),
            entity_set.map(NavigationSource::EntitySet),
            state,
        );
        Ok(())
    }

    fn apply_return_type(
        &self,
        return_type: Option<&str>,
        source: Option<NavigationSource>,
        state: &mut ParseState,
    ) {
        let Some(return_type) = return_type else {
            state.terminal = Some("action without a return type");
            return;
        };
        let (type_name, collection) = parse_type_reference(return_type);
        state.entity_type = self.model.find_entity_type(type_name);
        state.collection = collection;
        state.source = if state.entity_type.is_some() { source } else { None };
    }

    fn push_key(
        &self,
        arguments: &str,
        segments: &mut Vec<ODataSegment>,
        state: &mut ParseState,
    ) -> ODataResult<()> {
        let entity_type = state
            .entity_type
            .clone()
            .ok_or_else(|| ODataError::InvalidKey("Key on a non-entity segment".to_string()))?;
        if !state.collection {
            return Err(ODataError::InvalidKey(format!(
                "'{}' is already a single entity",
                entity_type.full_name()
            )));
        }

        let values = self.parse_key_values(arguments, &entity_type)?;
        segments.push(ODataSegment::Key(KeySegment {
            entity_type,
            source: state.source.clone(),
            values,
        }));
        state.collection = false;
        Ok(())
    }

    fn parse_key_values(
        &self,
        arguments: &str,
        entity_type: &EdmEntityType,
    ) -> ODataResult<Vec<NamedLiteral>> {
        let items = split_arguments(arguments);
        if items.is_empty() {
            return Err(ODataError::InvalidKey("Empty key".to_string()));
        }

        let values: Vec<NamedLiteral> = if let [single] = items.as_slice() {
            match split_name_value(single) {
                Some((name, literal)) => vec![NamedLiteral {
                    name: name.to_string(),
                    literal: literal.to_string(),
                }],
                None => {
                    let [key_property] = entity_type.key.as_slice() else {
                        return Err(ODataError::InvalidKey(format!(
                            "'{}' has a composite key; name every key property",
                            entity_type.full_name()
                        )));
                    };
                    vec![NamedLiteral {
                        name: key_property.clone(),
                        literal: single.to_string(),
                    }]
                }
            }
        } else {
            items
                .iter()
                .map(|item| {
                    split_name_value(item)
                        .map(|(name, literal)| NamedLiteral {
                            name: name.to_string(),
                            literal: literal.to_string(),
                        })
                        .ok_or_else(|| {
                            ODataError::InvalidKey(format!("Unnamed composite key value '{}'", item))
                        })
                })
                .collect::<ODataResult<_>>()?
        };

        if values.len() != entity_type.key.len()
            || !entity_type.key.iter().all(|k| values.iter().any(|v| &v.name == k))
        {
            return Err(ODataError::InvalidKey(format!(
                "Key '{}' does not match the key of '{}'",
                arguments,
                entity_type.full_name()
            )));
        }
        for value in &values {
            self.check_literal(&value.literal)?;
        }
        Ok(values)
    }

    fn parse_parameters(&self, arguments: &str) -> ODataResult<Vec<NamedLiteral>> {
        let mut parameters: Vec<NamedLiteral> = Vec::new();
        for item in split_arguments(arguments) {
            let (name, literal) = split_name_value(item).ok_or_else(|| {
                ODataError::InvalidPath(format!("Parameter '{}' must be written as name=value", item))
            })?;
            if parameters.iter().any(|p| p.name == name) {
                return Err(ODataError::InvalidPath(format!(
                    "Parameter '{}' is given more than once",
                    name
                )));
            }
            self.check_literal(literal)?;
            parameters.push(NamedLiteral {
                name: name.to_string(),
                literal: literal.to_string(),
            });
        }
        Ok(parameters)
    }

    fn check_literal(&self, literal: &str) -> ODataResult<()> {
        if literal.is_empty() {
            return Err(ODataError::InvalidKey("Empty literal".to_string()));
        }
        if is_placeholder(literal) && !self.allow_templates {
            return Err(ODataError::InvalidPath(format!(
                "Template placeholder '{}' is not allowed in a request",
                literal
            )));
        }
        Ok(())
    }

    fn placeholder(&self, raw: &str) -> ODataResult<Option<String>> {
        if !is_placeholder(raw) {
            return Ok(None);
        }
        if !self.allow_templates {
            return Err(ODataError::InvalidPath(format!(
                "Template placeholder '{}' is not allowed in a request",
                raw
            )));
        }
        Ok(Some(raw[1..raw.len() - 1].to_string()))
    }
}

/// Path of `uri` below `service_root`, still percent-encoded.
pub fn relative_path<'u>(uri: &'u Url, service_root: &Url) -> Option<&'u str> {
    if uri.scheme() != service_root.scheme()
        || uri.host_str() != service_root.host_str()
        || uri.port_or_known_default() != service_root.port_or_known_default()
    {
        return None;
    }
    let root = service_root.path();
    let path = uri.path();
    if let Some(rest) = path.strip_prefix(root) {
        return Some(rest);
    }
    // Service root requested without its trailing slash
    if root.ends_with('/') && path == &root[..root.len() - 1] {
        return Some("");
    }
    None
}

fn is_placeholder(text: &str) -> bool {
    text.len() > 2 && text.starts_with('{') && text.ends_with('}')
}

/// Splits a path on `/` and percent-decodes every segment. Empty segments are dropped.
fn split_path(path: &str) -> ODataResult<Vec<String>> {
    path.trim_start_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            percent_decode_str(s)
                .decode_utf8()
                .map(|decoded| decoded.into_owned())
                .map_err(|e| ODataError::InvalidPath(format!("Invalid segment '{}': {}", s, e)))
        })
        .collect()
}

/// `Customers('A')` -> (`Customers`, Some(`'A'`)); `Customers` -> (`Customers`, None).
fn split_identifier(raw: &str) -> ODataResult<(&str, Option<&str>)> {
    match raw.find('(') {
        Some(open) => {
            if !raw.ends_with(')') {
                return Err(ODataError::InvalidPath(format!("Unbalanced parentheses in '{}'", raw)));
            }
            Ok((&raw[..open], Some(&raw[open + 1..raw.len() - 1])))
        }
        None => Ok((raw, None)),
    }
}

/// Splits on commas that are not inside a single-quoted string.
fn split_arguments(arguments: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut in_quote = false;
    let mut start = 0;
    for (index, ch) in arguments.char_indices() {
        match ch {
            '\'' => in_quote = !in_quote,
            ',' if !in_quote => {
                items.push(arguments[start..index].trim());
                start = index + 1;
            }
            _ => {}
        }
    }
    let last = arguments[start..].trim();
    if !last.is_empty() || !items.is_empty() {
        items.push(last);
    }
    items
}

/// Splits `name=value` on the first `=` outside quotes.
fn split_name_value(item: &str) -> Option<(&str, &str)> {
    let mut in_quote = false;
    for (index, ch) in item.char_indices() {
        match ch {
            '\'' => in_quote = !in_quote,
            '=' if !in_quote => {
                return Some((item[..index].trim(), item[index + 1..].trim()));
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segments::SegmentKind;
    use crate::test_support::sample_model;

    fn kinds(segments: &[ODataSegment]) -> Vec<SegmentKind> {
        segments.iter().map(|s| s.kind()).collect()
    }

    #[test]
    fn test_parse_entity_set_and_key() {
        let model = sample_model();
        let segments = UriParser::new(&model).parse_path("Customers('ALFKI')").unwrap();
        assert_eq!(kinds(&segments), vec![SegmentKind::EntitySet, SegmentKind::Key]);
        let ODataSegment::Key(key) = &segments[1] else {
            panic!("expected key segment");
        };
        assert_eq!(key.values[0].name, "CustomerID");
        assert_eq!(key.values[0].literal, "'ALFKI'");
    }

    #[test]
    fn test_parse_composite_key_and_quoted_commas() {
        let model = sample_model();
        let parser = UriParser::new(&model);
        let segments = parser.parse_path("OrderLines(OrderID=1,LineNo=2)").unwrap();
        assert_eq!(segments[1].literal(), "(OrderID=1,LineNo=2)");

        let segments = parser.parse_path("Customers('A,B=C')").unwrap();
        let ODataSegment::Key(key) = &segments[1] else {
            panic!("expected key segment");
        };
        assert_eq!(key.values[0].literal, "'A,B=C'");

        assert!(matches!(
            parser.parse_path("OrderLines(1)"),
            Err(ODataError::InvalidKey(_))
        ));
        assert!(matches!(
            parser.parse_path("OrderLines(OrderID=1,Nope=2)"),
            Err(ODataError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_parse_navigation_link_and_count() {
        let model = sample_model();
        let parser = UriParser::new(&model);
        let segments = parser.parse_path("/Customers('ALFKI')/Orders/$ref").unwrap();
        assert_eq!(
            kinds(&segments),
            vec![SegmentKind::EntitySet, SegmentKind::Key, SegmentKind::NavigationLink]
        );
        let segments = parser.parse_path("Customers('ALFKI')/Orders/$count").unwrap();
        assert_eq!(segments.last(), Some(&ODataSegment::Count));

        let segments = parser.parse_path("Customers('ALFKI')/Orders(10)/Lines").unwrap();
        let ODataSegment::Navigation(lines) = &segments[4] else {
            panic!("expected navigation");
        };
        assert_eq!(lines.target.as_ref().unwrap().name, "OrderLines");
    }

    #[test]
    fn test_parse_properties_dynamic_and_value() {
        let model = sample_model();
        let parser = UriParser::new(&model);
        let segments = parser.parse_path("Customers('A')/CompanyName/$value").unwrap();
        assert_eq!(
            kinds(&segments),
            vec![
                SegmentKind::EntitySet,
                SegmentKind::Key,
                SegmentKind::Property,
                SegmentKind::Value
            ]
        );
        // Customer is open, Order is not
        let segments = parser.parse_path("Customers('A')/Nickname").unwrap();
        assert_eq!(segments[2], ODataSegment::DynamicPath("Nickname".to_string()));
        assert!(matches!(
            parser.parse_path("Orders(1)/Nickname"),
            Err(ODataError::UnresolvedSegment(_))
        ));
    }

    #[test]
    fn test_parse_type_cast_and_bound_operations() {
        let model = sample_model();
        let parser = UriParser::new(&model);
        let segments = parser
            .parse_path("Customers/NS.VipCustomer('A')/NS.GetTopOrders(count=3)")
            .unwrap();
        assert_eq!(
            kinds(&segments),
            vec![
                SegmentKind::EntitySet,
                SegmentKind::TypeCast,
                SegmentKind::Key,
                SegmentKind::Operation
            ]
        );
        let ODataSegment::Operation(operation) = &segments[3] else {
            panic!("expected operation");
        };
        assert_eq!(operation.operations.len(), 2);
        assert_eq!(operation.parameters[0].literal, "3");

        let segments = parser.parse_path("Products/NS.MostExpensive()").unwrap();
        assert_eq!(segments[1].kind(), SegmentKind::Operation);

        assert!(matches!(
            parser.parse_path("Orders/NS.Customer"),
            Err(ODataError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_parse_operation_imports() {
        let model = sample_model();
        let parser = UriParser::new(&model);
        let segments = parser.parse_path("GetNearestStore(city='Berlin')").unwrap();
        assert_eq!(segments[0].literal(), "GetNearestStore(city='Berlin')");
        let segments = parser.parse_path("ResetData").unwrap();
        assert_eq!(segments[0].kind(), SegmentKind::OperationImport);
        assert!(parser.parse_path("ResetData/Anything").is_err());
    }

    #[test]
    fn test_parse_system_segments() {
        let model = sample_model();
        let parser = UriParser::new(&model);
        assert_eq!(parser.parse_path("$metadata").unwrap(), vec![ODataSegment::Metadata]);
        assert_eq!(parser.parse_path("$batch").unwrap(), vec![ODataSegment::Batch]);
        assert_eq!(
            parser.parse_path("$1").unwrap(),
            vec![ODataSegment::BatchReference("1".to_string())]
        );
        assert!(parser.parse_path("$batch/Customers").is_err());
        assert!(parser.parse_path("Customers/$metadata").is_err());
        assert!(parser.parse_path("").unwrap().is_empty());
    }

    #[test]
    fn test_placeholders_only_in_template_mode() {
        let model = sample_model();
        assert!(UriParser::new(&model).parse_path("Customers({key})").is_err());
        assert!(UriParser::new(&model).parse_path("{anything}").is_err());

        let template = UriParser::for_templates(&model);
        let segments = template.parse_path("Customers({key})/{property}").unwrap();
        assert_eq!(
            kinds(&segments),
            vec![SegmentKind::EntitySet, SegmentKind::Key, SegmentKind::PathTemplate]
        );
    }

    #[test]
    fn test_parse_uri_relative_to_service_root() {
        let model = sample_model();
        let root = Url::parse("http://localhost/odata/").unwrap();
        let parser = UriParser::new(&model);

        let uri = Url::parse("http://localhost/odata/Customers('A')?$select=City").unwrap();
        assert_eq!(parser.parse_uri(&uri, &root).unwrap().len(), 2);

        let encoded = Url::parse("http://localhost/odata/Customers('A%20B')").unwrap();
        let segments = parser.parse_uri(&encoded, &root).unwrap();
        assert_eq!(segments[1].literal(), "('A B')");

        let outside = Url::parse("http://localhost/other/Customers").unwrap();
        assert!(matches!(parser.parse_uri(&outside, &root), Err(ODataError::InvalidPath(_))));

        let bare_root = Url::parse("http://localhost/odata").unwrap();
        assert!(parser.parse_uri(&bare_root, &root).unwrap().is_empty());
    }

    #[test]
    fn test_split_arguments() {
        assert_eq!(split_arguments("a=1, b='x,y'"), vec!["a=1", "b='x,y'"]);
        assert_eq!(split_arguments(""), Vec::<&str>::new());
        assert_eq!(split_arguments("'it''s'"), vec!["'it''s'"]);
    }
}
