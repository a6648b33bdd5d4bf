use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::errors::ODataError;
use crate::segments::ODataSegment;
use crate::ODataResult;

use super::SegmentTemplate;

/// Parameter name -> raw literal text captured from the request path.
///
/// Quotes are kept: a key template `Customers({key})` matched against
/// `Customers('ALFKI')` binds `key` to `'ALFKI'`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteValues(BTreeMap<String, String>);

impl RouteValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: String, value: String) {
        self.0.insert(name, value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

/// Ordered sequence of segment templates, compared position-wise against request paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    segments: Vec<SegmentTemplate>,
}

impl PathTemplate {
    /// Builds a template, rejecting parameter names that are bound more than once.
    pub fn new(segments: Vec<SegmentTemplate>) -> ODataResult<Self> {
        let template = Self { segments };
        let mut seen = HashSet::new();
        for name in template.parameter_names() {
            if !seen.insert(name) {
                return Err(ODataError::DuplicateRouteParameter(name.to_string()));
            }
        }
        Ok(template)
    }

    pub fn segments(&self) -> &[SegmentTemplate] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn parameter_names(&self) -> Vec<&str> {
        self.segments
            .iter()
            .flat_map(|s| s.parameter_names())
            .collect()
    }

    /// Position-wise rank vector; compared lexicographically, lower wins.
    pub fn specificity(&self) -> Vec<u8> {
        self.segments.iter().map(SegmentTemplate::rank).collect()
    }

    /// Returns the route values when every request segment matches the template
    /// segment at the same position, `None` otherwise.
    pub fn match_path(&self, segments: &[ODataSegment]) -> Option<RouteValues> {
        if segments.len() != self.segments.len() {
            return None;
        }

        let mut values = RouteValues::new();
        for (template, segment) in self.segments.iter().zip(segments) {
            if !template.matches(segment, &mut values) {
                return None;
            }
        }
        Some(values)
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, segment) in self.segments.iter().enumerate() {
            // Keys attach to the previous segment: Customers({key})
            if index > 0 && !matches!(segment, SegmentTemplate::Key(_)) {
                write!(f, "/")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_model;
    use crate::translator::translate_path;
    use crate::uri_parser::UriParser;

    fn template(path: &str) -> PathTemplate {
        let model = sample_model();
        let segments = UriParser::for_templates(&model).parse_path(path).unwrap();
        translate_path(&segments).unwrap()
    }

    fn request(path: &str) -> Vec<ODataSegment> {
        let model = sample_model();
        UriParser::new(&model).parse_path(path).unwrap()
    }

    // === Matching ===

    #[test]
    fn test_key_parameter_binds_raw_literal() {
        let values = template("Customers({key})")
            .match_path(&request("Customers('ALFKI')"))
            .unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values.get("key"), Some("'ALFKI'"));
    }

    #[test]
    fn test_composite_key_binds_by_property_name() {
        let values = template("OrderLines(LineNo={line},OrderID={order})")
            .match_path(&request("OrderLines(OrderID=10,LineNo=2)"))
            .unwrap();
        assert_eq!(values.get("order"), Some("10"));
        assert_eq!(values.get("line"), Some("2"));
    }

    #[test]
    fn test_literal_key_must_match_exactly() {
        let fixed = template("Customers('ALFKI')");
        assert!(fixed.match_path(&request("Customers('ALFKI')")).unwrap().is_empty());
        assert!(fixed.match_path(&request("Customers('BONAP')")).is_none());
    }

    #[test]
    fn test_length_mismatch_is_no_match() {
        let t = template("Customers({key})");
        assert!(t.match_path(&request("Customers")).is_none());
        assert!(t.match_path(&request("Customers('A')/Orders")).is_none());
    }

    #[test]
    fn test_function_parameters_must_be_supplied_exactly() {
        let t = template("Customers({key})/NS.GetTopOrders(count={count})");
        let values = t
            .match_path(&request("Customers('A')/NS.GetTopOrders(count=5)"))
            .unwrap();
        assert_eq!(values.get("key"), Some("'A'"));
        assert_eq!(values.get("count"), Some("5"));

        assert!(t
            .match_path(&request("Customers('A')/NS.GetTopOrders(count=5,minFreight=1)"))
            .is_none());
    }

    #[test]
    fn test_action_and_import_matching() {
        let promote = template("Customers({key})/NS.Promote");
        assert!(promote.match_path(&request("Customers('A')/NS.Promote")).is_some());

        let nearest = template("GetNearestStore(city={city})");
        let values = nearest
            .match_path(&request("GetNearestStore(city='Berlin')"))
            .unwrap();
        assert_eq!(values.get("city"), Some("'Berlin'"));
        assert!(nearest.match_path(&request("ResetData")).is_none());
    }

    #[test]
    fn test_navigation_link_and_system_segments() {
        let link = template("Customers({key})/Orders/$ref");
        assert!(link.match_path(&request("Customers('A')/Orders/$ref")).is_some());
        assert!(link.match_path(&request("Customers('A')/Orders")).is_none());

        let count = template("Customers/$count");
        assert!(count.match_path(&request("Customers/$count")).is_some());
        assert!(template("$metadata").match_path(&request("$metadata")).is_some());
    }

    #[test]
    fn test_placeholder_binds_segment_literal() {
        let values = template("Customers({key})/{property}")
            .match_path(&request("Customers('A')/City"))
            .unwrap();
        assert_eq!(values.get("property"), Some("City"));
    }

    // === Construction ===

    #[test]
    fn test_duplicate_parameter_names_rejected() {
        let model = sample_model();
        let segments = UriParser::for_templates(&model)
            .parse_path("Customers({key})/Orders({key})")
            .unwrap();
        assert_eq!(
            translate_path(&segments),
            Err(ODataError::DuplicateRouteParameter("key".to_string()))
        );
    }

    #[test]
    fn test_display_and_specificity() {
        let t = template("Customers({key})/Orders/$count");
        assert_eq!(t.to_string(), "Customers({key})/Orders/$count");
        assert_eq!(t.specificity(), vec![0, 0, 0, 0]);
        assert_eq!(template("Customers({key})/{p}").specificity(), vec![0, 0, 2]);
        assert_eq!(template("Customers({key})/Nick").specificity(), vec![0, 0, 1]);
    }
}
