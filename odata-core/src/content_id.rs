//! Content-ID bookkeeping for batch requests.
//!
//! A batch operation may carry a `Content-ID`. Once it succeeds with a `Location`,
//! later operations in the same batch can refer to the created resource as `$<id>`,
//! both in their request URI and in reference-link bodies.

use std::collections::HashMap;

use url::Url;

use crate::errors::ODataError;
use crate::uri_parser::relative_path;
use crate::ODataResult;

/// `$`-prefixed names that are OData system segments, never content-ID references.
pub const RESERVED_SYSTEM_SEGMENTS: &[&str] = &[
    "metadata", "batch", "count", "value", "ref", "entity", "all", "crossjoin", "each", "filter",
];

/// Content-ID -> location of the resource created by that operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentIdMapping {
    entries: HashMap<String, String>,
}

impl ContentIdMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        content_id: impl Into<String>,
        location: impl Into<String>,
    ) -> ODataResult<()> {
        let content_id = content_id.into();
        if self.entries.contains_key(&content_id) {
            return Err(ODataError::DuplicateContentId(content_id));
        }
        self.entries.insert(content_id, location.into());
        Ok(())
    }

    pub fn get(&self, content_id: &str) -> Option<&str> {
        self.entries.get(content_id).map(String::as_str)
    }

    pub fn contains(&self, content_id: &str) -> bool {
        self.entries.contains_key(content_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn is_id_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'
}

/// Replaces every `$<id>` whose id is registered with its location.
///
/// The id is the whole run of `[A-Za-z0-9_-]` after the `$`, so with only `1`
/// registered `$10` stays as written. Unknown ids and system segments such as
/// `$filter` are left untouched.
pub fn resolve_content_id(text: &str, mapping: &ContentIdMapping) -> String {
    if mapping.is_empty() || !text.contains('$') {
        return text.to_string();
    }

    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(position) = rest.find('$') {
        output.push_str(&rest[..position]);
        let after = &rest[position + 1..];
        let end = after.find(|c: char| !is_id_char(c)).unwrap_or(after.len());
        let id = &after[..end];
        match mapping.get(id) {
            Some(location) if !RESERVED_SYSTEM_SEGMENTS.contains(&id) => {
                output.push_str(location)
            }
            _ => {
                output.push('$');
                output.push_str(id);
            }
        }
        rest = &after[end..];
    }
    output.push_str(rest);
    output
}

/// Leading `$<id>` of `text` when it is a content-ID reference rather than a system segment.
pub fn leading_reference(text: &str) -> Option<&str> {
    let after = text.strip_prefix('$')?;
    let end = after.find(|c: char| !is_id_char(c)).unwrap_or(after.len());
    let id = &after[..end];
    if id.is_empty() || RESERVED_SYSTEM_SEGMENTS.contains(&id) {
        return None;
    }
    Some(id)
}

/// Resolves a request URI or reference link against the content-ID mapping.
///
/// Absolute references below `base` are made relative first so that
/// `http://host/service/$1/Orders` resolves like `$1/Orders`. A reference that still
/// starts with an unknown `$<id>` fails with [`ODataError::ReferenceNotFound`].
pub fn resolve_reference(
    reference: &str,
    mapping: &ContentIdMapping,
    base: &Url,
) -> ODataResult<Url> {
    let relative = match Url::parse(reference) {
        Ok(absolute) => match relative_path(&absolute, base) {
            Some(path) => match absolute.query() {
                Some(query) => format!("{}?{}", path, query),
                None => path.to_string(),
            },
            None => return Ok(absolute),
        },
        Err(_) => reference.to_string(),
    };

    let resolved = resolve_content_id(&relative, mapping);
    if let Some(id) = leading_reference(&resolved) {
        return Err(ODataError::ReferenceNotFound(id.to_string()));
    }

    match Url::parse(&resolved) {
        Ok(absolute) => Ok(absolute),
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(base.join(&resolved)?),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("http://localhost/odata/").unwrap()
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut mapping = ContentIdMapping::new();
        mapping.register("1", "Customers('ALFKI')").unwrap();
        assert_eq!(
            mapping.register("1", "Customers('BONAP')"),
            Err(ODataError::DuplicateContentId("1".to_string()))
        );
        assert_eq!(mapping.get("1"), Some("Customers('ALFKI')"));
    }

    #[test]
    fn test_longest_id_wins() {
        let mut mapping = ContentIdMapping::new();
        mapping.register("1", "http://h/A(1)").unwrap();
        mapping.register("10", "http://h/A(10)").unwrap();
        assert_eq!(resolve_content_id("$10/Name", &mapping), "http://h/A(10)/Name");
        assert_eq!(resolve_content_id("$1/Name", &mapping), "http://h/A(1)/Name");
    }

    #[test]
    fn test_unknown_and_system_tokens_are_left_alone() {
        let mut mapping = ContentIdMapping::new();
        mapping.register("1", "http://h/A(1)").unwrap();
        assert_eq!(resolve_content_id("$count", &mapping), "$count");
        assert_eq!(resolve_content_id("A/$2", &mapping), "A/$2");
        assert_eq!(resolve_content_id("Customers", &mapping), "Customers");
    }

    #[test]
    fn test_id_is_the_whole_token() {
        let mut mapping = ContentIdMapping::new();
        mapping.register("9", "Customers('NINE')").unwrap();
        assert_eq!(resolve_content_id("$99/Orders", &mapping), "$99/Orders");
        assert_eq!(resolve_content_id("$9/Orders", &mapping), "Customers('NINE')/Orders");
        assert_eq!(
            resolve_reference("$99", &mapping, &base()),
            Err(ODataError::ReferenceNotFound("99".to_string()))
        );
    }

    #[test]
    fn test_query_options_survive_short_ids() {
        let mut mapping = ContentIdMapping::new();
        mapping.register("f", "Customers('F')").unwrap();
        mapping.register("1", "Customers('ONE')").unwrap();
        assert_eq!(
            resolve_content_id("Customers?$filter=x&$top=1", &mapping),
            "Customers?$filter=x&$top=1"
        );
        let url = resolve_reference("$1/Orders?$filter=x", &mapping, &base()).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost/odata/Customers('ONE')/Orders?$filter=x"
        );
    }

    #[test]
    fn test_registered_system_name_is_not_substituted() {
        let mut mapping = ContentIdMapping::new();
        mapping.register("count", "Customers('C')").unwrap();
        assert_eq!(resolve_content_id("Orders/$count", &mapping), "Orders/$count");
    }

    #[test]
    fn test_leading_reference() {
        assert_eq!(leading_reference("$1/Orders"), Some("1"));
        assert_eq!(leading_reference("$new-order"), Some("new-order"));
        assert_eq!(leading_reference("$metadata"), None);
        assert_eq!(leading_reference("$batch"), None);
        assert_eq!(leading_reference("Customers"), None);
        assert_eq!(leading_reference("$"), None);
    }

    #[test]
    fn test_resolve_relative_location_against_base() {
        let mut mapping = ContentIdMapping::new();
        mapping.register("1", "Customers('ALFKI')").unwrap();
        let url = resolve_reference("$1", &mapping, &base()).unwrap();
        assert_eq!(url.as_str(), "http://localhost/odata/Customers('ALFKI')");
    }

    #[test]
    fn test_resolve_absolute_reference_below_base() {
        let mut mapping = ContentIdMapping::new();
        mapping
            .register("1", "http://localhost/odata/Customers('ALFKI')")
            .unwrap();
        let url = resolve_reference("http://localhost/odata/$1/Orders?$top=1", &mapping, &base())
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost/odata/Customers('ALFKI')/Orders?$top=1"
        );
    }

    #[test]
    fn test_unresolved_reference_fails() {
        let mapping = ContentIdMapping::new();
        assert_eq!(
            resolve_reference("$99/Orders", &mapping, &base()),
            Err(ODataError::ReferenceNotFound("99".to_string()))
        );
        // System segments are not references
        let url = resolve_reference("$metadata", &mapping, &base()).unwrap();
        assert_eq!(url.as_str(), "http://localhost/odata/$metadata");
    }

    #[test]
    fn test_foreign_absolute_reference_is_kept() {
        let mapping = ContentIdMapping::new();
        let url = resolve_reference("http://elsewhere/x", &mapping, &base()).unwrap();
        assert_eq!(url.as_str(), "http://elsewhere/x");
    }
}
