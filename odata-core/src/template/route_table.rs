use tracing::debug;

use crate::edm::EdmModel;
use crate::segments::ODataSegment;
use crate::translator::translate_path;
use crate::uri_parser::UriParser;
use crate::ODataResult;

use super::{PathTemplate, RouteValues};

struct RouteEntry<E> {
    template: PathTemplate,
    endpoint: E,
    order: usize,
}

/// Collects templates before they are frozen into a [`RouteTable`].
pub struct RouteTableBuilder<E> {
    entries: Vec<RouteEntry<E>>,
}

impl<E> Default for RouteTableBuilder<E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<E> RouteTableBuilder<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, template: PathTemplate, endpoint: E) {
        let order = self.entries.len();
        self.entries.push(RouteEntry {
            template,
            endpoint,
            order,
        });
    }

    /// Parses `path` in template mode and registers the translated template.
    ///
    /// # Examples
    ///
    /// ```
    /// use odata_core::{EdmModel, RouteTableBuilder, UriParser};
    ///
    /// let model = EdmModel::from_json(r#"{
    ///     "namespace": "NS",
    ///     "entityTypes": [{"name": "Item", "key": ["Id"],
    ///                      "properties": [{"name": "Id", "type": "Edm.Int32"}]}],
    ///     "entitySets": [{"name": "Items", "entityType": "NS.Item"}]
    /// }"#).unwrap();
    ///
    /// let mut builder = RouteTableBuilder::new();
    /// builder.register_path(&model, "Items({id})", "item").unwrap();
    /// let table = builder.build();
    ///
    /// let request = UriParser::new(&model).parse_path("Items(7)").unwrap();
    /// let found = table.find(&request).unwrap();
    /// assert_eq!(*found.endpoint, "item");
    /// assert_eq!(found.values.get("id"), Some("7"));
    /// ```
    pub fn register_path(&mut self, model: &EdmModel, path: &str, endpoint: E) -> ODataResult<()> {
        let segments = UriParser::for_templates(model).parse_path(path)?;
        let template = translate_path(&segments)?;
        self.register(template, endpoint);
        Ok(())
    }

    /// Orders entries by specificity, then by registration order.
    pub fn build(mut self) -> RouteTable<E> {
        self.entries
            .sort_by_cached_key(|entry| (entry.template.specificity(), entry.order));
        RouteTable {
            entries: self.entries,
        }
    }
}

pub struct RouteMatch<'a, E> {
    pub endpoint: &'a E,
    pub template: &'a PathTemplate,
    pub values: RouteValues,
}

/// Immutable set of ranked templates, shared read-only once built.
pub struct RouteTable<E> {
    entries: Vec<RouteEntry<E>>,
}

impl<E> RouteTable<E> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Templates in ranking order.
    pub fn templates(&self) -> impl Iterator<Item = &PathTemplate> {
        self.entries.iter().map(|e| &e.template)
    }

    /// First template in ranking order that matches `segments`.
    pub fn find(&self, segments: &[ODataSegment]) -> Option<RouteMatch<'_, E>> {
        for entry in &self.entries {
            if let Some(values) = entry.template.match_path(segments) {
                debug!(template = %entry.template, values = ?values, "Route matched");
                return Some(RouteMatch {
                    endpoint: &entry.endpoint,
                    template: &entry.template,
                    values,
                });
            }
        }
        debug!(segments = segments.len(), "No route matched");
        None
    }
}
