use serde_json::{json, Map, Value};
use url::Url;

use crate::errors::ODataError;
use crate::ODataResult;

pub const SKIP_TOKEN: &str = "$skiptoken";

/// At most `page_size` items taken from a larger source, remembering whether
/// anything was left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct TruncatedCollection<T> {
    items: Vec<T>,
    page_size: usize,
    truncated: bool,
}

impl<T> TruncatedCollection<T> {
    pub fn new<I>(source: I, page_size: usize) -> ODataResult<Self>
    where
        I: IntoIterator<Item = T>,
    {
        if page_size < 1 {
            return Err(ODataError::ArgumentOutOfRange {
                name: "pageSize".to_string(),
                min: 1,
                actual: page_size,
            });
        }

        // One extra item tells us whether the source was longer than a page
        let mut items: Vec<T> = source
            .into_iter()
            .take(page_size.saturating_add(1))
            .collect();
        let truncated = items.len() > page_size;
        items.truncate(page_size);

        Ok(Self {
            items,
            page_size,
            truncated,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

impl<T> IntoIterator for TruncatedCollection<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// Reads the `$skiptoken` of a request URL emitted by [`next_page_link`].
pub fn skip_token(request: &Url) -> ODataResult<usize> {
    match request.query_pairs().find(|(name, _)| *name == SKIP_TOKEN) {
        Some((_, value)) => value
            .parse()
            .map_err(|_| ODataError::InvalidUri(format!("Invalid {} '{}'", SKIP_TOKEN, value))),
        None => Ok(0),
    }
}

/// `request` with its `$skiptoken` replaced by `skip`.
pub fn next_page_link(request: &Url, skip: usize) -> Url {
    let prefix = format!("{}=", SKIP_TOKEN);
    let mut pairs: Vec<String> = request
        .query()
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty() && !pair.starts_with(&prefix))
        .map(str::to_string)
        .collect();
    pairs.push(format!("{}{}", prefix, skip));

    let mut next = request.clone();
    next.set_query(Some(&pairs.join("&")));
    next
}

/// One page of a collection response.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionPage {
    pub context: String,
    pub value: Vec<Value>,
    pub next_link: Option<Url>,
}

impl CollectionPage {
    /// Builds the page for `collection`, which was read starting at `skip`.
    pub fn new(
        context: impl Into<String>,
        collection: TruncatedCollection<Value>,
        request: &Url,
        skip: usize,
    ) -> Self {
        let next_link = collection
            .is_truncated()
            .then(|| next_page_link(request, skip + collection.page_size()));
        Self {
            context: context.into(),
            value: collection.into_items(),
            next_link,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut body = Map::new();
        body.insert("@odata.context".to_string(), json!(self.context));
        body.insert("value".to_string(), Value::Array(self.value.clone()));
        if let Some(next) = &self.next_link {
            body.insert("@odata.nextLink".to_string(), json!(next.as_str()));
        }
        Value::Object(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_must_be_positive() {
        let err = TruncatedCollection::new(vec![1, 2, 3], 0).unwrap_err();
        assert_eq!(
            err,
            ODataError::ArgumentOutOfRange {
                name: "pageSize".to_string(),
                min: 1,
                actual: 0
            }
        );
    }

    #[test]
    fn test_truncation() {
        let page = TruncatedCollection::new(1..=5, 2).unwrap();
        assert!(page.is_truncated());
        assert_eq!(page.items(), &[1, 2]);
        assert_eq!(page.page_size(), 2);

        let exact = TruncatedCollection::new(1..=2, 2).unwrap();
        assert!(!exact.is_truncated());
        assert_eq!(exact.len(), 2);

        let short = TruncatedCollection::new(Vec::<i32>::new(), 10).unwrap();
        assert!(short.is_empty());
        assert!(!short.is_truncated());
    }

    #[test]
    fn test_unbounded_page_size_keeps_everything() {
        let page = TruncatedCollection::new(1..=3, usize::MAX).unwrap();
        assert_eq!(page.items(), &[1, 2, 3]);
        assert!(!page.is_truncated());
    }

    #[test]
    fn test_next_link_replaces_skip_token() {
        let request = Url::parse("http://localhost/odata/Customers?$skiptoken=2&x=1").unwrap();
        let next = next_page_link(&request, 4);
        assert_eq!(next.as_str(), "http://localhost/odata/Customers?x=1&$skiptoken=4");
        assert_eq!(skip_token(&next).unwrap(), 4);
        assert_eq!(
            skip_token(&Url::parse("http://localhost/odata/Customers").unwrap()).unwrap(),
            0
        );
    }

    #[test]
    fn test_collection_page_json() {
        let request = Url::parse("http://localhost/odata/Customers").unwrap();
        let collection = TruncatedCollection::new((0..3).map(|i| json!({ "n": i })), 2).unwrap();
        let page = CollectionPage::new("$metadata#Customers", collection, &request, 0);
        let body = page.to_json();
        assert_eq!(body["value"].as_array().unwrap().len(), 2);
        assert_eq!(
            body["@odata.nextLink"],
            json!("http://localhost/odata/Customers?$skiptoken=2")
        );
    }
}
