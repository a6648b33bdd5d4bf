use strum::{Display, EnumString};
use url::Url;

use crate::content_id::ContentIdMapping;
use crate::errors::ODataError;
use crate::ODataResult;

/// Kind of payload carried by a request or response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum PayloadKind {
    Resource,
    ResourceSet,
    Property,
    Collection,
    Value,
    BinaryValue,
    EntityReferenceLink,
    EntityReferenceLinks,
    ServiceDocument,
    MetadataDocument,
    Error,
    Parameter,
    Batch,
    Delta,
    Unsupported,
}

/// Request-scoped state a deserializer may need.
#[derive(Debug, Clone, Copy)]
pub struct DeserializerContext<'a> {
    /// Service root relative references are resolved against.
    pub base: &'a Url,
    /// Present while reading an operation inside a batch.
    pub content_ids: Option<&'a ContentIdMapping>,
}

impl<'a> DeserializerContext<'a> {
    pub fn new(base: &'a Url) -> Self {
        Self {
            base,
            content_ids: None,
        }
    }

    pub fn with_content_ids(mut self, content_ids: &'a ContentIdMapping) -> Self {
        self.content_ids = Some(content_ids);
        self
    }
}

/// Reads one kind of payload from a request body.
pub trait Deserializer {
    type Output;

    fn payload_kind(&self) -> PayloadKind;

    /// Fails with [`ODataError::NotSupported`] unless the deserializer overrides it.
    fn read(&self, body: &[u8], ctx: &DeserializerContext<'_>) -> ODataResult<Self::Output>
    where
        Self: Sized,
    {
        let _ = (body, ctx);
        Err(ODataError::NotSupported(format!(
            "'{}' does not support Read.",
            short_type_name::<Self>()
        )))
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct WriteOnly;

    impl Deserializer for WriteOnly {
        type Output = ();

        fn payload_kind(&self) -> PayloadKind {
            PayloadKind::Error
        }
    }

    #[test]
    fn test_default_read_is_not_supported() {
        let base = Url::parse("http://localhost/odata/").unwrap();
        let err = WriteOnly
            .read(b"{}", &DeserializerContext::new(&base))
            .unwrap_err();
        assert_eq!(
            err,
            ODataError::NotSupported("'WriteOnly' does not support Read.".to_string())
        );
    }

    #[test]
    fn test_payload_kind_names() {
        assert_eq!(PayloadKind::EntityReferenceLink.to_string(), "EntityReferenceLink");
        assert_eq!("ResourceSet".parse::<PayloadKind>().unwrap(), PayloadKind::ResourceSet);
    }
}
