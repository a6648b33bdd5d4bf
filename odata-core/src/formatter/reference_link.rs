use serde_json::Value;
use url::Url;

use crate::content_id::{resolve_reference, ContentIdMapping};
use crate::errors::ODataError;
use crate::ODataResult;

use super::{Deserializer, DeserializerContext, PayloadKind};

pub const ODATA_ID_ANNOTATION: &str = "@odata.id";

/// Reads `{"@odata.id": "..."}` bodies, as sent to `.../Nav/$ref`.
///
/// Inside a batch the id may be a `$<content-id>` of an earlier operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityReferenceLinkDeserializer;

impl Deserializer for EntityReferenceLinkDeserializer {
    /// `None` for an empty body.
    type Output = Option<Url>;

    fn payload_kind(&self) -> PayloadKind {
        PayloadKind::EntityReferenceLink
    }

    fn read(&self, body: &[u8], ctx: &DeserializerContext<'_>) -> ODataResult<Option<Url>> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let payload: Value = serde_json::from_slice(body)?;
        let id = payload
            .get(ODATA_ID_ANNOTATION)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ODataError::Serialization(format!(
                    "Entity reference link must contain a string '{}'",
                    ODATA_ID_ANNOTATION
                ))
            })?;

        let empty = ContentIdMapping::new();
        let mapping = ctx.content_ids.unwrap_or(&empty);
        resolve_reference(id, mapping, ctx.base).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("http://localhost/odata/").unwrap()
    }

    #[test]
    fn test_empty_body_reads_none() {
        let base = base();
        let ctx = DeserializerContext::new(&base);
        assert_eq!(EntityReferenceLinkDeserializer.read(b"", &ctx).unwrap(), None);
        assert_eq!(EntityReferenceLinkDeserializer.read(b"  \n", &ctx).unwrap(), None);
    }

    #[test]
    fn test_relative_id_joined_to_base() {
        let base = base();
        let ctx = DeserializerContext::new(&base);
        let url = EntityReferenceLinkDeserializer
            .read(br#"{"@odata.id": "Orders(10)"}"#, &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(url.as_str(), "http://localhost/odata/Orders(10)");
    }

    #[test]
    fn test_content_id_reference_resolved() {
        let base = base();
        let mut mapping = ContentIdMapping::new();
        mapping
            .register("order", "http://localhost/odata/Orders(11)")
            .unwrap();
        let ctx = DeserializerContext::new(&base).with_content_ids(&mapping);
        let url = EntityReferenceLinkDeserializer
            .read(br#"{"@odata.id": "$order"}"#, &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(url.as_str(), "http://localhost/odata/Orders(11)");

        assert_eq!(
            EntityReferenceLinkDeserializer.read(br#"{"@odata.id": "$nope"}"#, &ctx),
            Err(ODataError::ReferenceNotFound("nope".to_string()))
        );
    }

    #[test]
    fn test_missing_id_is_an_error() {
        let base = base();
        let ctx = DeserializerContext::new(&base);
        assert!(matches!(
            EntityReferenceLinkDeserializer.read(br#"{"id": "x"}"#, &ctx),
            Err(ODataError::Serialization(_))
        ));
    }
}
