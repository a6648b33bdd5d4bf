//! Routing data service: the pipeline every request, batched or not, is dispatched through.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use odata_core::{
    resolve_reference, skip_token, CollectionPage, ContentIdMapping, Deserializer, EdmEntityType,
    EdmModel, EdmOperation, EntityReferenceLinkDeserializer, ODataError, ODataResult, ODataSegment,
    ResourceDeserializer, RouteTable, RouteTableBuilder, RouteValues, TruncatedCollection,
    UriParser, ODATA_ID_ANNOTATION,
};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::batch::model::{OperationRequest, OperationResponse};
use crate::errors::DispatchError;
use crate::pipeline::{RequestContext, RequestPipeline};
use crate::store::{canonical_key, key_from_entity, key_from_segment, Entity, EntityAddress, EntityStore};

/// What a matched route is served by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    ServiceDocument,
    Metadata,
    EntitySet(String),
    EntitySetCount(String),
    Entity(String),
    EntityProperty(String),
    EntityPropertyValue(String),
    Singleton(String),
    SingletonProperty(String),
    /// `source` is an entity set (addressed by key) or a singleton.
    Navigation { source: String, property: String },
    NavigationRef { source: String, property: String },
    Operation(String),
}

pub struct ODataService {
    model: Arc<EdmModel>,
    routes: RouteTable<Endpoint>,
    store: EntityStore,
    page_size: usize,
}

/// Everything an endpoint handler gets to see about one request.
struct Call<'r> {
    request: &'r OperationRequest,
    ctx: RequestContext<'r>,
    url: &'r Url,
    segments: &'r [ODataSegment],
    values: &'r RouteValues,
}

impl Call<'_> {
    fn root(&self) -> &Url {
        self.ctx.service_root
    }

    fn context(&self, fragment: &str) -> String {
        format!("{}$metadata#{}", self.root(), fragment)
    }

    fn location(&self, address: &EntityAddress) -> String {
        format!(
            "{}/{}",
            self.root().as_str().trim_end_matches('/'),
            address.path()
        )
    }

    fn read_entity(&self) -> ODataResult<Entity> {
        ResourceDeserializer.read(&self.request.body, &self.ctx.deserializer_context())
    }
}

impl ODataService {
    pub fn new(model: Arc<EdmModel>, page_size: usize) -> ODataResult<Self> {
        if page_size == 0 {
            return Err(ODataError::ArgumentOutOfRange {
                name: "pageSize".to_string(),
                min: 1,
                actual: page_size,
            });
        }

        let routes = build_routes(&model)?;
        info!(routes = routes.len(), "Route table built");

        let store = EntityStore::new();
        for singleton in model.singletons() {
            store.upsert(&EntityAddress::singleton(&singleton.name), Entity::new());
        }

        Ok(Self {
            model,
            routes,
            store,
            page_size,
        })
    }

    pub fn model(&self) -> &Arc<EdmModel> {
        &self.model
    }

    pub fn routes(&self) -> &RouteTable<Endpoint> {
        &self.routes
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    fn handle(&self, endpoint: &Endpoint, call: &Call<'_>) -> ODataResult<OperationResponse> {
        let method = &call.request.method;
        match endpoint {
            Endpoint::ServiceDocument if *method == Method::GET => Ok(self.service_document(call)),
            Endpoint::Metadata if *method == Method::GET => Ok(OperationResponse::json(
                StatusCode::OK,
                &serde_json::to_value(self.model.definition())?,
            )),
            Endpoint::EntitySet(set) => match *method {
                Method::GET => self.list_entities(set, call),
                Method::POST => self.create_entity(set, call, None),
                _ => Ok(method_not_allowed(method)),
            },
            Endpoint::EntitySetCount(set) if *method == Method::GET => Ok(OperationResponse::text(
                StatusCode::OK,
                self.store.count(set).to_string(),
            )),
            Endpoint::Entity(set) => {
                let address = self.entity_address(set, call.values)?;
                self.entity(&address, set, call)
            }
            Endpoint::Singleton(name) => {
                let address = EntityAddress::singleton(name);
                match *method {
                    Method::DELETE | Method::POST => Ok(method_not_allowed(method)),
                    _ => self.entity(&address, name, call),
                }
            }
            Endpoint::EntityProperty(source) | Endpoint::SingletonProperty(source) => {
                let (address, entity_type) = self.source_address(source, call.values)?;
                self.property(&address, &entity_type, call, false)
            }
            Endpoint::EntityPropertyValue(set) => {
                let (address, entity_type) = self.source_address(set, call.values)?;
                self.property(&address, &entity_type, call, true)
            }
            Endpoint::Navigation { source, property } => {
                let (address, _) = self.source_address(source, call.values)?;
                self.navigation(&address, property, call)
            }
            Endpoint::NavigationRef { source, property } => {
                let (address, _) = self.source_address(source, call.values)?;
                self.navigation_ref(&address, property, call)
            }
            Endpoint::Operation(name) => {
                debug!(operation = %name, "Operation routed without an implementation");
                Ok(OperationResponse::error(
                    StatusCode::NOT_IMPLEMENTED,
                    "NotImplemented",
                    &format!("Operation '{}' is not implemented by this service", name),
                ))
            }
            _ => Ok(method_not_allowed(method)),
        }
    }

    fn service_document(&self, call: &Call<'_>) -> OperationResponse {
        let mut value: Vec<Value> = self
            .model
            .entity_sets()
            .iter()
            .map(|set| json!({"name": set.name, "kind": "EntitySet", "url": set.name}))
            .collect();
        value.extend(
            self.model
                .singletons()
                .iter()
                .map(|s| json!({"name": s.name, "kind": "Singleton", "url": s.name})),
        );
        value.extend(
            self.model
                .operation_imports()
                .iter()
                .filter(|import| !import.is_action_import())
                .map(|import| json!({"name": import.name, "kind": "FunctionImport", "url": import.name})),
        );
        OperationResponse::json(
            StatusCode::OK,
            &json!({"@odata.context": format!("{}$metadata", call.root()), "value": value}),
        )
    }

    // === Entity sets and entities ===

    fn page(&self, context: String, items: Vec<Value>, call: &Call<'_>) -> ODataResult<OperationResponse> {
        let skip = skip_token(call.url)?;
        let collection = TruncatedCollection::new(items.into_iter().skip(skip), self.page_size)?;
        let page = CollectionPage::new(context, collection, call.url, skip);
        Ok(OperationResponse::json(StatusCode::OK, &page.to_json()))
    }

    fn list_entities(&self, set: &str, call: &Call<'_>) -> ODataResult<OperationResponse> {
        let items = self
            .store
            .list(set)
            .into_iter()
            .map(|(_, entity)| Value::Object(entity))
            .collect();
        self.page(call.context(set), items, call)
    }

    /// Creates an entity in `set`; with `link` the new entity is also linked from
    /// `link.0` through navigation `link.1`.
    fn create_entity(
        &self,
        set: &str,
        call: &Call<'_>,
        link: Option<(&EntityAddress, &str)>,
    ) -> ODataResult<OperationResponse> {
        let entity_set = self
            .model
            .find_entity_set(set)
            .ok_or_else(|| ODataError::UnresolvedSegment(set.to_string()))?;
        let entity = call.read_entity()?;
        let key = key_from_entity(&entity_set.entity_type, &entity).ok_or_else(|| {
            ODataError::InvalidKey(format!(
                "Body does not supply every key property of '{}'",
                entity_set.entity_type.full_name()
            ))
        })?;

        let address = EntityAddress::new(set, key);
        if !self.store.insert(&address, entity.clone()) {
            return Ok(OperationResponse::error(
                StatusCode::CONFLICT,
                "EntityExists",
                &format!("'{}' already exists", address.path()),
            ));
        }
        if let Some((source, navigation)) = link {
            self.store.add_link(source, navigation, address.clone(), true);
        }
        debug!(entity = %address.path(), "Entity created");

        let body = with_context(call.context(&format!("{}/$entity", set)), entity);
        Ok(OperationResponse::json(StatusCode::CREATED, &body).with_location(&call.location(&address)))
    }

    fn entity(&self, address: &EntityAddress, collection: &str, call: &Call<'_>) -> ODataResult<OperationResponse> {
        let method = &call.request.method;
        match *method {
            Method::GET => Ok(match self.store.get(address) {
                Some(entity) => OperationResponse::json(
                    StatusCode::OK,
                    &with_context(call.context(&format!("{}/$entity", collection)), entity),
                ),
                None => not_found(address),
            }),
            Method::PATCH => {
                let changes = call.read_entity()?;
                Ok(if self.store.merge(address, changes) {
                    OperationResponse::new(StatusCode::NO_CONTENT)
                } else {
                    not_found(address)
                })
            }
            Method::PUT => {
                let Some(existing) = self.store.get(address) else {
                    return Ok(not_found(address));
                };
                let mut replacement = call.read_entity()?;
                // Key properties cannot change through a replace.
                if let Some(set) = self.model.find_entity_set(collection) {
                    for property in &set.entity_type.key {
                        if let Some(value) = existing.get(property) {
                            replacement.insert(property.clone(), value.clone());
                        }
                    }
                }
                self.store.upsert(address, replacement);
                Ok(OperationResponse::new(StatusCode::NO_CONTENT))
            }
            Method::DELETE => Ok(if self.store.remove(address) {
                OperationResponse::new(StatusCode::NO_CONTENT)
            } else {
                not_found(address)
            }),
            _ => Ok(method_not_allowed(method)),
        }
    }

    // === Properties ===

    fn property(
        &self,
        address: &EntityAddress,
        entity_type: &EdmEntityType,
        call: &Call<'_>,
        raw_value: bool,
    ) -> ODataResult<OperationResponse> {
        let name = call
            .values
            .get("property")
            .ok_or_else(|| ODataError::ArgumentNull("property".to_string()))?;
        if entity_type.find_property(name).is_none() && !entity_type.open {
            return Err(ODataError::UnresolvedSegment(name.to_string()));
        }
        let Some(entity) = self.store.get(address) else {
            return Ok(not_found(address));
        };

        let method = &call.request.method;
        match *method {
            Method::GET => {
                let value = entity.get(name).cloned().unwrap_or(Value::Null);
                if value.is_null() {
                    return Ok(OperationResponse::new(StatusCode::NO_CONTENT));
                }
                if raw_value {
                    let text = match value {
                        Value::String(text) => text,
                        other => other.to_string(),
                    };
                    return Ok(OperationResponse::text(StatusCode::OK, text));
                }
                let context = call.context(&format!("{}/{}", address.path(), name));
                Ok(OperationResponse::json(
                    StatusCode::OK,
                    &json!({"@odata.context": context, "value": value}),
                ))
            }
            Method::PUT | Method::PATCH if !raw_value => {
                let body: Value = serde_json::from_slice(&call.request.body)?;
                let value = body.get("value").cloned().ok_or_else(|| {
                    ODataError::Serialization("Property body must contain 'value'".to_string())
                })?;
                let mut changes = Map::new();
                changes.insert(name.to_string(), value);
                self.store.merge(address, changes);
                Ok(OperationResponse::new(StatusCode::NO_CONTENT))
            }
            Method::DELETE if !raw_value => {
                let mut changes = Map::new();
                changes.insert(name.to_string(), Value::Null);
                self.store.merge(address, changes);
                Ok(OperationResponse::new(StatusCode::NO_CONTENT))
            }
            _ => Ok(method_not_allowed(method)),
        }
    }

    // === Navigation ===

    fn navigation_target(&self, call: &Call<'_>) -> ODataResult<(String, bool)> {
        match call.segments.last() {
            Some(ODataSegment::Navigation(nav)) | Some(ODataSegment::NavigationLink(nav)) => {
                let target = nav.target.as_ref().ok_or_else(|| {
                    ODataError::NotSupported(format!(
                        "Navigation property '{}' has no target entity set",
                        nav.property.name
                    ))
                })?;
                Ok((target.name.clone(), nav.property.collection))
            }
            _ => Err(ODataError::InvalidPath(
                "Navigation route matched without a navigation segment".to_string(),
            )),
        }
    }

    fn navigation(&self, source: &EntityAddress, property: &str, call: &Call<'_>) -> ODataResult<OperationResponse> {
        if !self.store.contains(source) {
            return Ok(not_found(source));
        }
        let (target_set, collection) = self.navigation_target(call)?;
        let method = &call.request.method;

        match *method {
            Method::GET if collection => {
                let items = self
                    .store
                    .links(source, property)
                    .iter()
                    .filter_map(|target| self.store.get(target))
                    .map(Value::Object)
                    .collect();
                self.page(call.context(&target_set), items, call)
            }
            Method::GET => Ok(
                match self
                    .store
                    .links(source, property)
                    .first()
                    .and_then(|target| self.store.get(target))
                {
                    Some(entity) => OperationResponse::json(
                        StatusCode::OK,
                        &with_context(call.context(&format!("{}/$entity", target_set)), entity),
                    ),
                    None => OperationResponse::new(StatusCode::NO_CONTENT),
                },
            ),
            Method::POST if collection => {
                self.create_entity(&target_set, call, Some((source, property)))
            }
            _ => Ok(method_not_allowed(method)),
        }
    }

    fn navigation_ref(&self, source: &EntityAddress, property: &str, call: &Call<'_>) -> ODataResult<OperationResponse> {
        if !self.store.contains(source) {
            return Ok(not_found(source));
        }
        let (target_set, collection) = self.navigation_target(call)?;
        let method = &call.request.method;

        match *method {
            Method::GET => {
                let ids: Vec<Value> = self
                    .store
                    .links(source, property)
                    .iter()
                    .map(|target| json!({ ODATA_ID_ANNOTATION: call.location(target) }))
                    .collect();
                if collection {
                    return Ok(OperationResponse::json(
                        StatusCode::OK,
                        &json!({"@odata.context": call.context("Collection($ref)"), "value": ids}),
                    ));
                }
                Ok(match ids.into_iter().next() {
                    Some(Value::Object(mut reference)) => {
                        reference.insert("@odata.context".to_string(), json!(call.context("$ref")));
                        OperationResponse::json(StatusCode::OK, &Value::Object(reference))
                    }
                    _ => OperationResponse::new(StatusCode::NO_CONTENT),
                })
            }
            Method::POST | Method::PUT if (*method == Method::POST) == collection => {
                let target_url = EntityReferenceLinkDeserializer
                    .read(&call.request.body, &call.ctx.deserializer_context())?
                    .ok_or_else(|| ODataError::ArgumentNull(ODATA_ID_ANNOTATION.to_string()))?;
                let target = self.address_of(&target_url, call.root())?;
                if target.collection != target_set {
                    return Err(ODataError::InvalidUri(format!(
                        "'{}' is not an entity of '{}'",
                        target_url, target_set
                    )));
                }
                if !self.store.contains(&target) {
                    return Ok(not_found(&target));
                }
                self.store.add_link(source, property, target, collection);
                Ok(OperationResponse::new(StatusCode::NO_CONTENT))
            }
            Method::DELETE => {
                let target = if collection {
                    let id = call
                        .url
                        .query_pairs()
                        .find(|(name, _)| *name == "$id")
                        .map(|(_, value)| value.into_owned())
                        .ok_or_else(|| ODataError::ArgumentNull("$id".to_string()))?;
                    let empty = ContentIdMapping::new();
                    let mapping = call.ctx.content_ids.unwrap_or(&empty);
                    let url = resolve_reference(&id, mapping, call.root())?;
                    Some(self.address_of(&url, call.root())?)
                } else {
                    None
                };
                Ok(if self.store.remove_link(source, property, target.as_ref()) {
                    OperationResponse::new(StatusCode::NO_CONTENT)
                } else {
                    OperationResponse::error(StatusCode::NOT_FOUND, "LinkNotFound", "No such link")
                })
            }
            _ => Ok(method_not_allowed(method)),
        }
    }

    // === Addressing ===

    fn entity_address(&self, set: &str, values: &RouteValues) -> ODataResult<EntityAddress> {
        let entity_set = self
            .model
            .find_entity_set(set)
            .ok_or_else(|| ODataError::UnresolvedSegment(set.to_string()))?;
        let single = entity_set.entity_type.key.len() == 1;
        let key = canonical_key(&entity_set.entity_type, |property| {
            if single {
                values.get("key")
            } else {
                values.get(property)
            }
        })
        .ok_or_else(|| ODataError::InvalidKey(format!("Incomplete key for '{}'", set)))?;
        Ok(EntityAddress::new(set, key))
    }

    /// Address and type of an entity set member or singleton named `source`.
    fn source_address(
        &self,
        source: &str,
        values: &RouteValues,
    ) -> ODataResult<(EntityAddress, Arc<EdmEntityType>)> {
        if let Some(singleton) = self.model.find_singleton(source) {
            return Ok((
                EntityAddress::singleton(source),
                singleton.entity_type.clone(),
            ));
        }
        let entity_set = self
            .model
            .find_entity_set(source)
            .ok_or_else(|| ODataError::UnresolvedSegment(source.to_string()))?;
        Ok((self.entity_address(source, values)?, entity_set.entity_type.clone()))
    }

    /// Entity addressed by an absolute URL such as `http://host/odata/Orders(1)`.
    fn address_of(&self, url: &Url, root: &Url) -> ODataResult<EntityAddress> {
        let segments = UriParser::new(&self.model).parse_uri(url, root)?;
        match segments.as_slice() {
            [ODataSegment::EntitySet(set), ODataSegment::Key(key)] => {
                let key = key_from_segment(key)
                    .ok_or_else(|| ODataError::InvalidKey(format!("Incomplete key in '{}'", url)))?;
                Ok(EntityAddress::new(&set.name, key))
            }
            [ODataSegment::Singleton(singleton)] => Ok(EntityAddress::singleton(&singleton.name)),
            _ => Err(ODataError::InvalidUri(format!(
                "'{}' does not identify a single entity",
                url
            ))),
        }
    }
}

#[async_trait]
impl RequestPipeline for ODataService {
    async fn dispatch(
        &self,
        request: &OperationRequest,
        ctx: &RequestContext<'_>,
    ) -> Result<OperationResponse, DispatchError> {
        let url = match Url::parse(&request.uri).or_else(|_| ctx.service_root.join(&request.uri)) {
            Ok(url) => url,
            Err(e) => {
                return Ok(OperationResponse::from_odata_error(
                    StatusCode::BAD_REQUEST,
                    &ODataError::from(e),
                ))
            }
        };

        let segments = match UriParser::new(&self.model).parse_uri(&url, ctx.service_root) {
            Ok(segments) => segments,
            Err(e) => {
                debug!(uri = %url, "Request path not understood: {}", e);
                return Ok(OperationResponse::from_odata_error(StatusCode::NOT_FOUND, &e));
            }
        };

        let Some(route) = self.routes.find(&segments) else {
            return Ok(OperationResponse::error(
                StatusCode::NOT_FOUND,
                "NoRoute",
                &format!("No route serves '{}'", url.path()),
            ));
        };

        let call = Call {
            request,
            ctx: *ctx,
            url: &url,
            segments: &segments,
            values: &route.values,
        };
        match self.handle(route.endpoint, &call) {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(method = %request.method, uri = %url, "Request failed: {}", e);
                Ok(OperationResponse::from_odata_error(status_of(&e), &e))
            }
        }
    }
}

fn status_of(err: &ODataError) -> StatusCode {
    match err {
        ODataError::ReferenceNotFound(_) | ODataError::UnresolvedSegment(_) => StatusCode::NOT_FOUND,
        ODataError::NotSupported(_) => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn with_context(context: String, mut entity: Entity) -> Value {
    entity.insert("@odata.context".to_string(), json!(context));
    Value::Object(entity)
}

fn not_found(address: &EntityAddress) -> OperationResponse {
    OperationResponse::error(
        StatusCode::NOT_FOUND,
        "EntityNotFound",
        &format!("'{}' does not exist", address.path()),
    )
}

fn method_not_allowed(method: &Method) -> OperationResponse {
    OperationResponse::error(
        StatusCode::METHOD_NOT_ALLOWED,
        "MethodNotAllowed",
        &format!("{} is not supported on this resource", method),
    )
}

// === Route table ===

/// `({key})` for single keys, `(K1={K1},K2={K2})` for composite keys.
fn key_template(entity_type: &EdmEntityType) -> String {
    match entity_type.key.as_slice() {
        [_] => "({key})".to_string(),
        properties => {
            let entries: Vec<String> = properties.iter().map(|p| format!("{}={{{}}}", p, p)).collect();
            format!("({})", entries.join(","))
        }
    }
}

fn operation_call(name: &str, operation: &EdmOperation) -> String {
    if operation.is_action() {
        return name.to_string();
    }
    let parameters: Vec<String> = operation
        .parameters
        .iter()
        .map(|p| format!("{}={{{}}}", p.name, p.name))
        .collect();
    format!("{}({})", name, parameters.join(","))
}

fn build_routes(model: &EdmModel) -> ODataResult<RouteTable<Endpoint>> {
    let mut builder = RouteTableBuilder::new();
    builder.register_path(model, "", Endpoint::ServiceDocument)?;
    builder.register_path(model, "$metadata", Endpoint::Metadata)?;

    for set in model.entity_sets() {
        let name = &set.name;
        let entity = format!("{}{}", name, key_template(&set.entity_type));
        builder.register_path(model, name, Endpoint::EntitySet(name.clone()))?;
        builder.register_path(model, &format!("{}/$count", name), Endpoint::EntitySetCount(name.clone()))?;
        builder.register_path(model, &entity, Endpoint::Entity(name.clone()))?;
        builder.register_path(model, &format!("{}/{{property}}", entity), Endpoint::EntityProperty(name.clone()))?;
        builder.register_path(
            model,
            &format!("{}/{{property}}/$value", entity),
            Endpoint::EntityPropertyValue(name.clone()),
        )?;
        register_navigations(&mut builder, model, name, &entity, &set.entity_type)?;
    }

    for singleton in model.singletons() {
        let name = &singleton.name;
        builder.register_path(model, name, Endpoint::Singleton(name.clone()))?;
        builder.register_path(model, &format!("{}/{{property}}", name), Endpoint::SingletonProperty(name.clone()))?;
        register_navigations(&mut builder, model, name, name, &singleton.entity_type)?;
    }

    // Overloads share one route: the first declaration decides its shape.
    let mut seen = HashSet::new();
    for import in model.operation_imports() {
        let path = operation_call(&import.name, &import.operation);
        if seen.insert(import.name.clone()) {
            builder.register_path(model, &path, Endpoint::Operation(import.name.clone()))?;
        }
    }
    for operation in model.operations() {
        let Some(binding) = &operation.binding else {
            continue;
        };
        for set in model.entity_sets() {
            if !set.entity_type.is_assignable_to(&binding.type_name) {
                continue;
            }
            let prefix = if binding.collection {
                set.name.clone()
            } else {
                format!("{}{}", set.name, key_template(&set.entity_type))
            };
            if !seen.insert(format!("{}/{}", prefix, operation.full_name())) {
                continue;
            }
            let path = format!("{}/{}", prefix, operation_call(&operation.full_name(), operation));
            builder.register_path(model, &path, Endpoint::Operation(operation.full_name()))?;
        }
    }

    Ok(builder.build())
}

fn register_navigations(
    builder: &mut RouteTableBuilder<Endpoint>,
    model: &EdmModel,
    source: &str,
    prefix: &str,
    entity_type: &EdmEntityType,
) -> ODataResult<()> {
    for navigation in &entity_type.navigation_properties {
        builder.register_path(
            model,
            &format!("{}/{}", prefix, navigation.name),
            Endpoint::Navigation {
                source: source.to_string(),
                property: navigation.name.clone(),
            },
        )?;
        builder.register_path(
            model,
            &format!("{}/{}/$ref", prefix, navigation.name),
            Endpoint::NavigationRef {
                source: source.to_string(),
                property: navigation.name.clone(),
            },
        )?;
    }
    Ok(())
}
