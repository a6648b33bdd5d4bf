//! Entity data model: entity types, entity sets, singletons and operations.
//!
//! The model is loaded once from a [`ModelDefinition`] (usually JSON) and then only
//! read. Every element is handed out behind an `Arc` so segments and templates can hold
//! on to the elements they are bound to without copying the model.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::errors::ODataError;
use crate::ODataResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdmProperty {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdmNavigationProperty {
    pub name: String,
    /// Qualified name of the target entity type.
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub collection: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdmEntityType {
    pub namespace: String,
    pub name: String,
    pub key: Vec<String>,
    pub properties: Vec<EdmProperty>,
    pub navigation_properties: Vec<EdmNavigationProperty>,
    pub base_type: Option<String>,
    /// Qualified names of every base type, nearest first.
    pub ancestors: Vec<String>,
    pub open: bool,
}

impl EdmEntityType {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    pub fn find_property(&self, name: &str) -> Option<&EdmProperty> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn find_navigation_property(&self, name: &str) -> Option<&EdmNavigationProperty> {
        self.navigation_properties.iter().find(|p| p.name == name)
    }

    /// True when this type is `type_name` or derives from it.
    pub fn is_assignable_to(&self, type_name: &str) -> bool {
        self.full_name() == type_name || self.ancestors.iter().any(|a| a == type_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdmEntitySet {
    pub name: String,
    pub entity_type: Arc<EdmEntityType>,
    /// Navigation property name -> target entity set name.
    pub navigation_bindings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdmSingleton {
    pub name: String,
    pub entity_type: Arc<EdmEntityType>,
    pub navigation_bindings: BTreeMap<String, String>,
}

/// Entity set or singleton a path is currently addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationSource {
    EntitySet(Arc<EdmEntitySet>),
    Singleton(Arc<EdmSingleton>),
}

impl NavigationSource {
    pub fn name(&self) -> &str {
        match self {
            NavigationSource::EntitySet(set) => &set.name,
            NavigationSource::Singleton(singleton) => &singleton.name,
        }
    }

    pub fn entity_type(&self) -> &Arc<EdmEntityType> {
        match self {
            NavigationSource::EntitySet(set) => &set.entity_type,
            NavigationSource::Singleton(singleton) => &singleton.entity_type,
        }
    }

    pub fn navigation_bindings(&self) -> &BTreeMap<String, String> {
        match self {
            NavigationSource::EntitySet(set) => &set.navigation_bindings,
            NavigationSource::Singleton(singleton) => &singleton.navigation_bindings,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OperationKind {
    Action,
    Function,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdmBinding {
    /// Qualified name of the bound entity type.
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub collection: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdmParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdmOperation {
    pub namespace: String,
    pub name: String,
    pub kind: OperationKind,
    pub binding: Option<EdmBinding>,
    /// Parameters after the binding parameter.
    pub parameters: Vec<EdmParameter>,
    pub return_type: Option<String>,
}

impl EdmOperation {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    pub fn is_action(&self) -> bool {
        self.kind == OperationKind::Action
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdmOperationImport {
    pub name: String,
    pub operation: Arc<EdmOperation>,
    pub entity_set: Option<Arc<EdmEntitySet>>,
}

impl EdmOperationImport {
    pub fn is_action_import(&self) -> bool {
        self.operation.is_action()
    }
}

/// Parsed form of a return type such as `NS.Order` or `Collection(NS.Order)`.
pub fn parse_type_reference(type_name: &str) -> (&str, bool) {
    match type_name
        .strip_prefix("Collection(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        Some(inner) => (inner, true),
        None => (type_name, false),
    }
}

// ---------------------------------------------------------------------------
// Serializable model definition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDefinition {
    pub namespace: String,
    #[serde(default)]
    pub entity_types: Vec<EntityTypeDefinition>,
    #[serde(default)]
    pub entity_sets: Vec<EntitySetDefinition>,
    #[serde(default)]
    pub singletons: Vec<SingletonDefinition>,
    #[serde(default)]
    pub operations: Vec<OperationDefinition>,
    #[serde(default)]
    pub operation_imports: Vec<OperationImportDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityTypeDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key: Vec<String>,
    #[serde(default)]
    pub properties: Vec<EdmProperty>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub navigation_properties: Vec<EdmNavigationProperty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_type: Option<String>,
    #[serde(default)]
    pub open: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySetDefinition {
    pub name: String,
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub navigation_bindings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingletonDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub navigation_bindings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDefinition {
    pub name: String,
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<EdmBinding>,
    #[serde(default)]
    pub parameters: Vec<EdmParameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationImportDefinition {
    pub name: String,
    /// Qualified name of the unbound operation being imported.
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_set: Option<String>,
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct EdmModel {
    pub namespace: String,
    entity_types: Vec<Arc<EdmEntityType>>,
    entity_sets: Vec<Arc<EdmEntitySet>>,
    singletons: Vec<Arc<EdmSingleton>>,
    operations: Vec<Arc<EdmOperation>>,
    operation_imports: Vec<Arc<EdmOperationImport>>,
    definition: ModelDefinition,
}

impl EdmModel {
    pub fn from_json(json: &str) -> ODataResult<Self> {
        let definition: ModelDefinition = serde_json::from_str(json)?;
        Self::from_definition(definition)
    }

    pub fn from_json_value(value: serde_json::Value) -> ODataResult<Self> {
        let definition: ModelDefinition = serde_json::from_value(value)?;
        Self::from_definition(definition)
    }

    pub fn from_definition(definition: ModelDefinition) -> ODataResult<Self> {
        let namespace = definition.namespace.clone();
        let entity_types = resolve_entity_types(&namespace, &definition.entity_types)?;
        let type_lookup: HashMap<String, Arc<EdmEntityType>> = entity_types
            .iter()
            .map(|t| (t.full_name(), t.clone()))
            .collect();

        let find_type = |name: &str| {
            type_lookup
                .get(name)
                .cloned()
                .ok_or_else(|| ODataError::Model(format!("Unknown entity type '{}'", name)))
        };

        let mut entity_sets = Vec::new();
        for set in &definition.entity_sets {
            entity_sets.push(Arc::new(EdmEntitySet {
                name: set.name.clone(),
                entity_type: find_type(&set.entity_type)?,
                navigation_bindings: set.navigation_bindings.clone(),
            }));
        }

        let mut singletons = Vec::new();
        for singleton in &definition.singletons {
            singletons.push(Arc::new(EdmSingleton {
                name: singleton.name.clone(),
                entity_type: find_type(&singleton.type_name)?,
                navigation_bindings: singleton.navigation_bindings.clone(),
            }));
        }

        let set_names: Vec<&str> = entity_sets.iter().map(|s| s.name.as_str()).collect();
        let bindings = entity_sets
            .iter()
            .map(|s| (s.name.as_str(), s.entity_type.as_ref(), &s.navigation_bindings))
            .chain(
                singletons
                    .iter()
                    .map(|s| (s.name.as_str(), s.entity_type.as_ref(), &s.navigation_bindings)),
            );
        for (source, entity_type, source_bindings) in bindings {
            for (navigation, target) in source_bindings {
                if entity_type.find_navigation_property(navigation).is_none() {
                    return Err(ODataError::Model(format!(
                        "'{}' binds unknown navigation property '{}'",
                        source, navigation
                    )));
                }
                if !set_names.contains(&target.as_str()) {
                    return Err(ODataError::Model(format!(
                        "'{}' binds '{}' to unknown entity set '{}'",
                        source, navigation, target
                    )));
                }
            }
        }

        let mut operations = Vec::new();
        for operation in &definition.operations {
            if let Some(binding) = &operation.binding {
                find_type(&binding.type_name)?;
            }
            operations.push(Arc::new(EdmOperation {
                namespace: namespace.clone(),
                name: operation.name.clone(),
                kind: operation.kind,
                binding: operation.binding.clone(),
                parameters: operation.parameters.clone(),
                return_type: operation.return_type.clone(),
            }));
        }

        let mut operation_imports = Vec::new();
        for import in &definition.operation_imports {
            let operation = operations
                .iter()
                .find(|op| !op.is_bound() && op.full_name() == import.operation)
                .cloned()
                .ok_or_else(|| {
                    ODataError::Model(format!(
                        "Import '{}' refers to unknown unbound operation '{}'",
                        import.name, import.operation
                    ))
                })?;
            let entity_set = match &import.entity_set {
                Some(name) => Some(
                    entity_sets
                        .iter()
                        .find(|s| &s.name == name)
                        .cloned()
                        .ok_or_else(|| {
                            ODataError::Model(format!("Unknown entity set '{}'", name))
                        })?,
                ),
                None => None,
            };
            operation_imports.push(Arc::new(EdmOperationImport {
                name: import.name.clone(),
                operation,
                entity_set,
            }));
        }

        Ok(Self {
            namespace,
            entity_types,
            entity_sets,
            singletons,
            operations,
            operation_imports,
            definition,
        })
    }

    /// The definition the model was built from, as served at `$metadata`.
    pub fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    pub fn entity_types(&self) -> &[Arc<EdmEntityType>] {
        &self.entity_types
    }

    pub fn entity_sets(&self) -> &[Arc<EdmEntitySet>] {
        &self.entity_sets
    }

    pub fn singletons(&self) -> &[Arc<EdmSingleton>] {
        &self.singletons
    }

    pub fn operations(&self) -> &[Arc<EdmOperation>] {
        &self.operations
    }

    pub fn operation_imports(&self) -> &[Arc<EdmOperationImport>] {
        &self.operation_imports
    }

    pub fn find_entity_set(&self, name: &str) -> Option<Arc<EdmEntitySet>> {
        self.entity_sets.iter().find(|s| s.name == name).cloned()
    }

    pub fn find_singleton(&self, name: &str) -> Option<Arc<EdmSingleton>> {
        self.singletons.iter().find(|s| s.name == name).cloned()
    }

    /// Looks up an entity type by qualified name.
    pub fn find_entity_type(&self, qualified_name: &str) -> Option<Arc<EdmEntityType>> {
        self.entity_types
            .iter()
            .find(|t| t.full_name() == qualified_name)
            .cloned()
    }

    /// All imports with the given name, in declaration order.
    pub fn find_operation_imports(&self, name: &str) -> Vec<Arc<EdmOperationImport>> {
        self.operation_imports
            .iter()
            .filter(|i| i.name == name)
            .cloned()
            .collect()
    }

    /// Bound operations named `qualified_name` that can be bound to `binding_type`,
    /// in declaration order. Overloads are all returned; callers decide which wins.
    pub fn find_bound_operations(
        &self,
        qualified_name: &str,
        binding_type: &EdmEntityType,
        collection: bool,
    ) -> Vec<Arc<EdmOperation>> {
        self.operations
            .iter()
            .filter(|op| op.full_name() == qualified_name)
            .filter(|op| match &op.binding {
                Some(binding) => {
                    binding.collection == collection
                        && binding_type.is_assignable_to(&binding.type_name)
                }
                None => false,
            })
            .cloned()
            .collect()
    }

    /// Entity set reached by following `navigation` from `source`, if bound.
    pub fn find_navigation_target(
        &self,
        source: &NavigationSource,
        navigation: &str,
    ) -> Option<Arc<EdmEntitySet>> {
        source
            .navigation_bindings()
            .get(navigation)
            .and_then(|target| self.find_entity_set(target))
    }
}

/// Resolves entity types in dependency order, flattening inherited keys and properties.
fn resolve_entity_types(
    namespace: &str,
    definitions: &[EntityTypeDefinition],
) -> ODataResult<Vec<Arc<EdmEntityType>>> {
    let mut resolved: Vec<Arc<EdmEntityType>> = Vec::new();
    let mut pending: Vec<&EntityTypeDefinition> = definitions.iter().collect();

    while !pending.is_empty() {
        let before = pending.len();
        let mut still_pending = Vec::new();

        for definition in pending {
            let base = match &definition.base_type {
                Some(base_name) => match resolved.iter().find(|t| &t.full_name() == base_name) {
                    Some(base) => Some(base.clone()),
                    None => {
                        still_pending.push(definition);
                        continue;
                    }
                },
                None => None,
            };

            let mut key = definition.key.clone();
            let mut properties = Vec::new();
            let mut navigation_properties = Vec::new();
            let mut ancestors = Vec::new();
            if let Some(base) = &base {
                if key.is_empty() {
                    key = base.key.clone();
                }
                properties.extend(base.properties.iter().cloned());
                navigation_properties.extend(base.navigation_properties.iter().cloned());
                ancestors.push(base.full_name());
                ancestors.extend(base.ancestors.iter().cloned());
            }
            properties.extend(definition.properties.iter().cloned());
            navigation_properties.extend(definition.navigation_properties.iter().cloned());

            if key.is_empty() {
                return Err(ODataError::Model(format!(
                    "Entity type '{}' has no key",
                    definition.name
                )));
            }
            if let Some(missing) = key
                .iter()
                .find(|k| !properties.iter().any(|p| &p.name == *k))
            {
                return Err(ODataError::Model(format!(
                    "Key property '{}' is not declared on '{}'",
                    missing, definition.name
                )));
            }

            resolved.push(Arc::new(EdmEntityType {
                namespace: namespace.to_string(),
                name: definition.name.clone(),
                key,
                properties,
                navigation_properties,
                base_type: definition.base_type.clone(),
                ancestors,
                open: definition.open,
            }));
        }

        if still_pending.len() == before {
            let names: Vec<&str> = still_pending.iter().map(|d| d.name.as_str()).collect();
            return Err(ODataError::Model(format!(
                "Unresolvable base types for: {}",
                names.join(", ")
            )));
        }
        pending = still_pending;
    }

    // Navigation targets may only be checked once every type exists.
    for entity_type in &resolved {
        for navigation in &entity_type.navigation_properties {
            if !resolved.iter().any(|t| t.full_name() == navigation.target_type) {
                return Err(ODataError::Model(format!(
                    "Navigation property '{}' targets unknown type '{}'",
                    navigation.name, navigation.target_type
                )));
            }
        }
    }

    Ok(resolved)
}
