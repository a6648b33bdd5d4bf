//! In-memory entity storage behind the data service.
//!
//! Entities live per collection (entity set or singleton name) under their canonical key:
//! the key literal as written between the parentheses of a canonical URL, e.g. `'ALFKI'`
//! or `OrderID=1,LineNo=2`. Singletons are stored under the empty key.

use std::collections::BTreeMap;

use dashmap::DashMap;
use odata_core::{EdmEntityType, KeySegment};
use serde_json::{Map, Value};

pub type Entity = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityAddress {
    pub collection: String,
    pub key: String,
}

impl EntityAddress {
    pub fn new(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
        }
    }

    pub fn singleton(name: impl Into<String>) -> Self {
        Self::new(name, "")
    }

    /// Path of the entity relative to the service root.
    pub fn path(&self) -> String {
        if self.key.is_empty() {
            self.collection.clone()
        } else {
            format!("{}({})", self.collection, self.key)
        }
    }
}

#[derive(Default)]
pub struct EntityStore {
    entities: DashMap<String, BTreeMap<String, Entity>>,
    links: DashMap<(EntityAddress, String), Vec<EntityAddress>>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a new entity. Returns false when the key is taken.
    pub fn insert(&self, address: &EntityAddress, entity: Entity) -> bool {
        let mut collection = self.entities.entry(address.collection.clone()).or_default();
        if collection.contains_key(&address.key) {
            return false;
        }
        collection.insert(address.key.clone(), entity);
        true
    }

    pub fn upsert(&self, address: &EntityAddress, entity: Entity) {
        self.entities
            .entry(address.collection.clone())
            .or_default()
            .insert(address.key.clone(), entity);
    }

    pub fn get(&self, address: &EntityAddress) -> Option<Entity> {
        self.entities
            .get(&address.collection)
            .and_then(|collection| collection.get(&address.key).cloned())
    }

    pub fn contains(&self, address: &EntityAddress) -> bool {
        self.entities
            .get(&address.collection)
            .is_some_and(|collection| collection.contains_key(&address.key))
    }

    /// Applies `changes` over the stored entity. Returns false when it does not exist.
    pub fn merge(&self, address: &EntityAddress, changes: Entity) -> bool {
        let Some(mut collection) = self.entities.get_mut(&address.collection) else {
            return false;
        };
        match collection.get_mut(&address.key) {
            Some(entity) => {
                entity.extend(changes);
                true
            }
            None => false,
        }
    }

    /// Removes the entity together with every link from or to it.
    pub fn remove(&self, address: &EntityAddress) -> bool {
        let removed = self
            .entities
            .get_mut(&address.collection)
            .is_some_and(|mut collection| collection.remove(&address.key).is_some());
        if removed {
            self.links.retain(|(source, _), targets| {
                targets.retain(|target| target != address);
                source != address
            });
        }
        removed
    }

    /// Entities of a collection in key order.
    pub fn list(&self, collection: &str) -> Vec<(String, Entity)> {
        self.entities
            .get(collection)
            .map(|entities| {
                entities
                    .iter()
                    .map(|(key, entity)| (key.clone(), entity.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count(&self, collection: &str) -> usize {
        self.entities
            .get(collection)
            .map_or(0, |entities| entities.len())
    }

    /// Links `source/navigation` to `target`. A single-valued navigation keeps only the
    /// latest target.
    pub fn add_link(
        &self,
        source: &EntityAddress,
        navigation: &str,
        target: EntityAddress,
        collection: bool,
    ) {
        let mut targets = self
            .links
            .entry((source.clone(), navigation.to_string()))
            .or_default();
        if !collection {
            targets.clear();
        }
        if !targets.contains(&target) {
            targets.push(target);
        }
    }

    pub fn links(&self, source: &EntityAddress, navigation: &str) -> Vec<EntityAddress> {
        self.links
            .get(&(source.clone(), navigation.to_string()))
            .map(|targets| targets.clone())
            .unwrap_or_default()
    }

    /// Removes one link, or all links of the navigation when `target` is `None`.
    pub fn remove_link(
        &self,
        source: &EntityAddress,
        navigation: &str,
        target: Option<&EntityAddress>,
    ) -> bool {
        let key = (source.clone(), navigation.to_string());
        match target {
            None => self.links.remove(&key).is_some(),
            Some(target) => self.links.get_mut(&key).is_some_and(|mut targets| {
                let before = targets.len();
                targets.retain(|t| t != target);
                targets.len() != before
            }),
        }
    }

    pub fn clear(&self) {
        self.entities.clear();
        self.links.clear();
    }
}

/// Literal form of a key value: strings quoted with `'` doubled inside, numbers as-is.
pub fn key_literal(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(format!("'{}'", text.replace('\'', "''"))),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Joins key literals in declaration order: `'A'` for a single key,
/// `OrderID=1,LineNo=2` for a composite one.
pub fn canonical_key<'a>(
    entity_type: &EdmEntityType,
    mut literal_of: impl FnMut(&str) -> Option<&'a str>,
) -> Option<String> {
    match entity_type.key.as_slice() {
        [] => None,
        [single] => literal_of(single).map(str::to_string),
        properties => {
            let mut parts = Vec::with_capacity(properties.len());
            for property in properties {
                parts.push(format!("{}={}", property, literal_of(property)?));
            }
            Some(parts.join(","))
        }
    }
}

pub fn key_from_segment(key: &KeySegment) -> Option<String> {
    canonical_key(&key.entity_type, |property| {
        key.find(property).map(|value| value.literal.as_str())
    })
}

/// Key of an entity body, `None` when a key property is missing or not a scalar.
pub fn key_from_entity(entity_type: &EdmEntityType, entity: &Entity) -> Option<String> {
    let literals: BTreeMap<&str, String> = entity_type
        .key
        .iter()
        .filter_map(|property| {
            entity
                .get(property)
                .and_then(key_literal)
                .map(|literal| (property.as_str(), literal))
        })
        .collect();
    canonical_key(entity_type, |property| literals.get(property).map(String::as_str))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(value: Value) -> Entity {
        value.as_object().cloned().unwrap()
    }

    fn order_line_type() -> EdmEntityType {
        EdmEntityType {
            namespace: "NS".to_string(),
            name: "OrderLine".to_string(),
            key: vec!["OrderID".to_string(), "LineNo".to_string()],
            properties: Vec::new(),
            navigation_properties: Vec::new(),
            base_type: None,
            ancestors: Vec::new(),
            open: false,
        }
    }

    #[test]
    fn test_insert_conflict_and_merge() {
        let store = EntityStore::new();
        let address = EntityAddress::new("Customers", "'ALFKI'");
        assert!(store.insert(&address, entity(json!({"CustomerID": "ALFKI"}))));
        assert!(!store.insert(&address, entity(json!({"CustomerID": "ALFKI"}))));

        assert!(store.merge(&address, entity(json!({"City": "Berlin"}))));
        let stored = store.get(&address).unwrap();
        assert_eq!(stored["City"], json!("Berlin"));
        assert_eq!(stored["CustomerID"], json!("ALFKI"));
        assert!(!store.merge(&EntityAddress::new("Customers", "'NONE'"), Entity::new()));
        assert_eq!(store.count("Customers"), 1);
    }

    #[test]
    fn test_links_follow_removal() {
        let store = EntityStore::new();
        let customer = EntityAddress::new("Customers", "'ALFKI'");
        let order = EntityAddress::new("Orders", "1");
        store.insert(&customer, Entity::new());
        store.insert(&order, Entity::new());

        store.add_link(&customer, "Orders", order.clone(), true);
        store.add_link(&customer, "Orders", order.clone(), true);
        assert_eq!(store.links(&customer, "Orders"), vec![order.clone()]);

        assert!(store.remove(&order));
        assert!(store.links(&customer, "Orders").is_empty());
    }

    #[test]
    fn test_single_valued_link_is_replaced() {
        let store = EntityStore::new();
        let order = EntityAddress::new("Orders", "1");
        store.add_link(&order, "Customer", EntityAddress::new("Customers", "'A'"), false);
        store.add_link(&order, "Customer", EntityAddress::new("Customers", "'B'"), false);
        assert_eq!(
            store.links(&order, "Customer"),
            vec![EntityAddress::new("Customers", "'B'")]
        );
        assert!(store.remove_link(&order, "Customer", None));
        assert!(!store.remove_link(&order, "Customer", None));
    }

    #[test]
    fn test_keys_from_bodies() {
        let line = entity(json!({"LineNo": 2, "OrderID": 1, "Quantity": 5}));
        assert_eq!(
            key_from_entity(&order_line_type(), &line).as_deref(),
            Some("OrderID=1,LineNo=2")
        );
        assert_eq!(key_literal(&json!("O'Brien")).as_deref(), Some("'O''Brien'"));
        assert_eq!(key_from_entity(&order_line_type(), &entity(json!({"OrderID": 1}))), None);
        assert_eq!(EntityAddress::new("OrderLines", "OrderID=1,LineNo=2").path(), "OrderLines(OrderID=1,LineNo=2)");
        assert_eq!(EntityAddress::singleton("Me").path(), "Me");
    }
}
