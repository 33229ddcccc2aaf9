use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use octofhir_core::{format_instant, generate_id, validate_id};
use octofhir_storage::{
    DocumentQuery, FhirStorage, FindOptions, StorageError, StoredResource,
};
use papaya::HashMap as PapayaHashMap;
use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::query::matches;

pub type StorageKey = String; // Format: "ResourceType/id"

pub(crate) fn make_storage_key(resource_type: &str, id: &str) -> StorageKey {
    format!("{resource_type}/{id}")
}

/// In-memory FHIR document store backed by a papaya lock-free HashMap.
///
/// Every write stamps `id`, `meta.versionId` and `meta.lastUpdated` on the
/// stored document. Versions come from one counter shared by all types.
#[derive(Debug)]
pub struct InMemoryStorage {
    data: PapayaHashMap<StorageKey, StoredResource>,
    version_counter: AtomicU64,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            data: PapayaHashMap::new(),
            version_counter: AtomicU64::new(1),
        }
    }

    fn next_version(&self) -> String {
        self.version_counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
    }

    /// Number of stored resources of `resource_type`.
    pub fn count_by_type(&self, resource_type: &str) -> usize {
        let guard = self.data.pin();
        guard
            .values()
            .filter(|stored| stored.resource_type == resource_type)
            .count()
    }

    /// Builds the document to store: `id` and `meta` are (re)written.
    fn stamp(
        &self,
        resource: &Value,
        resource_type: &str,
        id: &str,
    ) -> Result<StoredResource, StorageError> {
        let version_id = self.next_version();
        let now = OffsetDateTime::now_utc();
        let last_updated =
            format_instant(now).map_err(|e| StorageError::internal(e.to_string()))?;

        validate_id(id).map_err(|e| StorageError::invalid_resource(e.to_string()))?;
        let mut document = resource.clone();
        let object = document
            .as_object_mut()
            .ok_or_else(|| StorageError::invalid_resource("Resource must be a JSON object"))?;
        object.insert("id".to_string(), Value::String(id.to_string()));

        let meta = object.entry("meta").or_insert_with(|| json!({}));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("versionId".to_string(), Value::String(version_id.clone()));
            meta.insert("lastUpdated".to_string(), Value::String(last_updated));
        }

        Ok(StoredResource {
            id: id.to_string(),
            version_id,
            resource_type: resource_type.to_string(),
            resource: document,
            last_updated: now,
        })
    }
}

fn extract_resource_type(resource: &Value) -> Result<&str, StorageError> {
    resource
        .get("resourceType")
        .and_then(Value::as_str)
        .ok_or_else(|| StorageError::invalid_resource("Missing resourceType field"))
}

fn extract_id(resource: &Value) -> Option<&str> {
    resource.get("id").and_then(Value::as_str)
}

#[async_trait]
impl FhirStorage for InMemoryStorage {
    async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError> {
        let resource_type = extract_resource_type(resource)?;
        let id = extract_id(resource).map_or_else(generate_id, str::to_string);
        let key = make_storage_key(resource_type, &id);
        let stored = self.stamp(resource, resource_type, &id)?;

        let guard = self.data.pin();
        if guard.try_insert(key, stored.clone()).is_err() {
            return Err(StorageError::already_exists(resource_type, &id));
        }
        Ok(stored)
    }

    async fn read(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Option<StoredResource>, StorageError> {
        let key = make_storage_key(resource_type, id);
        let guard = self.data.pin();
        Ok(guard.get(&key).cloned())
    }

    async fn upsert(&self, resource: &Value) -> Result<StoredResource, StorageError> {
        let resource_type = extract_resource_type(resource)?;
        let id = extract_id(resource)
            .ok_or_else(|| StorageError::invalid_resource("Missing id field for update"))?;
        let stored = self.stamp(resource, resource_type, id)?;

        let guard = self.data.pin();
        guard.insert(make_storage_key(resource_type, id), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<(), StorageError> {
        let key = make_storage_key(resource_type, id);
        let guard = self.data.pin();
        match guard.remove(&key) {
            Some(_) => Ok(()),
            None => Err(StorageError::not_found(resource_type, id)),
        }
    }

    async fn find(
        &self,
        resource_type: &str,
        query: &DocumentQuery,
        options: &FindOptions,
    ) -> Result<Vec<Value>, StorageError> {
        if query.is_nothing() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<(String, Value)> = {
            let guard = self.data.pin();
            guard
                .values()
                .filter(|stored| stored.resource_type == resource_type)
                .filter(|stored| matches(query, &stored.resource))
                .map(|stored| (stored.id.clone(), stored.resource.clone()))
                .collect()
        };
        hits.sort_by(|a, b| a.0.cmp(&b.0));

        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(hits
            .into_iter()
            .skip(options.offset)
            .take(limit)
            .map(|(_, document)| match &options.projection {
                Some(projection) => projection.apply(&document),
                None => document,
            })
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octofhir_storage::Projection;

    fn condition(id: &str, patient: &str) -> Value {
        json!({
            "resourceType": "Condition",
            "id": id,
            "subject": {"reference": format!("Patient/{patient}")},
            "code": {"coding": [{"system": "http://snomed.info/sct", "code": "195967001"}]}
        })
    }

    #[tokio::test]
    async fn test_storage_basic_operations() {
        let storage = InMemoryStorage::new();

        let created = storage
            .create(&json!({"resourceType": "Patient", "id": "p1"}))
            .await
            .unwrap();
        assert_eq!(created.id, "p1");
        assert_eq!(created.resource["meta"]["versionId"], "1");
        assert!(created.resource["meta"]["lastUpdated"].is_string());

        let read = storage.read("Patient", "p1").await.unwrap().unwrap();
        assert_eq!(read.resource, created.resource);

        let updated = storage
            .upsert(&json!({"resourceType": "Patient", "id": "p1", "active": true}))
            .await
            .unwrap();
        assert_eq!(updated.version_id, "2");

        storage.delete("Patient", "p1").await.unwrap();
        assert!(storage.read("Patient", "p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_storage_conflicts_and_not_found() {
        let storage = InMemoryStorage::new();
        let patient = json!({"resourceType": "Patient", "id": "dup"});
        storage.create(&patient).await.unwrap();

        let err = storage.create(&patient).await.unwrap_err();
        assert!(err.is_already_exists());

        let err = storage.delete("Patient", "missing").await.unwrap_err();
        assert!(err.is_not_found());

        let err = storage.create(&json!({"id": "x"})).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidResource { .. }));

        let err = storage
            .upsert(&json!({"resourceType": "Patient", "id": "has space"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidResource { .. }));
    }

    #[tokio::test]
    async fn test_create_generates_id() {
        let storage = InMemoryStorage::new();
        let created = storage
            .create(&json!({"resourceType": "Observation"}))
            .await
            .unwrap();
        assert!(!created.id.is_empty());
        assert_eq!(created.resource["id"], created.id.as_str());
    }

    #[tokio::test]
    async fn test_find_filters_sorts_and_pages() {
        let storage = InMemoryStorage::new();
        for (id, patient) in [("c3", "a"), ("c1", "a"), ("c2", "b")] {
            storage.create(&condition(id, patient)).await.unwrap();
        }
        storage
            .create(&json!({"resourceType": "Patient", "id": "a"}))
            .await
            .unwrap();

        let all = storage
            .find("Condition", &DocumentQuery::All, &FindOptions::new())
            .await
            .unwrap();
        let ids: Vec<_> = all.iter().map(|doc| doc["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);

        let for_a = storage
            .find(
                "Condition",
                &DocumentQuery::equals("subject.reference", "Patient/a"),
                &FindOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(for_a.len(), 2);

        let page = storage
            .find(
                "Condition",
                &DocumentQuery::All,
                &FindOptions::new().with_offset(1).with_limit(1),
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0]["id"], "c2");

        assert_eq!(storage.count_by_type("Condition"), 3);
    }

    #[tokio::test]
    async fn test_find_applies_projection() {
        let storage = InMemoryStorage::new();
        storage.create(&condition("c1", "a")).await.unwrap();

        let projection = Projection::new()
            .with_field("resourceType")
            .with_field("id")
            .with_field("subject");
        let docs = storage
            .find(
                "Condition",
                &DocumentQuery::All,
                &FindOptions::new().with_projection(Some(projection)),
            )
            .await
            .unwrap();
        assert_eq!(
            docs[0],
            json!({
                "resourceType": "Condition",
                "id": "c1",
                "subject": {"reference": "Patient/a"}
            })
        );
    }

    #[tokio::test]
    async fn test_find_nothing_short_circuits() {
        let storage = InMemoryStorage::new();
        storage.create(&condition("c1", "a")).await.unwrap();
        let docs = storage
            .find("Condition", &DocumentQuery::Nothing, &FindOptions::new())
            .await
            .unwrap();
        assert!(docs.is_empty());
    }
}
