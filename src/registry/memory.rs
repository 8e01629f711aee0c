//! In-memory endpoint registry using DashMap.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::signature::{generate_secret, DEFAULT_SECRET_BYTES};

use super::models::dedup;
use super::{Endpoint, EndpointAdmin, EndpointRegistry, EndpointUpdate, NewEndpoint, RegistryError};

#[derive(Default)]
pub struct MemoryEndpointRegistry {
    endpoints: DashMap<Uuid, Endpoint>,
}

impl MemoryEndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EndpointRegistry for MemoryEndpointRegistry {
    async fn find_active_endpoints_subscribed_to(
        &self,
        event_type: &str,
    ) -> Result<Vec<Endpoint>, RegistryError> {
        let mut matches: Vec<Endpoint> = self
            .endpoints
            .iter()
            .filter(|e| e.is_active && e.subscribes_to(event_type))
            .map(|e| e.value().clone())
            .collect();
        matches.sort_by_key(|e| e.created_at);
        Ok(matches)
    }

    async fn get_endpoint(&self, id: Uuid) -> Result<Option<Endpoint>, RegistryError> {
        Ok(self.endpoints.get(&id).map(|e| e.value().clone()))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl EndpointAdmin for MemoryEndpointRegistry {
    async fn create(&self, new: NewEndpoint) -> Result<Endpoint, RegistryError> {
        new.validate()?;

        let now = Utc::now();
        let endpoint = Endpoint {
            id: Uuid::new_v4(),
            url: new.url,
            secret: generate_secret(DEFAULT_SECRET_BYTES),
            events: dedup(new.events),
            is_active: true,
            owner_id: new.owner_id,
            metadata: new.metadata.unwrap_or(Value::Object(Default::default())),
            created_at: now,
            updated_at: now,
        };

        self.endpoints.insert(endpoint.id, endpoint.clone());
        tracing::info!(endpoint_id = %endpoint.id, url = %endpoint.url, "Endpoint registered");
        Ok(endpoint)
    }

    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<Endpoint>, RegistryError> {
        let mut endpoints: Vec<Endpoint> = self
            .endpoints
            .iter()
            .filter(|e| owner_id.map_or(true, |owner| e.owner_id.as_deref() == Some(owner)))
            .map(|e| e.value().clone())
            .collect();
        endpoints.sort_by_key(|e| e.created_at);
        Ok(endpoints)
    }

    async fn update(&self, id: Uuid, update: EndpointUpdate) -> Result<Endpoint, RegistryError> {
        update.validate()?;

        let mut entry = self
            .endpoints
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        update.apply(entry.value_mut());
        Ok(entry.value().clone())
    }

    async fn deactivate(&self, id: Uuid) -> Result<Endpoint, RegistryError> {
        self.update(
            id,
            EndpointUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    async fn delete(&self, id: Uuid) -> Result<(), RegistryError> {
        self.endpoints
            .remove(&id)
            .map(|_| ())
            .ok_or(RegistryError::NotFound(id))
    }

    async fn rotate_secret(&self, id: Uuid) -> Result<Endpoint, RegistryError> {
        let mut entry = self
            .endpoints
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        entry.secret = generate_secret(DEFAULT_SECRET_BYTES);
        entry.updated_at = Utc::now();
        tracing::info!(endpoint_id = %id, "Endpoint secret rotated");
        Ok(entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_endpoint(url: &str, events: &[&str]) -> NewEndpoint {
        NewEndpoint {
            url: url.to_string(),
            events: events.iter().map(|e| e.to_string()).collect(),
            owner_id: Some("merchant_1".to_string()),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_find_active_subscribers() {
        let registry = MemoryEndpointRegistry::new();
        let a = registry
            .create(new_endpoint("https://a.example.com", &["order.created"]))
            .await
            .unwrap();
        let b = registry
            .create(new_endpoint(
                "https://b.example.com",
                &["order.created", "payment.failed"],
            ))
            .await
            .unwrap();
        registry
            .create(new_endpoint("https://c.example.com", &["user.created"]))
            .await
            .unwrap();
        registry.deactivate(b.id).await.unwrap();

        let found = registry
            .find_active_endpoints_subscribed_to("order.created")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a.id);
    }

    #[tokio::test]
    async fn test_rotate_secret_changes_secret() {
        let registry = MemoryEndpointRegistry::new();
        let created = registry
            .create(new_endpoint("https://a.example.com", &["order.created"]))
            .await
            .unwrap();

        let rotated = registry.rotate_secret(created.id).await.unwrap();
        assert_ne!(rotated.secret, created.secret);
        assert_eq!(rotated.secret.len(), 64);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let registry = MemoryEndpointRegistry::new();
        let created = registry
            .create(new_endpoint("https://a.example.com", &["order.created"]))
            .await
            .unwrap();

        let updated = registry
            .update(
                created.id,
                EndpointUpdate {
                    url: Some("https://new.example.com".to_string()),
                    events: Some(vec!["order.updated".to_string(), "order.updated".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.url, "https://new.example.com");
        assert_eq!(updated.events, vec!["order.updated".to_string()]);

        let bad = registry
            .update(
                created.id,
                EndpointUpdate {
                    url: Some("gopher://x".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(bad, Err(RegistryError::InvalidUrl(_))));

        registry.delete(created.id).await.unwrap();
        assert!(registry.get_endpoint(created.id).await.unwrap().is_none());
        assert!(matches!(
            registry.delete(created.id).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters_by_owner() {
        let registry = MemoryEndpointRegistry::new();
        registry
            .create(new_endpoint("https://a.example.com", &["order.created"]))
            .await
            .unwrap();
        let mut other = new_endpoint("https://b.example.com", &["order.created"]);
        other.owner_id = Some("merchant_2".to_string());
        registry.create(other).await.unwrap();

        assert_eq!(registry.list(None).await.unwrap().len(), 2);
        assert_eq!(registry.list(Some("merchant_2")).await.unwrap().len(), 1);
        assert!(registry.list(Some("nobody")).await.unwrap().is_empty());
    }
}
