use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use uuid::Uuid;

use super::RegistryError;

/// Event types endpoints may subscribe to, with a short description.
pub const KNOWN_EVENT_TYPES: &[(&str, &str)] = &[
    ("order.created", "A new order was placed"),
    ("order.updated", "An order changed"),
    ("order.cancelled", "An order was cancelled"),
    ("order.completed", "An order was fulfilled"),
    ("payment.succeeded", "A payment was captured"),
    ("payment.failed", "A payment attempt failed"),
    ("payment.refunded", "A payment was refunded"),
    ("product.created", "A product was added to the catalog"),
    ("product.updated", "A product changed"),
    ("product.deleted", "A product was removed"),
    ("user.created", "A user account was registered"),
    ("user.updated", "A user account changed"),
];

pub fn is_known_event_type(event_type: &str) -> bool {
    KNOWN_EVENT_TYPES.iter().any(|(name, _)| *name == event_type)
}

/// A subscriber endpoint.
///
/// The secret is never serialized; API responses that must reveal it
/// (create, rotate) copy it out explicitly.
#[derive(Debug, Clone, Serialize)]
pub struct Endpoint {
    pub id: Uuid,
    pub url: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub events: Vec<String>,
    pub is_active: bool,
    pub owner_id: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.events.iter().any(|e| e == event_type)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewEndpoint {
    pub url: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl NewEndpoint {
    pub fn validate(&self) -> Result<(), RegistryError> {
        validate_url(&self.url)?;
        validate_events(&self.events)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointUpdate {
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub is_active: Option<bool>,
    pub metadata: Option<Value>,
}

impl EndpointUpdate {
    pub fn validate(&self) -> Result<(), RegistryError> {
        if let Some(url) = &self.url {
            validate_url(url)?;
        }
        if let Some(events) = &self.events {
            validate_events(events)?;
        }
        Ok(())
    }

    pub(crate) fn apply(self, endpoint: &mut Endpoint) {
        if let Some(url) = self.url {
            endpoint.url = url;
        }
        if let Some(events) = self.events {
            endpoint.events = dedup(events);
        }
        if let Some(is_active) = self.is_active {
            endpoint.is_active = is_active;
        }
        if let Some(metadata) = self.metadata {
            endpoint.metadata = metadata;
        }
        endpoint.updated_at = Utc::now();
    }
}

/// Subscriber URLs must be absolute http(s) URLs with a host.
pub fn validate_url(raw: &str) -> Result<(), RegistryError> {
    let parsed = Url::parse(raw).map_err(|e| RegistryError::InvalidUrl(format!("{raw}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(RegistryError::InvalidUrl(format!(
                "{raw}: unsupported scheme '{other}'"
            )))
        }
    }

    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(RegistryError::InvalidUrl(format!("{raw}: missing host")));
    }

    Ok(())
}

fn validate_events(events: &[String]) -> Result<(), RegistryError> {
    if events.is_empty() {
        return Err(RegistryError::Validation(
            "at least one event type is required".to_string(),
        ));
    }

    if let Some(unknown) = events.iter().find(|e| !is_known_event_type(e)) {
        return Err(RegistryError::Validation(format!(
            "unknown event type '{unknown}'"
        )));
    }

    Ok(())
}

pub(crate) fn dedup(mut events: Vec<String>) -> Vec<String> {
    events.sort();
    events.dedup();
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com/hooks").is_ok());
        assert!(validate_url("http://localhost:8080/cb").is_ok());

        assert!(matches!(
            validate_url("ftp://example.com"),
            Err(RegistryError::InvalidUrl(_))
        ));
        assert!(validate_url("not a url").is_err());
        assert!(validate_url("/relative/path").is_err());
    }

    #[test]
    fn test_validate_events() {
        let ok = NewEndpoint {
            url: "https://example.com".to_string(),
            events: vec!["order.created".to_string()],
            owner_id: None,
            metadata: None,
        };
        assert!(ok.validate().is_ok());

        let empty = NewEndpoint {
            events: vec![],
            ..ok.clone()
        };
        assert!(matches!(empty.validate(), Err(RegistryError::Validation(_))));

        let unknown = NewEndpoint {
            events: vec!["order.teleported".to_string()],
            ..ok
        };
        assert!(matches!(
            unknown.validate(),
            Err(RegistryError::Validation(_))
        ));
    }

    #[test]
    fn test_secret_not_serialized() {
        let endpoint = Endpoint {
            id: Uuid::new_v4(),
            url: "https://example.com".to_string(),
            secret: "topsecret".to_string(),
            events: vec!["user.created".to_string()],
            is_active: true,
            owner_id: None,
            metadata: Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let json = serde_json::to_string(&endpoint).unwrap();
        assert!(!json.contains("topsecret"));
        assert!(!json.contains("\"secret\""));
    }
}
