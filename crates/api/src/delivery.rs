//! HTTP delivery handlers for catalog outbox messages.
//!
//! A handler decodes the stored entity and POSTs its id to the configured
//! endpoint. Any 2xx response counts as delivered.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use library_catalog::{Author, Book};
use library_core::Entity;
use library_infra::config::OutboxConfig;
use library_infra::outbox::{DeliveryError, KindHandler, KindRegistry, OutboxKind};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// POSTs the id of a decoded `E` to `url`.
pub struct EntityDelivery<E> {
    client: reqwest::Client,
    url: String,
    _entity: PhantomData<fn() -> E>,
}

pub type BookDelivery = EntityDelivery<Book>;
pub type AuthorDelivery = EntityDelivery<Author>;

impl<E> EntityDelivery<E> {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            _entity: PhantomData,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl<E> KindHandler for EntityDelivery<E>
where
    E: Entity + DeserializeOwned + Send + 'static,
{
    async fn deliver(&self, payload: &[u8]) -> Result<(), DeliveryError> {
        // Only the id string is held across the request.
        let body = decode_id::<E>(payload)?;

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

fn decode_id<E: Entity + DeserializeOwned>(payload: &[u8]) -> Result<String, DeliveryError> {
    let entity: E = serde_json::from_slice(payload).map_err(|e| {
        DeliveryError::Payload(format!("cannot decode {} payload: {e}", E::KIND))
    })?;
    Ok(entity.id().to_string())
}

/// Client shared by every delivery handler.
pub fn http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()
}

/// Registry with a handler for every kind that has an endpoint configured.
pub fn registry_from_config(config: &OutboxConfig, client: &reqwest::Client) -> KindRegistry {
    let mut registry = KindRegistry::new();
    if let Some(url) = &config.book_send_url {
        registry.register(
            OutboxKind::Book,
            Arc::new(BookDelivery::new(client.clone(), url.as_str())),
        );
    }
    if let Some(url) = &config.author_send_url {
        registry.register(
            OutboxKind::Author,
            Arc::new(AuthorDelivery::new(client.clone(), url.as_str())),
        );
    }
    for kind in OutboxKind::ALL {
        if kind != OutboxKind::Undefined && !registry.contains(kind) {
            tracing::warn!(%kind, "no delivery endpoint configured; messages will stay pending");
        }
    }
    registry
}
