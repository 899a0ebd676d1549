use super::KvStore;
use crate::config::KvConfig;
use crate::retry::{retry_request, RetryPolicy};
use crate::{Git2KvError, Result};
use async_trait::async_trait;

/// [`KvStore`] backed by a Consul agent.
///
/// Transient transport failures are retried a bounded number of times per
/// request; permanent ones (4xx, rejected writes) surface immediately.
#[derive(Debug, Clone)]
pub struct ConsulKv {
    client: consul::Client,
    retry: RetryPolicy,
}

impl ConsulKv {
    pub fn new(client: consul::Client, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    /// Build a client from the `kv` section of the configuration
    pub fn from_config(config: &KvConfig) -> Result<Self> {
        let mut client = consul::Client::with_timeout(&config.endpoint, config.request_timeout())?;
        if let Some(token) = config.resolved_token() {
            client = client.with_token(token);
        }

        tracing::debug!(
            endpoint = %client.endpoint(),
            retries = config.retries,
            "Consul KV client configured"
        );

        Ok(Self::new(client, RetryPolicy::with_retries(config.retries)))
    }

    pub fn endpoint(&self) -> &str {
        self.client.endpoint()
    }
}

#[async_trait]
impl KvStore for ConsulKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        retry_request(&self.retry, "get", key, || async {
            self.client.get(key).await.map_err(Git2KvError::from)
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        tracing::trace!(key, bytes = value.len(), "Writing KV entry");
        retry_request(&self.retry, "set", key, || async {
            self.client.put(key, value).await.map_err(Git2KvError::from)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        tracing::trace!(key, "Deleting KV entry");
        retry_request(&self.retry, "delete", key, || async {
            self.client.delete(key).await.map_err(Git2KvError::from)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_uses_endpoint() {
        let config = KvConfig {
            endpoint: "http://consul.internal:8500/".into(),
            token: Some("secret".into()),
            ..Default::default()
        };
        let kv = ConsulKv::from_config(&config).unwrap();
        assert_eq!(kv.endpoint(), "http://consul.internal:8500");
        assert_eq!(kv.retry.retries, 3);
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_an_error() {
        let config = KvConfig {
            // Port 9 (discard) on localhost is not a Consul agent
            endpoint: "http://127.0.0.1:9".into(),
            retries: 0,
            request_timeout_secs: 2,
            ..Default::default()
        };
        let kv = ConsulKv::from_config(&config).unwrap();
        assert!(kv.get("repo/main.ref").await.is_err());
    }
}
