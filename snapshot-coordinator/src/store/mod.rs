//! Object store gateway.
//!
//! [`ObjectGateway`] is the thin put/get/list/delete surface the index and
//! the arbiter are written against. [`ObjectStoreGateway`] is the
//! production implementation over any `object_store::ObjectStore`
//! (S3-compatible in deployment, `InMemory` in tests) with:
//! - per-call timeouts, reported as transient errors
//! - bounded exponential backoff on transient errors
//! - no retry for authentication or conditional-write failures

pub mod s3;

use crate::utils::errors::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use object_store::path::Path;
use object_store::{
    GetOptions, ObjectStore, PutMode, PutOptions, PutPayload, PutResult, UpdateVersion,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Version token of a stored object, used for conditional replacement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectVersion {
    pub e_tag: Option<String>,
    pub version: Option<String>,
}

impl From<PutResult> for ObjectVersion {
    fn from(r: PutResult) -> Self {
        Self {
            e_tag: r.e_tag,
            version: r.version,
        }
    }
}

impl From<&ObjectVersion> for UpdateVersion {
    fn from(v: &ObjectVersion) -> Self {
        UpdateVersion {
            e_tag: v.e_tag.clone(),
            version: v.version.clone(),
        }
    }
}

#[async_trait]
pub trait ObjectGateway: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Lazily list keys under `prefix`, optionally resuming after `start_after`.
    fn list<'a>(
        &'a self,
        prefix: &str,
        start_after: Option<&str>,
    ) -> BoxStream<'a, Result<String, StoreError>>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Write only if nothing exists at `key`. Loses with [`StoreError::Conflict`].
    async fn create(&self, key: &str, bytes: Bytes) -> Result<ObjectVersion, StoreError>;

    async fn get_versioned(&self, key: &str) -> Result<(Bytes, ObjectVersion), StoreError>;

    /// Overwrite only if the stored object is still at `expected`.
    async fn replace(
        &self,
        key: &str,
        bytes: Bytes,
        expected: &ObjectVersion,
    ) -> Result<ObjectVersion, StoreError>;
}

/// Timeout and backoff settings for gateway calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub(crate) fn backoff(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Production [`ObjectGateway`] backed by an [`ObjectStore`].
pub struct ObjectStoreGateway {
    store: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
}

impl ObjectStoreGateway {
    pub fn new(store: Arc<dyn ObjectStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Run `op` under the per-call timeout, retrying transient failures
    /// with exponential backoff up to `max_retries` times.
    async fn with_retry<T, F, Fut>(
        &self,
        op_name: &'static str,
        key: &str,
        mut op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, object_store::Error>>,
    {
        let timeout = self.policy.request_timeout;
        let max_retries = self.policy.max_retries;
        let mut attempt = 0u32;

        backoff::future::retry(self.policy.backoff(), || {
            attempt += 1;
            let current = attempt;
            let fut = op();
            async move {
                let result = match tokio::time::timeout(timeout, fut).await {
                    Ok(r) => r.map_err(StoreError::from),
                    Err(_) => Err(StoreError::Transient(format!(
                        "{op_name} {key} timed out after {timeout:?}"
                    ))),
                };
                result.map_err(|e| {
                    if e.is_transient() && current <= max_retries {
                        warn!(op = op_name, key, attempt = current, error = %e, "Retrying object store call");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }

    async fn put_with_mode(
        &self,
        op_name: &'static str,
        key: &str,
        bytes: Bytes,
        mode: PutMode,
    ) -> Result<PutResult, StoreError> {
        let path = Path::from(key);
        let payload = PutPayload::from_bytes(bytes);
        self.with_retry(op_name, key, || {
            let opts = PutOptions {
                mode: mode.clone(),
                ..Default::default()
            };
            self.store.put_opts(&path, payload.clone(), opts)
        })
        .await
    }
}

#[async_trait]
impl ObjectGateway for ObjectStoreGateway {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        self.put_with_mode("put", key, bytes, PutMode::Overwrite)
            .await
            .map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let path = Path::from(key);
        self.with_retry("get", key, || {
            let store = Arc::clone(&self.store);
            let path = path.clone();
            async move {
                let result = store.get_opts(&path, GetOptions::default()).await?;
                result.bytes().await
            }
        })
        .await
    }

    fn list<'a>(
        &'a self,
        prefix: &str,
        start_after: Option<&str>,
    ) -> BoxStream<'a, Result<String, StoreError>> {
        let prefix = Path::from(prefix);
        let stream = match start_after {
            Some(offset) => self.store.list_with_offset(Some(&prefix), &Path::from(offset)),
            None => self.store.list(Some(&prefix)),
        };
        stream
            .map(|item| item.map(|meta| meta.location.to_string()).map_err(StoreError::from))
            .boxed()
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = Path::from(key);
        self.with_retry("delete", key, || self.store.delete(&path)).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = Path::from(key);
        match self.with_retry("head", key, || self.store.head(&path)).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, key: &str, bytes: Bytes) -> Result<ObjectVersion, StoreError> {
        self.put_with_mode("create", key, bytes, PutMode::Create)
            .await
            .map(ObjectVersion::from)
    }

    async fn get_versioned(&self, key: &str) -> Result<(Bytes, ObjectVersion), StoreError> {
        let path = Path::from(key);
        self.with_retry("get", key, || {
            let store = Arc::clone(&self.store);
            let path = path.clone();
            async move {
                let result = store.get_opts(&path, GetOptions::default()).await?;
                let version = ObjectVersion {
                    e_tag: result.meta.e_tag.clone(),
                    version: result.meta.version.clone(),
                };
                let bytes = result.bytes().await?;
                Ok((bytes, version))
            }
        })
        .await
    }

    async fn replace(
        &self,
        key: &str,
        bytes: Bytes,
        expected: &ObjectVersion,
    ) -> Result<ObjectVersion, StoreError> {
        let mode = PutMode::Update(UpdateVersion::from(expected));
        self.put_with_mode("replace", key, bytes, mode)
            .await
            .map(ObjectVersion::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use object_store::memory::InMemory;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn make_gateway() -> ObjectStoreGateway {
        let policy = RetryPolicy {
            request_timeout: Duration::from_secs(5),
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        };
        ObjectStoreGateway::new(Arc::new(InMemory::new()), policy)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let gw = make_gateway();
        gw.put("snapshots/a/snapshot", Bytes::from_static(b"state"))
            .await
            .unwrap();
        assert!(gw.exists("snapshots/a/snapshot").await.unwrap());
        assert_eq!(
            gw.get("snapshots/a/snapshot").await.unwrap(),
            Bytes::from_static(b"state")
        );

        gw.delete("snapshots/a/snapshot").await.unwrap();
        assert!(!gw.exists("snapshots/a/snapshot").await.unwrap());
        assert!(matches!(
            gw.get("snapshots/a/snapshot").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_and_resume() {
        let gw = make_gateway();
        for name in ["a", "b", "c"] {
            gw.put(&format!("snapshots/{name}/complete"), Bytes::new())
                .await
                .unwrap();
        }
        gw.put("elsewhere/x", Bytes::new()).await.unwrap();

        let mut keys: Vec<String> = gw.list("snapshots", None).try_collect().await.unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec!["snapshots/a/complete", "snapshots/b/complete", "snapshots/c/complete"]
        );

        let rest: Vec<String> = gw
            .list("snapshots", Some("snapshots/a/complete"))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert!(!rest.contains(&"snapshots/a/complete".to_string()));
    }

    #[tokio::test]
    async fn test_create_is_exclusive() {
        let gw = make_gateway();
        gw.create("snapshots/.lease", Bytes::from_static(b"one"))
            .await
            .unwrap();
        let second = gw.create("snapshots/.lease", Bytes::from_static(b"two")).await;
        assert!(matches!(second, Err(StoreError::Conflict { .. })));
        assert_eq!(
            gw.get("snapshots/.lease").await.unwrap(),
            Bytes::from_static(b"one")
        );
    }

    #[tokio::test]
    async fn test_replace_requires_current_version() {
        let gw = make_gateway();
        gw.create("k", Bytes::from_static(b"v1")).await.unwrap();
        let (_, v1) = gw.get_versioned("k").await.unwrap();

        let v2 = gw.replace("k", Bytes::from_static(b"v2"), &v1).await.unwrap();
        assert_ne!(v1, v2);

        let stale = gw.replace("k", Bytes::from_static(b"v3"), &v1).await;
        assert!(matches!(stale, Err(StoreError::Conflict { .. })));
        assert_eq!(gw.get("k").await.unwrap(), Bytes::from_static(b"v2"));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let gw = make_gateway();
        let calls = AtomicU32::new(0);
        let result = gw
            .with_retry("get", "k", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(object_store::Error::Generic {
                            store: "test",
                            source: "connection reset".into(),
                        })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let gw = make_gateway();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = gw
            .with_retry("put", "k", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(object_store::Error::Generic {
                        store: "test",
                        source: "503 slow down".into(),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(StoreError::Transient(_))));
        // first attempt plus max_retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_auth_errors_are_not_retried() {
        let gw = make_gateway();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = gw
            .with_retry("put", "k", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(object_store::Error::PermissionDenied {
                        path: "k".into(),
                        source: "access denied".into(),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(StoreError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
