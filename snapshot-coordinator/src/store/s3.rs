//! S3-compatible backend construction.

use crate::config::StoreConfig;
use crate::utils::errors::CoordinatorError;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::ObjectStore;
use std::sync::Arc;

/// Build the object store for `cfg`.
///
/// Conditional puts are required: the lease record relies on
/// create-if-absent and compare-and-swap on the ETag.
pub fn build_store(cfg: &StoreConfig) -> Result<Arc<dyn ObjectStore>, CoordinatorError> {
    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(&cfg.bucket)
        .with_region(&cfg.region)
        .with_allow_http(cfg.allow_http)
        .with_conditional_put(S3ConditionalPut::ETagMatch);

    if let Some(endpoint) = &cfg.endpoint {
        builder = builder
            .with_endpoint(endpoint)
            .with_virtual_hosted_style_request(false);
    }

    if let (Some(key_id), Some(secret)) = (&cfg.access_key_id, &cfg.secret_access_key) {
        builder = builder
            .with_access_key_id(key_id)
            .with_secret_access_key(secret);
    }

    let store = builder
        .build()
        .map_err(|e| CoordinatorError::Config(format!("invalid object store settings: {e}")))?;
    tracing::info!(bucket = %cfg.bucket, endpoint = ?cfg.endpoint, prefix = %cfg.prefix, "Object store configured");
    Ok(Arc::new(store))
}
