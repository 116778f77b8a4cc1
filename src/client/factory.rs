//! Client factory wiring.
//!
//! The MTProto transport is an external adapter: deployments link one in and
//! hand its factory to [`crate::core::runtime::Runtime`]. The fallback below
//! keeps the binary honest when no transport is linked — every connection
//! attempt reports the condition instead of pretending.

use async_trait::async_trait;
use std::sync::Arc;

use crate::client::upstream::{ClientFactory, UpstreamClient, UpstreamError};

/// Factory used when the binary was built without a transport adapter.
/// Storage, the web surface and archive serving still work; auth endpoints
/// report the missing transport.
pub struct UnavailableFactory;

#[async_trait]
impl ClientFactory for UnavailableFactory {
    async fn connect(
        &self,
        _api_id: i32,
        _api_hash: &str,
        _session: Option<&str>,
        _max_concurrent_transmissions: usize,
    ) -> Result<Arc<dyn UpstreamClient>, UpstreamError> {
        Err(UpstreamError::Other(
            "no upstream transport linked into this build".to_string(),
        ))
    }
}
