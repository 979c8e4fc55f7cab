//! Google Earth Engine
//!
//! Earth Engine only exposes its catalogue through its own client runtime.
//! The adapter is registered so the provider name resolves, and every
//! operation reports that it is not supported.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};

use super::{
    AdapterContext, AdapterCore, FetchError, Provider, ProviderAdapter, ProviderResult,
    QueryRequest, ResultExt, Session,
};
use crate::product::{ProductRecord, QueryResult};
use crate::transfer::{ExistsPolicy, TransferRequest};

/// Adapter for Google Earth Engine
pub struct GoogleAdapter {
    core: AdapterCore,
}

impl GoogleAdapter {
    /// Build the adapter
    pub fn new(context: &AdapterContext) -> ProviderResult<Self> {
        Ok(Self {
            core: AdapterCore::new(Provider::GoogleEe, context)?,
        })
    }
}

fn unsupported<T>(operation: &'static str) -> ProviderResult<T> {
    Err(FetchError::NotSupported(format!("{operation} on Earth Engine"))).during(Provider::GoogleEe, operation)
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn core(&self) -> &AdapterCore {
        &self.core
    }

    async fn authenticate(&self, _previous: Option<&Session>) -> ProviderResult<Session> {
        unsupported("authenticate")
    }

    async fn query(&self, _session: &Session, _request: &QueryRequest) -> ProviderResult<QueryResult> {
        unsupported("query")
    }

    async fn build_download_request(
        &self,
        _session: &Session,
        _product: &ProductRecord,
        _dir: &Path,
        _policy: ExistsPolicy,
    ) -> ProviderResult<TransferRequest> {
        unsupported("build_download_request")
    }

    async fn fetch_metadata(&self, _session: &Session, _product: &ProductRecord) -> ProviderResult<Value> {
        unsupported("fetch_metadata")
    }

    async fn fetch_preview(
        &self,
        _session: &Session,
        _product: &ProductRecord,
        _dir: &Path,
    ) -> ProviderResult<PathBuf> {
        unsupported("fetch_preview")
    }
}
