//! EUMETSAT Data Store
//!
//! Tokens come from a client-credentials grant using the consumer key and
//! secret stored for `data.eumetsat.int`.

use async_trait::async_trait;
use reqwest::Url;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span, warn, Instrument};

use super::keycloak::client_credentials_grant;
use super::{
    check_too_many_matches, parse_instant, str_field, AdapterContext, AdapterCore, FetchError,
    FetchResult, Provider, ProviderAdapter, ProviderResult, QueryPlan, QueryRequest, ResultExt,
    Session,
};
use crate::product::{ProductRecord, QueryResult};
use crate::transfer::{ExistsPolicy, SourceLocator, TransferRequest};

const API_URL: &str = "https://api.eumetsat.int";

/// Page size of an OpenSearch query
pub const SEARCH_PAGE_SIZE: usize = 500;

/// Adapter for the EUMETSAT Data Store
pub struct EumdacAdapter {
    core: AdapterCore,
    root: String,
}

impl EumdacAdapter {
    /// Build the adapter
    pub fn new(context: &AdapterContext) -> ProviderResult<Self> {
        let core = AdapterCore::new(Provider::Eumdac, context)?;
        let root = core.base_url().unwrap_or(API_URL).to_string();
        Ok(Self { core, root })
    }

    fn search_url(&self) -> String {
        format!("{}/data/search-products/1.0.0/os", self.root)
    }

    /// Download URL with collection and product ids as escaped path segments
    pub fn download_url(&self, collection: &str, product: &str) -> FetchResult<String> {
        let mut url = Url::parse(&self.root).map_err(|e| FetchError::Parse(format!("{}: {e}", self.root)))?;
        url.path_segments_mut()
            .map_err(|_| FetchError::Parse(format!("{} cannot be a base URL", self.root)))?
            .pop_if_empty()
            .extend(["data", "download", "1.0.0", "collections", collection, "products", product]);
        Ok(url.to_string())
    }

    async fn search(&self, plan: &QueryPlan) -> FetchResult<Vec<ProductRecord>> {
        if plan.cloud_cover.is_some() {
            warn!("Cloud cover threshold is not supported by the EUMETSAT Data Store, ignoring it");
        }
        let mut records = Vec::new();
        let url = self.search_url();
        for collection in &plan.collection_ids {
            let params = search_params(collection, plan);
            debug!(collection = %collection, params = ?params, "OpenSearch query");
            let response: Value = self
                .core
                .api
                .json("search", |client| client.get(&url).query(&params))
                .await?;

            let features = response
                .get("features")
                .and_then(Value::as_array)
                .ok_or_else(|| FetchError::missing("features"))?;
            let returned = features.len() as u64;
            let matched = response
                .get("totalResults")
                .or_else(|| response.pointer("/properties/totalResults"))
                .and_then(Value::as_u64)
                .ok_or_else(|| FetchError::missing("totalResults"))?;
            check_too_many_matches(returned, matched)?;

            for feature in features {
                records.push(parse_feature(feature.clone(), collection)?);
            }
        }
        Ok(records)
    }

    async fn metadata_document(&self, session: &Session, product: &ProductRecord) -> FetchResult<Value> {
        let url = product
            .field(&["properties", "links", "alternates"])
            .and_then(|a| a.pointer("/0/href"))
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::missing("properties.links.alternates[0].href"))?;
        let text = self
            .core
            .api
            .text("metadata", |client| session.credential().apply(client.get(url)))
            .await?;
        if text.trim().is_empty() {
            return Err(FetchError::NotFound(format!("empty metadata document for {}", product.product_id())));
        }
        Ok(serde_json::from_str(&text).unwrap_or_else(|_| json!({"format": "xml", "content": text})))
    }
}

#[async_trait]
impl ProviderAdapter for EumdacAdapter {
    fn core(&self) -> &AdapterCore {
        &self.core
    }

    async fn authenticate(&self, previous: Option<&Session>) -> ProviderResult<Session> {
        if let Some(session) = Session::reusable(previous, Provider::Eumdac) {
            return Ok(session);
        }
        async {
            let credentials = self.core.credentials()?;
            let token_url = format!("{}/token", self.root);
            let token = client_credentials_grant(&self.core.api, &token_url, &credentials).await?;
            info!(provider = "eumdac", "Obtained access token");
            Ok::<_, FetchError>(token.into_session(Provider::Eumdac))
        }
        .await
        .during(Provider::Eumdac, "authenticate")
    }

    async fn query(&self, _session: &Session, request: &QueryRequest) -> ProviderResult<QueryResult> {
        let span = info_span!("query", provider = "eumdac", collection = %request.collection());
        async {
            let plan = self.core.plan(request)?;
            let records = self.search(&plan).await?;
            Ok::<_, FetchError>(self.core.finish_query(&plan, records))
        }
        .instrument(span)
        .await
        .during(Provider::Eumdac, "query")
    }

    async fn build_download_request(
        &self,
        session: &Session,
        product: &ProductRecord,
        dir: &Path,
        policy: ExistsPolicy,
    ) -> ProviderResult<TransferRequest> {
        let url = product
            .field(&["properties", "parentIdentifier"])
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::missing("properties.parentIdentifier"))
            .and_then(|collection| self.download_url(collection, product.provider_index()))
            .during(Provider::Eumdac, "build_download_request")?;
        Ok(TransferRequest::new(
            dir.join(product.product_id()),
            SourceLocator::new(url).with_credential(session.credential().clone()),
        )
        .with_compression(".zip")
        .with_exists_policy(policy)
        .with_label("eumdac"))
    }

    async fn fetch_metadata(&self, session: &Session, product: &ProductRecord) -> ProviderResult<Value> {
        self.metadata_document(session, product)
            .await
            .during(Provider::Eumdac, "fetch_metadata")
    }

    async fn fetch_preview(
        &self,
        session: &Session,
        product: &ProductRecord,
        dir: &Path,
    ) -> ProviderResult<PathBuf> {
        async {
            let url = product
                .field(&["properties", "links", "previews"])
                .and_then(|p| p.pointer("/0/href"))
                .and_then(Value::as_str)
                .ok_or_else(|| FetchError::NotFound(format!("quicklook link of {}", product.product_id())))?;
            let target = dir.join(preview_name(url).unwrap_or_else(|| format!("{}.jpeg", product.product_id())));
            self.core.save_file(url, session.credential(), target).await
        }
        .await
        .during(Provider::Eumdac, "fetch_preview")
    }
}

/// Query string of an OpenSearch request for one collection
pub fn search_params(collection: &str, plan: &QueryPlan) -> Vec<(&'static str, String)> {
    let mut params = vec![("format", "json".to_string()), ("pi", collection.to_string())];
    if let Some(start) = plan.time.start() {
        params.push(("dtstart", start.format("%Y-%m-%dT%H:%M:%SZ").to_string()));
    }
    if let Some(end) = plan.time.end() {
        params.push(("dtend", end.format("%Y-%m-%dT%H:%M:%SZ").to_string()));
    }
    match plan.geo.as_ref().map(|geo| (geo, geo.to_wkt())) {
        Some((_, Some(wkt))) => params.push(("geo", wkt)),
        Some((geo, None)) => warn!(?geo, "Data Store has no tile filter, ignoring tile constraint"),
        None => {}
    }
    params.push(("c", SEARCH_PAGE_SIZE.to_string()));
    params.push(("si", "0".to_string()));
    params
}

fn parse_feature(mut feature: Value, collection: &str) -> FetchResult<ProductRecord> {
    let id = str_field(&feature, "id")?.to_string();
    let properties = feature
        .get_mut("properties")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| FetchError::missing("properties"))?;
    properties
        .entry("parentIdentifier")
        .or_insert_with(|| Value::String(collection.to_string()));
    // "start/end" interval
    let start = properties
        .get("date")
        .and_then(Value::as_str)
        .and_then(|d| d.split('/').next())
        .map(|s| Value::String(s.to_string()));
    let date = parse_instant(start.as_ref(), "properties.date")?;
    Ok(ProductRecord::new(id.clone(), id, date, feature))
}

/// `<stem>.jpeg` from the second-to-last path segment of a preview URL
fn preview_name(url: &str) -> Option<String> {
    let mut segments = url.trim_end_matches('/').rsplit('/');
    segments.next()?;
    let stem = segments.next()?.split('.').next()?;
    (!stem.is_empty()).then(|| format!("{stem}.jpeg"))
}
