//! USGS Machine-to-Machine API
//!
//! Every M2M response wraps its payload as
//! `{"data": ..., "errorCode": ..., "errorMessage": ...}`; a null `data` or a
//! non-null `errorCode` is a failure even on HTTP 200.

use async_trait::async_trait;
use chrono::Local;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span, warn, Instrument};

use super::{
    check_too_many_matches, parse_instant, str_field, AdapterContext, AdapterCore, FetchError,
    FetchResult, Provider, ProviderAdapter, ProviderResult, QueryPlan, QueryRequest, ResultExt,
    Session,
};
use crate::constraint::{GeoConstraint, DEFAULT_POINT_EXTENT};
use crate::product::{ProductRecord, QueryResult};
use crate::transfer::{Credential, ExistsPolicy, SourceLocator, TransferRequest};

const M2M_URL: &str = "https://m2m.cr.usgs.gov/api/api/json/stable";

/// Largest scene-search page
pub const M2M_MAX_RESULTS: usize = 1000;

/// Lifetime of an M2M API key
const API_KEY_LIFETIME_SECS: i64 = 2 * 60 * 60;

/// Adapter for USGS M2M
pub struct UsgsAdapter {
    core: AdapterCore,
    root: String,
}

impl UsgsAdapter {
    /// Build the adapter
    pub fn new(context: &AdapterContext) -> ProviderResult<Self> {
        let core = AdapterCore::new(Provider::Usgs, context)?;
        let root = match core.base_url() {
            Some(base) => format!("{base}/api/json/stable"),
            None => M2M_URL.to_string(),
        };
        Ok(Self { core, root })
    }

    /// Call an M2M endpoint and unwrap its `data` payload
    async fn call(&self, session: Option<&Session>, endpoint: &'static str, body: &Value) -> FetchResult<Value> {
        let url = format!("{}/{endpoint}", self.root);
        let credential = session.map(Session::credential).cloned().unwrap_or_default();
        let response: Value = self
            .core
            .api
            .json(endpoint, |client| credential.apply(client.post(&url)).json(body))
            .await?;
        unwrap_data(response)
    }

    async fn search(&self, session: &Session, plan: &QueryPlan) -> FetchResult<Vec<ProductRecord>> {
        let mut records = Vec::new();
        for dataset in &plan.collection_ids {
            let body = scene_search_body(dataset, plan);
            debug!(dataset = %dataset, body = %body, "Scene search");
            let data = self.call(Some(session), "scene-search", &body).await?;

            let returned = data
                .get("recordsReturned")
                .and_then(Value::as_u64)
                .ok_or_else(|| FetchError::missing("data.recordsReturned"))?;
            let matched = data
                .get("totalHits")
                .and_then(Value::as_u64)
                .ok_or_else(|| FetchError::missing("data.totalHits"))?;
            check_too_many_matches(returned, matched)?;

            let results = data
                .get("results")
                .and_then(Value::as_array)
                .ok_or_else(|| FetchError::missing("data.results"))?;
            for scene in results {
                records.push(parse_scene(scene.clone(), dataset)?);
            }
        }
        Ok(records)
    }

    async fn download_url(&self, session: &Session, product: &ProductRecord) -> FetchResult<(String, Option<&'static str>)> {
        let dataset = product
            .field(&["datasetName"])
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::missing("datasetName"))?;
        let options = self
            .call(
                Some(session),
                "download-options",
                &json!({"entityIds": product.provider_index(), "datasetName": dataset}),
            )
            .await?;
        let options = options.as_array().cloned().unwrap_or_default();

        for option in options.iter().filter(|o| is_downloadable_bundle(o)) {
            let entity_id = str_field(option, "entityId")?;
            let option_id = option.get("id").cloned().unwrap_or(Value::Null);
            let body = json!({
                "label": Local::now().format("%Y%m%d_%H%M%S").to_string(),
                "downloads": [{"entityId": entity_id, "productId": option_id}],
            });
            let request = self.call(Some(session), "download-request", &body).await?;
            if request.get("numInvalidScenes").and_then(Value::as_u64).unwrap_or(0) != 0 {
                warn!(product = %product.product_id(), "Download request rejected the scene, trying next option");
                continue;
            }
            let url = request
                .pointer("/availableDownloads/0/url")
                .and_then(Value::as_str)
                .ok_or_else(|| FetchError::missing("availableDownloads[0].url"))?;
            let compression = match option.get("downloadSystem").and_then(Value::as_str) {
                Some("ls_zip") => Some(".tar"),
                _ => None,
            };
            return Ok((url.to_string(), compression));
        }

        let mut message = "No product immediately available.".to_string();
        if !options.is_empty() {
            message.push_str(" Your product is likely to be archived.");
        }
        Err(FetchError::NotFound(message))
    }
}

#[async_trait]
impl ProviderAdapter for UsgsAdapter {
    fn core(&self) -> &AdapterCore {
        &self.core
    }

    async fn authenticate(&self, previous: Option<&Session>) -> ProviderResult<Session> {
        if let Some(session) = Session::reusable(previous, Provider::Usgs) {
            return Ok(session);
        }
        async {
            let credentials = self.core.credentials()?;
            let body = json!({"username": credentials.user, "token": credentials.secret});
            let key = self
                .call(None, "login-token", &body)
                .await
                .map_err(|e| match e {
                    FetchError::Http { .. } | FetchError::Parse(_) => {
                        FetchError::Authentication(e.to_string())
                    }
                    other => other,
                })?;
            let key = key
                .as_str()
                .ok_or_else(|| FetchError::Authentication("login returned no API key".to_string()))?;
            info!(provider = "usgs", user = %credentials.user, "Logged in");
            Ok::<_, FetchError>(Session::expiring_in(
                Provider::Usgs,
                Credential::Header {
                    name: "X-Auth-Token".to_string(),
                    value: key.to_string(),
                },
                API_KEY_LIFETIME_SECS,
            ))
        }
        .await
        .during(Provider::Usgs, "authenticate")
    }

    async fn query(&self, session: &Session, request: &QueryRequest) -> ProviderResult<QueryResult> {
        let span = info_span!("query", provider = "usgs", collection = %request.collection());
        async {
            let plan = self.core.plan(request)?;
            let records = self.search(session, &plan).await?;
            Ok::<_, FetchError>(self.core.finish_query(&plan, records))
        }
        .instrument(span)
        .await
        .during(Provider::Usgs, "query")
    }

    async fn build_download_request(
        &self,
        session: &Session,
        product: &ProductRecord,
        dir: &Path,
        policy: ExistsPolicy,
    ) -> ProviderResult<TransferRequest> {
        let (url, compression) = self
            .download_url(session, product)
            .await
            .during(Provider::Usgs, "build_download_request")?;
        let mut request = TransferRequest::new(
            dir.join(product.product_id()),
            SourceLocator::new(url).with_credential(session.credential().clone()),
        )
        .with_exists_policy(policy)
        .with_label("usgs");
        if let Some(suffix) = compression {
            request = request.with_compression(suffix);
        }
        Ok(request)
    }

    async fn fetch_metadata(&self, _session: &Session, product: &ProductRecord) -> ProviderResult<Value> {
        metadata_fields(product).during(Provider::Usgs, "fetch_metadata")
    }

    async fn fetch_preview(
        &self,
        session: &Session,
        product: &ProductRecord,
        dir: &Path,
    ) -> ProviderResult<PathBuf> {
        async {
            let url = product
                .field(&["browse"])
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|b| b.get("browsePath").and_then(Value::as_str))
                .find(|path| path.contains("type=refl"))
                .ok_or_else(|| FetchError::NotFound(format!("quicklook of {}", product.product_id())))?;
            let target = dir.join(format!("{}.png", product.product_id()));
            self.core.save_file(url, session.credential(), target).await
        }
        .await
        .during(Provider::Usgs, "fetch_preview")
    }
}

/// `data` of an M2M envelope, or the error it reports
pub fn unwrap_data(mut response: Value) -> FetchResult<Value> {
    let message = response
        .get("errorMessage")
        .and_then(Value::as_str)
        .unwrap_or("no error message")
        .to_string();
    if let Some(code) = response.get("errorCode").and_then(Value::as_str) {
        if code.starts_with("AUTH") {
            return Err(FetchError::Authentication(format!("{code}: {message}")));
        }
        return Err(FetchError::Parse(format!("M2M error {code}: {message}")));
    }
    match response.get_mut("data").map(Value::take) {
        Some(Value::Null) | None => Err(FetchError::Parse(format!("M2M returned no data: {message}"))),
        Some(data) => Ok(data),
    }
}

/// Body of a scene-search request
pub fn scene_search_body(dataset: &str, plan: &QueryPlan) -> Value {
    let mut acquisition = Map::new();
    if let Some(start) = plan.time.start() {
        acquisition.insert("start".into(), json!(start.format("%Y-%m-%dT%H:%M:%S").to_string()));
    }
    if let Some(end) = plan.time.end() {
        acquisition.insert("end".into(), json!(end.format("%Y-%m-%dT%H:%M:%S").to_string()));
    }

    let mut scene_filter = Map::new();
    scene_filter.insert("acquisitionFilter".into(), Value::Object(acquisition));
    match &plan.geo {
        Some(GeoConstraint::TileCode { scheme, code }) => {
            warn!(%scheme, code = %code, "M2M has no tile filter, ignoring tile constraint");
        }
        Some(geo) => {
            // A degenerate rectangle matches nothing
            if let Some((lonmin, latmin, lonmax, latmax)) = geo.expand(DEFAULT_POINT_EXTENT).bounds() {
                scene_filter.insert(
                    "spatialFilter".into(),
                    json!({
                        "filterType": "mbr",
                        "lowerLeft": {"latitude": latmin, "longitude": lonmin},
                        "upperRight": {"latitude": latmax, "longitude": lonmax},
                    }),
                );
            }
        }
        None => {}
    }
    if let Some(cloud) = plan.cloud_cover {
        scene_filter.insert(
            "cloudCoverFilter".into(),
            json!({"min": 0, "max": cloud, "includeUnknown": false}),
        );
    }

    json!({
        "datasetName": dataset,
        "sceneFilter": scene_filter,
        "maxResults": M2M_MAX_RESULTS,
        "metadataType": "full",
    })
}

fn parse_scene(mut scene: Value, dataset: &str) -> FetchResult<ProductRecord> {
    let display_id = str_field(&scene, "displayId")?.to_string();
    let entity_id = str_field(&scene, "entityId")?.to_string();
    let date = parse_instant(scene.pointer("/temporalCoverage/startDate"), "temporalCoverage.startDate")?;
    if let Some(object) = scene.as_object_mut() {
        object
            .entry("datasetName")
            .or_insert_with(|| Value::String(dataset.to_string()));
    }
    Ok(ProductRecord::new(display_id, entity_id, date, scene))
}

/// Available bundle delivered as an archive or a folder
fn is_downloadable_bundle(option: &Value) -> bool {
    let available = option.get("available").and_then(Value::as_bool).unwrap_or(false);
    let is_bundle = option
        .get("productName")
        .and_then(Value::as_str)
        .is_some_and(|name| name.contains("Bundle"))
        || option
            .get("secondaryDownloads")
            .and_then(Value::as_array)
            .is_some_and(|d| d.len() > 1);
    let archive_or_folder = matches!(
        option.get("downloadSystem").and_then(Value::as_str),
        Some("ls_zip" | "folder")
    );
    available && is_bundle && archive_or_folder
}

/// `fieldName -> value` map of the full scene metadata
fn metadata_fields(product: &ProductRecord) -> FetchResult<Value> {
    let fields = product
        .field(&["metadata"])
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::missing("metadata"))?;
    let map: Map<String, Value> = fields
        .iter()
        .filter_map(|m| {
            let name = m.get("fieldName").and_then(Value::as_str)?;
            Some((name.to_string(), m.get("value").cloned().unwrap_or(Value::Null)))
        })
        .collect();
    Ok(Value::Object(map))
}
