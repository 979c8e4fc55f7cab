//! NASA Common Metadata Repository and Earthdata downloads
//!
//! Searching is anonymous. Granule downloads redirect through Earthdata
//! Login, which accepts basic authentication on every hop.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info_span, warn, Instrument};

use super::{
    check_too_many_matches, parse_instant, str_field, url_file_name, AdapterContext, AdapterCore,
    FetchError, FetchResult, Provider, ProviderAdapter, ProviderResult, QueryPlan, QueryRequest,
    ResultExt, Session,
};
use crate::constraint::GeoConstraint;
use crate::error::ErrorKind;
use crate::product::{ProductRecord, QueryResult};
use crate::transfer::{Credential, ExistsPolicy, SourceLocator, TransferRequest};

const CMR_URL: &str = "https://cmr.earthdata.nasa.gov";

/// Page size of a granule search
pub const CMR_PAGE_SIZE: usize = 1000;

/// Header carrying the total number of matching granules
const HITS_HEADER: &str = "CMR-Hits";

/// Adapter for NASA CMR
pub struct NasaAdapter {
    core: AdapterCore,
    search_url: String,
}

impl NasaAdapter {
    /// Build the adapter
    pub fn new(context: &AdapterContext) -> ProviderResult<Self> {
        let core = AdapterCore::new(Provider::Nasa, context)?;
        let search_url = format!("{}/search/granules", core.base_url().unwrap_or(CMR_URL));
        Ok(Self { core, search_url })
    }

    async fn search(&self, plan: &QueryPlan) -> FetchResult<Vec<ProductRecord>> {
        let mut records = Vec::new();
        for collection in &plan.collection_ids {
            let mut params = search_params(plan);
            params.push(("concept_id", collection.clone()));
            params.push(("page_size", CMR_PAGE_SIZE.to_string()));
            debug!(collection = %collection, params = ?params, "CMR search");

            let url = &self.search_url;
            let response = self
                .core
                .api
                .send("granules", |client| {
                    client.post(url.as_str()).query(&params).header(ACCEPT, "application/json")
                })
                .await?;
            let hits = response
                .headers()
                .get(HITS_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body: Value = response
                .json()
                .await
                .map_err(|e| FetchError::Parse(format!("granules: {e}")))?;

            let entries = body
                .pointer("/feed/entry")
                .and_then(Value::as_array)
                .ok_or_else(|| FetchError::missing("feed.entry"))?;
            let returned = entries.len() as u64;
            let hits = hits.ok_or_else(|| FetchError::missing(HITS_HEADER))?;
            check_too_many_matches(returned, hits)?;

            for entry in entries {
                records.push(parse_entry(entry.clone())?);
            }
        }
        Ok(records)
    }

    async fn metadata_document(&self, session: &Session, product: &ProductRecord) -> FetchResult<Value> {
        let links = links(product)?;
        let id = product.product_id();
        let url = links
            .iter()
            .filter_map(|link| link.get("href").and_then(Value::as_str))
            .find(|href| href.contains(id) && href.ends_with(".xml"))
            .ok_or_else(|| FetchError::NotFound(format!("metadata link of {id}")))?;
        let text = self
            .core
            .api
            .text("metadata", |client| session.credential().apply(client.get(url)))
            .await?;
        if text.trim().is_empty() {
            return Err(FetchError::NotFound(format!("empty metadata document for {id}")));
        }
        Ok(json!({"format": "xml", "content": text}))
    }
}

#[async_trait]
impl ProviderAdapter for NasaAdapter {
    fn core(&self) -> &AdapterCore {
        &self.core
    }

    async fn authenticate(&self, previous: Option<&Session>) -> ProviderResult<Session> {
        if let Some(session) = Session::reusable(previous, Provider::Nasa) {
            return Ok(session);
        }
        match self.core.credentials() {
            Ok(credentials) => Ok(Session::new(
                Provider::Nasa,
                Credential::Basic {
                    user: credentials.user,
                    password: credentials.secret,
                },
                None,
            )),
            Err(e) if e.kind() == ErrorKind::MissingCredentials => {
                debug!("No Earthdata credentials, searching anonymously");
                Ok(Session::anonymous(Provider::Nasa))
            }
            Err(e) => Err(e).during(Provider::Nasa, "authenticate"),
        }
    }

    async fn query(&self, _session: &Session, request: &QueryRequest) -> ProviderResult<QueryResult> {
        let span = info_span!("query", provider = "nasa", collection = %request.collection());
        async {
            let plan = self.core.plan(request)?;
            let records = self.search(&plan).await?;
            Ok::<_, FetchError>(self.core.finish_query(&plan, records))
        }
        .instrument(span)
        .await
        .during(Provider::Nasa, "query")
    }

    async fn build_download_request(
        &self,
        session: &Session,
        product: &ProductRecord,
        dir: &Path,
        policy: ExistsPolicy,
    ) -> ProviderResult<TransferRequest> {
        let url = links(product)
            .and_then(|links| find_link(links, product.product_id()))
            .during(Provider::Nasa, "build_download_request")?;
        let file_name = url_file_name(&url).unwrap_or(product.product_id()).to_string();
        Ok(TransferRequest::new(
            dir.join(file_name),
            SourceLocator::new(url).with_credential(session.credential().clone()),
        )
        .with_exists_policy(policy)
        .with_label("nasa"))
    }

    async fn fetch_metadata(&self, session: &Session, product: &ProductRecord) -> ProviderResult<Value> {
        self.metadata_document(session, product)
            .await
            .during(Provider::Nasa, "fetch_metadata")
    }

    async fn fetch_preview(
        &self,
        session: &Session,
        product: &ProductRecord,
        dir: &Path,
    ) -> ProviderResult<PathBuf> {
        async {
            let name = format!("{}.png", product.product_id());
            let url = find_link(links(product)?, &name)?;
            self.core.save_file(&url, session.credential(), dir.join(name)).await
        }
        .await
        .during(Provider::Nasa, "fetch_preview")
    }
}

/// Query string shared by every collection of a plan
pub fn search_params(plan: &QueryPlan) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if let Some(start) = plan.time.start() {
        let mut range = format!("{},", start.format("%Y-%m-%dT%H:%M:%SZ"));
        if let Some(end) = plan.time.end() {
            range.push_str(&end.format("%Y-%m-%dT%H:%M:%SZ").to_string());
        }
        params.push(("temporal", range));
    }
    match &plan.geo {
        Some(GeoConstraint::TileCode { scheme, code }) => {
            warn!(%scheme, code = %code, "CMR has no tile filter, ignoring tile constraint");
        }
        Some(geo) => {
            if let Some((lonmin, latmin, lonmax, latmax)) = geo.bounds() {
                params.push(("bounding_box", format!("{lonmin},{latmin},{lonmax},{latmax}")));
            }
        }
        None => {}
    }
    if let Some(cloud) = plan.cloud_cover {
        params.push(("cloud_cover", format!(",{cloud}")));
    }
    params
}

fn parse_entry(entry: Value) -> FetchResult<ProductRecord> {
    let product_id = match entry.get("producer_granule_id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => str_field(&entry, "title")?.to_string(),
    };
    let index = str_field(&entry, "id")?.to_string();
    let date = parse_instant(entry.get("time_start"), "time_start")?;
    Ok(ProductRecord::new(product_id, index, date, entry))
}

fn links(product: &ProductRecord) -> FetchResult<&Vec<Value>> {
    product
        .field(&["links"])
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::missing("links"))
}

/// Link titled `Download <name>`, else the first href mentioning `name`
fn find_link(links: &[Value], name: &str) -> FetchResult<String> {
    let title = format!("Download {name}");
    let by_title = links.iter().find(|link| {
        link.get("title")
            .and_then(Value::as_str)
            .is_some_and(|t| t.starts_with(&title))
    });
    by_title
        .or_else(|| {
            links.iter().find(|link| {
                link.get("href")
                    .and_then(Value::as_str)
                    .is_some_and(|href| href.contains(name))
            })
        })
        .and_then(|link| link.get("href").and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| FetchError::NotFound(format!("no link for {name}")))
}
