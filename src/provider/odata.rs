//! OData catalogues: Copernicus Data Space and CREODIAS
//!
//! Both providers expose the same OData product model behind different hosts
//! and identity realms, so the differences live in two static
//! [`OdataConfig`]s and one [`OdataAdapter`] serves both.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span, Instrument};

use super::keycloak::{password_grant, totp_now};
use super::{
    check_too_many_matches, parse_instant, str_field, AdapterContext, AdapterCore, FetchError,
    FetchResult, Provider, ProviderAdapter, ProviderResult, QueryPlan, QueryRequest, ResultExt,
    Session,
};
use crate::constraint::{GeoConstraint, NameConstraint, TileScheme};
use crate::product::{ProductRecord, QueryResult};
use crate::transfer::{ExistsPolicy, SourceLocator, TransferRequest};

/// Largest page the catalogue serves
pub const ODATA_TOP: usize = 1000;

/// Environment variable holding a CREODIAS TOTP secret when the credential store has none
pub const TOTP_SECRET_ENV: &str = "CREODIAS_TOTP";

/// Where product archives are served from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadRoute {
    /// `{catalogue}/Products({id})/$value`
    ProductValue,
    /// `{root}/{id}` on a separate download host
    Zipper(&'static str),
}

/// Per-provider constants of an OData catalogue
#[derive(Debug, Clone)]
pub struct OdataConfig {
    /// Provider served
    pub provider: Provider,
    /// OData service root
    pub catalogue_url: &'static str,
    /// Keycloak token endpoint
    pub token_url: &'static str,
    /// Keycloak client id
    pub client_id: &'static str,
    /// Credential-store host holding a TOTP secret, for realms requiring one
    pub totp_host: Option<&'static str>,
    /// Archive location
    pub download: DownloadRoute,
    /// Whether products expose a quicklook asset
    pub previews: bool,
}

/// Copernicus Data Space Ecosystem
pub static CDSE_CONFIG: OdataConfig = OdataConfig {
    provider: Provider::Cdse,
    catalogue_url: "https://catalogue.dataspace.copernicus.eu/odata/v1",
    token_url: "https://identity.dataspace.copernicus.eu/auth/realms/CDSE/protocol/openid-connect/token",
    client_id: "cdse-public",
    totp_host: None,
    download: DownloadRoute::ProductValue,
    previews: true,
};

/// CREODIAS
pub static CREODIAS_CONFIG: OdataConfig = OdataConfig {
    provider: Provider::Creodias,
    catalogue_url: "https://datahub.creodias.eu/odata/v1",
    token_url: "https://identity.cloudferro.com/auth/realms/Creodias-new/protocol/openid-connect/token",
    client_id: "CLOUDFERRO_PUBLIC",
    totp_host: Some("creodias.totp"),
    download: DownloadRoute::Zipper("https://zipper.creodias.eu/download"),
    previews: false,
};

/// Resolved URLs, either public or rooted under a stub server
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoints {
    catalogue: String,
    token: String,
    zipper: Option<String>,
}

impl Endpoints {
    fn new(config: &OdataConfig, base_url: Option<&str>) -> Self {
        match base_url {
            None => Self {
                catalogue: config.catalogue_url.to_string(),
                token: config.token_url.to_string(),
                zipper: match config.download {
                    DownloadRoute::ProductValue => None,
                    DownloadRoute::Zipper(root) => Some(root.to_string()),
                },
            },
            Some(base) => Self {
                catalogue: format!("{base}/odata/v1"),
                token: format!("{base}/token"),
                zipper: match config.download {
                    DownloadRoute::ProductValue => None,
                    DownloadRoute::Zipper(_) => Some(format!("{base}/download")),
                },
            },
        }
    }

    fn products(&self) -> String {
        format!("{}/Products", self.catalogue)
    }

    fn download(&self, id: &str) -> String {
        match &self.zipper {
            Some(root) => format!("{root}/{id}"),
            None => format!("{}/Products({id})/$value", self.catalogue),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProductPage {
    value: Vec<Value>,
    #[serde(rename = "@odata.count")]
    count: Option<u64>,
}

/// Adapter for OData catalogues
pub struct OdataAdapter {
    core: AdapterCore,
    config: &'static OdataConfig,
    endpoints: Endpoints,
}

impl OdataAdapter {
    /// Adapter for the catalogue described by `config`
    pub fn new(config: &'static OdataConfig, context: &AdapterContext) -> ProviderResult<Self> {
        let core = AdapterCore::new(config.provider, context)?;
        let endpoints = Endpoints::new(config, core.base_url());
        Ok(Self {
            core,
            config,
            endpoints,
        })
    }

    /// Catalogue constants
    pub fn config(&self) -> &'static OdataConfig {
        self.config
    }

    fn totp(&self) -> FetchResult<Option<String>> {
        let Some(host) = self.config.totp_host else {
            return Ok(None);
        };
        let secret = match self.core.credentials_for(host) {
            Ok(entry) => entry.secret,
            Err(missing) => std::env::var(TOTP_SECRET_ENV).map_err(|_| missing)?,
        };
        totp_now(&secret).map(Some)
    }

    async fn search(&self, plan: &QueryPlan) -> FetchResult<Vec<ProductRecord>> {
        let name = pushdown_name(plan);
        let mut records = Vec::new();
        for collection in &plan.collection_ids {
            let filter = build_filter(collection, plan, &name);
            debug!(collection = %collection, filter = %filter, "OData search");

            let url = self.endpoints.products();
            let params = [
                ("$filter", filter),
                ("$top", ODATA_TOP.to_string()),
                ("$count", "true".to_string()),
            ];
            let page: ProductPage = self
                .core
                .api
                .json("products", |client| client.get(&url).query(&params))
                .await?;

            let returned = page.value.len() as u64;
            let matched = page.count.ok_or_else(|| FetchError::missing("@odata.count"))?;
            check_too_many_matches(returned, matched)?;

            let items = if collection == "SENTINEL-2" {
                keep_latest_baseline(page.value)
            } else {
                page.value
            };
            for item in items {
                records.push(parse_product(item)?);
            }
        }
        Ok(records.into_iter().filter(|p| name.matches(p.product_id())).collect())
    }

    async fn expanded_metadata(&self, product: &ProductRecord) -> FetchResult<Value> {
        let url = self.endpoints.products();
        let filter = format!("Id eq '{}'", escape(product.provider_index()));
        let page: ProductPage = self
            .core
            .api
            .json("metadata", |client| {
                client
                    .get(&url)
                    .query(&[("$filter", filter.as_str()), ("$expand", "Attributes"), ("$expand", "Assets")])
            })
            .await?;
        page.value
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::NotFound(format!("product {}", product.product_id())))
    }
}

#[async_trait]
impl ProviderAdapter for OdataAdapter {
    fn core(&self) -> &AdapterCore {
        &self.core
    }

    async fn authenticate(&self, previous: Option<&Session>) -> ProviderResult<Session> {
        if let Some(session) = Session::reusable(previous, self.config.provider) {
            return Ok(session);
        }
        let provider = self.config.provider;
        let credentials = self.core.credentials().during(provider, "authenticate")?;
        let totp = self.totp().during(provider, "authenticate")?;
        let token = password_grant(
            &self.core.api,
            &self.endpoints.token,
            self.config.client_id,
            &credentials,
            totp.as_deref(),
        )
        .await
        .during(provider, "authenticate")?;
        info!(provider = %provider, user = %credentials.user, "Logged in");
        Ok(token.into_session(provider))
    }

    async fn query(&self, _session: &Session, request: &QueryRequest) -> ProviderResult<QueryResult> {
        let provider = self.config.provider;
        let span = info_span!("query", provider = %provider, collection = %request.collection());
        async {
            let plan = self.core.plan(request)?;
            let records = self.search(&plan).await?;
            Ok::<_, FetchError>(self.core.finish_query(&plan, records))
        }
        .instrument(span)
        .await
        .during(provider, "query")
    }

    async fn build_download_request(
        &self,
        session: &Session,
        product: &ProductRecord,
        dir: &Path,
        policy: ExistsPolicy,
    ) -> ProviderResult<TransferRequest> {
        let source = SourceLocator::new(self.endpoints.download(product.provider_index()))
            .with_credential(session.credential().clone());
        Ok(TransferRequest::new(dir.join(product.product_id()), source)
            .with_compression(".zip")
            .with_exists_policy(policy)
            .with_label(self.config.provider.table_name()))
    }

    async fn fetch_metadata(&self, _session: &Session, product: &ProductRecord) -> ProviderResult<Value> {
        self.expanded_metadata(product)
            .await
            .during(self.config.provider, "fetch_metadata")
    }

    async fn fetch_preview(
        &self,
        session: &Session,
        product: &ProductRecord,
        dir: &Path,
    ) -> ProviderResult<PathBuf> {
        let provider = self.config.provider;
        if !self.config.previews {
            return Err(FetchError::NotSupported("quicklook".to_string())).during(provider, "fetch_preview");
        }
        async {
            let metadata = self.expanded_metadata(product).await?;
            let link = metadata
                .get("Assets")
                .and_then(Value::as_array)
                .and_then(|assets| assets.first())
                .and_then(|asset| asset.get("DownloadLink"))
                .and_then(Value::as_str)
                .ok_or_else(|| FetchError::NotFound(format!("quicklook of {}", product.product_id())))?;
            let target = dir.join(format!("{}.jpeg", product.product_id()));
            self.core.save_file(link, session.credential(), target).await
        }
        .await
        .during(provider, "fetch_preview")
    }
}

/// Caller constraint plus what the geometry implies about names
fn pushdown_name(plan: &QueryPlan) -> NameConstraint {
    match &plan.geo {
        Some(GeoConstraint::TileCode { scheme: TileScheme::Mgrs, code }) => {
            plan.name.clone().contains(format!("_T{code}"))
        }
        _ => plan.name.clone(),
    }
}

/// OData `$filter` expression for one collection
pub fn build_filter(collection: &str, plan: &QueryPlan, name: &NameConstraint) -> String {
    let mut parts = vec![format!("Collection/Name eq '{}'", escape(collection))];

    if let Some(start) = plan.time.start() {
        parts.push(format!("ContentDate/Start gt {}", super::iso_millis(start)));
    }
    if let Some(end) = plan.time.end() {
        parts.push(format!("ContentDate/Start lt {}", super::iso_millis(end)));
    }
    if let Some(wkt) = plan.geo.as_ref().and_then(GeoConstraint::to_wkt) {
        parts.push(format!("OData.CSC.Intersects(area=geography'SRID=4326;{wkt}')"));
    }

    let mut prefixes: Vec<String> = name.prefixes().map(str::to_string).collect();
    let mut suffixes: Vec<String> = name.suffixes().map(str::to_string).collect();
    let mut contained: Vec<String> = name.contained().map(str::to_string).collect();
    for pattern in name.globs() {
        let (prefix, middle, suffix) = split_glob(pattern);
        prefixes.extend(prefix);
        contained.extend(middle);
        suffixes.extend(suffix);
    }
    for prefix in prefixes {
        parts.push(format!("startswith(Name, '{}')", escape(&prefix)));
    }
    for part in contained {
        parts.push(format!("contains(Name, '{}')", escape(&part)));
    }
    for suffix in suffixes {
        parts.push(format!("endswith(Name, '{}')", escape(&suffix)));
    }

    if let Some(cloud) = plan.cloud_cover {
        parts.push(format!(
            "Attributes/OData.CSC.DoubleAttribute/any(att:att/Name eq 'cloudCover' \
             and att/OData.CSC.DoubleAttribute/Value le {cloud})"
        ));
    }
    parts.join(" and ")
}

/// Literal fragments of a glob: leading, inner and trailing
///
/// Server-side prefilter only; the glob itself is still matched on the client.
pub fn split_glob(pattern: &str) -> (Option<String>, Vec<String>, Option<String>) {
    let fragments: Vec<&str> = pattern.split(['*', '?']).collect();
    if fragments.len() == 1 {
        // No wildcard: the whole name is known
        return (Some(pattern.to_string()), Vec::new(), Some(pattern.to_string()));
    }
    let first = fragments.first().filter(|f| !f.is_empty()).map(|f| f.to_string());
    let last = fragments.last().filter(|f| !f.is_empty()).map(|f| f.to_string());
    let middle = fragments[1..fragments.len() - 1]
        .iter()
        .filter(|f| !f.is_empty())
        .map(|f| f.to_string())
        .collect();
    (first, middle, last)
}

/// Keep only the most recent processing baseline of each Sentinel-2 product
///
/// Versions share the mission, product type, sensing time, orbit and tile
/// fields of the name; the greatest full name wins.
pub fn keep_latest_baseline(items: Vec<Value>) -> Vec<Value> {
    let mut latest: BTreeMap<String, Value> = BTreeMap::new();
    let mut passthrough = Vec::new();
    for item in items {
        let Some(name) = item.get("Name").and_then(Value::as_str).map(str::to_string) else {
            passthrough.push(item);
            continue;
        };
        let fields: Vec<&str> = name.split('_').collect();
        if fields.len() < 6 {
            passthrough.push(item);
            continue;
        }
        let ident = [0, 1, 2, 4, 5].map(|i| fields[i]).join("_");
        let newer = latest
            .get(&ident)
            .and_then(|kept| kept.get("Name").and_then(Value::as_str))
            .map_or(true, |kept| name.as_str() > kept);
        if newer {
            latest.insert(ident, item);
        }
    }
    latest.into_values().chain(passthrough).collect()
}

fn parse_product(item: Value) -> FetchResult<ProductRecord> {
    let name = str_field(&item, "Name")?.to_string();
    let id = str_field(&item, "Id")?.to_string();
    let date = parse_instant(item.get("ContentDate").and_then(|d| d.get("Start")), "ContentDate/Start")?;
    Ok(ProductRecord::new(name, id, date, item))
}

fn escape(literal: &str) -> String {
    literal.replace('\'', "''")
}
