//! CNES Geodes STAC catalogue
//!
//! Authentication is a static API key sent as `X-API-Key`; no token exchange.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info_span, Instrument};

use super::{
    check_too_many_matches, iso_millis, parse_instant, str_field, AdapterContext, AdapterCore,
    FetchError, FetchResult, Provider, ProviderAdapter, ProviderResult, QueryPlan, QueryRequest,
    ResultExt, Session,
};
use crate::constraint::{GeoConstraint, TileScheme};
use crate::product::{ProductRecord, QueryResult};
use crate::transfer::{
    compression_suffix, strip_compression_suffix, Credential, ExistsPolicy, SourceLocator,
    TransferRequest,
};

const SEARCH_URL: &str = "https://geodes-portal.cnes.fr/api/stac/search";

/// Page size of a STAC search
pub const STAC_LIMIT: usize = 500;

/// Products delivered as `.SAFE` folders
const SAFE_PREFIXES: [&str; 3] = ["S1A", "S2A", "S2B"];

/// Adapter for CNES Geodes
pub struct CnesAdapter {
    core: AdapterCore,
    search_url: String,
}

impl CnesAdapter {
    /// Build the adapter
    pub fn new(context: &AdapterContext) -> ProviderResult<Self> {
        let core = AdapterCore::new(Provider::Cnes, context)?;
        let search_url = match core.base_url() {
            Some(base) => format!("{base}/api/stac/search"),
            None => SEARCH_URL.to_string(),
        };
        Ok(Self { core, search_url })
    }

    async fn search(&self, session: &Session, body: &Value) -> FetchResult<Value> {
        let url = &self.search_url;
        self.core
            .api
            .json("stac_search", |client| {
                session.credential().apply(client.post(url.as_str())).json(body)
            })
            .await
    }
}

#[async_trait]
impl ProviderAdapter for CnesAdapter {
    fn core(&self) -> &AdapterCore {
        &self.core
    }

    async fn authenticate(&self, previous: Option<&Session>) -> ProviderResult<Session> {
        if let Some(session) = Session::reusable(previous, Provider::Cnes) {
            return Ok(session);
        }
        let credentials = self.core.credentials().during(Provider::Cnes, "authenticate")?;
        Ok(Session::new(
            Provider::Cnes,
            Credential::Header {
                name: "X-API-Key".to_string(),
                value: credentials.secret,
            },
            None,
        ))
    }

    async fn query(&self, session: &Session, request: &QueryRequest) -> ProviderResult<QueryResult> {
        let span = info_span!("query", provider = "cnes", collection = %request.collection());
        async {
            let plan = self.core.plan(request)?;
            let body = search_body(&plan);
            debug!(body = %body, "STAC search");

            let response = self.search(session, &body).await?;
            let returned = response
                .pointer("/context/returned")
                .and_then(Value::as_u64)
                .ok_or_else(|| FetchError::missing("context.returned"))?;
            let matched = response
                .pointer("/context/matched")
                .and_then(Value::as_u64)
                .ok_or_else(|| FetchError::missing("context.matched"))?;
            check_too_many_matches(returned, matched)?;

            let records = features(response)?
                .into_iter()
                .map(parse_feature)
                .collect::<FetchResult<Vec<_>>>()?;
            Ok::<_, FetchError>(self.core.finish_query(&plan, records))
        }
        .instrument(span)
        .await
        .during(Provider::Cnes, "query")
    }

    async fn build_download_request(
        &self,
        session: &Session,
        product: &ProductRecord,
        dir: &Path,
        policy: ExistsPolicy,
    ) -> ProviderResult<TransferRequest> {
        let (key, href) = archive_asset(product).during(Provider::Cnes, "build_download_request")?;
        let mut request = TransferRequest::new(
            dir.join(target_name(product.product_id(), &key)),
            SourceLocator::new(href).with_credential(session.credential().clone()),
        )
        .with_exists_policy(policy)
        .with_label("cnes");
        if let Some(suffix) = compression_suffix(&key) {
            request = request.with_compression(suffix);
        }
        Ok(request)
    }

    async fn fetch_metadata(&self, session: &Session, product: &ProductRecord) -> ProviderResult<Value> {
        async {
            let body = json!({
                "page": 1,
                "limit": 5,
                "query": {"identifier": {"contains": product.product_id()}},
            });
            let response = self.search(session, &body).await?;
            features(response)?
                .into_iter()
                .next()
                .and_then(|mut feature| feature.get_mut("properties").map(Value::take))
                .ok_or_else(|| FetchError::NotFound(format!("product {}", product.product_id())))
        }
        .await
        .during(Provider::Cnes, "fetch_metadata")
    }

    async fn fetch_preview(
        &self,
        session: &Session,
        product: &ProductRecord,
        dir: &Path,
    ) -> ProviderResult<PathBuf> {
        async {
            let (key, href) = assets(product)?
                .iter()
                .find_map(|(key, asset)| {
                    let href = asset.get("href").and_then(Value::as_str)?;
                    href.contains("quicklook").then(|| (key.clone(), href.to_string()))
                })
                .ok_or_else(|| FetchError::NotFound(format!("quicklook of {}", product.product_id())))?;
            let file_name = key.rsplit('/').next().unwrap_or(key.as_str());
            self.core
                .save_file(&href, session.credential(), dir.join(file_name))
                .await
        }
        .await
        .during(Provider::Cnes, "fetch_preview")
    }
}

/// STAC search body for a plan
pub fn search_body(plan: &QueryPlan) -> Value {
    let mut query = Map::new();
    query.insert("dataset".to_string(), json!({"in": plan.collection_ids}));
    if let Some(start) = plan.time.start() {
        query.insert("start_datetime".to_string(), json!({"gte": iso_millis(start)}));
    }
    if let Some(end) = plan.time.end() {
        query.insert("end_datetime".to_string(), json!({"lte": iso_millis(end)}));
    }
    if let Some(cloud) = plan.cloud_cover {
        query.insert("eo:cloud_cover".to_string(), json!({"lte": cloud}));
    }

    let mut body = json!({"page": 1, "limit": STAC_LIMIT});
    match &plan.geo {
        Some(GeoConstraint::TileCode { scheme: TileScheme::Mgrs, code }) => {
            query.insert("location".to_string(), json!(code));
        }
        Some(GeoConstraint::TileCode { scheme: TileScheme::Venus, code }) => {
            query.insert("grid:code".to_string(), json!({"contains": code}));
        }
        Some(geo) => {
            if let Some((lonmin, latmin, lonmax, latmax)) = geo.bounds() {
                body["bbox"] = json!([lonmin, latmin, lonmax, latmax]);
            }
        }
        None => {}
    }
    body["query"] = Value::Object(query);
    body
}

fn features(response: Value) -> FetchResult<Vec<Value>> {
    match response {
        Value::Object(mut map) => match map.remove("features") {
            Some(Value::Array(features)) => Ok(features),
            _ => Err(FetchError::missing("features")),
        },
        _ => Err(FetchError::missing("features")),
    }
}

fn parse_feature(feature: Value) -> FetchResult<ProductRecord> {
    let properties = feature
        .get("properties")
        .ok_or_else(|| FetchError::missing("properties"))?;
    let identifier = str_field(properties, "identifier")?.to_string();
    let date = parse_instant(properties.get("start_datetime"), "properties.start_datetime")?;
    let index = str_field(&feature, "id")?.to_string();
    Ok(ProductRecord::new(identifier, index, date, feature))
}

fn assets(product: &ProductRecord) -> FetchResult<&Map<String, Value>> {
    product
        .field(&["assets"])
        .and_then(Value::as_object)
        .ok_or_else(|| FetchError::missing("assets"))
}

/// The single compressed asset of a product
fn archive_asset(product: &ProductRecord) -> FetchResult<(String, String)> {
    let found: Vec<(String, String)> = assets(product)?
        .iter()
        .filter(|(key, _)| compression_suffix(key).is_some())
        .filter_map(|(key, asset)| {
            let href = asset.get("href").and_then(Value::as_str)?;
            Some((key.clone(), href.to_string()))
        })
        .collect();
    match found.len() {
        1 => Ok(found.into_iter().next().ok_or_else(|| FetchError::missing("assets"))?),
        0 => Err(FetchError::NotFound(format!(
            "no download link for product {}",
            product.product_id()
        ))),
        n => Err(FetchError::Parse(format!(
            "{n} archive assets for product {}, expected one",
            product.product_id()
        ))),
    }
}

/// Final path name for an archive asset
pub fn target_name(product_id: &str, asset_key: &str) -> String {
    let stem = strip_compression_suffix(asset_key);
    if SAFE_PREFIXES.iter().any(|p| product_id.starts_with(p)) && !stem.ends_with(".SAFE") {
        return format!("{stem}.SAFE");
    }
    stem.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::{NameConstraint, TimeRange};
    use chrono::{TimeZone, Utc};

    fn plan(geo: Option<GeoConstraint>) -> QueryPlan {
        QueryPlan {
            collection_ids: vec!["PEPS_S2_L1C".to_string()],
            time: TimeRange::parse(Some("2024-01-01"), Some("2024-01-31")).unwrap(),
            geo,
            name: NameConstraint::new(),
            cloud_cover: Some(30.0),
        }
    }

    #[test]
    fn test_search_body_bbox() {
        let body = search_body(&plan(Some(GeoConstraint::bbox(43.0, 44.0, 1.0, 2.0).unwrap())));
        assert_eq!(body["limit"], 500);
        assert_eq!(body["bbox"], json!([1.0, 43.0, 2.0, 44.0]));
        assert_eq!(body["query"]["dataset"]["in"], json!(["PEPS_S2_L1C"]));
        assert_eq!(body["query"]["start_datetime"]["gte"], "2024-01-01T00:00:00.000Z");
        assert_eq!(body["query"]["eo:cloud_cover"]["lte"], 30.0);
    }

    #[test]
    fn test_search_body_tiles() {
        let mgrs = search_body(&plan(Some(GeoConstraint::tile(TileScheme::Mgrs, "31TCJ"))));
        assert_eq!(mgrs["query"]["location"], "31TCJ");
        assert!(mgrs.get("bbox").is_none());

        let venus = search_body(&plan(Some(GeoConstraint::tile(TileScheme::Venus, "FR-LAM"))));
        assert_eq!(venus["query"]["grid:code"]["contains"], "FR-LAM");
    }

    #[test]
    fn test_target_name() {
        assert_eq!(
            target_name("S2A_MSIL1C_20240101", "S2A_MSIL1C_20240101.zip"),
            "S2A_MSIL1C_20240101.SAFE"
        );
        assert_eq!(target_name("S2B_X", "S2B_X.SAFE.zip"), "S2B_X.SAFE");
        assert_eq!(target_name("VENUS-XS_2020", "VENUS-XS_2020.tar.gz"), "VENUS-XS_2020");
    }

    #[test]
    fn test_archive_asset_selection() {
        let product = ProductRecord::new(
            "SENTINEL2A_20240101",
            "uuid-1",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            json!({"assets": {
                "SENTINEL2A_20240101.zip": {"href": "https://geodes/download/1"},
                "quicklook.jpg": {"href": "https://geodes/quicklook/1"}
            }}),
        );
        let (key, href) = archive_asset(&product).unwrap();
        assert_eq!(key, "SENTINEL2A_20240101.zip");
        assert_eq!(href, "https://geodes/download/1");

        let bare = ProductRecord::new("x", "y", Utc::now(), json!({"assets": {}}));
        assert_eq!(
            archive_asset(&bare).unwrap_err().kind(),
            crate::error::ErrorKind::NotFound
        );
    }

    #[test]
    fn test_parse_feature() {
        let record = parse_feature(json!({
            "id": "URN:FEATURE:1",
            "properties": {"identifier": "S2A_MSIL1C_X", "start_datetime": "2024-01-02T10:00:00Z"}
        }))
        .unwrap();
        assert_eq!(record.product_id(), "S2A_MSIL1C_X");
        assert_eq!(record.provider_index(), "URN:FEATURE:1");
    }
}
