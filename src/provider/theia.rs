//! CNES Theia resto catalogue

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span, Instrument};

use super::keycloak::authentication_failure;
use super::{
    check_too_many_matches, parse_instant, str_field, AdapterContext, AdapterCore, FetchError,
    FetchResult, Provider, ProviderAdapter, ProviderResult, QueryPlan, QueryRequest, ResultExt,
    Session,
};
use crate::constraint::{GeoConstraint, TileScheme};
use crate::product::{ProductRecord, QueryResult};
use crate::transfer::{Credential, ExistsPolicy, SourceLocator, TransferRequest};

const ROOT_URL: &str = "https://theia.cnes.fr/atdistrib";

/// Page size of a resto search
pub const RESTO_MAX_RECORDS: usize = 500;

/// Adapter for Theia
pub struct TheiaAdapter {
    core: AdapterCore,
    root: String,
}

impl TheiaAdapter {
    /// Build the adapter
    pub fn new(context: &AdapterContext) -> ProviderResult<Self> {
        let core = AdapterCore::new(Provider::Theia, context)?;
        let root = core.base_url().unwrap_or(ROOT_URL).to_string();
        Ok(Self { core, root })
    }

    fn search_url(&self, collection: &str) -> String {
        format!("{}/resto2/api/collections/{collection}/search.json", self.root)
    }

    fn download_url(&self, collection: &str, id: &str) -> String {
        format!(
            "{}/resto2/collections/{collection}/{id}/download/?issuerId=theia",
            self.root
        )
    }

    async fn search(&self, plan: &QueryPlan) -> FetchResult<Vec<ProductRecord>> {
        let mut records = Vec::new();
        for collection in &plan.collection_ids {
            let params = search_params(plan);
            debug!(collection = %collection, params = ?params, "Resto search");
            let url = self.search_url(collection);
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
                .pointer("/properties/totalResults")
                .and_then(Value::as_u64)
                .ok_or_else(|| FetchError::missing("properties.totalResults"))?;
            check_too_many_matches(returned, matched)?;

            for feature in features {
                records.push(parse_feature(feature.clone(), collection)?);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl ProviderAdapter for TheiaAdapter {
    fn core(&self) -> &AdapterCore {
        &self.core
    }

    async fn authenticate(&self, previous: Option<&Session>) -> ProviderResult<Session> {
        if let Some(session) = Session::reusable(previous, Provider::Theia) {
            return Ok(session);
        }
        async {
            let credentials = self.core.credentials()?;
            let url = format!("{}/services/authenticate/", self.root);
            let form = [
                ("ident", credentials.user.as_str()),
                ("pass", credentials.secret.as_str()),
            ];
            let token = self
                .core
                .api
                .text("authenticate", |client| client.post(&url).form(&form))
                .await
                .map_err(authentication_failure)?;
            let token = token.trim().to_string();
            if token.is_empty() {
                return Err(FetchError::Authentication("empty token returned".to_string()));
            }
            info!(provider = "theia", user = %credentials.user, "Logged in");
            Ok::<_, FetchError>(Session::new(Provider::Theia, Credential::Bearer(token), None))
        }
        .await
        .during(Provider::Theia, "authenticate")
    }

    async fn query(&self, _session: &Session, request: &QueryRequest) -> ProviderResult<QueryResult> {
        let span = info_span!("query", provider = "theia", collection = %request.collection());
        async {
            let plan = self.core.plan(request)?;
            let records = self.search(&plan).await?;
            Ok::<_, FetchError>(self.core.finish_query(&plan, records))
        }
        .instrument(span)
        .await
        .during(Provider::Theia, "query")
    }

    async fn build_download_request(
        &self,
        session: &Session,
        product: &ProductRecord,
        dir: &Path,
        policy: ExistsPolicy,
    ) -> ProviderResult<TransferRequest> {
        let collection = product
            .field(&["properties", "collection"])
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::missing("properties.collection"))
            .during(Provider::Theia, "build_download_request")?;
        let source = SourceLocator::new(self.download_url(collection, product.provider_index()))
            .with_credential(session.credential().clone());
        Ok(TransferRequest::new(dir.join(product.product_id()), source)
            .with_compression(".zip")
            .with_exists_policy(policy)
            .with_label("theia"))
    }

    async fn fetch_metadata(&self, _session: &Session, _product: &ProductRecord) -> ProviderResult<Value> {
        Err(FetchError::NotSupported("metadata".to_string())).during(Provider::Theia, "fetch_metadata")
    }

    async fn fetch_preview(
        &self,
        _session: &Session,
        _product: &ProductRecord,
        _dir: &Path,
    ) -> ProviderResult<PathBuf> {
        Err(FetchError::NotSupported("quicklook".to_string())).during(Provider::Theia, "fetch_preview")
    }
}

/// Query string of a resto search
pub fn search_params(plan: &QueryPlan) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if let Some(start) = plan.time.start() {
        params.push(("startDate", start.format("%Y-%m-%d").to_string()));
    }
    if let Some(end) = plan.time.end() {
        params.push(("completionDate", end.format("%Y-%m-%d").to_string()));
    }
    match &plan.geo {
        Some(GeoConstraint::TileCode { scheme: TileScheme::Mgrs, code }) => {
            let code = if code.starts_with('T') { code.clone() } else { format!("T{code}") };
            params.push(("location", code));
        }
        Some(GeoConstraint::TileCode { scheme: TileScheme::Venus, code }) => {
            params.push(("location", code.clone()));
        }
        Some(geo) => {
            if let Some((lonmin, latmin, lonmax, latmax)) = geo.bounds() {
                params.push(("box", format!("{lonmin},{latmin},{lonmax},{latmax}")));
            }
        }
        None => {}
    }
    if let Some(cloud) = plan.cloud_cover {
        params.push(("maxcloud", cloud.to_string()));
    }
    params.push(("maxRecords", RESTO_MAX_RECORDS.to_string()));
    params
}

fn parse_feature(mut feature: Value, collection: &str) -> FetchResult<ProductRecord> {
    let id = str_field(&feature, "id")?.to_string();
    let properties = feature
        .get_mut("properties")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| FetchError::missing("properties"))?;
    properties
        .entry("collection")
        .or_insert_with(|| Value::String(collection.to_string()));
    let name = properties
        .get("productIdentifier")
        .and_then(Value::as_str)
        .ok_or_else(|| FetchError::missing("properties.productIdentifier"))?
        .to_string();
    let date = parse_instant(properties.get("startDate"), "properties.startDate")?;
    Ok(ProductRecord::new(name, id, date, feature))
}
