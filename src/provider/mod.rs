//! Provider adapters
//!
//! One adapter per data provider, all behind [`ProviderAdapter`]. Adapters
//! translate a [`QueryRequest`] into the provider's wire query, turn results
//! into [`ProductRecord`]s and describe downloads as [`TransferRequest`]s that
//! the shared [`TransferEngine`] executes.

pub mod cnes;
pub mod credentials;
pub mod eumdac;
pub mod google;
pub mod http;
pub mod keycloak;
pub mod nasa;
pub mod odata;
pub mod theia;
pub mod usgs;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::BoxFuture;
use futures_util::{stream, StreamExt};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::constraint::{
    normalize_geo, ConstraintError, GeoConstraint, LonConvention, NameConstraint, TimeRange,
};
use crate::error::ErrorKind;
use crate::metrics::record_query;
use crate::product::{ProductRecord, QueryResult};
use crate::registry::{CollectionResolver, ReferenceSource, RegistryError};
use crate::shutdown::SharedShutdown;
use crate::transfer::{
    Credential, CredentialRefresher, ExistsPolicy, SourceLocator, TransferConfig, TransferEngine,
    TransferError, TransferObserver, TransferOutcome, TransferRequest, TransferResult,
};

pub use credentials::{
    CredentialError, CredentialProvider, Credentials, NetrcCredentials, StaticCredentials,
};
pub use http::ApiClient;

/// Sessions are refreshed this long before the provider says they expire
const SESSION_EXPIRY_MARGIN_SECS: i64 = 30;

/// Default download parallelism of [`ProviderAdapter::download_all`]
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Supported data providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// Copernicus Data Space Ecosystem
    Cdse,
    /// CREODIAS
    Creodias,
    /// CNES Geodes
    Cnes,
    /// CNES Theia
    Theia,
    /// NASA CMR / Earthdata
    Nasa,
    /// USGS Machine-to-Machine API
    Usgs,
    /// EUMETSAT Data Access
    Eumdac,
    /// Google Earth Engine
    GoogleEe,
}

impl Provider {
    /// Every provider
    pub const ALL: [Provider; 8] = [
        Provider::Cdse,
        Provider::Creodias,
        Provider::Cnes,
        Provider::Theia,
        Provider::Nasa,
        Provider::Usgs,
        Provider::Eumdac,
        Provider::GoogleEe,
    ];

    /// Key of the provider's collection table
    pub fn table_name(&self) -> &'static str {
        match self {
            Provider::Cdse => "cdse",
            Provider::Creodias => "creodias",
            Provider::Cnes => "cnes",
            Provider::Theia => "theia",
            Provider::Nasa => "nasa",
            Provider::Usgs => "usgs",
            Provider::Eumdac => "eumdac",
            Provider::GoogleEe => "google",
        }
    }

    /// Host the credential store is queried with
    pub fn credential_host(&self) -> &'static str {
        match self {
            Provider::Cdse => "dataspace.copernicus.eu",
            Provider::Creodias => "datahub.creodias.eu",
            Provider::Cnes => "geodes.cnes.fr",
            Provider::Theia => "theia.cnes.fr",
            Provider::Nasa => "urs.earthdata.nasa.gov",
            Provider::Usgs => "usgs.gov",
            Provider::Eumdac => "data.eumetsat.int",
            Provider::GoogleEe => "google.com",
        }
    }

    /// Longitude convention of the provider's query geometry
    pub fn lon_convention(&self) -> LonConvention {
        LonConvention::Centered0
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cdse" | "copernicus" | "dataspace" => Ok(Provider::Cdse),
            "creodias" => Ok(Provider::Creodias),
            "cnes" | "geodes" => Ok(Provider::Cnes),
            "theia" => Ok(Provider::Theia),
            "nasa" | "cmr" | "earthdata" => Ok(Provider::Nasa),
            "usgs" | "m2m" => Ok(Provider::Usgs),
            "eumdac" | "eumetsat" => Ok(Provider::Eumdac),
            "google" | "google_ee" | "gee" => Ok(Provider::GoogleEe),
            other => Err(format!(
                "Unknown provider '{}'. Expected one of: {}",
                other,
                Provider::ALL.map(|p| p.table_name()).join(", ")
            )),
        }
    }
}

/// Authenticated state threaded through adapter calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    provider: Provider,
    credential: Credential,
    expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Session without credential
    pub fn anonymous(provider: Provider) -> Self {
        Self {
            provider,
            credential: Credential::None,
            expires_at: None,
        }
    }

    /// Session carrying `credential`; `None` expiry means it never expires
    pub fn new(provider: Provider, credential: Credential, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            provider,
            credential,
            expires_at,
        }
    }

    /// Session whose credential expires `seconds` from now
    pub fn expiring_in(provider: Provider, credential: Credential, seconds: i64) -> Self {
        Self::new(provider, credential, Some(Utc::now() + ChronoDuration::seconds(seconds)))
    }

    /// Provider the session belongs to
    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Credential attached to requests
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Expiry instant, if the provider reported one
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether the session can still be used
    pub fn is_valid(&self) -> bool {
        match self.expires_at {
            None => true,
            Some(expiry) => Utc::now() + ChronoDuration::seconds(SESSION_EXPIRY_MARGIN_SECS) < expiry,
        }
    }

    /// Whether `previous` can be reused for `provider`
    pub fn reusable(previous: Option<&Session>, provider: Provider) -> Option<Session> {
        previous
            .filter(|s| s.provider == provider && s.is_valid())
            .cloned()
    }
}

/// Query parameters in the shared vocabulary
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    collection: String,
    level: u8,
    time: TimeRange,
    geo: Option<GeoConstraint>,
    name: NameConstraint,
    cloud_cover: Option<f64>,
    raw_collections: Option<Vec<String>>,
}

impl QueryRequest {
    /// Query `collection` at processing `level`
    pub fn new(collection: impl Into<String>, level: u8) -> Self {
        Self {
            collection: collection.into(),
            level,
            time: TimeRange::unbounded(),
            geo: None,
            name: NameConstraint::new(),
            cloud_cover: None,
            raw_collections: None,
        }
    }

    /// Restrict sensing time
    pub fn with_time(mut self, time: TimeRange) -> Self {
        self.time = time;
        self
    }

    /// Restrict location
    pub fn with_geo(mut self, geo: GeoConstraint) -> Self {
        self.geo = Some(geo);
        self
    }

    /// Restrict product names
    pub fn with_name(mut self, name: NameConstraint) -> Self {
        self.name = name;
        self
    }

    /// Maximum cloud cover in percent
    pub fn with_cloud_cover(mut self, percent: f64) -> Self {
        self.cloud_cover = Some(percent);
        self
    }

    /// Query these provider collection ids instead of resolving the name
    pub fn with_raw_collections<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.raw_collections = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Generic collection name
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Processing level
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Time constraint
    pub fn time(&self) -> &TimeRange {
        &self.time
    }

    /// Geometry constraint
    pub fn geo(&self) -> Option<&GeoConstraint> {
        self.geo.as_ref()
    }

    /// Name constraint supplied by the caller
    pub fn name(&self) -> &NameConstraint {
        &self.name
    }

    /// Cloud cover ceiling
    pub fn cloud_cover(&self) -> Option<f64> {
        self.cloud_cover
    }

    /// Raw collection override
    pub fn raw_collections(&self) -> Option<&[String]> {
        self.raw_collections.as_deref()
    }
}

/// A [`QueryRequest`] resolved against the provider's reference tables
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// Provider collection ids, queried in order
    pub collection_ids: Vec<String>,
    /// Time window with mission bounds filled in
    pub time: TimeRange,
    /// Geometry in the provider's longitude convention
    pub geo: Option<GeoConstraint>,
    /// Caller constraint merged with the collection's implied names
    pub name: NameConstraint,
    /// Cloud cover ceiling
    pub cloud_cover: Option<f64>,
}

impl QueryPlan {
    /// Resolve the collection, merge names, bound time and normalize geometry
    pub fn prepare(
        resolver: &CollectionResolver,
        request: &QueryRequest,
        convention: LonConvention,
    ) -> FetchResult<Self> {
        let mut name = request.name().clone();
        let collection_ids = match request.raw_collections() {
            Some(ids) => ids.to_vec(),
            None => {
                let record = resolver.resolve(request.collection(), request.level())?;
                name.add(&record.name_constraint());
                record.provider_collection_ids().to_vec()
            }
        };

        let time = match resolver.sensors().resolve_time(request.collection(), request.time()) {
            Ok(time) => time,
            // Raw collections may name a sensor with no lifetime record, but
            // then the caller has to bound the window on both sides
            Err(RegistryError::UnknownSensor(sensor))
                if request.raw_collections().is_some()
                    && request.time().start().is_some()
                    && request.time().end().is_some() =>
            {
                warn!(sensor = %sensor, "No sensor record, using the time window as given");
                *request.time()
            }
            Err(e) => return Err(e.into()),
        };

        let geo = match request.geo() {
            Some(geo) => {
                geo.validate()?;
                Some(normalize_geo(geo, convention))
            }
            None => None,
        };

        debug!(
            collections = ?collection_ids,
            start = ?time.start(),
            end = ?time.end(),
            "Prepared query"
        );

        Ok(Self {
            collection_ids,
            time,
            geo,
            name,
            cloud_cover: request.cloud_cover(),
        })
    }
}

/// Everything an adapter needs from its caller
#[derive(Clone)]
pub struct AdapterContext {
    /// Credential store
    pub credentials: Arc<dyn CredentialProvider>,
    /// Reference tables
    pub reference: ReferenceSource,
    /// Transfer engine tunables
    pub transfer: TransferConfig,
    /// Retries of catalogue and token requests
    pub max_retries: u32,
    /// Root every provider endpoint under this URL instead of the public hosts
    pub base_url: Option<String>,
    /// Cancellation handle shared with the engine
    pub shutdown: Option<SharedShutdown>,
    /// Progress sink for transfers
    pub observer: Option<Arc<dyn TransferObserver>>,
}

impl AdapterContext {
    /// Context over `credentials` with embedded tables and default tunables
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            credentials,
            reference: ReferenceSource::Embedded,
            transfer: TransferConfig::default(),
            max_retries: crate::transfer::config::MAX_RETRIES,
            base_url: None,
            shutdown: None,
            observer: None,
        }
    }

    /// Context backed by `$NETRC` or `~/.netrc`
    pub fn from_env() -> Result<Self, CredentialError> {
        Ok(Self::new(Arc::new(NetrcCredentials::from_env()?)))
    }

    /// Read tables from `reference`
    pub fn with_reference(mut self, reference: ReferenceSource) -> Self {
        self.reference = reference;
        self
    }

    /// Transfer tunables
    pub fn with_transfer_config(mut self, config: TransferConfig) -> Self {
        self.transfer = config;
        self
    }

    /// Retries of catalogue and token requests
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Send every request to `base_url` (stub servers)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    /// Cancel transfers on `shutdown`
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Report transfer progress to `observer`
    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

impl fmt::Debug for AdapterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterContext")
            .field("reference", &self.reference)
            .field("transfer", &self.transfer)
            .field("max_retries", &self.max_retries)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// State shared by every adapter
pub struct AdapterCore {
    /// Provider served
    pub provider: Provider,
    /// Catalogue and token client
    pub api: ApiClient,
    /// Collection resolver over the provider table
    pub resolver: CollectionResolver,
    /// Transfer engine for downloads and previews
    pub engine: TransferEngine,
    credentials: Arc<dyn CredentialProvider>,
    base_url: Option<String>,
}

impl AdapterCore {
    /// Load the provider table and wire the shared clients
    pub fn new(provider: Provider, context: &AdapterContext) -> ProviderResult<Self> {
        let resolver = CollectionResolver::load(provider.table_name(), &context.reference)
            .during(provider, "load")?;
        let mut engine = TransferEngine::new(context.transfer.clone());
        if let Some(shutdown) = &context.shutdown {
            engine = engine.with_shutdown(shutdown.clone());
        }
        if let Some(observer) = &context.observer {
            engine = engine.with_observer(observer.clone());
        }
        Ok(Self {
            provider,
            api: ApiClient::new(
                provider,
                context.transfer.clone().with_max_retries(context.max_retries),
            ),
            resolver,
            engine,
            credentials: context.credentials.clone(),
            base_url: context.base_url.clone(),
        })
    }

    /// Base URL override, if any
    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    /// Credentials for `host`
    pub fn credentials_for(&self, host: &str) -> FetchResult<Credentials> {
        Ok(self.credentials.credentials(host)?)
    }

    /// Credentials for the provider's own host
    pub fn credentials(&self) -> FetchResult<Credentials> {
        self.credentials_for(self.provider.credential_host())
    }

    /// Prepare a [`QueryPlan`] for `request`
    pub fn plan(&self, request: &QueryRequest) -> FetchResult<QueryPlan> {
        QueryPlan::prepare(&self.resolver, request, self.provider.lon_convention())
    }

    /// Apply the merged name constraint, sort and record the query
    pub fn finish_query(&self, plan: &QueryPlan, products: Vec<ProductRecord>) -> QueryResult {
        let fetched = products.len();
        let result: QueryResult = products
            .into_iter()
            .filter(|p| plan.name.matches(p.product_id()))
            .collect();
        info!(
            provider = %self.provider,
            fetched,
            kept = result.len(),
            "Query completed"
        );
        record_query(self.provider.table_name(), "query", result.len());
        result
    }

    /// Fetch a small auxiliary file (quicklook) into `target`, overwriting it
    pub async fn save_file(
        &self,
        url: &str,
        credential: &Credential,
        target: PathBuf,
    ) -> FetchResult<PathBuf> {
        let request = TransferRequest::new(
            target,
            SourceLocator::new(url).with_credential(credential.clone()),
        )
        .with_exists_policy(ExistsPolicy::Overwrite)
        .with_label(self.provider.table_name());
        let outcome = self.engine.execute(request, None).await?;
        Ok(outcome.path)
    }
}

/// Error raised inside an adapter, before provider context is attached
#[derive(Debug, Error)]
pub enum FetchError {
    /// Reference table failure
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Malformed constraint
    #[error(transparent)]
    Constraint(#[from] ConstraintError),

    /// Transfer failure
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Credential store failure
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    /// Provider rejected the credentials
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Response was truncated by the provider
    #[error("query matched {matched} products but only {returned} were returned; narrow the time or area")]
    TooManyMatches {
        /// Records in the response
        returned: u64,
        /// Records the provider says match
        matched: u64,
    },

    /// Non-success HTTP status from a catalogue endpoint
    #[error("HTTP {status} from {url}: {message}")]
    Http {
        /// Status code
        status: u16,
        /// Request URL
        url: String,
        /// Response body or reason
        message: String,
    },

    /// Transport failure after retries
    #[error("network error contacting {url}: {message}")]
    Network {
        /// Request URL
        url: String,
        /// Transport message
        message: String,
    },

    /// Unexpected payload shape
    #[error("unexpected response: {0}")]
    Parse(String),

    /// Operation not offered
    #[error("{0} is not supported")]
    NotSupported(String),

    /// Requested item does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A product id matched more than one product
    #[error("{product_id} matches {} products: {}", matches.len(), matches.join(", "))]
    AmbiguousProduct {
        /// Requested id
        product_id: String,
        /// Ids of every match
        matches: Vec<String>,
    },

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Fieldless classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Registry(e) => e.kind(),
            FetchError::Constraint(e) => e.kind(),
            FetchError::Transfer(e) => e.kind(),
            FetchError::Credentials(CredentialError::Missing { .. }) => ErrorKind::MissingCredentials,
            FetchError::Credentials(CredentialError::Unreadable { .. }) => ErrorKind::Io,
            FetchError::Authentication(_) => ErrorKind::AuthenticationError,
            FetchError::TooManyMatches { .. } => ErrorKind::TooManyMatches,
            FetchError::Http { status, .. } => match status {
                401 | 403 => ErrorKind::AuthenticationError,
                404 => ErrorKind::NotFound,
                429 | 500..=599 => ErrorKind::TransientServerError,
                _ => ErrorKind::PermanentClientError,
            },
            FetchError::Network { .. } => ErrorKind::TransientServerError,
            FetchError::Parse(_) => ErrorKind::Parse,
            FetchError::NotSupported(_) => ErrorKind::NotSupported,
            FetchError::NotFound(_) => ErrorKind::NotFound,
            FetchError::AmbiguousProduct { .. } => ErrorKind::AmbiguousProduct,
            FetchError::Io(_) => ErrorKind::Io,
        }
    }

    /// Missing JSON field
    pub fn missing(field: &str) -> Self {
        FetchError::Parse(format!("missing or invalid field '{field}'"))
    }
}

/// Result type inside adapters
pub type FetchResult<T> = Result<T, FetchError>;

/// Failure surfaced by an adapter, tagged with provider and operation
#[derive(Debug, Error)]
#[error("{provider} {operation} failed: {source}")]
pub struct ProviderError {
    /// Provider that failed
    pub provider: Provider,
    /// Operation name
    pub operation: &'static str,
    /// Underlying failure
    pub source: FetchError,
}

impl ProviderError {
    /// Tag `source` with provider and operation
    pub fn new(provider: Provider, operation: &'static str, source: impl Into<FetchError>) -> Self {
        Self {
            provider,
            operation,
            source: source.into(),
        }
    }

    /// Fieldless classification
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    /// Whether the failure is a normal outcome (`NotSupported`, `NotFound`)
    pub fn is_expected(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotSupported | ErrorKind::NotFound)
    }
}

/// Result type of adapter operations
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Attach provider and operation to adapter-internal errors
pub trait ResultExt<T> {
    /// Tag the error side
    fn during(self, provider: Provider, operation: &'static str) -> ProviderResult<T>;
}

impl<T, E: Into<FetchError>> ResultExt<T> for Result<T, E> {
    fn during(self, provider: Provider, operation: &'static str) -> ProviderResult<T> {
        self.map_err(|e| ProviderError::new(provider, operation, e))
    }
}

/// Fail when the provider returned fewer records than it matched
pub fn check_too_many_matches(returned: u64, matched: u64) -> FetchResult<()> {
    if returned < matched {
        return Err(FetchError::TooManyMatches { returned, matched });
    }
    Ok(())
}

/// Result of one download in [`ProviderAdapter::download_all`]
#[derive(Debug)]
pub struct DownloadReport {
    /// Product downloaded
    pub product_id: String,
    /// Outcome
    pub result: ProviderResult<TransferOutcome>,
}

/// Provider adapter contract
///
/// Unsupported operations fail with a [`FetchError::NotSupported`] kind
/// instead of being absent.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Shared adapter state
    fn core(&self) -> &AdapterCore;

    /// Provider served
    fn provider(&self) -> Provider {
        self.core().provider
    }

    /// Collection resolver of this provider
    fn resolver(&self) -> &CollectionResolver {
        &self.core().resolver
    }

    /// Obtain a session; a still-valid `previous` is returned without a network call
    async fn authenticate(&self, previous: Option<&Session>) -> ProviderResult<Session>;

    /// Search the catalogue
    async fn query(&self, session: &Session, request: &QueryRequest) -> ProviderResult<QueryResult>;

    /// Describe how to download `product` into `dir`
    async fn build_download_request(
        &self,
        session: &Session,
        product: &ProductRecord,
        dir: &Path,
        policy: ExistsPolicy,
    ) -> ProviderResult<TransferRequest>;

    /// Full metadata document of `product`
    async fn fetch_metadata(
        &self,
        session: &Session,
        product: &ProductRecord,
    ) -> ProviderResult<serde_json::Value>;

    /// Download the quicklook of `product` into `dir`
    async fn fetch_preview(
        &self,
        session: &Session,
        product: &ProductRecord,
        dir: &Path,
    ) -> ProviderResult<PathBuf>;

    /// Download `product` into `dir`, re-authenticating once on auth failure
    async fn download(
        &self,
        session: &Session,
        product: &ProductRecord,
        dir: &Path,
        policy: ExistsPolicy,
    ) -> ProviderResult<TransferOutcome> {
        let request = self.build_download_request(session, product, dir, policy).await?;
        let refresher = SessionRefresher { adapter: self };
        self.core()
            .engine
            .execute(request, Some(&refresher))
            .await
            .during(self.provider(), "download")
    }

    /// Find the single product whose name contains `product_id` and download it
    ///
    /// `request` supplies the collection, level and time window searched.
    /// No match is `NotFound`; several matches are `AmbiguousProduct`.
    async fn download_file(
        &self,
        request: &QueryRequest,
        product_id: &str,
        dir: &Path,
        policy: ExistsPolicy,
    ) -> ProviderResult<TransferOutcome> {
        let session = self.authenticate(None).await?;
        let request = request
            .clone()
            .with_name(request.name().clone().contains(product_id));
        let result = self.query(&session, &request).await?;
        let product = match result.len() {
            0 => Err(FetchError::NotFound(format!("product {product_id}"))),
            1 => Ok(&result[0]),
            _ => Err(FetchError::AmbiguousProduct {
                product_id: product_id.to_string(),
                matches: result.product_ids().into_iter().map(String::from).collect(),
            }),
        }
        .during(self.provider(), "download_file")?;
        debug!(provider = %self.provider(), product = %product.product_id(), "Resolved product id");
        self.download(&session, product, dir, policy).await
    }

    /// Download every product with at most `concurrency` transfers in flight
    ///
    /// One session is shared by all transfers. Reports come back in product-id
    /// order whatever the completion order.
    async fn download_all(
        &self,
        products: &[ProductRecord],
        dir: &Path,
        policy: ExistsPolicy,
        concurrency: usize,
    ) -> ProviderResult<Vec<DownloadReport>> {
        let session = self.authenticate(None).await?;
        let session = &session;
        info!(
            provider = %self.provider(),
            count = products.len(),
            concurrency,
            "Starting downloads"
        );

        let downloads: Vec<BoxFuture<'_, DownloadReport>> = products
            .iter()
            .map(|product| {
                Box::pin(async move {
                    DownloadReport {
                        product_id: product.product_id().to_string(),
                        result: self.download(session, product, dir, policy).await,
                    }
                }) as BoxFuture<'_, DownloadReport>
            })
            .collect();
        let mut reports: Vec<DownloadReport> = stream::iter(downloads)
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
        reports.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        Ok(reports)
    }
}

/// Re-authenticates through an adapter on behalf of the engine
struct SessionRefresher<'a, A: ?Sized> {
    adapter: &'a A,
}

#[async_trait]
impl<'a, A: ProviderAdapter + ?Sized> CredentialRefresher for SessionRefresher<'a, A> {
    async fn refresh(&self) -> TransferResult<Credential> {
        let session = self
            .adapter
            .authenticate(None)
            .await
            .map_err(|e| TransferError::CredentialRefresh(e.to_string()))?;
        Ok(session.credential().clone())
    }
}

/// Create the adapter for `provider`
pub fn create_adapter(
    provider: Provider,
    context: &AdapterContext,
) -> ProviderResult<Box<dyn ProviderAdapter>> {
    Ok(match provider {
        Provider::Cdse => Box::new(odata::OdataAdapter::new(&odata::CDSE_CONFIG, context)?),
        Provider::Creodias => Box::new(odata::OdataAdapter::new(&odata::CREODIAS_CONFIG, context)?),
        Provider::Cnes => Box::new(cnes::CnesAdapter::new(context)?),
        Provider::Theia => Box::new(theia::TheiaAdapter::new(context)?),
        Provider::Nasa => Box::new(nasa::NasaAdapter::new(context)?),
        Provider::Usgs => Box::new(usgs::UsgsAdapter::new(context)?),
        Provider::Eumdac => Box::new(eumdac::EumdacAdapter::new(context)?),
        Provider::GoogleEe => Box::new(google::GoogleAdapter::new(context)?),
    })
}

/// `YYYY-MM-DDTHH:MM:SS.mmmZ`
pub(crate) fn iso_millis(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parse an RFC 3339 timestamp field
pub(crate) fn parse_instant(value: Option<&serde_json::Value>, field: &str) -> FetchResult<DateTime<Utc>> {
    let text = value.and_then(|v| v.as_str()).ok_or_else(|| FetchError::missing(field))?;
    DateTime::parse_from_rfc3339(text)
        .map(|d| d.with_timezone(&Utc))
        .or_else(|_| {
            // Some catalogues omit the offset
            chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
                .map(|d| d.and_utc())
        })
        .map_err(|e| FetchError::Parse(format!("field '{field}': cannot parse '{text}': {e}")))
}

/// String field of a JSON object
pub(crate) fn str_field<'a>(value: &'a serde_json::Value, field: &str) -> FetchResult<&'a str> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| FetchError::missing(field))
}

/// Last path segment of a URL, without query string
pub(crate) fn url_file_name(url: &str) -> Option<&str> {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.trim_end_matches('/').rsplit('/').next())
        .filter(|name| !name.is_empty())
}
