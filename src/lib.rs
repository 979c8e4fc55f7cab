//! # Satellite Data Downloader Library
//!
//! Search and download Earth-observation products from several data
//! providers through one constraint vocabulary.
//!
//! ## Features
//!
//! - **Multi-Provider Support**: Copernicus Data Space, CREODIAS, CNES Geodes,
//!   Theia, NASA CMR, USGS M2M and the EUMETSAT Data Store
//! - **Generic Collections**: `("SENTINEL-2-MSI", 1)` resolves to each
//!   provider's own collection ids and implied name filters
//! - **Resilient Transfers**: bounded redirects, exponential backoff, one
//!   re-authentication, atomic placement and archive unpacking
//! - **Type-Safe Constraints**: validated time windows, geometries and name
//!   filters
//!
//! ## Quick Start
//!
//! ```no_run
//! use satellite_data_downloader::provider::{create_adapter, AdapterContext, Provider, QueryRequest};
//! use satellite_data_downloader::constraint::{GeoConstraint, TileScheme, TimeRange};
//! use satellite_data_downloader::transfer::ExistsPolicy;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let context = AdapterContext::from_env()?;
//! let adapter = create_adapter(Provider::Cdse, &context)?;
//! let session = adapter.authenticate(None).await?;
//!
//! let request = QueryRequest::new("SENTINEL-2-MSI", 1)
//!     .with_time(TimeRange::parse(Some("2023-06-01"), Some("2023-06-30"))?)
//!     .with_geo(GeoConstraint::tile(TileScheme::Mgrs, "31TCJ"));
//! let products = adapter.query(&session, &request).await?;
//!
//! if let Some(first) = products.get(0) {
//!     adapter.download(&session, first, Path::new("data"), ExistsPolicy::Skip).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`constraint`] - Time, geometry and product-name constraints
//! - [`registry`] - Reference tables and the collection resolver
//! - [`provider`] - Adapter contract, sessions, credentials and one adapter per provider
//! - [`transfer`] - Resilient transfer engine
//! - [`product`] - Product records and query results

#![warn(missing_docs)]
#![warn(clippy::all)]

/// CLI command implementations
pub mod cli;

/// Time, geometry and name constraints
pub mod constraint;

/// Error classification shared by every layer
pub mod error;

/// Observability metrics
pub mod metrics;

/// Product records and query results
pub mod product;

/// Provider adapters
pub mod provider;

/// Reference tables and collection resolution
pub mod registry;

/// Process-wide HTTP clients
pub mod shared_resources;

/// Graceful shutdown coordination shared across modules
pub mod shutdown;

/// Resilient transfer engine
pub mod transfer;

pub use error::ErrorKind;
pub use product::{ProductRecord, QueryResult};
pub use provider::{create_adapter, AdapterContext, Provider, ProviderAdapter, ProviderError, QueryRequest, Session};
