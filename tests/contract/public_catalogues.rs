//! Contract tests against the live public catalogues
//!
//! These check that the response shapes the adapters rely on are still
//! served. They need network access and are ignored by default; run them
//! with `cargo test -- --ignored`.

use serde_json::Value;

use satellite_data_downloader::constraint::TimeRange;
use satellite_data_downloader::provider::{AdapterContext, StaticCredentials};
use satellite_data_downloader::{create_adapter, ErrorKind, Provider, QueryRequest, Session};
use std::sync::Arc;

/// CDSE OData answers a counted product search without authentication
#[tokio::test]
#[ignore]
async fn test_cdse_odata_count_contract() {
    let client = reqwest::Client::new();
    let response = client
        .get("https://catalogue.dataspace.copernicus.eu/odata/v1/Products")
        .query(&[
            ("$filter", "Collection/Name eq 'SENTINEL-2' and contains(Name, '_T31TCJ_') and ContentDate/Start gt 2023-06-17T00:00:00.000Z and ContentDate/Start lt 2023-06-18T00:00:00.000Z"),
            ("$top", "10"),
            ("$count", "true"),
        ])
        .send()
        .await
        .expect("Failed to reach the CDSE catalogue");

    assert!(
        response.status().is_success(),
        "Expected successful response, got: {}",
        response.status()
    );
    let body: Value = response.json().await.expect("Failed to parse JSON response");

    assert!(body["@odata.count"].is_u64(), "Response should carry @odata.count");
    let products = body["value"].as_array().expect("value should be an array");
    for product in products {
        assert!(product["Id"].is_string());
        assert!(product["Name"].is_string());
        assert!(product["ContentDate"]["Start"].is_string());
    }
}

/// CMR granule search works anonymously and reports hits in a header
#[tokio::test]
#[ignore]
async fn test_cmr_granule_search_contract() {
    let client = reqwest::Client::new();
    let response = client
        .post("https://cmr.earthdata.nasa.gov/search/granules")
        .query(&[
            ("concept_id", "C1378227407-LAADS"),
            ("temporal", "2024-01-01T00:00:00Z,2024-01-01T01:00:00Z"),
            ("page_size", "5"),
        ])
        .header("Accept", "application/json")
        .send()
        .await
        .expect("Failed to reach CMR");

    assert!(response.status().is_success());
    assert!(
        response.headers().contains_key("CMR-Hits"),
        "CMR should report the number of hits"
    );
    let body: Value = response.json().await.expect("Failed to parse JSON response");
    let entries = body["feed"]["entry"].as_array().expect("feed.entry should be an array");
    for entry in entries {
        assert!(entry["id"].is_string());
        assert!(entry["time_start"].is_string());
        assert!(entry["links"].is_array());
    }
}

/// Anonymous NASA query through the adapter
#[tokio::test]
#[ignore]
async fn test_nasa_adapter_anonymous_query() {
    let context = AdapterContext::new(Arc::new(StaticCredentials::new()));
    let adapter = create_adapter(Provider::Nasa, &context).expect("adapter");
    let session = adapter.authenticate(None).await.expect("anonymous session");
    assert_eq!(session, Session::anonymous(Provider::Nasa));

    let request = QueryRequest::new("MODIS-AQUA-HR", 1)
        .with_time(TimeRange::parse(Some("2024-01-01T00:00:00Z"), Some("2024-01-01T00:30:00Z")).unwrap());
    match adapter.query(&session, &request).await {
        Ok(result) => {
            for product in result.iter() {
                assert!(!product.product_id().is_empty());
            }
        }
        Err(e) => assert_eq!(e.kind(), ErrorKind::TooManyMatches, "unexpected failure: {e}"),
    }
}
