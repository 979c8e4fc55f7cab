//! Adapter workflows against stub servers: truncation, authentication,
//! re-authentication during download and batch downloads

use httpmock::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use satellite_data_downloader::constraint::TimeRange;
use satellite_data_downloader::provider::StaticCredentials;
use satellite_data_downloader::transfer::{ExistsPolicy, TransferStatus};
use satellite_data_downloader::{create_adapter, ErrorKind, Provider, QueryRequest, Session};

use crate::common::{product, stub_context, tar_bytes, zip_bytes};

const L1C: &str = "S2A_MSIL1C_20230617T105031_N0509_R051_T31TCJ_20230617T143502.SAFE";
const L2A: &str = "S2A_MSIL2A_20230617T105031_N0509_R051_T31TCJ_20230617T170041.SAFE";

fn odata_item(name: &str, id: &str) -> serde_json::Value {
    json!({
        "Id": id,
        "Name": name,
        "ContentDate": {"Start": "2023-06-17T10:50:31.024Z", "End": "2023-06-17T10:50:31.024Z"}
    })
}

fn june_request() -> QueryRequest {
    QueryRequest::new("SENTINEL-2-MSI", 1)
        .with_time(TimeRange::parse(Some("2023-06-01"), Some("2023-06-30")).unwrap())
}

#[tokio::test]
async fn test_odata_truncated_page_is_rejected() {
    let server = MockServer::start();
    let products = server.mock(|when, then| {
        when.method(GET)
            .path("/odata/v1/Products")
            .query_param("$count", "true")
            .query_param("$top", "1000")
            .query_param_exists("$filter");
        then.status(200).json_body(json!({
            "@odata.count": 5,
            "value": [odata_item(L1C, "a1"), odata_item(L2A, "b2")]
        }));
    });

    let context = stub_context(&server, StaticCredentials::new());
    let adapter = create_adapter(Provider::Cdse, &context).unwrap();
    let err = adapter
        .query(&Session::anonymous(Provider::Cdse), &june_request())
        .await
        .unwrap_err();

    products.assert();
    assert_eq!(err.kind(), ErrorKind::TooManyMatches);
    assert!(err.to_string().contains("cdse query failed"));
}

#[tokio::test]
async fn test_sentinel2_level1_end_to_end() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/odata/v1/Products");
        then.status(200).json_body(json!({
            "@odata.count": 2,
            "value": [odata_item(L2A, "b2"), odata_item(L1C, "a1")]
        }));
    });

    let context = stub_context(&server, StaticCredentials::new());
    let adapter = create_adapter(Provider::Cdse, &context).unwrap();

    let record = adapter.resolver().resolve("SENTINEL-2-MSI", 1).unwrap();
    assert_eq!(record.provider_collection_ids(), ["SENTINEL-2".to_string()]);
    assert_eq!(record.implied_name_constraint(), ["MSIL1C".to_string()]);

    let result = adapter
        .query(&Session::anonymous(Provider::Cdse), &june_request())
        .await
        .unwrap();
    assert_eq!(result.product_ids(), vec![L1C]);
    assert_eq!(result.get(0).unwrap().provider_index(), "a1");
}

#[tokio::test]
async fn test_token_rejection_is_an_authentication_error() {
    let server = MockServer::start();
    let token = server.mock(|when, then| {
        when.method(POST).path("/token").body_contains("grant_type=password");
        then.status(401).json_body(json!({"error": "invalid_grant"}));
    });

    let credentials = StaticCredentials::new().with("dataspace.copernicus.eu", "user@example.com", "wrong");
    let context = stub_context(&server, credentials);
    let adapter = create_adapter(Provider::Cdse, &context).unwrap();
    let err = adapter.authenticate(None).await.unwrap_err();

    assert_eq!(token.hits(), 1);
    assert_eq!(err.kind(), ErrorKind::AuthenticationError);
    assert!(err.to_string().contains("invalid_grant"));
}

#[tokio::test]
async fn test_missing_credentials_fail_without_network() {
    let server = MockServer::start();
    let token = server.mock(|when, then| {
        when.path("/token");
        then.status(200);
    });

    let context = stub_context(&server, StaticCredentials::new());
    let adapter = create_adapter(Provider::Cdse, &context).unwrap();
    let err = adapter.authenticate(None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::MissingCredentials);
    assert_eq!(token.hits(), 0);
}

#[tokio::test]
async fn test_download_reauthenticates_on_expired_token() {
    let server = MockServer::start();
    let mut login = server.mock(|when, then| {
        when.method(POST).path("/services/authenticate/");
        then.status(200).body("old-token\n");
    });
    let credentials = StaticCredentials::new().with("theia.cnes.fr", "user", "secret");
    let context = stub_context(&server, credentials);
    let adapter = create_adapter(Provider::Theia, &context).unwrap();
    let session = adapter.authenticate(None).await.unwrap();
    login.delete();

    let relogin = server.mock(|when, then| {
        when.method(POST).path("/services/authenticate/");
        then.status(200).body("new-token");
    });
    let expired = server.mock(|when, then| {
        when.method(GET)
            .path("/resto2/collections/SENTINEL2/6b1f/download/")
            .header("Authorization", "Bearer old-token");
        then.status(401).body("token expired");
    });
    let name = "SENTINEL2A_20230617-105857-000_L2A_T31TCJ_C_V3-1";
    let archive = zip_bytes(&[(&format!("{name}/{name}_MTD_ALL.xml"), b"<Muscate_Metadata/>")]);
    let granted = server.mock(|when, then| {
        when.method(GET)
            .path("/resto2/collections/SENTINEL2/6b1f/download/")
            .query_param("issuerId", "theia")
            .header("Authorization", "Bearer new-token");
        then.status(200).body(archive.clone());
    });

    let dir = TempDir::new().unwrap();
    let record = product(name, "6b1f", json!({"properties": {"collection": "SENTINEL2"}}));
    let outcome = adapter
        .download(&session, &record, dir.path(), ExistsPolicy::Skip)
        .await
        .unwrap();

    assert_eq!(expired.hits(), 1);
    assert_eq!(relogin.hits(), 1);
    assert_eq!(granted.hits(), 1);
    assert_eq!(outcome.path, dir.path().join(name));
    assert!(outcome.path.join(format!("{name}_MTD_ALL.xml")).is_file());
}

#[tokio::test]
async fn test_download_all_reports_in_product_order() {
    let server = MockServer::start();
    for name in ["A.nc", "C.nc"] {
        server.mock(|when, then| {
            when.method(GET).path(format!("/data/{name}"));
            then.status(200).body(format!("content of {name}"));
        });
    }
    server.mock(|when, then| {
        when.method(GET).path("/data/B.nc");
        then.status(404).body("granule withdrawn");
    });

    let context = stub_context(&server, StaticCredentials::new());
    let adapter = create_adapter(Provider::Nasa, &context).unwrap();
    let records: Vec<_> = ["C.nc", "A.nc", "B.nc"]
        .iter()
        .map(|name| {
            let links = json!({"links": [
                {"title": format!("Download {name}"), "href": server.url(format!("/data/{name}"))}
            ]});
            product(name, &format!("G-{name}"), links)
        })
        .collect();

    let dir = TempDir::new().unwrap();
    let reports = adapter
        .download_all(&records, dir.path(), ExistsPolicy::Overwrite, 3)
        .await
        .unwrap();

    let ids: Vec<_> = reports.iter().map(|r| r.product_id.as_str()).collect();
    assert_eq!(ids, ["A.nc", "B.nc", "C.nc"]);
    assert!(reports[0].result.is_ok());
    assert_eq!(reports[1].result.as_ref().unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("C.nc")).unwrap(),
        "content of C.nc"
    );
}

#[tokio::test]
async fn test_usgs_bundle_download() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST)
            .path("/api/json/stable/login-token")
            .json_body_partial(r#"{"username": "landsat-user"}"#);
        then.status(200)
            .json_body(json!({"data": "m2m-key", "errorCode": null, "errorMessage": null}));
    });
    let options = server.mock(|when, then| {
        when.method(POST)
            .path("/api/json/stable/download-options")
            .header("X-Auth-Token", "m2m-key");
        then.status(200).json_body(json!({
            "data": [
                {"id": "band", "entityId": "LC81140662023202LGN00", "available": true,
                 "productName": "Band 4", "secondaryDownloads": [], "downloadSystem": "dds"},
                {"id": "bundle", "entityId": "LC81140662023202LGN00", "available": true,
                 "productName": "Landsat Collection 2 Level-1 Product Bundle",
                 "secondaryDownloads": [], "downloadSystem": "ls_zip"}
            ],
            "errorCode": null
        }));
    });
    server.mock(|when, then| {
        when.method(POST)
            .path("/api/json/stable/download-request")
            .json_body_partial(r#"{"downloads": [{"productId": "bundle"}]}"#);
        then.status(200).json_body(json!({
            "data": {
                "numInvalidScenes": 0,
                "availableDownloads": [{"url": server.url("/dl/scene.tar")}]
            },
            "errorCode": null
        }));
    });
    let name = "LC08_L1TP_114066_20230721_20230802_02_T1";
    let archive = tar_bytes(&[(&format!("{name}/{name}_MTL.txt"), b"GROUP = LANDSAT_METADATA_FILE")]);
    server.mock(|when, then| {
        when.method(GET).path("/dl/scene.tar");
        then.status(200).body(archive.clone());
    });

    let credentials = StaticCredentials::new().with("usgs.gov", "landsat-user", "app-token");
    let context = stub_context(&server, credentials);
    let adapter = create_adapter(Provider::Usgs, &context).unwrap();
    let session = adapter.authenticate(None).await.unwrap();

    let dir = TempDir::new().unwrap();
    let record = product(name, "LC81140662023202LGN00", json!({"datasetName": "landsat_ot_c2_l1"}));
    let outcome = adapter
        .download(&session, &record, dir.path(), ExistsPolicy::Skip)
        .await
        .unwrap();

    options.assert();
    assert_eq!(outcome.status, TransferStatus::Downloaded);
    assert!(dir.path().join(name).join(format!("{name}_MTL.txt")).is_file());

    // Second run finds the product on disk and skips it
    let again = adapter
        .download(&session, &record, dir.path(), ExistsPolicy::Skip)
        .await
        .unwrap();
    assert_eq!(again.status, TransferStatus::Skipped);
}

#[tokio::test]
async fn test_stac_search_truncation() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/stac/search");
        then.status(200).json_body(json!({
            "features": [{
                "id": "f1",
                "properties": {
                    "identifier": "S2A_MSIL1C_20230617T105031_N0509_R051_T31TCJ_20230617T143502",
                    "start_datetime": "2023-06-17T10:50:31Z"
                }
            }],
            "context": {"returned": 1, "matched": 250}
        }));
    });

    let credentials = StaticCredentials::new().with("geodes.cnes.fr", "user", "api-key");
    let context = stub_context(&server, credentials);
    let adapter = create_adapter(Provider::Cnes, &context).unwrap();
    let session = adapter.authenticate(None).await.unwrap();
    let err = adapter.query(&session, &june_request()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::TooManyMatches);
    assert!(err.to_string().contains("250"));
}

#[tokio::test]
async fn test_download_all_overlaps_transfers() {
    let server = MockServer::start();
    let names = ["D1.nc", "D2.nc", "D3.nc", "D4.nc"];
    for name in names {
        server.mock(|when, then| {
            when.method(GET).path(format!("/slow/{name}"));
            then.status(200)
                .body(format!("content of {name}"))
                .delay(std::time::Duration::from_millis(400));
        });
    }

    let context = stub_context(&server, StaticCredentials::new());
    let adapter = create_adapter(Provider::Nasa, &context).unwrap();
    let records: Vec<_> = names
        .iter()
        .map(|name| {
            let links = json!({"links": [
                {"title": format!("Download {name}"), "href": server.url(format!("/slow/{name}"))}
            ]});
            product(name, &format!("G-{name}"), links)
        })
        .collect();

    let dir = TempDir::new().unwrap();
    let started = std::time::Instant::now();
    let reports = adapter
        .download_all(&records, dir.path(), ExistsPolicy::Overwrite, 4)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(reports.len(), 4);
    assert!(reports.iter().all(|r| r.result.is_ok()));
    // Serial transfers would take at least 1.6 s
    assert!(elapsed < std::time::Duration::from_millis(1400), "took {elapsed:?}");
}

#[tokio::test]
async fn test_odata_page_without_count_is_rejected() {
    let server = MockServer::start();
    let items: Vec<_> = (0..1000)
        .map(|i| odata_item(&format!("S2A_MSIL1C_20230617T105031_N0509_R051_T31TCJ_{i:04}.SAFE"), &format!("id-{i}")))
        .collect();
    server.mock(|when, then| {
        when.method(GET).path("/odata/v1/Products");
        then.status(200).json_body(json!({"value": items}));
    });

    let context = stub_context(&server, StaticCredentials::new());
    let adapter = create_adapter(Provider::Cdse, &context).unwrap();
    let err = adapter
        .query(&Session::anonymous(Provider::Cdse), &june_request())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Parse);
    assert!(err.to_string().contains("@odata.count"));
}

#[tokio::test]
async fn test_cmr_response_without_hits_header_is_rejected() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/search/granules");
        then.status(200).json_body(json!({"feed": {"entry": []}}));
    });

    let context = stub_context(&server, StaticCredentials::new());
    let adapter = create_adapter(Provider::Nasa, &context).unwrap();
    let request = QueryRequest::new("MODIS-TERRA-HR", 1)
        .with_raw_collections(["C1234-LAADS"])
        .with_time(TimeRange::parse(Some("2023-06-01"), Some("2023-06-30")).unwrap());
    let err = adapter
        .query(&Session::anonymous(Provider::Nasa), &request)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Parse);
    assert!(err.to_string().contains("CMR-Hits"));
}

fn cmr_entry(server: &MockServer, name: &str) -> serde_json::Value {
    json!({
        "id": format!("G-{name}"),
        "producer_granule_id": name,
        "time_start": "2023-06-17T10:50:00.000Z",
        "links": [{"title": format!("Download {name}"), "href": server.url(format!("/data/{name}"))}]
    })
}

#[tokio::test]
async fn test_download_file_by_product_id() {
    let server = MockServer::start();
    let names = [
        "MOD021KM.A2023168.1050.061.nc",
        "MOD021KM.A2023168.1055.061.nc",
        "MOD03.A2023168.1050.061.nc",
    ];
    let entries: Vec<_> = names.iter().map(|name| cmr_entry(&server, name)).collect();
    server.mock(|when, then| {
        when.method(POST).path("/search/granules");
        then.status(200)
            .header("CMR-Hits", "3")
            .json_body(json!({"feed": {"entry": entries}}));
    });
    let granule = server.mock(|when, then| {
        when.method(GET).path("/data/MOD021KM.A2023168.1050.061.nc");
        then.status(200).body("radiances");
    });

    let context = stub_context(&server, StaticCredentials::new());
    let adapter = create_adapter(Provider::Nasa, &context).unwrap();
    let request = QueryRequest::new("MODIS-TERRA-HR", 1)
        .with_raw_collections(["C1378227407-LAADS"])
        .with_time(TimeRange::parse(Some("2023-06-17"), Some("2023-06-17")).unwrap());
    let dir = TempDir::new().unwrap();

    let outcome = adapter
        .download_file(&request, "MOD021KM.A2023168.1050", dir.path(), ExistsPolicy::Skip)
        .await
        .unwrap();
    granule.assert();
    assert_eq!(outcome.status, TransferStatus::Downloaded);
    assert_eq!(std::fs::read_to_string(&outcome.path).unwrap(), "radiances");

    let ambiguous = adapter
        .download_file(&request, "A2023168.1050", dir.path(), ExistsPolicy::Skip)
        .await
        .unwrap_err();
    assert_eq!(ambiguous.kind(), ErrorKind::AmbiguousProduct);
    assert!(ambiguous.to_string().contains("MOD03.A2023168.1050.061.nc"));

    let missing = adapter
        .download_file(&request, "A2023169", dir.path(), ExistsPolicy::Skip)
        .await
        .unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NotFound);
    assert_eq!(granule.hits(), 1);
}
