//! Reference tables through the public resolver API

use satellite_data_downloader::constraint::TimeRange;
use satellite_data_downloader::provider::{Provider, QueryPlan, QueryRequest};
use satellite_data_downloader::registry::{CollectionResolver, ReferenceSource};
use satellite_data_downloader::ErrorKind;

fn resolver(provider: Provider) -> CollectionResolver {
    CollectionResolver::load(provider.table_name(), &ReferenceSource::Embedded).unwrap()
}

#[test]
fn test_every_embedded_table_loads() {
    for provider in Provider::ALL {
        let collections = resolver(provider).available_collections().unwrap();
        assert!(!collections.is_empty(), "{provider} has no collections");
        for info in &collections {
            assert!(!info.levels.is_empty());
            assert!(info.levels.windows(2).all(|w| w[0] < w[1]));
        }
    }
}

#[test]
fn test_resolution_is_idempotent() {
    let resolver = resolver(Provider::Cdse);
    let first = resolver.resolve("SENTINEL-2-MSI", 2).unwrap();
    let second = resolver.resolve("SENTINEL-2-MSI", 2).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.implied_name_constraint(), ["MSIL2A".to_string()]);
}

#[test]
fn test_unknown_name_fails_at_every_level() {
    let resolver = resolver(Provider::Cdse);
    for level in [0, 1, 2, 3] {
        let err = resolver.resolve("NOT-A-MISSION", level).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownCollection);
    }
}

#[test]
fn test_known_name_missing_level() {
    let err = resolver(Provider::Cdse).resolve("SENTINEL-2-MSI", 9).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedLevel);
    assert!(err.to_string().contains("[1, 2]"));
}

#[test]
fn test_directory_source_overrides_embedded_tables() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("collections")).unwrap();
    std::fs::write(
        dir.path().join("sensors.csv"),
        "sand_name,launch_date,end_date,description\nTEST-SAT,2020-01-01,2021-12-31,Test mission\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("collections").join("cdse.csv"),
        "sand_name,level,collections,contains\nTEST-SAT,1,TEST-A TEST-B,_L1_\n",
    )
    .unwrap();

    let source = ReferenceSource::Directory(dir.path().to_path_buf());
    let resolver = CollectionResolver::load("cdse", &source).unwrap();
    let record = resolver.resolve("TEST-SAT", 1).unwrap();
    assert_eq!(record.provider_collection_ids(), ["TEST-A".to_string(), "TEST-B".to_string()]);

    let info = resolver.available_collections().unwrap();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].end_date.unwrap().to_string(), "2021-12-31");
}

#[test]
fn test_missing_directory_table() {
    let dir = tempfile::TempDir::new().unwrap();
    let source = ReferenceSource::Directory(dir.path().to_path_buf());
    let err = CollectionResolver::load("cdse", &source).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingReferenceData);
}

#[test]
fn test_plan_fills_open_time_bounds_from_launch_date() {
    let resolver = resolver(Provider::Cdse);
    let request = QueryRequest::new("SENTINEL-2-MSI", 1)
        .with_time(TimeRange::parse(None, Some("2016-01-01")).unwrap());
    let plan = QueryPlan::prepare(&resolver, &request, Provider::Cdse.lon_convention()).unwrap();

    assert_eq!(plan.time.start().unwrap().to_rfc3339(), "2015-06-23T00:00:00+00:00");
    assert_eq!(plan.collection_ids, ["SENTINEL-2".to_string()]);
    assert!(plan.name.matches("S2A_MSIL1C_20151201T000000"));
    assert!(!plan.name.matches("S2A_MSIL2A_20151201T000000"));
}

#[test]
fn test_plan_rejects_start_before_launch() {
    let resolver = resolver(Provider::Cdse);
    let request = QueryRequest::new("SENTINEL-2-MSI", 1)
        .with_time(TimeRange::parse(Some("2010-01-01"), Some("2010-02-01")).unwrap());
    let err = QueryPlan::prepare(&resolver, &request, Provider::Cdse.lon_convention()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConstraint);
}

#[test]
fn test_raw_collections_skip_the_table() {
    let resolver = resolver(Provider::Nasa);
    let request = QueryRequest::new("SENTINEL-2-MSI", 7).with_raw_collections(["C1234-LAADS"]);
    let plan = QueryPlan::prepare(&resolver, &request, Provider::Nasa.lon_convention()).unwrap();
    assert_eq!(plan.collection_ids, ["C1234-LAADS".to_string()]);
    assert!(plan.name.is_empty());
}

fn ghost_sensor_source(dir: &std::path::Path) -> ReferenceSource {
    std::fs::create_dir(dir.join("collections")).unwrap();
    std::fs::write(
        dir.join("sensors.csv"),
        "sand_name,launch_date,end_date,description\nTEST-SAT,2020-01-01,x,Test mission\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("collections").join("cdse.csv"),
        "sand_name,level,collections,contains\nGHOST-SENSOR,1,GHOST,_L1_\n",
    )
    .unwrap();
    ReferenceSource::Directory(dir.to_path_buf())
}

#[test]
fn test_plan_collection_without_sensor_record_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    let resolver = CollectionResolver::load("cdse", &ghost_sensor_source(dir.path())).unwrap();
    assert!(resolver.resolve("GHOST-SENSOR", 1).is_ok());

    let request = QueryRequest::new("GHOST-SENSOR", 1);
    let err = QueryPlan::prepare(&resolver, &request, Provider::Cdse.lon_convention()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownCollection);

    // A closed window does not rescue a table-resolved collection
    let bounded = QueryRequest::new("GHOST-SENSOR", 1)
        .with_time(TimeRange::parse(Some("2023-06-01"), Some("2023-06-30")).unwrap());
    let err = QueryPlan::prepare(&resolver, &bounded, Provider::Cdse.lon_convention()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownCollection);
}

#[test]
fn test_raw_collections_without_sensor_record_need_closed_window() {
    let dir = tempfile::TempDir::new().unwrap();
    let resolver = CollectionResolver::load("cdse", &ghost_sensor_source(dir.path())).unwrap();

    let open = QueryRequest::new("GHOST-SENSOR", 1).with_raw_collections(["GHOST"]);
    let err = QueryPlan::prepare(&resolver, &open, Provider::Cdse.lon_convention()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownCollection);

    let closed = QueryRequest::new("GHOST-SENSOR", 1)
        .with_raw_collections(["GHOST"])
        .with_time(TimeRange::parse(Some("2023-06-01"), Some("2023-06-30")).unwrap());
    let plan = QueryPlan::prepare(&resolver, &closed, Provider::Cdse.lon_convention()).unwrap();
    assert_eq!(plan.collection_ids, ["GHOST".to_string()]);
    assert_eq!(plan.time, *closed.time());
}
