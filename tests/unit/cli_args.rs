//! Command-line parsing into query requests

use clap::Parser;

use satellite_data_downloader::cli::{Cli, Commands};
use satellite_data_downloader::constraint::GeoConstraint;
use satellite_data_downloader::transfer::ExistsPolicy;
use satellite_data_downloader::Provider;

fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
    Cli::try_parse_from(std::iter::once("satellite-data-downloader").chain(args.iter().copied()))
}

#[test]
fn test_download_flags() {
    let cli = parse(&[
        "--concurrency",
        "8",
        "download",
        "--provider",
        "usgs",
        "--collection",
        "LANDSAT-8-OLI",
        "--level",
        "2",
        "--bbox",
        "-10.5,-9.5,120.0,121.0",
        "--first",
        "3",
        "--if-exists",
        "backup",
        "--output",
        "/tmp/products",
    ])
    .unwrap();
    assert_eq!(cli.concurrency, 8);

    let Commands::Download(args) = cli.command else {
        panic!("expected download command");
    };
    assert_eq!(args.query.provider, Provider::Usgs);
    assert_eq!(args.first, Some(3));
    assert_eq!(args.if_exists, ExistsPolicy::Backup);
    assert_eq!(args.output.to_str(), Some("/tmp/products"));

    let request = args.query.to_request().unwrap();
    assert_eq!(request.level(), 2);
    assert_eq!(
        request.geo(),
        Some(&GeoConstraint::BoundingBox {
            latmin: -10.5,
            latmax: -9.5,
            lonmin: 120.0,
            lonmax: 121.0
        })
    );
}

#[test]
fn test_repeatable_name_flags_form_a_conjunction() {
    let cli = parse(&[
        "query",
        "--provider",
        "cdse",
        "--collection",
        "SENTINEL-2-MSI",
        "--contains",
        "_T31TCJ_",
        "--contains",
        "N0509",
        "--glob",
        "S2?_*",
    ])
    .unwrap();
    let Commands::Query(args) = cli.command else {
        panic!("expected query command");
    };
    let name = args.to_request().unwrap().name().clone();
    assert!(name.matches("S2B_MSIL1C_20230617T105031_N0509_R051_T31TCJ_20230617T143502"));
    assert!(!name.matches("S2B_MSIL1C_20230617T105031_N0510_R051_T31TCJ_20230617T143502"));
    assert!(!name.matches("LC08_N0509_T31TCJ_"));
}

#[test]
fn test_geometry_flags_are_exclusive() {
    let both = parse(&[
        "query",
        "--provider",
        "cdse",
        "--collection",
        "SENTINEL-2-MSI",
        "--point",
        "43.6,1.4",
        "--tile",
        "31TCJ",
    ]);
    assert!(both.is_err());
}

#[test]
fn test_invalid_values_fail_when_building_the_request() {
    let cases: [&[&str]; 4] = [
        &["--point", "95.0,1.4"],
        &["--bbox", "10,20,30"],
        &["--start", "2023-06-30", "--end", "2023-06-01"],
        &["--cloud-cover", "120"],
    ];
    for extra in cases {
        let mut args = vec!["query", "--provider", "nasa", "--collection", "VIIRS"];
        args.extend_from_slice(extra);
        let cli = parse(&args).unwrap();
        let Commands::Query(query) = cli.command else {
            panic!("expected query command");
        };
        assert!(query.to_request().is_err(), "accepted {extra:?}");
    }
}

#[test]
fn test_unknown_tile_scheme() {
    let cli = parse(&[
        "query",
        "--provider",
        "theia",
        "--collection",
        "VENUS",
        "--tile",
        "FR-LUS",
        "--tile-scheme",
        "utm",
    ])
    .unwrap();
    let Commands::Query(args) = cli.command else {
        panic!("expected query command");
    };
    assert!(args.geo().is_err());
}
