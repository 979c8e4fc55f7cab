//! End-to-end runs of the compiled binary

use assert_cmd::Command;
use tempfile::TempDir;

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("satellite-data-downloader").unwrap();
    // Keep the user's credentials and logging settings out of the runs
    cmd.env("NETRC", "/nonexistent/netrc")
        .env_remove("SDD_REFERENCE_DIR")
        .env_remove("SDD_METRICS_ADDR")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_collections_human_output() {
    let output = cli()
        .args(["collections", "--provider", "cdse"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("collections served by cdse"));
    assert!(stdout.contains("SENTINEL-2-MSI"));
}

#[test]
fn test_collections_json_output() {
    let output = cli()
        .args(["--output-format", "json", "collections", "--provider", "theia"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let collections: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let entries = collections.as_array().unwrap();
    assert!(!entries.is_empty());
    for entry in entries {
        assert!(entry["sand_name"].is_string());
        assert!(entry["levels"].is_array());
        assert!(entry["launch_date"].is_string());
    }
}

#[test]
fn test_reference_dir_without_tables_fails() {
    let dir = TempDir::new().unwrap();
    let output = cli()
        .args(["collections", "--provider", "nasa", "--reference-dir"])
        .arg(dir.path())
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
}

#[test]
fn test_unsupported_provider_operation_exits_with_error() {
    let output = cli()
        .args(["query", "--provider", "google", "--collection", "SENTINEL-2-MSI"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not supported"), "stderr was: {stderr}");
}

#[test]
fn test_invalid_arguments_are_rejected_by_the_parser() {
    cli()
        .args(["--concurrency", "0", "collections", "--provider", "cdse"])
        .assert()
        .failure();
    cli()
        .args(["collections", "--provider", "sentinelhub"])
        .assert()
        .failure();
    cli()
        .args([
            "download",
            "--provider",
            "cdse",
            "--collection",
            "SENTINEL-2-MSI",
            "--if-exists",
            "sometimes",
        ])
        .assert()
        .failure();
}
