//! Helpers shared by the integration tests

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use httpmock::MockServer;
use serde_json::Value;
use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use satellite_data_downloader::provider::{AdapterContext, StaticCredentials};
use satellite_data_downloader::transfer::TransferConfig;
use satellite_data_downloader::ProductRecord;

/// Transfer tunables with millisecond backoff so retry tests stay fast
pub fn fast_config() -> TransferConfig {
    TransferConfig::default()
        .with_max_retries(2)
        .with_backoff(Duration::from_millis(5), Duration::from_millis(20))
}

/// Adapter context whose endpoints all live on `server`
pub fn stub_context(server: &MockServer, credentials: StaticCredentials) -> AdapterContext {
    AdapterContext::new(Arc::new(credentials))
        .with_transfer_config(fast_config())
        .with_max_retries(2)
        .with_base_url(server.base_url())
}

/// In-memory zip archive holding `entries`
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }
    cursor.into_inner()
}

/// Product record acquired on 2023-06-17
pub fn product(product_id: &str, index: &str, raw: Value) -> ProductRecord {
    let date = Utc.with_ymd_and_hms(2023, 6, 17, 10, 56, 19).unwrap();
    ProductRecord::new(product_id, index, date, raw)
}

/// In-memory tar archive holding `entries`
pub fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}
