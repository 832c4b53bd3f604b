// Shared test utilities
#![allow(dead_code)]

use flate2::write::GzEncoder;
use flate2::Compression;
use importer::ImportOptions;
use std::io::Write;
use wiremock::MockServer;
use xz2::write::XzEncoder;

/// Generate deterministic test data of a given size
pub fn create_test_data(size: usize) -> Vec<u8> {
    // Create a repeating pattern for easier debugging
    let pattern = b"TESTDATA";
    let mut data = Vec::with_capacity(size);

    for i in 0..size {
        data.push(pattern[i % pattern.len()]);
    }

    data
}

/// Generate incompressible pseudo-random test data
pub fn create_random_data(size: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    (0..size)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

/// Test data that starts with a qcow2 header signature
pub fn create_qcow2_data(size: usize) -> Vec<u8> {
    let mut data = create_test_data(size.max(8));
    data[..8].copy_from_slice(b"QFI\xfb\x00\x00\x00\x03");
    data
}

/// Compress data using xz compression
pub fn compress_xz(data: &[u8]) -> Vec<u8> {
    let mut encoder = XzEncoder::new(Vec::new(), 6);
    encoder
        .write_all(data)
        .expect("Failed to write to xz encoder");
    encoder.finish().expect("Failed to finish xz compression")
}

/// Compress data using gzip compression
pub fn compress_gz(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .expect("Failed to write to gz encoder");
    encoder.finish().expect("Failed to finish gz compression")
}

/// Build a tar archive from (name, contents) pairs
pub fn create_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *data)
            .expect("Failed to append tar entry");
    }
    builder.into_inner().expect("Failed to finish tar archive")
}

/// Tar archive holding one entry whose size lives only in a PAX record,
/// with the ustar size field left at zero as PAX writers do for huge entries
pub fn create_pax_sized_tar(name: &str, data: &[u8]) -> Vec<u8> {
    let body = format!(" size={}\n", data.len());
    let mut len = body.len() + 1;
    while body.len() + len.to_string().len() != len {
        len = body.len() + len.to_string().len();
    }
    let records = format!("{}{}", len, body);

    let mut builder = tar::Builder::new(Vec::new());
    let mut pax = tar::Header::new_ustar();
    pax.set_entry_type(tar::EntryType::XHeader);
    pax.set_path("PaxHeaders/entry").expect("Failed to set PAX header path");
    pax.set_size(records.len() as u64);
    pax.set_cksum();
    builder
        .append(&pax, records.as_bytes())
        .expect("Failed to append PAX header");

    let mut header = tar::Header::new_ustar();
    header.set_path(name).expect("Failed to set entry path");
    header.set_size(0);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, data).expect("Failed to append tar entry");
    builder.into_inner().expect("Failed to finish tar archive")
}

/// Object-store style endpoint (`host:port/bucket/key`) on the mock server
pub fn object_endpoint(server: &MockServer, bucket_key: &str) -> String {
    let authority = server.uri().trim_start_matches("http://").to_string();
    format!("{}/{}", authority, bucket_key)
}

/// Options for a plain-HTTP mock object store
pub fn object_store_options(server: &MockServer, bucket_key: &str) -> ImportOptions {
    ImportOptions {
        secure: false,
        ..ImportOptions::new(object_endpoint(server, bucket_key))
    }
}
