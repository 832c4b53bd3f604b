// Library module for the disk-image importer
// This exposes the public API for the binary and integration tests

pub mod importer;

// Re-export the main public API
pub use importer::{
    import, stream_data_to_file, DataStream, DataStreamFactory, ImportError, ImportOptions,
    ImportResult,
};
