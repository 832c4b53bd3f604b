mod auth;
mod byte_channel;
mod copier;
mod data_stream;
mod download_error;
mod endpoint;
mod error;
mod http;
mod magic_bytes;
mod object_store;
mod options;
mod peek;
mod progress;
mod stream_utils;
mod tar_entry;
mod transform;
mod validation;

use std::path::Path;

pub use auth::Credentials;
pub use copier::{stream_data_to_file, ImportResult, COPY_CHUNK_SIZE};
pub use data_stream::{DataStream, DataStreamFactory};
pub use download_error::DownloadError;
pub use endpoint::{Endpoint, Scheme};
pub use error::ImportError;
pub use magic_bytes::{detect_wrapper, Wrapper};
pub use options::{HttpClientOptions, ImportOptions};
pub use progress::FinalStats;
pub use transform::{
    build_chain, build_chain_with_depth, SourceReader, Stage, StageKind, TransformChain,
    HEADER_PEEK_LEN, MAX_CHAIN_DEPTH,
};
pub use validation::{declared_format, is_valid_image_file, sniff_format, ImageFormat};

use progress::ProgressTracker;

/// Import the object named by `options` into `destination`.
///
/// Either a complete, validated file exists at `destination` afterwards or
/// an error is returned and no file was left behind.
pub async fn import(
    options: ImportOptions,
    destination: impl AsRef<Path>,
) -> Result<ImportResult, ImportError> {
    let factory = DataStreamFactory::from_options(options)?;
    import_with(&factory, destination.as_ref()).await
}

/// Run one import through an already validated factory
pub async fn import_with(
    factory: &DataStreamFactory,
    destination: &Path,
) -> Result<ImportResult, ImportError> {
    tracing::info!(
        endpoint = %factory.endpoint(),
        destination = %destination.display(),
        "starting import"
    );

    let mut stream = factory.new_data_stream().await?;
    let stages = stream.stages().to_vec();
    let format = stream.format();

    let mut tracker = ProgressTracker::new(factory.progress_interval())
        .with_source(stream.received_counter(), stream.content_length());
    let dest = destination.to_path_buf();

    let (copied, stats) = tokio::task::spawn_blocking(move || {
        let copied = copier::copy_with_progress(&mut stream, &dest, &mut tracker);
        stream.close();
        (copied, tracker.finish())
    })
    .await
    .map_err(|e| copier::abandon_copy(destination, std::io::Error::other(e)))?;

    let bytes_written = copied?;

    tracing::info!(
        "Import complete: received {:.2} MB, wrote {:.2} MB in {} ({:.2} MB/s)",
        stats.bytes_received as f64 / (1024.0 * 1024.0),
        bytes_written as f64 / (1024.0 * 1024.0),
        stats.total_time_formatted(),
        stats.write_rate()
    );
    if let Some(ratio) = stats.expansion_ratio() {
        tracing::info!("Expansion ratio: {:.2}x", ratio);
    }

    Ok(ImportResult {
        bytes_written,
        destination: destination.to_path_buf(),
        stages,
        format,
        elapsed: stats.elapsed,
    })
}
