use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use importer::importer::{HttpClientOptions, ImportOptions, MAX_CHAIN_DEPTH};

/// Parse a header argument in the format "Header: value"
fn parse_header(s: &str) -> Result<(String, String), String> {
    let Some((name, value)) = s.split_once(':') else {
        return Err("Format should be 'Header: value'".to_string());
    };
    let name = name.trim();
    if name.is_empty() {
        return Err("Header name cannot be empty".to_string());
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[derive(Parser)]
#[command(name = "importer")]
#[command(about = "Stream a remote disk image into a local file")]
struct Cli {
    /// Source: host[:port]/bucket/key, s3://host/bucket/key, or an http(s):// URL
    #[arg(long, env = "IMPORTER_ENDPOINT")]
    endpoint: String,
    /// Access key for the source (object-store key ID or HTTP username)
    #[arg(long, env = "IMPORTER_ACCESS_KEY_ID", hide_env_values = true)]
    access_key: Option<String>,
    /// Secret key for the source (object-store secret or HTTP password)
    #[arg(long, env = "IMPORTER_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,
    /// Destination file path
    #[arg(long, env = "IMPORTER_WRITE_PATH", default_value = "/data/disk.img")]
    dest: PathBuf,
    /// Use plain HTTP for object-store endpoints
    #[arg(long)]
    insecure_endpoint: bool,
    /// Signing region for object-store requests
    #[arg(long, default_value = "us-east-1")]
    region: String,
    /// Path to CA certificate PEM file for TLS validation
    #[arg(long)]
    cacert: Option<PathBuf>,
    /// Ignore SSL certificate verification
    #[arg(short = 'k', long = "insecure-tls")]
    insecure_tls: bool,
    /// Custom HTTP headers (can be used multiple times, format: 'Header: value')
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,
    /// Buffer size in MB for download buffering
    #[arg(long, default_value = "128")]
    buffer_size: usize,
    /// Maximum number of nested compression/archive layers
    #[arg(long, default_value_t = MAX_CHAIN_DEPTH)]
    max_chain_depth: usize,
    /// Progress update interval in seconds (accepts float values like 1.0 or 0.5)
    #[arg(short = 'i', long, default_value = "0.5")]
    progress_interval: f64,
    /// Enable debug output
    #[arg(long)]
    debug: bool,
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "importer=debug" } else { "importer=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    tracing::info!("Import options:");
    tracing::info!("  Endpoint: {}", cli.endpoint);
    tracing::info!("  Destination: {}", cli.dest.display());
    tracing::info!("  Object-store TLS: {}", !cli.insecure_endpoint);
    tracing::info!("  Ignore certificates: {}", cli.insecure_tls);
    tracing::info!("  Buffer size: {} MB", cli.buffer_size);
    tracing::info!("  Max chain depth: {}", cli.max_chain_depth);
    for (name, _) in &cli.headers {
        tracing::info!("  Custom header: {}", name);
    }

    let options = ImportOptions {
        endpoint: cli.endpoint,
        access_key: cli.access_key,
        secret_key: cli.secret_key,
        secure: !cli.insecure_endpoint,
        region: cli.region,
        http: HttpClientOptions {
            insecure_tls: cli.insecure_tls,
            cacert: cli.cacert,
        },
        headers: cli.headers,
        buffer_size_mb: cli.buffer_size,
        max_chain_depth: cli.max_chain_depth,
        progress_interval_secs: cli.progress_interval,
    };

    match importer::import(options, &cli.dest).await {
        Ok(result) => {
            tracing::info!(
                "Wrote {} bytes of {} to {}",
                result.bytes_written,
                result.format,
                result.destination.display()
            );
            println!("Result: IMPORT_COMPLETED");
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("Error ({} stage): {}", e.stage(), e);
            println!("Result: IMPORT_FAILED");
            std::process::exit(1);
        }
    }
}
