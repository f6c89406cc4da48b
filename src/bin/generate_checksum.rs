//! Checksum generator for raw concept and mapping payloads.
//!
//! Prints the checksum of a JSON object (or of an array of objects) using
//! the same field selection and encoding as stored resources, so results can
//! be compared against checksums reported by a server.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `RUST_LOG`: Log level filter (default: terminology_kernel=info)
//! - `LOG_FORMAT`: "json" for structured logs, "pretty" for development (default: pretty)
//!
//! ## Usage
//!
//! ```bash
//! generate_checksum --resource concept --checksum-type smart \
//!     --data '{"concept_class": "Diagnosis", "datatype": "N/A", "names": []}'
//! ```

use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::{debug, error};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use terminology_kernel::checksum::{raw_checksum, ChecksumKind};
use terminology_kernel::config::DigestAlgorithm;
use terminology_kernel::types::ResourceKind;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Resource {
    Concept,
    Mapping,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ChecksumType {
    Standard,
    Smart,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Digest {
    Md5,
    Sha256,
}

/// Generate the checksum of resource data.
#[derive(Debug, Parser)]
#[command(name = "generate_checksum", version, about)]
struct Args {
    /// The type of resource.
    #[arg(short, long, value_enum)]
    resource: Resource,

    /// The type of checksum to generate.
    #[arg(short, long, value_enum, default_value = "standard")]
    checksum_type: ChecksumType,

    /// JSON object or array of objects to checksum.
    #[arg(short, long)]
    data: String,

    /// Digest algorithm.
    #[arg(long, value_enum, default_value = "md5")]
    digest: Digest,
}

/// Initialize the tracing subscriber with JSON or pretty format
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "terminology_kernel=info".into());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).flatten_event(true).with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let data: serde_json::Value = match serde_json::from_str(&args.data) {
        Ok(data) => data,
        Err(e) => {
            error!(error = %e, "Data is not valid JSON");
            return ExitCode::FAILURE;
        }
    };
    let resource = match args.resource {
        Resource::Concept => ResourceKind::Concept,
        Resource::Mapping => ResourceKind::Mapping,
    };
    let kind = match args.checksum_type {
        ChecksumType::Standard => ChecksumKind::Standard,
        ChecksumType::Smart => ChecksumKind::Smart,
    };
    let digest = match args.digest {
        Digest::Md5 => DigestAlgorithm::Md5,
        Digest::Sha256 => DigestAlgorithm::Sha256,
    };
    debug!(resource = %resource, kind = %kind, digest = %digest, "Generating checksum");

    match raw_checksum(resource, &data, kind, digest) {
        Ok(checksum) => {
            println!("{kind} checksum: {checksum}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Checksum generation failed");
            ExitCode::FAILURE
        }
    }
}
