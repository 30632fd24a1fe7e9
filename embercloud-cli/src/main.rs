//! Embercloud CLI
//!
//! Diagnostic tool for the embercloud client core.
//!
//! # Usage
//!
//! ```bash
//! # Decode a captured HTTP response
//! embercloud decode-response capture.http --format json
//!
//! # Replay a captured event-stream body
//! embercloud decode-stream events.txt --chunked
//!
//! # Decode an inline blob value to a file
//! embercloud decode-blob value.json firmware.bin
//!
//! # Mint a signed service-account assertion
//! embercloud sign-jwt service_account.json --uid device-42
//!
//! # Subscribe to a database path
//! embercloud listen /sensors
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use embercloud_core::{Clock, SystemClock};
use tracing_subscriber::EnvFilter;

mod config;
mod jwt;
mod listen;
mod replay;

#[derive(Parser)]
#[command(name = "embercloud")]
#[command(about = "Inspect responses, decode payloads and mint tokens for embercloud clients")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Client configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a captured HTTP response ("-" reads stdin)
    DecodeResponse {
        /// Raw response capture
        file: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Replay a captured event-stream body
    DecodeStream {
        /// Raw body capture ("-" reads stdin)
        file: PathBuf,

        /// The body uses chunked transfer encoding
        #[arg(long)]
        chunked: bool,
    },

    /// Decode an inline blob or file value
    DecodeBlob {
        /// File holding the quoted value
        input: PathBuf,

        /// Destination file
        output: PathBuf,

        /// Append instead of overwriting
        #[arg(short, long)]
        append: bool,
    },

    /// Sign a service-account assertion
    SignJwt {
        /// Service-account key file
        service_account: PathBuf,

        /// Mint a custom token for this user id
        #[arg(long)]
        uid: Option<String>,

        /// Developer claims for the custom token (JSON object)
        #[arg(long)]
        claims: Option<String>,

        /// OAuth scope for an access-token grant (repeatable)
        #[arg(short, long = "scope")]
        scopes: Vec<String>,
    },

    /// Validate the client configuration
    CheckConfig,

    /// Subscribe to a database path and print events
    Listen {
        /// Database path
        #[arg(default_value = "/")]
        path: String,

        /// Override the database port
        #[arg(short, long)]
        port: Option<u16>,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::DecodeResponse { file, format } => {
            let raw = read_input(&file)?;
            let summary = replay::decode_response(&raw)?;
            replay::print_summary(&summary, format == "json", &mut std::io::stdout())
        }
        Commands::DecodeStream { file, chunked } => {
            let raw = read_input(&file)?;
            for signal in replay::decode_stream(&raw, chunked)? {
                println!("{}", replay::describe_signal(&signal)?);
            }
            Ok(())
        }
        Commands::DecodeBlob { input, output, append } => {
            let written = replay::decode_blob(&input, &output, append)?;
            println!("Wrote {} bytes to {}", written, output.display());
            Ok(())
        }
        Commands::SignJwt {
            service_account,
            uid,
            claims,
            scopes,
        } => {
            let audience = jwt::audience(uid, claims.as_deref(), scopes)?;
            let assertion = jwt::mint(&service_account, audience, SystemClock::new().now_epoch())?;
            println!("{}", assertion);
            Ok(())
        }
        Commands::CheckConfig => {
            let (config, path) = config::load_config(cli.config.as_deref())?;
            println!("Configuration OK: {}", path.display());
            println!("  Auth mode:  {}", config.auth.token_type());
            if let Ok(endpoint) = config.database_endpoint() {
                println!("  Database:   {}:{}", endpoint.host, endpoint.port);
            }
            println!("  Keep-alive: {:?}", config.timeouts.stream_keep_alive());
            Ok(())
        }
        Commands::Listen { path, port } => {
            let (config, _) = config::load_config(cli.config.as_deref())?;
            listen::listen(config, path, port).await
        }
    }
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        return Ok(buf);
    }
    std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))
}
