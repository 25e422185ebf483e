//! `http-transit` command line.
//!
//! Runs one request through the full engine: system resolver, TCP, rustls,
//! proxy rules and auth, printing the response head to stderr and the body
//! to stdout.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use rustls::RootCertStore;
use tokio::io::AsyncWriteExt;

use http_transit::auth::AuthCredentials;
use http_transit::config::loader::load_config;
use http_transit::config::EngineConfig;
use http_transit::http::HttpRequestInfo;
use http_transit::net::RustlsConnector;
use http_transit::observability::logging::init_tracing;
use http_transit::{HttpNetworkSession, HttpNetworkTransaction, SessionDeps};

/// Trust stores tried when neither the command line nor the config names one.
const SYSTEM_CA_BUNDLES: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/cert.pem",
];

#[derive(Parser)]
#[command(name = "http-transit", version)]
#[command(about = "Client-side HTTP connection engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a URL
    Fetch(FetchArgs),
}

#[derive(Args)]
struct FetchArgs {
    url: String,

    /// Engine configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Proxy rules, e.g. "http://proxy:3128" or "https=socks5://gw:1080;direct://"
    #[arg(long)]
    proxy: Option<String>,

    /// Server credentials, offered when challenged
    #[arg(short, long, value_name = "USER:PASS")]
    user: Option<String>,

    /// Proxy credentials, offered when challenged
    #[arg(long, value_name = "USER:PASS")]
    proxy_user: Option<String>,

    /// PEM bundle of trusted CA certificates
    #[arg(long, value_name = "PEM")]
    ca_file: Option<PathBuf>,

    /// Continue when the server certificate fails verification
    #[arg(short = 'k', long)]
    insecure: bool,

    /// Dump the socket pools as JSON after the fetch
    #[arg(long)]
    show_pools: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing("http_transit=info")?;

    match cli.command {
        Commands::Fetch(args) => fetch(args).await,
    }
}

async fn fetch(args: FetchArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };
    if let Some(rules) = &args.proxy {
        config.proxy.rules = rules.clone();
    }

    let ca_file = args
        .ca_file
        .clone()
        .or_else(|| config.ssl.ca_file.as_ref().map(PathBuf::from))
        .or_else(system_ca_bundle);
    let tls = match &ca_file {
        Some(path) => RustlsConnector::from_pem_file(path)?,
        None => {
            tracing::warn!("No trust anchors found, server certificates will not verify");
            RustlsConnector::new(RootCertStore::empty())
        }
    };

    let session = HttpNetworkSession::new(config, SessionDeps::system(Arc::new(tls)))?;
    let request = HttpRequestInfo::get(&args.url)?;
    tracing::info!(request = %request.id, url = %request.url, "Fetching");
    let mut trans = HttpNetworkTransaction::new(Arc::clone(&session), request);

    // Each set of credentials is offered once; a second challenge is shown.
    let mut user = args.user.as_deref().map(AuthCredentials::parse);
    let mut proxy_user = args.proxy_user.as_deref().map(AuthCredentials::parse);
    let mut result = trans.start().await;
    loop {
        match result {
            Err(e) if e.is_certificate_error() && args.insecure => {
                tracing::warn!(error = %e, "Ignoring certificate error");
                result = trans.restart_ignoring_error().await;
            }
            Err(e) => return Err(e.into()),
            Ok(()) => {
                let Some(challenge) = trans.response_info().auth_challenge.clone() else {
                    break;
                };
                let credentials = if challenge.is_proxy {
                    proxy_user.take()
                } else {
                    user.take()
                };
                match credentials {
                    Some(credentials) => {
                        tracing::info!(challenger = %challenge.challenger, realm = %challenge.realm, "Answering auth challenge");
                        result = trans.restart_with_auth(credentials).await;
                    }
                    None => break,
                }
            }
        }
    }

    let response = trans.response_info();
    eprintln!("{}", response.status_line());
    for (name, value) in &response.headers {
        eprintln!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
    }
    eprintln!();

    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = trans.read().await? {
        stdout.write_all(&chunk).await?;
    }
    stdout.flush().await?;

    tracing::debug!(
        received_bytes = trans.total_received_bytes(),
        timing = %trans.load_timing_info().as_value(),
        "Fetch complete"
    );
    if args.show_pools {
        eprintln!("{}", serde_json::to_string_pretty(&session.pool_info())?);
    }
    Ok(())
}

fn system_ca_bundle() -> Option<PathBuf> {
    SYSTEM_CA_BUNDLES
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(Path::to_path_buf)
}
