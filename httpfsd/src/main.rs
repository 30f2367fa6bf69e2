use std::net::SocketAddr;
use std::path::PathBuf;

use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Parser)]
#[command(name = "httpfsd", version, about = "Serve a local directory over the httpfs protocol")]
struct Cli {
    /// [int]:<port> to bind to
    #[arg(long, default_value = "0.0.0.0:8000")]
    bind: String,

    /// Path to serve (defaults to the current working directory)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Use TLS
    #[arg(long)]
    tls: bool,

    /// Server certificate
    #[arg(long, default_value = "server.crt")]
    tlscert: PathBuf,

    /// Server key
    #[arg(long, default_value = "server.key")]
    tlskey: PathBuf,

    /// Set debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "httpfsd=debug,tower_http=debug"
    } else {
        "httpfsd=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| default_directive.to_string()))
        .init();

    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    let root = root.canonicalize()?;

    let app = httpfsd::router(root.clone()).layer(TraceLayer::new_for_http());

    info!(target: "httpfsd", bind = %cli.bind, root = %root.display(), tls = cli.tls, "serving");

    if cli.tls {
        let addr: SocketAddr = cli.bind.parse()?;
        let tls_config = RustlsConfig::from_pem_file(&cli.tlscert, &cli.tlskey).await?;
        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(&cli.bind).await?;
        axum::serve(listener, app).await?;
    }

    Ok(())
}
