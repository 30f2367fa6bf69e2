use std::path::PathBuf;

use clap::Parser;

use httpfsmount::fs::mount::mount_unprivileged;
use httpfsmount::{HttpClient, HttpFs};

#[derive(Parser)]
#[command(name = "httpfsmount", version, about = "Mount a remote httpfs tree over HTTP")]
struct Cli {
    /// URL of the httpfs backend (required)
    #[arg(long)]
    url: String,

    /// Path to mount the volume (required)
    #[arg(long)]
    mount: PathBuf,

    /// Enable TLS verification
    #[arg(long)]
    tlsverify: bool,

    /// Enable debug log messages to stderr
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "httpfsmount=debug"
    } else {
        "httpfsmount=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| default_directive.to_string()))
        .init();

    if !cli.mount.is_dir() {
        anyhow::bail!("mount point must be an existing directory");
    }

    let client = HttpClient::new(&cli.url, cli.tlsverify)?;
    let fs = HttpFs::new(client);

    let handle = mount_unprivileged(fs, &cli.mount).await?;
    println!("mounted {} at {}", cli.url, cli.mount.display());

    tokio::signal::ctrl_c().await?;
    println!("unmounting...");
    handle.unmount().await?;
    Ok(())
}
