use clap::Parser;
use std::path::PathBuf;

/// Arguments for colab-master.
#[derive(Parser, Debug)]
#[command(name = "colab-master")]
#[command(about = "Keeps workspaces replicated across storage nodes")]
#[command(version)]
pub struct MasterArgs {
    /// Settings file (JSON)
    #[arg(short, long, env = "COLAB_CONFIG", default_value = "colab.json")]
    pub config: PathBuf,

    /// Log filter, overrides RUST_LOG
    #[arg(long, env = "COLAB_LOG")]
    pub log: Option<String>,

    /// Run a single replication pass and exit
    #[arg(long)]
    pub once: bool,
}

/// Arguments for colab-replay.
#[derive(Parser, Debug)]
#[command(name = "colab-replay")]
#[command(about = "Print the buffers stored for a workspace and check their fingerprints")]
#[command(version)]
pub struct ReplayArgs {
    /// Directory holding workspace databases
    #[arg(short, long, env = "COLAB_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Workspace to load
    pub workspace: u64,

    /// Also print buffer contents
    #[arg(long)]
    pub content: bool,

    /// Log filter, overrides RUST_LOG
    #[arg(long, env = "COLAB_LOG")]
    pub log: Option<String>,
}

/// Install the tracing subscriber. `filter` wins over `RUST_LOG`; the
/// default is `info`.
pub fn init_tracing(filter: Option<&str>) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = match filter {
        Some(filter) => tracing_subscriber::EnvFilter::new(filter),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info".into()),
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
