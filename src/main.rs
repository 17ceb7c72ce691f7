use anyhow::Result;
use clap::Parser;
use roi_classifier_lib::Cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    // RUST_LOG が設定されていればそちらを優先
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("roi_classifier={level},tower_http={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    cli.run().await
}
