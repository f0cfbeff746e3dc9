use clap::Parser;
use hanna::bridge::LogPublisher;
use hanna::cli::{self, Cli};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let code = cli::run(cli, Vec::new(), Arc::new(LogPublisher)).await?;
    std::process::exit(code);
}
