mod cli;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let code = cli::Cli::parse().run().await?;
    std::process::exit(code);
}
