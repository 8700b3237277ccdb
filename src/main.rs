use std::path::PathBuf;

use clap::Parser;
use dicom_node::config::Config;

/// DICOM storage and query/retrieve node
#[derive(Parser, Debug)]
#[command(name = "dicom-node", version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log level, overriding the configuration file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = Config::from_file(&args.config)?;
    if let Some(level) = args.log_level {
        config.node.log_level = level;
    }
    if args.check {
        println!("{}: configuration is valid", args.config.display());
        return Ok(());
    }
    dicom_node::run(config).await
}
