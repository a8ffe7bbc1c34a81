use std::path::PathBuf;

use clap::Parser;
use env_logger::Env;
use spatial_join::{config::Config, pipeline};

/// Annotate features with the regions they fall in.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input config file.
    #[arg(short, long)]
    config_filepath: PathBuf,
}

fn try_main() -> anyhow::Result<()> {
    let args = Args::try_parse()?;
    let config = Config::from_file(&args.config_filepath)?;
    let summary = pipeline::run(&config)?;
    log::info!(
        "Wrote {} features to {:?}",
        summary.features_written,
        config.output.features
    );
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    if let Err(e) = try_main() {
        eprintln!("Error: {:?}", e);
        std::process::exit(1)
    }
}
