//! Writes a freshly initialised (untrained) RetinaCNN weight file.

use clap::Parser;
use fundus_backend::model::{Architecture, RetinaCnn};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "init-weights", about = "Generate seeded He-initialised RetinaCNN weights")]
struct Args {
    /// Output safetensors file
    #[arg(short, long, default_value = "models/fundus_cnn.safetensors")]
    output: PathBuf,

    /// RNG seed
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Channels of each conv block
    #[arg(long, value_delimiter = ',', default_values_t = [32, 64, 128, 256])]
    blocks: Vec<usize>,

    /// Units of each hidden dense layer
    #[arg(long, value_delimiter = ',', default_values_t = [512, 256])]
    dense: Vec<usize>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let args = Args::parse();

    let architecture = Architecture {
        block_channels: args.blocks,
        dense_units: args.dense,
    };
    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let model = RetinaCnn::initialize(&architecture, args.seed);
    model.save(&args.output)?;
    log::info!(
        "Wrote {} (seed {}) to {}",
        architecture.describe(),
        args.seed,
        args.output.display()
    );
    Ok(())
}
