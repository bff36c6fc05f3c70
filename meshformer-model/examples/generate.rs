//! Token generation on the CPU backend
//!
//! Usage:
//!   cargo run --example generate -- --config model.json --checkpoint ckpt/ 1 2 3 4
//!   cargo run --example generate -- --greedy 5 9 2
//!   cargo run --example generate -- -t 0.8 -p 0.95 -n 32 5 9 2
//!
//! Without `--config` a small random `gpt-j` model is used; without
//! `--checkpoint` the parameters are freshly initialised.

use clap::Parser;

use meshformer::{
    Architecture, GreedySampler, ModelConfig, NucleusSampler, Result, SamplingOptions, Sgd,
};
use meshformer_cpu::{CpuBackend, SafeTensorsCheckpoint};
use meshformer_model::Transformer;

/// Generate token ids with a sharded transformer on CPU threads
#[derive(Parser)]
#[command(name = "generate")]
struct Cli {
    /// JSON model configuration (default: small gpt-j)
    #[arg(short, long, env = "MESHFORMER_CONFIG")]
    config: Option<String>,

    /// Directory of shard_{rank}.safetensors files
    #[arg(short = 'k', long)]
    checkpoint: Option<String>,

    /// Context token ids
    #[arg(default_values_t = [1_u32, 2])]
    tokens: Vec<u32>,

    /// Tokens to generate
    #[arg(short = 'n', long, default_value_t = 16)]
    max_tokens: usize,

    /// Use greedy (argmax) decoding instead of sampling
    #[arg(long)]
    greedy: bool,

    /// Sampling temperature
    #[arg(short, long, default_value_t = 1.0)]
    temperature: f32,

    /// Nucleus sampling threshold
    #[arg(short = 'p', long, default_value_t = 0.9)]
    top_p: f32,

    /// RNG seed for sampling
    #[arg(short, long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ModelConfig::from_file(path)?,
        None => ModelConfig::new(Architecture::GptJ, 64, 32, 4, 2, 32),
    };
    println!(
        "Model: {} ({} layers, d_model {}, {} shards)",
        config.architecture.name(),
        config.layers,
        config.d_model,
        config.topology.shard_count
    );

    let optimizer = Sgd::new(0.0);
    let model = match &cli.checkpoint {
        Some(dir) => {
            let store = SafeTensorsCheckpoint::new(dir);
            Transformer::<CpuBackend, _>::from_checkpoint(config, optimizer, &store)?
        }
        None => Transformer::<CpuBackend, _>::new(config, optimizer, 0)?,
    };

    // generation needs at least two context tokens
    let mut tokens = cli.tokens.clone();
    while tokens.len() < 2 {
        tokens.insert(0, 1);
    }

    // right-align the context in the full sequence window
    let seq = model.config().seq;
    let mut context = vec![0; seq.saturating_sub(tokens.len())];
    context.extend_from_slice(&tokens);
    let ctx_length = tokens.len();

    let sampling = SamplingOptions {
        temperature: cli.temperature,
        top_p: cli.top_p,
        seed: cli.seed,
    };
    let generated = if cli.greedy {
        println!("Decoding: greedy (argmax)");
        model.generate(&[context], &[ctx_length], cli.max_tokens, &GreedySampler, &sampling)?
    } else {
        println!(
            "Sampling: temperature={}, top_p={}, seed={}",
            sampling.temperature, sampling.top_p, sampling.seed
        );
        model.generate(&[context], &[ctx_length], cli.max_tokens, &NucleusSampler, &sampling)?
    };

    println!("Context:   {tokens:?}");
    println!("Generated: {:?}", generated.first().cloned().unwrap_or_default());
    Ok(())
}
