//! Inferir CLI
//!
//! # Commands
//!
//! - `run` - Generate text from a GGUF model or checkpoint
//! - `info` - Show a container's header, hyperparameters and tensors
//! - `quantize` - Re-encode a container's weight matrices

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use inferir::checkpoint::{load_checkpoint, CHECKPOINT_MAGIC};
use inferir::config::{init_tracing, EngineConfig};
use inferir::engine::InferenceEngine;
use inferir::error::Result;
use inferir::gguf::{GgufWriter, MappedGguf, MetadataValue};
use inferir::model::ModelConfig;
use inferir::quantize::QuantKind;
use inferir::session::InferenceOptions;
use inferir::tokenizer::ByteTokenizer;
use tracing::info;

/// Inferir - governed CPU inference for transformer language models
#[derive(Parser)]
#[command(name = "inferir")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a completion
    ///
    /// Examples:
    ///   inferir run ./model.gguf "Once upon a time" -n 64 --seed 7
    ///   inferir run ./model.ckpt "abc" --temperature 0
    Run {
        /// GGUF container or checkpoint
        #[arg(value_name = "MODEL")]
        model: PathBuf,

        /// Prompt text
        #[arg(value_name = "PROMPT")]
        prompt: String,

        /// Maximum tokens to generate
        #[arg(short = 'n', long)]
        max_new_tokens: Option<usize>,

        /// Seed for reproducible sampling
        #[arg(long)]
        seed: Option<u64>,

        /// Sampling temperature (0 = greedy)
        #[arg(short, long)]
        temperature: Option<f32>,

        /// Top-k cutoff (0 = off)
        #[arg(long)]
        top_k: Option<usize>,

        /// Nucleus cutoff
        #[arg(long)]
        top_p: Option<f32>,

        /// Wall-clock budget in milliseconds
        #[arg(long)]
        max_time_ms: Option<u64>,

        /// Engine configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Show container metadata and tensors
    Info {
        /// GGUF container
        #[arg(value_name = "MODEL")]
        model: PathBuf,
    },
    /// Re-encode 2-D weights as another kind
    ///
    /// Examples:
    ///   inferir quantize model-f32.gguf model-q8.gguf --kind q8_0
    Quantize {
        /// Source container
        #[arg(value_name = "IN")]
        input: PathBuf,

        /// Destination container
        #[arg(value_name = "OUT")]
        output: PathBuf,

        /// Target kind: q8_0, q4_0, q4_1 or f16
        #[arg(short, long, default_value = "q8_0")]
        kind: QuantKind,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            model,
            prompt,
            max_new_tokens,
            seed,
            temperature,
            top_k,
            top_p,
            max_time_ms,
            config,
        } => {
            let config = match config {
                Some(path) => EngineConfig::from_json_file(path)?,
                None => EngineConfig::default(),
            }
            .with_env_overrides()?;
            let mut options = config.default_options.clone();
            if let Some(n) = max_new_tokens {
                options = options.with_max_new_tokens(n);
            }
            if let Some(s) = seed {
                options = options.with_seed(s);
            }
            if let Some(t) = temperature {
                options = options.with_temperature(t);
            }
            if let Some(k) = top_k {
                options = options.with_top_k(k);
            }
            if let Some(p) = top_p {
                options = options.with_top_p(p);
            }
            if let Some(ms) = max_time_ms {
                options = options.with_max_time_ms(ms);
            }
            run_model(&model, &prompt, config, options).await?;
        },
        Commands::Info { model } => display_model_info(&model)?,
        Commands::Quantize {
            input,
            output,
            kind,
        } => quantize_model(&input, &output, kind)?,
    }

    Ok(())
}

fn is_checkpoint(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 4];
    let mut f = std::fs::File::open(path)?;
    Ok(std::io::Read::read_exact(&mut f, &mut magic).is_ok() && magic == CHECKPOINT_MAGIC)
}

fn open_engine(path: &Path, config: EngineConfig) -> Result<InferenceEngine> {
    if is_checkpoint(path)? {
        // Checkpoints carry no vocabulary; byte-level ids with the model's specials
        let weights = load_checkpoint(path)?;
        let c = &weights.config;
        let special = |id: Option<u32>| id.filter(|&id| id >= 256);
        let tokenizer = ByteTokenizer::with_specials(special(c.bos_token_id), special(c.eos_token_id))?;
        InferenceEngine::new(Arc::new(weights), Arc::new(tokenizer), config)
    } else {
        InferenceEngine::load(path, config)
    }
}

async fn run_model(
    path: &Path,
    prompt: &str,
    config: EngineConfig,
    options: InferenceOptions,
) -> Result<()> {
    let engine = open_engine(path, config)?;
    let mut stream = engine.stream(prompt, options).await?;

    let mut stdout = std::io::stdout().lock();
    write!(stdout, "{prompt}")?;
    let mut last = None;
    let mut failure = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(token) => {
                write!(stdout, "{}", token.text)?;
                stdout.flush()?;
                last = Some(token.metrics);
            },
            Err(e) => failure = Some(e),
        }
    }
    writeln!(stdout)?;

    if let Some(m) = last {
        info!(
            tokens = m.tokens_generated,
            ttft_ms = m.time_to_first_token.map_or(0, |d| d.as_millis() as u64),
            tokens_per_second = format!("{:.1}", m.tokens_per_second()),
            "Generation finished"
        );
    }
    match failure {
        // Partial output is already printed; report why it stopped
        Some(e) => {
            eprintln!("stopped: {e}");
            Ok(())
        },
        None => Ok(()),
    }
}

fn display_model_info(path: &Path) -> Result<()> {
    let container = MappedGguf::open(path)?;
    let file = &container.file;
    println!("File: {}", path.display());
    println!("GGUF version: {}", file.header.version);
    println!("Alignment: {}", file.alignment);
    println!();

    println!("Metadata ({} entries):", file.metadata.len());
    for (key, value) in &file.metadata {
        match value {
            MetadataValue::Array(items) => println!("  {key} = [{} items]", items.len()),
            other => println!("  {key} = {other}"),
        }
    }
    println!();

    match ModelConfig::from_gguf(file) {
        Ok(c) => {
            println!("Model:");
            println!("  architecture: {}", c.architecture);
            println!("  vocab: {}, hidden: {}, layers: {}", c.vocab_size, c.hidden_dim, c.num_layers);
            println!(
                "  heads: {} (kv {}), head dim: {}, ffn: {} ({:?})",
                c.num_heads,
                c.num_kv_heads,
                c.head_dim(),
                c.intermediate_dim,
                c.ffn
            );
            println!(
                "  context: {}, norm: {:?}, position: {:?}, tied output: {}",
                c.context_length, c.norm, c.position, c.tied_output
            );
        },
        Err(e) => println!("Model: not loadable ({e})"),
    }
    println!();

    println!("Tensors ({}):", file.tensors.len());
    let mut total = 0usize;
    for t in &file.tensors {
        let bytes = t.byte_size()?;
        total += bytes;
        println!("  {:<32} {:<5} {:?} ({bytes} bytes)", t.name, t.kind.name(), t.shape);
    }
    println!("Total tensor data: {}", format_size(total as u64));
    Ok(())
}

fn quantize_model(input: &Path, output: &Path, kind: QuantKind) -> Result<()> {
    let container = MappedGguf::open(input)?;
    let writer = GgufWriter::requantize(&container, kind)?;
    writer.write_file(output)?;
    let before = std::fs::metadata(input)?.len();
    let after = std::fs::metadata(output)?.len();
    info!(
        kind = %kind,
        before = %format_size(before),
        after = %format_size(after),
        "Container re-encoded"
    );
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
