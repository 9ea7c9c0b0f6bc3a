use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use homebrew_llm::config::Config;
use homebrew_llm::data::{DataLoader, Dataset};
use homebrew_llm::tokenizer::{BPETrainer, Tokenizer};
use homebrew_llm::{LinearAttention, TextGenerator, Trainer};

#[derive(Parser)]
#[command(name = "homebrew-llm")]
#[command(about = "Train reversible linear-attention language models")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Training config; shorthand for `homebrew-llm train <CONFIG>`
    config: Option<PathBuf>,

    #[command(flatten)]
    device: DeviceArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Clone, Default)]
struct DeviceArgs {
    /// Run on the CPU even when a GPU feature is enabled
    #[arg(long)]
    cpu: bool,

    /// GPU device index (for multi-GPU systems)
    #[arg(long, default_value = "0")]
    gpu_id: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model from a YAML config
    Train {
        /// Path to the YAML config
        config: PathBuf,

        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Train a BPE tokenizer
    TrainTokenizer {
        /// Input text files for training (.gz and .zst are decompressed)
        #[arg(short, long, num_args = 1.., required = true)]
        input: Vec<PathBuf>,

        /// Output tokenizer path
        #[arg(short, long)]
        output: PathBuf,

        /// Vocabulary size
        #[arg(short, long, default_value = "32000")]
        vocab_size: usize,

        /// Minimum pair frequency for a merge
        #[arg(long, default_value = "2")]
        min_frequency: u32,
    },

    /// Generate text from a trained model
    Generate {
        /// Config the model was trained with
        #[arg(long)]
        config: PathBuf,

        /// Path to model checkpoint
        #[arg(short, long)]
        checkpoint: PathBuf,

        /// Tokenizer file; defaults to `data.tokenizer` from the config
        #[arg(short, long)]
        tokenizer: Option<PathBuf>,

        /// Prompt text
        #[arg(short, long)]
        prompt: String,

        /// Maximum number of tokens to generate
        #[arg(short, long, default_value = "100")]
        max_tokens: usize,

        /// Sampling temperature; 0 is greedy
        #[arg(long, default_value = "0.8")]
        temperature: f64,

        /// Top-k sampling
        #[arg(long)]
        top_k: Option<usize>,

        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Show model info for a preset name or a config file
    Info {
        /// Preset (tiny, small) or path to a YAML config
        #[arg(default_value = "small")]
        model: String,
    },
}

impl Cli {
    /// The subcommand to run; a bare config path means `train`.
    fn into_command(self) -> Result<Commands> {
        match (self.command, self.config) {
            (Some(command), _) => Ok(command),
            (None, Some(config)) => Ok(Commands::Train {
                config,
                device: self.device,
            }),
            (None, None) => anyhow::bail!("expected a config file or a subcommand; see --help"),
        }
    }
}

#[allow(unused_variables)]
fn get_device(args: &DeviceArgs) -> Result<Device> {
    if args.cpu {
        return Ok(Device::Cpu);
    }
    #[cfg(feature = "cuda")]
    {
        return Ok(Device::new_cuda(args.gpu_id)?);
    }
    #[cfg(feature = "metal")]
    {
        return Ok(Device::new_metal(args.gpu_id)?);
    }
    #[cfg(not(any(feature = "metal", feature = "cuda")))]
    {
        tracing::warn!(
            "No GPU feature enabled, using CPU. Build with --features metal or --features cuda"
        );
        Ok(Device::Cpu)
    }
}

fn load_tokenizer(path: Option<&Path>) -> Result<Tokenizer> {
    match path {
        Some(path) => info!("Loading tokenizer from {}", path.display()),
        None => info!("Using byte-level tokens"),
    }
    Tokenizer::load(path)
}

fn train(config_path: &Path, device: &DeviceArgs) -> Result<()> {
    let mut config = Config::from_yaml(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let device = get_device(device)?;
    info!("Using device: {:?}", device);

    let tokenizer = load_tokenizer(config.data.tokenizer.as_deref())?;
    if tokenizer.vocab_size() != config.model.vocab_size {
        info!(
            "Setting vocab size to {} (config had {})",
            tokenizer.vocab_size(),
            config.model.vocab_size
        );
        config.model.vocab_size = tokenizer.vocab_size();
    }
    info!("Model config: {:?}", config.model);

    let train_path = config
        .data
        .train_path
        .clone()
        .context("data.train_path is required for training")?;
    info!("Loading dataset from {}", train_path.display());
    let dataset = Dataset::from_file(
        &train_path,
        config.data.format,
        &config.data.text_field,
        &tokenizer,
        config.model.sequence_length,
    )?;
    info!("Dataset size: {} tokens", dataset.tokens().len());

    let mut train_loader = DataLoader::new(
        dataset,
        config.training.batch_size,
        true,
        config.training.seed,
    );
    info!("Number of batches: {}", train_loader.num_batches());

    let mut eval_loader = match config.data.eval_path.clone() {
        Some(path) => {
            info!("Loading eval dataset from {}", path.display());
            let dataset = Dataset::from_file(
                &path,
                config.data.format,
                &config.data.text_field,
                &tokenizer,
                config.model.sequence_length,
            )?;
            Some(DataLoader::new(
                dataset,
                config.training.batch_size,
                false,
                config.training.seed,
            ))
        }
        None => None,
    };

    let output = config.training.output_dir.clone();
    std::fs::create_dir_all(&output)?;
    let saved = output.join("config.yaml");
    config.save_yaml(&saved)?;
    info!("Saved config to {}", saved.display());

    let mut trainer = Trainer::new(config.model, config.optimizer, config.training, device)?;
    trainer.train(&mut train_loader, eval_loader.as_mut(), Some(&output))?;

    info!("Training complete!");
    Ok(())
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    match cli.into_command()? {
        Commands::Train { config, device } => train(&config, &device)?,

        Commands::TrainTokenizer {
            input,
            output,
            vocab_size,
            min_frequency,
        } => {
            info!("Training BPE tokenizer with vocab size {}", vocab_size);
            let trainer = BPETrainer::new(vocab_size).with_min_frequency(min_frequency);
            let tokenizer = trainer.train_from_files(&input, &output)?;
            info!(
                "Tokenizer trained and saved to {} (vocab size: {})",
                output.display(),
                tokenizer.vocab_size()
            );
        }

        Commands::Generate {
            config: config_path,
            checkpoint,
            tokenizer: tokenizer_path,
            prompt,
            max_tokens,
            temperature,
            top_k,
            device,
        } => {
            let device = get_device(&device)?;
            info!("Using device: {:?}", device);

            let config = Config::from_yaml(&config_path)
                .with_context(|| format!("loading {}", config_path.display()))?;
            let tokenizer =
                load_tokenizer(tokenizer_path.as_deref().or(config.data.tokenizer.as_deref()))?;
            if tokenizer.vocab_size() != config.model.vocab_size {
                anyhow::bail!(
                    "tokenizer has {} tokens but the model was trained with {}",
                    tokenizer.vocab_size(),
                    config.model.vocab_size
                );
            }

            let mut var_map = VarMap::new();
            let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
            let model = LinearAttention::new(&config.model, vb)?;
            var_map.load(&checkpoint)?;
            info!("Loaded model from {}", checkpoint.display());

            let prompt_tokens = tokenizer.encode(&prompt)?;
            info!("Prompt tokens: {:?}", prompt_tokens);

            let generator = TextGenerator::new(&model, &device);
            let output_tokens =
                generator.generate(&prompt_tokens, max_tokens, temperature, top_k)?;

            let output_text = tokenizer.decode(&output_tokens)?;
            println!("\n{}", output_text);
        }

        Commands::Info { model } => {
            let config = match Config::preset(&model) {
                Some(config) => config,
                None if Path::new(&model).exists() => Config::from_yaml(&model)?,
                None => anyhow::bail!("unknown preset or config file '{}'", model),
            };
            let m = &config.model;
            let total = m.num_parameters();
            println!("Model: {}", model);
            println!("  Vocab size: {}", m.vocab_size);
            println!("  Sequence length: {}", m.sequence_length);
            println!("  Hidden features: {}", m.hidden_features);
            println!("  Stem features: {}", m.stem_features());
            println!("  Depth: {}", m.depth);
            println!("  Kernel size: {}", m.kernel_size);
            println!("  Intermediate factor: {}", m.intermediate_factor);
            println!("  Optimizer: {:?}", config.optimizer.kind);
            println!(
                "  Parameters: {} ({:.2}M)",
                total,
                total as f64 / 1_000_000.0
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(args: &[&str]) -> Result<Commands> {
        Cli::try_parse_from(args)?.into_command()
    }

    #[test]
    fn test_bare_config_trains() {
        let Commands::Train { config, device } =
            command(&["homebrew-llm", "configs/small.yaml"]).unwrap()
        else {
            panic!("expected train");
        };
        assert_eq!(config, PathBuf::from("configs/small.yaml"));
        assert!(!device.cpu);
        assert_eq!(device.gpu_id, 0);
    }

    #[test]
    fn test_train_subcommand() {
        let Commands::Train { config, device } =
            command(&["homebrew-llm", "train", "configs/tiny.yaml", "--cpu", "--gpu-id", "1"])
                .unwrap()
        else {
            panic!("expected train");
        };
        assert_eq!(config, PathBuf::from("configs/tiny.yaml"));
        assert!(device.cpu);
        assert_eq!(device.gpu_id, 1);
    }

    #[test]
    fn test_cpu_flag_with_bare_config() {
        let Commands::Train { config, device } =
            command(&["homebrew-llm", "--cpu", "configs/small.yaml"]).unwrap()
        else {
            panic!("expected train");
        };
        assert_eq!(config, PathBuf::from("configs/small.yaml"));
        assert!(device.cpu);
    }

    #[test]
    fn test_no_config_or_subcommand_is_an_error() {
        assert!(command(&["homebrew-llm"]).is_err());
        assert!(command(&["homebrew-llm", "--cpu"]).is_err());
    }

    #[test]
    fn test_generate_arguments() {
        let Commands::Generate {
            config,
            checkpoint,
            prompt,
            max_tokens,
            temperature,
            top_k,
            ..
        } = command(&[
            "homebrew-llm",
            "generate",
            "--config",
            "out/config.yaml",
            "--checkpoint",
            "out/latest.safetensors",
            "-p",
            "hello",
            "--top-k",
            "40",
        ])
        .unwrap()
        else {
            panic!("expected generate");
        };
        assert_eq!(config, PathBuf::from("out/config.yaml"));
        assert_eq!(checkpoint, PathBuf::from("out/latest.safetensors"));
        assert_eq!(prompt, "hello");
        assert_eq!(max_tokens, 100);
        assert_eq!(temperature, 0.8);
        assert_eq!(top_k, Some(40));
    }

    #[test]
    fn test_train_tokenizer_requires_input() {
        assert!(command(&["homebrew-llm", "train-tokenizer", "-o", "tok.json"]).is_err());
        let Commands::TrainTokenizer {
            input, vocab_size, ..
        } = command(&[
            "homebrew-llm",
            "train-tokenizer",
            "-i",
            "a.txt",
            "b.txt.zst",
            "-o",
            "tok.json",
        ])
        .unwrap()
        else {
            panic!("expected train-tokenizer");
        };
        assert_eq!(input.len(), 2);
        assert_eq!(vocab_size, 32000);
    }
}
