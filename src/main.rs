//! CLI entry point for vision-finetune-rs.

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vision_finetune_rs::{FinetuneConfig, ParameterSnapshot, Result};

#[derive(Parser)]
#[command(name = "vision-finetune")]
#[command(about = "Fine-tune an image classifier on a directory-structured dataset")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start training
    Train(TrainArgs),
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Generate a default configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "finetune.yaml")]
        output: String,
    },
    /// List the parameters stored in a weights file
    Inspect {
        /// Path to a .safetensors, .pth, .pt or .bin file
        weights: String,
    },
}

/// Flags override values loaded from `--config`.
#[derive(Args)]
struct TrainArgs {
    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,
    /// Number of classifier outputs
    #[arg(long)]
    num_classes: Option<usize>,
    /// Number of epochs
    #[arg(long)]
    epochs: Option<usize>,
    /// Samples per batch
    #[arg(long)]
    batch_size: Option<usize>,
    /// Base learning rate
    #[arg(long)]
    lr: Option<f64>,
    /// Final learning rate as a fraction of the base rate
    #[arg(long)]
    lrf: Option<f64>,
    /// Dataset root containing train/ and val/
    #[arg(long)]
    data_path: Option<String>,
    /// Pretrained weights to transfer from
    #[arg(long)]
    weights: Option<String>,
    /// Freeze everything except the classification layer
    #[arg(long)]
    freeze_layers: Option<bool>,
    /// Device: cpu, cuda, cuda:N, N, metal, metal:N
    #[arg(long)]
    device: Option<String>,
    /// Directory for the checkpoint and class index map
    #[arg(long)]
    output_dir: Option<String>,
    /// Square input size in pixels
    #[arg(long)]
    image_size: Option<usize>,
    /// Upper bound on image decode workers
    #[arg(long)]
    num_workers: Option<usize>,
    /// Random seed
    #[arg(long)]
    seed: Option<u64>,
    /// Hide progress bars
    #[arg(long)]
    no_progress: bool,
}

impl TrainArgs {
    fn into_config(self) -> Result<FinetuneConfig> {
        let mut config = match &self.config {
            Some(path) => FinetuneConfig::from_file(path)?,
            None => FinetuneConfig::default(),
        };
        if let Some(v) = self.num_classes {
            config.num_classes = v;
        }
        if let Some(v) = self.epochs {
            config.training.epochs = v;
        }
        if let Some(v) = self.batch_size {
            config.training.batch_size = v;
        }
        if let Some(v) = self.lr {
            config.training.learning_rate = v;
        }
        if let Some(v) = self.lrf {
            config.training.lr_floor = v;
        }
        if let Some(v) = self.data_path {
            config.data.path = v;
        }
        if self.weights.is_some() {
            config.weights = self.weights;
        }
        if let Some(v) = self.freeze_layers {
            config.freeze_layers = v;
        }
        if let Some(v) = self.device {
            config.device = v;
        }
        if let Some(v) = self.output_dir {
            config.output_dir = v;
        }
        if let Some(v) = self.image_size {
            config.data.image_size = v;
        }
        if self.num_workers.is_some() {
            config.data.num_workers = self.num_workers;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if self.no_progress {
            config.training.show_progress = false;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => {
            let config = args.into_config()?;
            tracing::info!("Starting training on {}", config.data.path);
            let reports = vision_finetune_rs::run(config)?;
            if let Some(last) = reports.last() {
                println!(
                    "✓ Training complete: {} epochs, final accuracy {:.3}",
                    reports.len(),
                    last.accuracy
                );
            }
        }
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = FinetuneConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Classes: {}", config.num_classes);
            println!("  Dataset: {}", config.data.path);
            println!("  Epochs: {}", config.training.epochs);
            println!("  Weights: {}", config.weights.as_deref().unwrap_or("none"));
        }
        Commands::Init { output } => {
            FinetuneConfig::default().to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
        Commands::Inspect { weights } => {
            let snapshot = ParameterSnapshot::load(&weights)?;
            let mut total = 0usize;
            for (name, tensor) in snapshot.iter() {
                println!("{name}\t{:?}\t{}", tensor.dims(), tensor.elem_count());
                total += tensor.elem_count();
            }
            println!("{} tensors, {} elements", snapshot.len(), total);
        }
    }

    Ok(())
}
