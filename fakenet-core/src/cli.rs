use crate::{train, AccuracyDenominator, ModelConfig, ResNetType, TrainingConfig};
use anyhow::Context as _;
use burn::backend::Autodiff;
use clap::{CommandFactory as _, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(subcommand)]
    subcmd: SubCmd,
}

#[derive(Debug, Subcommand)]
enum SubCmd {
    /// Train a ResNet model to tell real posts from fabricated ones.
    Train {
        /// Model type
        #[arg(short, long, default_value=ResNetType::default())]
        model: ResNetType,
        /// CSV file mapping training image names to labels
        #[arg(long, default_value = "train.csv")]
        train_set: PathBuf,
        /// Directory containing the training images
        #[arg(long, default_value = "train")]
        train_dir: PathBuf,
        /// CSV file mapping validation image names to labels
        #[arg(long, default_value = "valid.csv")]
        valid_set: PathBuf,
        /// Directory containing the validation images
        #[arg(long, default_value = "valid")]
        valid_dir: PathBuf,
        /// CSV file of a test set evaluated after the last epoch
        #[arg(long, requires = "test_dir")]
        test_set: Option<PathBuf>,
        /// Directory containing the test images
        #[arg(long, requires = "test_set")]
        test_dir: Option<PathBuf>,
        /// Directory to save artifacts (The directory will be recreated if it exists)
        #[arg(short, long, default_value = "fakenet_artifact")]
        artifact_dir: PathBuf,
        #[arg(short = 'e', long, default_value = "1")]
        num_epochs: usize,
        #[arg(short, long, default_value = "24")]
        batch_size: usize,
        /// Number of workers for data loading, 0 loads on the training thread
        #[arg(short = 'w', long, default_value = "0")]
        num_workers: usize,
        #[arg(short, long, default_value = "1.0e-2")]
        learning_rate: f64,
        #[arg(long, default_value = "0.9")]
        momentum: f64,
        #[arg(long, default_value = "1.0e-3")]
        weight_decay: f32,
        #[arg(long, default_value = "2")]
        num_classes: usize,
        /// Edge length images are resized to
        #[arg(long, default_value = "224")]
        image_size: u32,
        /// Probability of flipping a training image horizontally
        #[arg(long, default_value = "0.5")]
        flip_prob: f64,
        /// Divide batch accuracy by the batch length or by the configured batch size
        #[arg(long, default_value = "actual")]
        accuracy_denominator: AccuracyDenominator,
        /// Random seed for reproducibility
        #[arg(short, long, default_value = "42")]
        seed: u64,
        /// Skip rendering the loss and accuracy charts
        #[arg(long)]
        no_plot: bool,
        /// Train on the CPU even if an accelerator is available
        #[arg(long)]
        cpu: bool,
    },
    /// generate auto completion script
    GenCompletion {
        /// shell name
        shell: Shell,
    },
}

#[cfg(feature = "tch")]
type MyBackend = burn::backend::LibTorch<f32, i8>;
#[cfg(all(feature = "candle", not(feature = "tch")))]
type MyBackend = burn::backend::Candle<f32, u8>;
#[cfg(all(feature = "ndarray", not(any(feature = "tch", feature = "candle"))))]
type MyBackend = burn::backend::NdArray<f32>;

type MyAutodiffBackend = Autodiff<MyBackend>;
type MyDevice = <MyBackend as burn::prelude::Backend>::Device;

#[cfg(feature = "tch")]
fn device(cpu: bool) -> MyDevice {
    use burn::backend::libtorch::LibTorchDevice;
    match cpu {
        true => LibTorchDevice::Cpu,
        false if cfg!(target_os = "macos") => LibTorchDevice::Mps,
        false => LibTorchDevice::Cuda(0),
    }
}

#[cfg(all(feature = "candle", not(feature = "tch")))]
fn device(cpu: bool) -> MyDevice {
    use burn::backend::candle::CandleDevice;
    match cpu {
        true => CandleDevice::Cpu,
        #[cfg(target_os = "macos")]
        false => CandleDevice::metal(0),
        #[cfg(not(target_os = "macos"))]
        false => CandleDevice::cuda(0),
    }
}

#[cfg(all(feature = "ndarray", not(any(feature = "tch", feature = "candle"))))]
fn device(_cpu: bool) -> MyDevice {
    burn::backend::ndarray::NdArrayDevice::Cpu
}

/// Panics raised while loading a batch carry the image path, logging them
/// through tracing adds the active epoch and batch spans.
fn install_panic_hook() {
    let default = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic| {
        tracing::error!("{panic}");
        default(panic);
    }));
}

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    install_panic_hook();

    let args = Cli::parse();
    match args.subcmd {
        SubCmd::Train {
            model,
            train_set,
            train_dir,
            valid_set,
            valid_dir,
            test_set,
            test_dir,
            artifact_dir,
            num_epochs,
            batch_size,
            num_workers,
            learning_rate,
            momentum,
            weight_decay,
            num_classes,
            image_size,
            flip_prob,
            accuracy_denominator,
            seed,
            no_plot,
            cpu,
        } => {
            let device = device(cpu);
            info!(?device, "training on");
            let report = train::train::<MyAutodiffBackend>(
                &artifact_dir,
                TrainingConfig::new(
                    ModelConfig::new()
                        .with_resnet(model)
                        .with_num_classes(num_classes),
                    train::sgd(momentum, weight_decay),
                    train_set,
                    train_dir,
                    valid_set,
                    valid_dir,
                )
                .with_test_set(test_set)
                .with_test_dir(test_dir)
                .with_num_epochs(num_epochs)
                .with_batch_size(batch_size)
                .with_num_workers(num_workers)
                .with_learning_rate(learning_rate)
                .with_image_size(image_size)
                .with_flip_prob(flip_prob)
                .with_accuracy_denominator(accuracy_denominator)
                .with_seed(seed)
                .with_plot(!no_plot),
                device,
            )
            .context("training failed")?;
            info!(
                artifact_dir = %artifact_dir.display(),
                batches = report.series.train_loss().len(),
                "run finished"
            );
        }
        SubCmd::GenCompletion { shell } => {
            generate(shell, &mut Cli::command(), "fakenet", &mut std::io::stdout());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["fakenet", "train"]).unwrap();
        let SubCmd::Train {
            model,
            num_epochs,
            batch_size,
            learning_rate,
            momentum,
            weight_decay,
            num_classes,
            image_size,
            accuracy_denominator,
            test_set,
            ..
        } = cli.subcmd
        else {
            panic!("expected the train subcommand");
        };
        assert_eq!(model, ResNetType::Layer50);
        assert_eq!((num_epochs, batch_size, num_classes, image_size), (1, 24, 2, 224));
        assert_eq!((learning_rate, momentum, weight_decay), (1.0e-2, 0.9, 1.0e-3));
        assert_eq!(accuracy_denominator, AccuracyDenominator::Actual);
        assert!(test_set.is_none());
    }

    #[test]
    fn test_test_set_requires_its_directory() {
        assert!(Cli::try_parse_from(["fakenet", "train", "--test-set", "test.csv"]).is_err());
        assert!(Cli::try_parse_from([
            "fakenet",
            "train",
            "--model",
            "layer101",
            "--test-set",
            "test.csv",
            "--test-dir",
            "test",
        ])
        .is_ok());
    }

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }
}
