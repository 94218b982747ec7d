use crate::{
    data::{FakedditBatch, FakedditBatcher, FakedditDataset},
    error::Error,
    metrics::{AccuracyDenominator, BatchOutcome, MetricSeries, Tally},
    model::{Model, ModelConfig},
    plot,
    transform::Transform,
};
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder, Dataset},
    module::AutodiffModule,
    optim::{
        decay::WeightDecayConfig, momentum::MomentumConfig, GradientsParams, Optimizer, SgdConfig,
    },
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tracing::{debug, debug_span, info, info_span};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub optimizer: SgdConfig,
    /// Annotations of the training set
    pub train_set: PathBuf,
    /// Directory the training annotations refer to
    pub train_dir: PathBuf,
    pub valid_set: PathBuf,
    pub valid_dir: PathBuf,
    /// Evaluated once after the last epoch when given together with `test_dir`
    pub test_set: Option<PathBuf>,
    pub test_dir: Option<PathBuf>,
    #[config(default = 1)]
    pub num_epochs: usize,
    #[config(default = 24)]
    pub batch_size: usize,
    #[config(default = 0)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-2)]
    pub learning_rate: f64,
    #[config(default = 224)]
    pub image_size: u32,
    #[config(default = 0.5)]
    pub flip_prob: f64,
    #[config(default = "AccuracyDenominator::Actual")]
    pub accuracy_denominator: AccuracyDenominator,
    #[config(default = true)]
    pub plot: bool,
}

impl TrainingConfig {
    pub fn validate(&self) -> crate::Result<()> {
        let fail = |msg: &str| Err(Error::Config(msg.to_string()));
        if self.batch_size == 0 {
            return fail("batch_size must be positive");
        }
        if self.model.num_classes < 2 {
            return fail("num_classes must be at least 2");
        }
        if self.model.base_width == 0 {
            return fail("base_width must be positive");
        }
        if self.image_size == 0 {
            return fail("image_size must be positive");
        }
        if !(0. ..=1.).contains(&self.flip_prob) {
            return fail("flip_prob must lie in [0, 1]");
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0. {
            return fail("learning_rate must be positive");
        }
        if self.test_set.is_some() != self.test_dir.is_some() {
            return fail("test_set and test_dir must be given together");
        }
        Ok(())
    }
}

/// SGD with classical (undampened) momentum and L2 weight decay.
pub fn sgd(momentum: f64, weight_decay: f32) -> SgdConfig {
    SgdConfig::new()
        .with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(momentum)
                .with_dampening(0.),
        ))
        .with_weight_decay(Some(WeightDecayConfig::new(weight_decay)))
}

/// The part of the configuration the epoch loop reads.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub num_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub num_classes: usize,
    pub accuracy_denominator: AccuracyDenominator,
}

impl From<&TrainingConfig> for LoopSettings {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            num_epochs: config.num_epochs,
            batch_size: config.batch_size,
            learning_rate: config.learning_rate,
            num_classes: config.model.num_classes,
            accuracy_denominator: config.accuracy_denominator,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_batches: usize,
    pub mean_train_loss: f64,
    pub valid: Tally,
}

/// Everything a run produces besides the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub series: MetricSeries,
    pub epochs: Vec<EpochSummary>,
    pub test: Option<Tally>,
    pub elapsed_secs: f64,
}

/// Result of one pass over a split without gradients.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub tally: Tally,
    pub losses: Vec<f64>,
    pub accuracies: Vec<f64>,
}

type Loader<B> = Arc<dyn DataLoader<FakedditBatch<B>>>;

fn create_artifact_dir(artifact_dir: &Path) -> crate::Result<()> {
    // Remove existing artifacts so metrics and plots belong to this run only
    std::fs::remove_dir_all(artifact_dir).ok();
    std::fs::create_dir_all(artifact_dir)?;
    Ok(())
}

fn loader<B: Backend>(
    config: &TrainingConfig,
    device: &B::Device,
    dataset: FakedditDataset,
) -> Loader<B> {
    let mut builder = DataLoaderBuilder::new(FakedditBatcher::<B>::new(
        device.clone(),
        config.image_size as usize,
    ))
    .batch_size(config.batch_size)
    .shuffle(config.seed);
    if config.num_workers > 0 {
        builder = builder.num_workers(config.num_workers);
    }
    builder.build(dataset)
}

pub fn train<B: AutodiffBackend>(
    artifact_dir: &Path,
    config: TrainingConfig,
    device: B::Device,
) -> crate::Result<TrainingReport> {
    config.validate()?;

    let num_classes = config.model.num_classes;
    let size = config.image_size;
    let train_set = FakedditDataset::from_csv(
        "training",
        &config.train_set,
        &config.train_dir,
        num_classes,
        Transform::train(size, config.flip_prob),
    )?;
    let valid_set = FakedditDataset::from_csv(
        "validation",
        &config.valid_set,
        &config.valid_dir,
        num_classes,
        Transform::valid(size),
    )?;
    let test_set = match (&config.test_set, &config.test_dir) {
        (Some(set), Some(dir)) => Some(FakedditDataset::from_csv(
            "test",
            set,
            dir,
            num_classes,
            Transform::test(size),
        )?),
        _ => None,
    };
    info!(
        train = train_set.len(),
        valid = valid_set.len(),
        test = test_set.as_ref().map_or(0, |s| s.len()),
        "datasets loaded"
    );

    // Only a run whose inputs check out replaces the previous artifacts
    create_artifact_dir(artifact_dir)?;
    B::seed(config.seed);
    config.save(artifact_dir.join("train_config.json"))?;

    let dataloader_train = loader::<B>(&config, &device, train_set);
    let dataloader_valid = loader::<B::InnerBackend>(&config, &device, valid_set);

    let start = Instant::now();
    let settings = LoopSettings::from(&config);
    let model = config.model.init::<B>(&device);
    let mut optim = config.optimizer.init::<B, Model<B>>();
    let fitted = fit(
        model,
        &mut optim,
        &settings,
        dataloader_train.as_ref(),
        dataloader_valid.as_ref(),
    );

    let test = test_set.map(|set| {
        let loader = loader::<B::InnerBackend>(&config, &device, set);
        let _span = info_span!("phase", split = "test").entered();
        let evaluation = evaluate(&fitted.model.valid(), loader.as_ref(), &settings);
        println!(
            "Accuracy of the network on the test images: {:.2} %",
            evaluation.tally.accuracy_percent()
        );
        evaluation.tally
    });

    let elapsed = start.elapsed();
    println!("Total execution time: {:.4} minutes", elapsed.as_secs_f64() / 60.);

    let report = TrainingReport {
        series: fitted.series,
        epochs: fitted.epochs,
        test,
        elapsed_secs: elapsed.as_secs_f64(),
    };
    serde_json::to_writer_pretty(File::create(artifact_dir.join("metrics.json"))?, &report)?;
    if config.plot {
        for path in plot::render(artifact_dir, &report.series)? {
            info!(path = %path.display(), "chart written");
        }
    }

    Ok(report)
}

pub struct Fitted<B: AutodiffBackend> {
    pub model: Model<B>,
    pub series: MetricSeries,
    pub epochs: Vec<EpochSummary>,
}

/// Runs `settings.num_epochs` epochs of training followed by validation.
pub fn fit<B, O>(
    mut model: Model<B>,
    optim: &mut O,
    settings: &LoopSettings,
    dataloader_train: &dyn DataLoader<FakedditBatch<B>>,
    dataloader_valid: &dyn DataLoader<FakedditBatch<B::InnerBackend>>,
) -> Fitted<B>
where
    B: AutodiffBackend,
    O: Optimizer<Model<B>, B>,
{
    let mut series = MetricSeries::default();
    let mut epochs = Vec::with_capacity(settings.num_epochs);

    for epoch in 0..settings.num_epochs {
        let _span = info_span!("epoch", epoch).entered();

        let (next, train_batches, loss_sum) =
            train_epoch(model, optim, settings, dataloader_train, &mut series, epoch);
        model = next;
        let mean_train_loss = loss_sum / train_batches.max(1) as f64;
        info!(train_batches, mean_train_loss, "training phase finished");

        let evaluation = {
            let _span = info_span!("phase", split = "valid").entered();
            evaluate(&model.valid(), dataloader_valid, settings)
        };
        for (loss, accuracy) in evaluation.losses.iter().zip(&evaluation.accuracies) {
            series.push_valid(*loss, *accuracy);
        }
        let valid = evaluation.tally;
        info!(
            correct = valid.correct,
            total = valid.total,
            predicted = ?valid.predicted,
            "validation phase finished"
        );
        println!(
            "Accuracy of the network on the validation images: {:.2} %",
            valid.accuracy_percent()
        );

        epochs.push(EpochSummary {
            epoch,
            train_batches,
            mean_train_loss,
            valid,
        });
    }

    Fitted {
        model,
        series,
        epochs,
    }
}

fn progress_bar(len: usize, epoch: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{prefix} [{elapsed_precise}] {bar:40} {pos}/{len} batches {msg}",
    ) {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb.set_prefix(format!("Epoch {epoch}"));
    pb
}

fn train_epoch<B, O>(
    mut model: Model<B>,
    optim: &mut O,
    settings: &LoopSettings,
    dataloader: &dyn DataLoader<FakedditBatch<B>>,
    series: &mut MetricSeries,
    epoch: usize,
) -> (Model<B>, usize, f64)
where
    B: AutodiffBackend,
    O: Optimizer<Model<B>, B>,
{
    let pb = progress_bar(dataloader.num_items().div_ceil(settings.batch_size), epoch);
    let mut iter = dataloader.iter();
    let mut batches = 0;
    let mut loss_sum = 0.;

    loop {
        let _span = debug_span!("batch", index = batches).entered();
        let Some(batch) = iter.next() else {
            break;
        };
        let (next, loss, outcome) = train_step(model, optim, batch, settings.learning_rate);
        model = next;

        let accuracy = settings.accuracy_denominator.accuracy(
            outcome.correct,
            outcome.len,
            settings.batch_size,
        );
        series.push_train(loss, accuracy);
        debug!(loss, accuracy, len = outcome.len, "batch trained");

        loss_sum += loss;
        batches += 1;
        pb.set_message(format!("loss={loss:.4} accuracy={:.2}%", 100. * accuracy));
        pb.inc(1);
    }
    pb.finish();

    (model, batches, loss_sum)
}

/// One optimizer step. The batch and the gradients are consumed here, so
/// nothing of this step outlives it except the updated model.
fn train_step<B, O>(
    model: Model<B>,
    optim: &mut O,
    batch: FakedditBatch<B>,
    learning_rate: f64,
) -> (Model<B>, f64, BatchOutcome)
where
    B: AutodiffBackend,
    O: Optimizer<Model<B>, B>,
{
    let output = model.forward_classification(batch.images, batch.targets);
    let outcome = BatchOutcome::new(output.output.clone().detach(), output.targets);
    let loss = output.loss.clone().into_scalar().elem::<f64>();

    let grads = GradientsParams::from_grads(output.loss.backward(), &model);
    let model = optim.step(learning_rate, model, grads);

    (model, loss, outcome)
}

/// Passes over every batch of `dataloader` on a backend without autodiff.
pub fn evaluate<B: Backend>(
    model: &Model<B>,
    dataloader: &dyn DataLoader<FakedditBatch<B>>,
    settings: &LoopSettings,
) -> Evaluation {
    let mut tally = Tally::new(settings.num_classes);
    let mut losses = vec![];
    let mut accuracies = vec![];

    let mut iter = dataloader.iter();
    for index in 0usize.. {
        let _span = debug_span!("batch", index).entered();
        let Some(batch) = iter.next() else {
            break;
        };
        let output = model.forward_classification(batch.images, batch.targets);
        let outcome = BatchOutcome::new(output.output, output.targets);
        let loss = output.loss.into_scalar().elem::<f64>();

        losses.push(loss);
        accuracies.push(settings.accuracy_denominator.accuracy(
            outcome.correct,
            outcome.len,
            settings.batch_size,
        ));
        tally.record(&outcome);
        debug!(loss, correct = outcome.correct, len = outcome.len, "batch evaluated");
    }

    Evaluation {
        tally,
        losses,
        accuracies,
    }
}
