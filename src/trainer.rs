//! Training loop and orchestration.

use std::path::Path;

use candle_core::{DType, Device, D};
use candle_nn::Optimizer;
use indicatif::{ProgressBar, ProgressStyle};

use crate::checkpoint::{save_checkpoint, write_class_indices};
use crate::config::FinetuneConfig;
use crate::dataset::{ClassIndex, FolderOptions, ImageFolder, SampleSource, Split};
use crate::error::{DivergenceError, FinetuneError, Result};
use crate::model::{Classifier, CompactNet};
use crate::optimizer::{MomentumSgd, ParamsSgd};
use crate::params::{
    transfer_weights, Binding, FreezePolicy, ParameterSnapshot, ParameterStore, TransferReport,
};
use crate::scheduler::LRScheduler;

/// Incremental mean: `mean_t = (mean_{t-1} * t + x_t) / (t + 1)`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMean {
    mean: f32,
    count: usize,
}

impl RunningMean {
    /// Empty mean (reads as zero).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one value and return the updated mean.
    #[allow(clippy::cast_precision_loss)]
    pub fn update(&mut self, value: f32) -> f32 {
        let t = self.count as f32;
        self.mean = (self.mean * t + value) / (t + 1.0);
        self.count += 1;
        self.mean
    }

    /// Current mean.
    #[must_use]
    pub fn value(&self) -> f32 {
        self.mean
    }

    /// Number of values folded in.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Mutable state of the epoch in progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpochState {
    /// Zero-based epoch index.
    pub epoch: usize,
    loss: RunningMean,
}

impl EpochState {
    /// Fresh state for `epoch` with a zeroed loss mean.
    #[must_use]
    pub fn new(epoch: usize) -> Self {
        Self {
            epoch,
            loss: RunningMean::new(),
        }
    }

    /// Record one batch loss; returns the running mean.
    pub fn record_loss(&mut self, loss: f32) -> f32 {
        self.loss.update(loss)
    }

    /// Mean loss over the batches seen so far.
    #[must_use]
    pub fn mean_loss(&self) -> f32 {
        self.loss.value()
    }

    /// Batches seen so far.
    #[must_use]
    pub fn batches_seen(&self) -> usize {
        self.loss.count()
    }
}

/// Summary of one completed epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Running mean of the training loss at epoch end.
    pub mean_loss: f32,
    /// Correct validation predictions.
    pub correct: usize,
    /// Validation samples.
    pub total: usize,
    /// `correct / total`, zero for an empty validation split.
    pub accuracy: f64,
    /// Learning rate after the schedule step, used by the next epoch.
    pub learning_rate: f64,
}

fn progress_bar(len: usize, show: bool) -> Result<ProgressBar> {
    if !show {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}",
            )?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Run one optimization pass over `source`.
///
/// Every batch is forwarded, scored with softmax cross-entropy and folded into
/// the running mean of `state`; the optimizer then updates the parameters it
/// owns. Returns the epoch's mean loss.
///
/// # Errors
///
/// Returns [`FinetuneError::Divergence`] as soon as a batch loss is NaN or
/// infinite, before the optimizer sees that batch. Data and tensor errors are
/// propagated unchanged.
pub fn train_one_epoch<C, O>(
    model: &C,
    optimizer: &mut O,
    source: &mut dyn SampleSource,
    device: &Device,
    state: &mut EpochState,
    progress: &ProgressBar,
) -> Result<f32>
where
    C: Classifier,
    O: Optimizer,
{
    for (batch_idx, batch) in source.batches().enumerate() {
        let batch = batch?;
        let images = batch.images.to_device(device)?;
        let labels = batch.labels.to_device(device)?;

        let logits = model.forward(&images)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &labels)?;
        let grads = loss.backward()?;

        let loss_value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        let mean = state.record_loss(loss_value);

        if !loss_value.is_finite() {
            tracing::warn!(
                "Non-finite loss {} at epoch {}, batch {}; ending training",
                loss_value,
                state.epoch,
                batch_idx
            );
            return Err(DivergenceError {
                epoch: state.epoch,
                batch: batch_idx,
                loss: loss_value,
            }
            .into());
        }

        optimizer.step(&grads)?;

        progress.set_message(format!("[epoch {}] mean loss {:.3}", state.epoch, mean));
        progress.inc(1);
    }
    Ok(state.mean_loss())
}

/// Count top-1 hits of `model` over `source`.
///
/// `model` should be bound with [`Binding::Inference`] so no gradient graph is
/// recorded.
///
/// # Errors
///
/// Propagates data and tensor errors.
pub fn evaluate<C: Classifier>(
    model: &C,
    source: &mut dyn SampleSource,
    device: &Device,
    progress: &ProgressBar,
) -> Result<usize> {
    let mut correct = 0usize;
    for batch in source.batches() {
        let batch = batch?;
        let logits = model.forward(&batch.images.to_device(device)?)?;
        let predictions = logits.argmax(D::Minus1)?;
        let labels = batch.labels.to_device(device)?;
        let hits = predictions
            .eq(&labels)?
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_scalar::<u32>()?;
        correct += hits as usize;
        progress.set_message(format!("valid correct {correct}"));
        progress.inc(1);
    }
    Ok(correct)
}

/// Resolve a device identifier.
///
/// Accepts `cpu`, `cuda`, `cuda:N`, a bare ordinal `N` (CUDA), `metal` and
/// `metal:N`. An accelerator that is not available falls back to the CPU with a
/// warning.
///
/// # Errors
///
/// Returns [`FinetuneError::Config`] for an identifier that does not parse.
pub fn select_device(identifier: &str) -> Result<Device> {
    let id = identifier.trim().to_ascii_lowercase();
    let unknown = || FinetuneError::Config(format!("unknown device identifier: {identifier}"));

    if id == "cpu" {
        tracing::info!("Training device: CPU");
        return Ok(Device::Cpu);
    }
    let (backend, ordinal) = if let Some(rest) = id.strip_prefix("cuda") {
        ("cuda", parse_ordinal(rest).ok_or_else(unknown)?)
    } else if let Some(rest) = id.strip_prefix("metal") {
        ("metal", parse_ordinal(rest).ok_or_else(unknown)?)
    } else if let Ok(ordinal) = id.parse::<usize>() {
        ("cuda", ordinal)
    } else {
        return Err(unknown());
    };

    let device = if backend == "cuda" {
        Device::cuda_if_available(ordinal)
    } else {
        Device::metal_if_available(ordinal)
    };
    match device {
        Ok(device) if !device.is_cpu() => {
            tracing::info!("Training device: {} (device {})", backend, ordinal);
            Ok(device)
        }
        Ok(_) => {
            tracing::warn!("{backend}:{ordinal} not available; falling back to CPU");
            Ok(Device::Cpu)
        }
        Err(err) => {
            tracing::warn!("{backend}:{ordinal} init failed ({err}); falling back to CPU");
            Ok(Device::Cpu)
        }
    }
}

fn parse_ordinal(rest: &str) -> Option<usize> {
    if rest.is_empty() {
        return Some(0);
    }
    rest.strip_prefix(':')?.parse().ok()
}

/// Training orchestrator.
///
/// Owns the parameter store, the classifier bound to it, the optimizer and the
/// schedule for the whole run.
///
/// # Example
///
/// ```no_run
/// use vision_finetune_rs::dataset::{ClassIndex, FolderOptions, ImageFolder, Split};
/// use vision_finetune_rs::{CompactNet, FinetuneConfig, Trainer};
///
/// # fn main() -> vision_finetune_rs::Result<()> {
/// let config = FinetuneConfig::from_file("finetune.yaml")?;
/// let classes = ClassIndex::from_dir(&config.data.train_dir())?;
/// let options = FolderOptions::from_config(&config)?;
/// let mut train = ImageFolder::open(&config.data.train_dir(), &classes, Split::Train, &options)?;
/// let mut val = ImageFolder::open(&config.data.val_dir(), &classes, Split::Val, &options)?;
///
/// let mut trainer: Trainer<CompactNet> = Trainer::new(config)?;
/// for report in trainer.train(&mut train, &mut val)? {
///     println!("epoch {} accuracy {:.3}", report.epoch, report.accuracy);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Trainer<C: Classifier> {
    /// Configuration
    config: FinetuneConfig,
    /// Device for training
    device: Device,
    /// Live parameters
    store: ParameterStore,
    /// Classifier bound for training
    model: C,
    optimizer: MomentumSgd,
    scheduler: LRScheduler,
    /// Outcome of the pretrained weight transfer, if one ran
    transfer: Option<TransferReport>,
    /// Names frozen by the freeze policy
    frozen: Vec<String>,
}

impl<C: Classifier> Trainer<C> {
    /// Create a trainer on the configured device.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or device identifier is invalid,
    /// or if model setup fails.
    pub fn new(config: FinetuneConfig) -> Result<Self> {
        let device = select_device(&config.device)?;
        Self::with_device(config, device)
    }

    /// Create a trainer on an explicit device.
    ///
    /// Builds the classifier, transfers pretrained weights when configured,
    /// applies the freeze policy, re-binds the classifier and creates the
    /// optimizer over the remaining trainable parameters.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Config`] for invalid settings or a missing
    /// weights file, and the underlying error if loading or building fails.
    pub fn with_device(config: FinetuneConfig, device: Device) -> Result<Self> {
        config.validate()?;
        if let Some(weights) = &config.weights {
            if !Path::new(weights).exists() {
                return Err(FinetuneError::Config(format!(
                    "weights file does not exist: {weights}"
                )));
            }
        }
        if let Err(err) = device.set_seed(config.seed) {
            tracing::debug!("Device RNG not seeded: {err}");
        }

        let mut store = ParameterStore::new(device.clone());
        C::build(store.init_var_builder(), config.num_classes)
            .map_err(|e| FinetuneError::Model(format!("failed to build classifier: {e}")))?;
        tracing::info!(
            "Built classifier: {} parameters, {} classes",
            store.len()?,
            config.num_classes
        );

        let transfer = match &config.weights {
            Some(path) => {
                let snapshot = ParameterSnapshot::load(path)?;
                let report = transfer_weights(&store, &snapshot)?;
                report.log();
                Some(report)
            }
            None => {
                tracing::info!("No pretrained weights configured; training from initialisation");
                None
            }
        };

        let frozen = if config.freeze_layers {
            FreezePolicy::except_marker(config.freeze_marker.as_str()).apply(&mut store)?
        } else {
            Vec::new()
        };

        let trainable = store.trainable_vars()?;
        if trainable.is_empty() {
            tracing::warn!("No trainable parameters; the optimizer will not change the model");
        }

        let model = C::build(store.bind(Binding::Training)?, config.num_classes)
            .map_err(|e| FinetuneError::Model(format!("failed to bind classifier: {e}")))?;
        let optimizer = ParamsSgd::from(&config.training).build(trainable)?;
        let scheduler = LRScheduler::new(
            config.training.learning_rate,
            config.training.epochs,
            config.training.lr_floor,
        );

        Ok(Self {
            config,
            device,
            store,
            model,
            optimizer,
            scheduler,
            transfer,
            frozen,
        })
    }

    /// Run every configured epoch, writing the checkpoint after each one.
    ///
    /// Per epoch: train, step the schedule, evaluate, report, checkpoint.
    ///
    /// # Errors
    ///
    /// A [`DivergenceError`] ends the run before the current epoch's
    /// checkpoint is written; any other error is propagated as is.
    pub fn train(
        &mut self,
        train: &mut dyn SampleSource,
        val: &mut dyn SampleSource,
    ) -> Result<Vec<EpochReport>> {
        let epochs = self.config.training.epochs;
        let show = self.config.training.show_progress;
        let checkpoint_path = self.config.checkpoint_path();

        tracing::info!("Starting training");
        tracing::info!("  Epochs: {}", epochs);
        tracing::info!(
            "  Train: {} samples / {} batches",
            train.len(),
            train.num_batches()
        );
        tracing::info!("  Val: {} samples / {} batches", val.len(), val.num_batches());
        tracing::info!("  Learning rate: {}", self.optimizer.learning_rate());

        let mut reports = Vec::with_capacity(epochs);
        for epoch in 0..epochs {
            let mut state = EpochState::new(epoch);
            let pb = progress_bar(train.num_batches(), show)?;
            let mean_loss = train_one_epoch(
                &self.model,
                &mut self.optimizer,
                train,
                &self.device,
                &mut state,
                &pb,
            )
            .inspect_err(|_| pb.abandon())?;
            pb.finish();

            let learning_rate = self.scheduler.step(&mut self.optimizer);

            let eval_model = C::build(self.store.bind(Binding::Inference)?, self.config.num_classes)?;
            let pb = progress_bar(val.num_batches(), show)?;
            let correct = evaluate(&eval_model, val, &self.device, &pb)?;
            pb.finish();

            #[allow(clippy::cast_precision_loss)]
            let accuracy = if val.is_empty() {
                0.0
            } else {
                correct as f64 / val.len() as f64
            };
            tracing::info!(
                "[epoch {}] accuracy: {:.3}, mean loss: {:.4}, lr: {:.6}",
                epoch,
                accuracy,
                mean_loss,
                learning_rate
            );

            save_checkpoint(&self.store, &checkpoint_path)?;

            reports.push(EpochReport {
                epoch,
                mean_loss,
                correct,
                total: val.len(),
                accuracy,
                learning_rate,
            });
        }

        tracing::info!("Training complete");
        Ok(reports)
    }

    /// Live parameters.
    #[must_use]
    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    /// Device the run uses.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Configuration the trainer was built with.
    #[must_use]
    pub fn config(&self) -> &FinetuneConfig {
        &self.config
    }

    /// Pretrained weight transfer outcome, `None` when no weights were set.
    #[must_use]
    pub fn transfer_report(&self) -> Option<&TransferReport> {
        self.transfer.as_ref()
    }

    /// Names of the parameters frozen during setup.
    #[must_use]
    pub fn frozen_parameters(&self) -> &[String] {
        &self.frozen
    }

    /// Current optimizer learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }
}

/// Fine-tune [`CompactNet`] on the image folders named in `config`.
///
/// Checks the filesystem preconditions, derives and persists the class index
/// map, opens both splits and runs the [`Trainer`].
///
/// # Errors
///
/// Returns [`FinetuneError::Config`] for missing paths or more dataset classes
/// than `num_classes`; otherwise any error from setup or training.
pub fn run(config: FinetuneConfig) -> Result<Vec<EpochReport>> {
    config.validate()?;
    config.check_paths()?;

    let classes = ClassIndex::from_dir(&config.data.train_dir())?;
    if classes.len() > config.num_classes {
        return Err(FinetuneError::Config(format!(
            "dataset has {} classes but num_classes is {}",
            classes.len(),
            config.num_classes
        )));
    }
    if classes.len() < config.num_classes {
        tracing::warn!(
            "Dataset has {} classes, classifier has {} outputs",
            classes.len(),
            config.num_classes
        );
    }
    write_class_indices(&classes, &config.class_index_path())?;

    let options = FolderOptions::from_config(&config)?;
    let mut train = ImageFolder::open(&config.data.train_dir(), &classes, Split::Train, &options)?;
    let mut val = ImageFolder::open(&config.data.val_dir(), &classes, Split::Val, &options)?;

    let mut trainer: Trainer<CompactNet> = Trainer::new(config)?;
    trainer.train(&mut train, &mut val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::TensorSource;
    use candle_core::Tensor;
    use candle_nn::{linear, Linear, Module, VarBuilder};
    use tempfile::TempDir;

    /// Linear head on two-dimensional features.
    struct Probe {
        fc: Linear,
    }

    impl Classifier for Probe {
        fn build(vb: VarBuilder, num_classes: usize) -> candle_core::Result<Self> {
            Ok(Self {
                fc: linear(2, num_classes, vb.pp("fc"))?,
            })
        }

        fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
            self.fc.forward(xs)
        }
    }

    fn one_hot_source(pattern: &[u32], batch_size: usize) -> TensorSource {
        let features: Vec<f32> = pattern
            .iter()
            .flat_map(|&l| if l == 0 { [1.0, 0.0] } else { [0.0, 1.0] })
            .collect();
        let images = Tensor::from_vec(features, (pattern.len(), 2), &Device::Cpu).unwrap();
        let labels = Tensor::new(pattern, &Device::Cpu).unwrap();
        TensorSource::new(images, labels, batch_size).unwrap()
    }

    fn test_config(dir: &TempDir) -> FinetuneConfig {
        let mut config = FinetuneConfig {
            num_classes: 2,
            device: "cpu".into(),
            output_dir: dir.path().to_string_lossy().into(),
            ..Default::default()
        };
        config.training.epochs = 2;
        config.training.batch_size = 2;
        config.training.show_progress = false;
        config
    }

    #[test]
    fn test_running_mean_matches_arithmetic_mean() {
        let mut mean = RunningMean::new();
        assert_eq!(mean.value(), 0.0);
        mean.update(1.0);
        mean.update(2.0);
        let last = mean.update(6.0);
        assert!((last - 3.0).abs() < 1e-6);
        assert_eq!(mean.count(), 3);
    }

    #[test]
    fn test_epoch_state_resets() {
        let mut state = EpochState::new(0);
        state.record_loss(4.0);
        let state = EpochState::new(1);
        assert_eq!(state.mean_loss(), 0.0);
        assert_eq!(state.batches_seen(), 0);
        assert_eq!(state.epoch, 1);
    }

    #[test]
    fn test_select_device_identifiers() {
        assert!(select_device("cpu").unwrap().is_cpu());
        assert!(select_device(" CPU ").unwrap().is_cpu());
        assert!(select_device("cuda:0").is_ok());
        assert!(select_device("cuda").is_ok());
        assert!(select_device("0").is_ok());
        assert!(matches!(
            select_device("tpu:0"),
            Err(FinetuneError::Config(_))
        ));
        assert!(matches!(
            select_device("cuda:x"),
            Err(FinetuneError::Config(_))
        ));
        assert!(matches!(
            select_device("cuda0"),
            Err(FinetuneError::Config(_))
        ));
    }

    #[test]
    fn test_evaluate_counts_hits() {
        let store = ParameterStore::new(Device::Cpu);
        Probe::build(store.init_var_builder(), 2).unwrap();
        store
            .set("fc.weight", &Tensor::new(&[[1f32, 0.], [0., 1.]], &Device::Cpu).unwrap())
            .unwrap();
        store
            .set("fc.bias", &Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        let model = Probe::build(store.bind(Binding::Inference).unwrap(), 2).unwrap();

        // Inputs say [0, 1, 0, 1, 1] but labels disagree on the last two.
        let images = Tensor::new(
            &[[1f32, 0.], [0., 1.], [1., 0.], [0., 1.], [0., 1.]],
            &Device::Cpu,
        )
        .unwrap();
        let labels = Tensor::new(&[0u32, 1, 0, 0, 0], &Device::Cpu).unwrap();
        let mut source = TensorSource::new(images, labels, 2).unwrap();

        let correct = evaluate(&model, &mut source, &Device::Cpu, &ProgressBar::hidden()).unwrap();
        assert_eq!(correct, 3);
    }

    #[test]
    fn test_trainer_freezes_all_but_head() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.freeze_marker = "bias".into();
        let trainer: Trainer<Probe> = Trainer::with_device(config, Device::Cpu).unwrap();
        assert_eq!(trainer.frozen_parameters(), ["fc.weight"]);
        assert!(trainer.store().is_trainable("fc.bias"));
        assert!(trainer.transfer_report().is_none());
    }

    #[test]
    fn test_trainer_rejects_missing_weights() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.weights = Some(dir.path().join("nope.safetensors").to_string_lossy().into());
        let result: Result<Trainer<Probe>> = Trainer::with_device(config, Device::Cpu);
        assert!(matches!(result, Err(FinetuneError::Config(_))));
    }

    #[test]
    fn test_train_reports_and_schedule() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let mut trainer: Trainer<Probe> = Trainer::with_device(config, Device::Cpu).unwrap();

        let mut train = one_hot_source(&[0, 1, 0, 1], 2);
        let mut val = one_hot_source(&[0, 1], 2);
        let reports = trainer.train(&mut train, &mut val).unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].epoch, 1);
        assert_eq!(reports[0].total, 2);
        assert!((reports[0].learning_rate - 0.1 * 0.55).abs() < 1e-9);
        assert!((reports[1].learning_rate - 0.01).abs() < 1e-9);
        assert!((trainer.learning_rate() - 0.01).abs() < 1e-9);
        assert!(dir.path().join("model_data.safetensors").exists());
    }

    #[test]
    fn test_divergence_stops_before_optimizer_step() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let trainer: Trainer<Probe> = Trainer::with_device(config, Device::Cpu).unwrap();
        let before = trainer.store().get("fc.weight").unwrap().unwrap();

        let images = Tensor::new(&[[f32::NAN, 0.]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32], &Device::Cpu).unwrap();
        let mut source = TensorSource::new(images, labels, 1).unwrap();

        let mut optimizer = ParamsSgd::default()
            .build(trainer.store().trainable_vars().unwrap())
            .unwrap();
        let mut state = EpochState::new(4);
        let err = train_one_epoch(
            &trainer.model,
            &mut optimizer,
            &mut source,
            &Device::Cpu,
            &mut state,
            &ProgressBar::hidden(),
        )
        .unwrap_err();

        match err {
            FinetuneError::Divergence(d) => {
                assert_eq!((d.epoch, d.batch), (4, 0));
                assert!(d.loss.is_nan());
            }
            other => panic!("expected divergence, got {other}"),
        }
        let after = trainer.store().get("fc.weight").unwrap().unwrap();
        assert_eq!(
            before.to_vec2::<f32>().unwrap(),
            after.to_vec2::<f32>().unwrap()
        );
    }
}
