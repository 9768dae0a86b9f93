use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use indicatif::ProgressBar;
use tempfile::TempDir;
use vision_finetune_rs::optimizer::ParamsSgd;
use vision_finetune_rs::params::Binding;
use vision_finetune_rs::trainer::{evaluate, train_one_epoch, EpochState};
use vision_finetune_rs::{
    cosine_multiplier, Classifier, CompactNet, FinetuneConfig, TensorSource, Trainer,
};

const IMAGE_SIZE: usize = 32;
const BATCH: usize = 8;

fn synthetic_source() -> TensorSource {
    let images = Tensor::randn(0f32, 1.0, (BATCH, 3, IMAGE_SIZE, IMAGE_SIZE), &Device::Cpu)
        .expect("Failed to create images");
    let labels: Vec<u32> = (0..BATCH as u32).map(|i| i % 5).collect();
    let labels = Tensor::from_vec(labels, BATCH, &Device::Cpu).expect("Failed to create labels");
    TensorSource::new(images, labels, BATCH).expect("Failed to create source")
}

fn trainer(dir: &TempDir, freeze_layers: bool) -> Trainer<CompactNet> {
    let mut config = FinetuneConfig {
        device: "cpu".into(),
        output_dir: dir.path().to_string_lossy().into(),
        freeze_layers,
        ..Default::default()
    };
    config.training.learning_rate = 0.01;
    config.training.show_progress = false;
    Trainer::with_device(config, Device::Cpu).expect("Failed to create trainer")
}

fn bench_training_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("training_step");
    let dir = TempDir::new().expect("Failed to create temp dir");

    for (label, freeze) in [("frozen_features", true), ("full", false)] {
        let trainer = trainer(&dir, freeze);
        let mut optimizer = ParamsSgd {
            lr: 0.01,
            ..Default::default()
        }
        .build(trainer.store().trainable_vars().expect("Failed to list vars"))
        .expect("Failed to build optimizer");
        let model = CompactNet::build(
            trainer
                .store()
                .bind(Binding::Training)
                .expect("Failed to bind"),
            5,
        )
        .expect("Failed to build model");
        let mut source = synthetic_source();
        let progress = ProgressBar::hidden();

        group.bench_function(label, |b| {
            b.iter(|| {
                let mut state = EpochState::new(0);
                train_one_epoch(
                    &model,
                    &mut optimizer,
                    &mut source,
                    &Device::Cpu,
                    &mut state,
                    &progress,
                )
                .expect("Training step failed")
            });
        });
    }

    group.finish();
}

fn bench_evaluation(c: &mut Criterion) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let trainer = trainer(&dir, true);
    let model = CompactNet::build(
        trainer
            .store()
            .bind(Binding::Inference)
            .expect("Failed to bind"),
        5,
    )
    .expect("Failed to build model");
    let mut source = synthetic_source();
    let progress = ProgressBar::hidden();

    c.bench_function("evaluate_batch", |b| {
        b.iter(|| evaluate(&model, &mut source, &Device::Cpu, &progress).expect("Eval failed"));
    });
}

fn bench_schedule(c: &mut Criterion) {
    c.bench_function("cosine_multiplier_30_epochs", |b| {
        b.iter(|| {
            (0..30)
                .map(|e| cosine_multiplier(black_box(e), 30, 0.1))
                .sum::<f64>()
        });
    });
}

criterion_group!(benches, bench_training_step, bench_evaluation, bench_schedule);
criterion_main!(benches);
