use std::{fs, path::Path, sync::Arc};

use anyhow::Result;
use candle_core::{DType, Device};
use cifar_data::{
    cifar::{BATCH_DIR, PIXELS_PER_IMAGE},
    BatchLoader, Compose, Dataset, HorizontalFlipViews, Image, ImageShape, InMemoryDataset,
    LoaderConfig, Sample, SampleInput, Split,
};
use model::{Classifier, ConvNet, ModelConfig};
use training::{
    change_scale, config::DeviceKind, piecewise, Accuracy, CrossEntropyLoss, EvalPipeline,
    HyperParameters, Logger, LoggingSettings, LossReduction, Metric, ModelWithLoss, PrefetchConfig,
    PrefetchLoader, ScheduledOptimizer, Sgd, Trainer, TrainerSettings, TrainerState,
    TrainingConfig,
};

const SIDE: usize = 16;
const BATCH: usize = 4;

fn synthetic(len: usize, offset: usize) -> InMemoryDataset {
    let shape = ImageShape::new(3, SIDE, SIDE);
    let samples = (0..len)
        .map(|i| {
            let n = i + offset;
            let data = (0..shape.numel())
                .map(|p| ((n * 7 + p * 3) % 11) as f32 / 10.0 - 0.5)
                .collect();
            Sample {
                input: SampleInput::Single(Image::new(shape, data).unwrap()),
                label: (n % 10) as u32,
            }
        })
        .collect();
    InMemoryDataset::new(samples)
}

/// Eval set whose samples from `from` onwards cannot be read without panicking.
struct PanicsFrom {
    inner: InMemoryDataset,
    from: usize,
}

impl Dataset for PanicsFrom {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn get(&self, index: usize) -> cifar_data::Result<Sample> {
        if index >= self.from {
            panic!("sample {index} is unreadable");
        }
        self.inner.get(index)
    }
}

fn build_trainer(epochs: usize, tta: bool) -> Result<Trainer<ConvNet, Sgd>> {
    build_trainer_with_eval(epochs, tta, Arc::new(synthetic(6, 100)))
}

fn build_trainer_with_eval(
    epochs: usize,
    tta: bool,
    eval_set: Arc<dyn Dataset>,
) -> Result<Trainer<ConvNet, Sgd>> {
    let device = Device::Cpu;
    let network = ConvNet::new(ModelConfig::tiny(10, device.clone()))?;
    let prefetch = PrefetchConfig::new(device.clone(), DType::F32);

    let train_source = BatchLoader::new(
        Arc::new(synthetic(24, 0)),
        Arc::new(Compose::new()),
        LoaderConfig::train(BATCH, 7, 2),
    )?;
    let steps = train_source.batches_per_pass();
    let train = PrefetchLoader::spawn(train_source, prefetch.clone())?;

    let eval_transforms = if tta {
        Compose::new().then(HorizontalFlipViews)
    } else {
        Compose::new()
    };
    let eval = EvalPipeline::new(
        eval_set,
        Arc::new(eval_transforms),
        LoaderConfig::eval(BATCH, 2),
        prefetch,
    )?;

    let schedule = change_scale(
        piecewise(
            vec![0.0, epochs as f64 / 2.0, epochs as f64],
            vec![0.025, 0.4, 0.0001],
        )?,
        1.0 / BATCH as f64,
    );
    let optimizer = ScheduledOptimizer::new(
        network.trainable_parameters(),
        Sgd::from_hyper,
        steps,
        Box::new(schedule),
        HyperParameters {
            momentum: 0.9,
            weight_decay: 5e-4 * BATCH as f64,
            nesterov: true,
        },
    )?;

    let metrics: Vec<Box<dyn Metric>> =
        vec![Box::new(Accuracy::top1()), Box::new(Accuracy::new(3)?)];
    Ok(Trainer::new(
        ModelWithLoss::new(network, CrossEntropyLoss::new()),
        optimizer,
        train,
        eval,
        metrics,
        TrainerSettings {
            epochs,
            warmup_steps: 2,
            reduction: LossReduction::Sum,
            log_every_n_steps: 1,
            device,
        },
        Logger::new(LoggingSettings::new(None, BATCH as f64))?,
    )?)
}

#[test]
fn state_machine_walks_warmup_train_eval_done() -> Result<()> {
    let mut trainer = build_trainer(2, true)?;
    assert_eq!(trainer.state(), TrainerState::Warmup);

    let mut visited = Vec::new();
    while trainer.state() != TrainerState::Done {
        visited.push(trainer.advance()?);
    }
    assert_eq!(
        visited,
        vec![
            TrainerState::TrainEpoch(0),
            TrainerState::EvalEpoch(0),
            TrainerState::TrainEpoch(1),
            TrainerState::EvalEpoch(1),
            TrainerState::Done,
        ]
    );

    // 24 samples / batch 4 = 6 steps per epoch, plus two warmup batches
    assert_eq!(trainer.optimizer().steps_per_epoch(), 6);
    assert_eq!(trainer.optimizer().global_step(), 12);
    assert_eq!(trainer.optimizer().epoch(), 2);
    assert_eq!(trainer.batches_pulled(), 2 + 12);

    let summaries = trainer.summaries();
    assert_eq!(summaries.len(), 2);
    for summary in summaries {
        assert!((0.0..=1.0).contains(&summary.accuracy));
        assert!(summary.train_loss.is_finite());
        assert!(summary.eval_loss.is_finite());
        assert_eq!(summary.metrics.len(), 2);
        assert_eq!(summary.metrics[0].0, "top1");
    }
    assert!(summaries[1].hours >= summaries[0].hours);
    Ok(())
}

#[test]
fn warmup_leaves_the_optimizer_untouched() -> Result<()> {
    let mut trainer = build_trainer(1, false)?;
    trainer.advance()?;
    assert_eq!(trainer.state(), TrainerState::TrainEpoch(0));
    assert_eq!(trainer.optimizer().global_step(), 0);
    assert_eq!(trainer.batches_pulled(), 2);
    Ok(())
}

#[test]
fn evaluation_is_repeatable_and_averages_views() -> Result<()> {
    let mut trainer = build_trainer(1, true)?;
    trainer.advance()?;

    let first = trainer.evaluate()?;
    let second = trainer.evaluate()?;
    assert_eq!(first.batches, 2);
    // two flip views per sample still yield one prediction per sample
    assert_eq!(first.predictions, 6);
    assert!((first.accuracy - second.accuracy).abs() < 1e-9);
    assert!((first.loss - second.loss).abs() < 1e-6);
    Ok(())
}

#[test]
fn eval_worker_failure_aborts_instead_of_truncating() -> Result<()> {
    let eval_set = PanicsFrom {
        inner: synthetic(6, 100),
        from: BATCH,
    };
    let mut trainer = build_trainer_with_eval(1, false, Arc::new(eval_set))?;
    trainer.advance()?;
    assert_eq!(trainer.advance()?, TrainerState::EvalEpoch(0));

    // the first batch evaluates fine, the second one kills the worker
    let err = trainer.evaluate().unwrap_err();
    assert!(matches!(err, training::TrainingError::Runtime(_)), "{err}");
    assert!(trainer.advance().is_err());
    assert!(trainer.summaries().is_empty());
    Ok(())
}

#[test]
fn report_has_one_row_per_epoch() -> Result<()> {
    let report = build_trainer(2, true)?.run()?;
    let rendered = report.render();
    let lines: Vec<&str> = rendered.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "epoch\thours\ttop1Accuracy");
    assert!(lines[1].starts_with("0\t"));
    assert!(lines[2].starts_with("1\t"));
    assert_eq!(lines[2].split('\t').count(), 3);
    assert!(report.timer.accumulated("train") > 0.0);
    assert!(report.timer.accumulated("test") > 0.0);
    Ok(())
}

fn write_batch(dir: &Path, name: &str, labels: &[u8]) -> Result<()> {
    let mut bytes = Vec::new();
    for (i, &label) in labels.iter().enumerate() {
        bytes.push(label);
        bytes.extend((0..PIXELS_PER_IMAGE).map(|p| ((i * 31 + p) % 256) as u8));
    }
    fs::write(dir.join(name), bytes)?;
    Ok(())
}

#[test]
fn runs_from_config_on_cifar_files() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dir = tmp.path().join("cifar10").join(BATCH_DIR);
    fs::create_dir_all(&dir)?;
    for (n, name) in Split::Train.file_names().iter().enumerate() {
        let labels: Vec<u8> = (0..4).map(|i| ((n * 4 + i) % 10) as u8).collect();
        write_batch(&dir, name, &labels)?;
    }
    write_batch(&dir, "test_batch.bin", &[3, 1, 4])?;

    let mut config = TrainingConfig::default();
    config.data.root = tmp.path().to_path_buf();
    config.data.batch_size = 4;
    config.data.num_workers = 1;
    config.model.stem_channels = Some(4);
    config.model.stage1_channels = Some(8);
    config.model.stage2_channels = Some(8);
    config.model.head_channels = Some(8);
    config.runtime.epochs = 1;
    config.runtime.warmup_steps = 1;
    config.runtime.device = DeviceKind::Cpu;

    let trainer = Trainer::from_config(&config)?;
    assert_eq!(trainer.optimizer().steps_per_epoch(), 5);
    let report = trainer.run()?;
    assert_eq!(report.epochs.len(), 1);
    assert_eq!(report.render().lines().count(), 2);
    Ok(())
}
