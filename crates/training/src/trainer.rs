use std::sync::Arc;

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    DType, Device, Tensor,
};
use cifar_data::{
    cifar::{self, dataset_root},
    materialize, BatchLoader, CifarDataset, Compose, Dataset, LoaderConfig, Split,
};
use model::{Classifier, ConvNet, ModelConfig};

use crate::{
    config::{DeviceKind, TrainingConfig},
    data::{DeviceBatch, EvalPipeline, PrefetchConfig, PrefetchLoader},
    logging::{Logger, LoggingSettings},
    loss::{to_runtime_error, CrossEntropyLoss, LossReduction, ModelWithLoss},
    metrics::{Accuracy, ExponentialMovingAverage, Metric, MetricHistory},
    optimizer::{BaseOptimizer, HyperParameters, ScheduledOptimizer, Sgd},
    scheduler::SchedulerConfig,
    timer::Timer,
    TrainingError,
};

const LOSS: &str = "loss";

/// Phases of a run: `Warmup → {TrainEpoch ⇄ EvalEpoch}* → Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Warmup,
    TrainEpoch(usize),
    EvalEpoch(usize),
    Done,
}

#[derive(Debug, Clone)]
pub struct TrainerSettings {
    pub epochs: usize,
    pub warmup_steps: usize,
    pub reduction: LossReduction,
    pub log_every_n_steps: usize,
    pub device: Device,
}

/// One record per finished epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    /// Cumulative time spent in training phases.
    pub hours: f64,
    pub train_loss: f64,
    pub eval_loss: f64,
    /// Mean of the first metric over the evaluation batches.
    pub accuracy: f64,
    pub learning_rate: f64,
    pub metrics: Vec<(String, f64)>,
}

/// Result of one pass over the evaluation set.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutcome {
    pub loss: f64,
    pub accuracy: f64,
    pub metrics: Vec<(String, f64)>,
    /// Final (view-averaged) predictions produced.
    pub predictions: usize,
    pub batches: usize,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub epochs: Vec<EpochSummary>,
    pub timer: Timer,
}

impl Report {
    /// Tab-separated `epoch, hours, accuracy %` table with a header row.
    pub fn render(&self) -> String {
        let mut lines = Vec::with_capacity(self.epochs.len() + 1);
        lines.push("epoch\thours\ttop1Accuracy".to_string());
        for summary in &self.epochs {
            lines.push(format!(
                "{}\t{:.8}\t{:.2}",
                summary.epoch,
                summary.hours,
                summary.accuracy * 100.0
            ));
        }
        lines.join("\n")
    }
}

pub struct Trainer<M, O> {
    model: ModelWithLoss<M>,
    optimizer: ScheduledOptimizer<O>,
    train: PrefetchLoader,
    eval: EvalPipeline,
    metrics: Vec<Box<dyn Metric>>,
    settings: TrainerSettings,
    logger: Logger,
    timer: Timer,
    state: TrainerState,
    summaries: Vec<EpochSummary>,
    last_train_loss: f64,
    loss_ema: ExponentialMovingAverage,
}

impl<M: Classifier, O: BaseOptimizer> Trainer<M, O> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: ModelWithLoss<M>,
        optimizer: ScheduledOptimizer<O>,
        train: PrefetchLoader,
        eval: EvalPipeline,
        metrics: Vec<Box<dyn Metric>>,
        settings: TrainerSettings,
        logger: Logger,
    ) -> Result<Self, TrainingError> {
        if metrics.is_empty() {
            return Err(TrainingError::configuration(
                "trainer needs at least one metric",
            ));
        }
        if eval.is_empty() {
            return Err(TrainingError::configuration("evaluation set is empty"));
        }
        Ok(Self {
            model,
            optimizer,
            train,
            eval,
            metrics,
            settings,
            logger,
            timer: Timer::new(),
            state: TrainerState::Warmup,
            summaries: Vec::new(),
            last_train_loss: f64::NAN,
            loss_ema: ExponentialMovingAverage::new(0.1),
        })
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn optimizer(&self) -> &ScheduledOptimizer<O> {
        &self.optimizer
    }

    pub fn model(&self) -> &M {
        self.model.model()
    }

    pub fn summaries(&self) -> &[EpochSummary] {
        &self.summaries
    }

    /// Training batches pulled so far, warmup included.
    pub fn batches_pulled(&self) -> usize {
        self.train.delivered()
    }

    /// Drives the run to completion.
    pub fn run(mut self) -> Result<Report, TrainingError> {
        while self.state != TrainerState::Done {
            self.advance()?;
        }
        self.logger.flush();
        Ok(Report {
            epochs: self.summaries,
            timer: self.timer,
        })
    }

    /// Performs the work of the current state and moves to the next one.
    pub fn advance(&mut self) -> Result<TrainerState, TrainingError> {
        let epochs = self.settings.epochs;
        self.state = match self.state {
            TrainerState::Warmup => {
                self.warmup()?;
                if epochs == 0 {
                    TrainerState::Done
                } else {
                    TrainerState::TrainEpoch(0)
                }
            }
            TrainerState::TrainEpoch(epoch) => {
                self.last_train_loss = self.train_epoch()?;
                TrainerState::EvalEpoch(epoch)
            }
            TrainerState::EvalEpoch(epoch) => {
                let outcome = self.evaluate()?;
                let summary = EpochSummary {
                    epoch,
                    hours: self.timer.accumulated("train") / 3600.0,
                    train_loss: self.last_train_loss,
                    eval_loss: outcome.loss,
                    accuracy: outcome.accuracy,
                    learning_rate: self.optimizer.learning_rate(),
                    metrics: outcome.metrics,
                };
                self.logger.log_epoch(&summary, &self.timer);
                self.summaries.push(summary);
                if epoch + 1 < epochs {
                    TrainerState::TrainEpoch(epoch + 1)
                } else {
                    TrainerState::Done
                }
            }
            TrainerState::Done => TrainerState::Done,
        };
        Ok(self.state)
    }

    /// Forward and backward passes on training batches to trigger lazy setup.
    /// Gradients are dropped and the optimizer is never stepped.
    fn warmup(&mut self) -> Result<(), TrainingError> {
        self.settings.device.synchronize()?;
        for _ in 0..self.settings.warmup_steps {
            let batch = self.train.expect_batch()?;
            let (_, loss) = self.model.forward(&batch.inputs, &batch.targets, true)?;
            let grads = self.settings.reduction.reduce(&loss)?.backward()?;
            drop(grads);
        }
        self.settings.device.synchronize()?;
        self.timer.lap("init");
        log::debug!("warmup done after {} batches", self.settings.warmup_steps);
        Ok(())
    }

    /// Runs `steps_per_epoch` optimizer steps and returns the mean batch loss.
    fn train_epoch(&mut self) -> Result<f64, TrainingError> {
        self.timer.begin_step("init");
        let steps = self.optimizer.steps_per_epoch();
        let mut total = 0.0;
        for _ in 0..steps {
            let batch = self.train.expect_batch()?;
            let (_, loss) = self.model.forward(&batch.inputs, &batch.targets, true)?;
            let grads = self.settings.reduction.reduce(&loss)?.backward()?;

            let lr = self.optimizer.update();
            self.optimizer.step(&grads)?;
            drop(grads);

            let batch_loss = loss.mean_all()?.to_vec0::<f32>()? as f64;
            total += batch_loss;
            let smoothed = self.loss_ema.update(batch_loss);
            let global_step = self.optimizer.global_step();
            if global_step % self.settings.log_every_n_steps.max(1) == 0 {
                self.logger.log_step(global_step, batch_loss, smoothed, lr);
            }
        }
        self.settings.device.synchronize()?;
        self.timer.lap("train");
        Ok(total / steps as f64)
    }

    /// One pass over the evaluation set in eval mode, averaging predictions
    /// over test-time views.
    pub fn evaluate(&mut self) -> Result<EvalOutcome, TrainingError> {
        let mut loader = self.eval.open()?;
        let mut history = MetricHistory::new();
        let mut predictions = 0;
        let mut batches = 0;
        while let Some(batch) = loader.next_batch()? {
            let (logits, loss) = self.predict(&batch)?;
            predictions += logits.dim(0)?;
            batches += 1;
            history.record(LOSS, loss.mean_all()?.to_vec0::<f32>()? as f64);
            for metric in &self.metrics {
                history.record(&metric.name(), metric.compute(&logits, &batch.targets)?);
            }
        }
        let expected = self.eval.batches();
        if batches != expected {
            return Err(TrainingError::data_exhausted(format!(
                "evaluation pass produced {batches} of {expected} batches"
            )));
        }
        self.settings.device.synchronize()?;
        self.timer.lap("test");

        let primary = self.metrics[0].name();
        let metrics: Vec<_> = history
            .averages()
            .into_iter()
            .filter(|(name, _)| name != LOSS)
            .collect();
        Ok(EvalOutcome {
            loss: history.mean(LOSS).unwrap_or(f64::NAN),
            accuracy: history.mean(&primary).unwrap_or(f64::NAN),
            metrics,
            predictions,
            batches,
        })
    }

    /// Returns `(B, K)` logits and the per-sample loss of every evaluated view.
    ///
    /// `(B, V, C, H, W)` inputs are flattened to `B·V` images, the loss uses
    /// targets repeated per view, and logits are averaged back over `V`.
    fn predict(&self, batch: &DeviceBatch) -> Result<(Tensor, Tensor), TrainingError> {
        let dims = batch.inputs.dims().to_vec();
        match dims.as_slice() {
            &[b, v, c, h, w] => {
                let inputs = batch.inputs.reshape((b * v, c, h, w))?;
                let targets = batch
                    .targets
                    .unsqueeze(1)?
                    .broadcast_as((b, v))?
                    .contiguous()?
                    .reshape(b * v)?;
                let (logits, loss) = self.model.forward(&inputs, &targets, false)?;
                let classes = logits.dim(1)?;
                let logits = logits
                    .detach()
                    .to_dtype(DType::F32)?
                    .reshape((b, v, classes))?
                    .mean(1)?;
                Ok((logits, loss.detach()))
            }
            &[_, _, _, _] => {
                let (logits, loss) = self.model.forward(&batch.inputs, &batch.targets, false)?;
                Ok((logits.detach().to_dtype(DType::F32)?, loss.detach()))
            }
            other => Err(TrainingError::configuration(format!(
                "evaluation batch must be rank 4 or 5, got {:?}",
                other
            ))),
        }
    }
}

impl Trainer<ConvNet, Sgd> {
    /// Assembles the CIFAR-10 run described by `config`.
    pub fn from_config(config: &TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        let device = select_device(config.runtime.device)?;
        if let Err(err) = device.set_seed(config.runtime.seed) {
            log::warn!("failed to seed device RNG: {}", err);
        }

        let root = dataset_root(&config.data.root);
        if config.data.download {
            cifar::download(&root)?;
        }
        let workers = config.data.num_workers;
        let batch_size = config.data.batch_size;

        let train_raw = CifarDataset::open(&root, Split::Train)?;
        let cached = materialize(&train_raw, &Compose::train_cached(config.data.pad), workers)?;
        let steps = steps_per_epoch(cached.len(), batch_size)?;
        let train_source = BatchLoader::new(
            Arc::new(cached),
            Arc::new(Compose::train_augment(config.data.crop, config.data.cutout)),
            LoaderConfig::train(batch_size, config.runtime.seed, workers),
        )?;

        let mut model_config = ModelConfig::cifar10(config.runtime.precision.dtype(), device.clone());
        let overrides = &config.model;
        if let Some(width) = overrides.stem_channels {
            model_config.stem_channels = width;
        }
        if let Some(width) = overrides.stage1_channels {
            model_config.stage1_channels = width;
        }
        if let Some(width) = overrides.stage2_channels {
            model_config.stage2_channels = width;
        }
        if let Some(width) = overrides.head_channels {
            model_config.head_channels = width;
        }
        let network = ConvNet::new(model_config).map_err(to_runtime_error)?;

        let prefetch = PrefetchConfig::new(device.clone(), network.input_dtype())
            .with_depth(config.data.prefetch_depth);
        let train = PrefetchLoader::spawn(train_source, prefetch.clone())?;
        let eval = EvalPipeline::new(
            Arc::new(CifarDataset::open(&root, Split::Test)?),
            Arc::new(Compose::cifar_eval(config.data.tta)),
            LoaderConfig::eval(config.eval_batch_size(), workers),
            prefetch,
        )?;

        let schedule = SchedulerConfig::from_training_config(
            &config.scheduler,
            config.runtime.epochs,
            batch_size,
        )?
        .build()?;
        let hyper = HyperParameters {
            momentum: config.optimizer.momentum,
            weight_decay: config.effective_weight_decay(),
            nesterov: config.optimizer.nesterov,
        };
        let optimizer = ScheduledOptimizer::new(
            network.trainable_parameters(),
            Sgd::from_hyper,
            steps,
            schedule,
            hyper,
        )?;

        let criterion = CrossEntropyLoss::new().with_label_smoothing(config.runtime.label_smoothing)?;
        let lr_display_scale = if config.scheduler.per_sample_scaling {
            batch_size as f64
        } else {
            1.0
        };
        let logger = Logger::new(LoggingSettings::new(
            config.runtime.tensorboard_dir.clone(),
            lr_display_scale,
        ))?;

        log::info!(
            "training: {} epochs x {} steps, batch {}, eval batch {}, tta {}, {:?}",
            config.runtime.epochs,
            steps,
            batch_size,
            config.eval_batch_size(),
            config.data.tta,
            config.runtime.precision
        );

        let metrics: Vec<Box<dyn Metric>> = vec![Box::new(Accuracy::top1())];
        Trainer::new(
            ModelWithLoss::new(network, criterion),
            optimizer,
            train,
            eval,
            metrics,
            TrainerSettings {
                epochs: config.runtime.epochs,
                warmup_steps: config.runtime.warmup_steps,
                reduction: config.runtime.loss_reduction,
                log_every_n_steps: config.runtime.log_every_n_steps,
                device,
            },
            logger,
        )
    }
}

/// Full batches per epoch; a partial trailing batch does not count.
pub fn steps_per_epoch(samples: usize, batch_size: usize) -> Result<usize, TrainingError> {
    if batch_size == 0 {
        return Err(TrainingError::configuration(
            "batch size must be greater than zero",
        ));
    }
    match samples / batch_size {
        0 => Err(TrainingError::configuration(format!(
            "{} samples do not fill a single batch of {}",
            samples, batch_size
        ))),
        steps => Ok(steps),
    }
}

pub fn select_device(kind: DeviceKind) -> Result<Device, TrainingError> {
    let device = match kind {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Cuda => Device::new_cuda(0)?,
        DeviceKind::Metal => Device::new_metal(0)?,
        DeviceKind::Auto => {
            let cuda_available = cuda_is_available();
            let metal_available = metal_is_available();
            log::debug!(
                "device detection: cuda_available={} metal_available={}",
                cuda_available,
                metal_available
            );
            if cuda_available {
                Device::new_cuda(0).unwrap_or_else(|err| {
                    log::warn!("cuda reported available but initialization failed: {err}");
                    Device::Cpu
                })
            } else if metal_available {
                Device::new_metal(0).unwrap_or_else(|err| {
                    log::warn!("failed to initialize metal device, falling back to CPU: {err}");
                    Device::Cpu
                })
            } else {
                log::warn!("no GPU backend available; using CPU");
                Device::Cpu
            }
        }
    };
    log::info!(
        "device selected: is_cuda={} is_metal={} is_cpu={}",
        device.is_cuda(),
        device.is_metal(),
        device.is_cpu()
    );
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_per_epoch_floors() {
        assert_eq!(steps_per_epoch(50_000, 500).unwrap(), 100);
        assert_eq!(steps_per_epoch(50_499, 500).unwrap(), 100);
        assert!(matches!(
            steps_per_epoch(10, 0),
            Err(TrainingError::Configuration(_))
        ));
        assert!(steps_per_epoch(10, 11).is_err());
    }

    #[test]
    fn report_renders_header_and_rows() {
        let report = Report {
            epochs: vec![
                EpochSummary {
                    epoch: 0,
                    hours: 0.001,
                    train_loss: 1.0,
                    eval_loss: 1.0,
                    accuracy: 0.5,
                    learning_rate: 0.1,
                    metrics: vec![],
                },
                EpochSummary {
                    epoch: 1,
                    hours: 0.0025,
                    train_loss: 0.5,
                    eval_loss: 0.7,
                    accuracy: 0.9412,
                    learning_rate: 0.1,
                    metrics: vec![],
                },
            ],
            timer: Timer::new(),
        };
        assert_eq!(
            report.render(),
            "epoch\thours\ttop1Accuracy\n0\t0.00100000\t50.00\n1\t0.00250000\t94.12"
        );
    }

    #[test]
    fn cpu_is_always_selectable() {
        assert!(select_device(DeviceKind::Cpu).unwrap().is_cpu());
    }
}
