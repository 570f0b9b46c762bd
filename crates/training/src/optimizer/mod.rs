pub mod sgd;

pub use sgd::{Sgd, SgdConfig};

use candle_core::{backprop::GradStore, Var};

use crate::{scheduler::Schedule, TrainingError};

/// Step-based optimizer whose learning rate is driven from outside.
pub trait BaseOptimizer {
    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Applies one update from the gradients in `grads`.
    fn step(&mut self, grads: &GradStore) -> Result<(), TrainingError>;
}

/// Hyperparameters passed through unchanged to the base optimizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HyperParameters {
    pub momentum: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
}

impl Default for HyperParameters {
    fn default() -> Self {
        Self {
            momentum: 0.9,
            weight_decay: 5e-4,
            nesterov: true,
        }
    }
}

/// Wraps a [`BaseOptimizer`] and sets its learning rate from a schedule
/// evaluated at `epoch + step / steps_per_epoch` before every update.
///
/// [`update`](Self::update) must be called exactly once before each
/// [`step`](Self::step).
pub struct ScheduledOptimizer<O> {
    base: O,
    schedule: Box<dyn Schedule>,
    steps_per_epoch: usize,
    step: usize,
    epoch: usize,
    global_step: usize,
    learning_rate: f64,
    pending_update: bool,
}

impl<O: BaseOptimizer> ScheduledOptimizer<O> {
    pub fn new<F>(
        params: Vec<(String, Var)>,
        constructor: F,
        steps_per_epoch: usize,
        schedule: Box<dyn Schedule>,
        hyper: HyperParameters,
    ) -> Result<Self, TrainingError>
    where
        F: FnOnce(Vec<(String, Var)>, HyperParameters) -> Result<O, TrainingError>,
    {
        if steps_per_epoch == 0 {
            return Err(TrainingError::configuration(
                "steps_per_epoch must be greater than zero",
            ));
        }
        let mut base = constructor(params, hyper)?;
        let learning_rate = schedule.value(0.0);
        base.set_learning_rate(learning_rate);
        log::debug!(
            "scheduled optimizer: {} steps/epoch, initial lr {:.6}, {:?}",
            steps_per_epoch,
            learning_rate,
            hyper
        );
        Ok(Self {
            base,
            schedule,
            steps_per_epoch,
            step: 0,
            epoch: 0,
            global_step: 0,
            learning_rate,
            pending_update: false,
        })
    }

    /// Fractional epoch position the next update is evaluated at.
    pub fn position(&self) -> f64 {
        self.epoch as f64 + self.step as f64 / self.steps_per_epoch as f64
    }

    /// Evaluates the schedule at the current position and hands the rate to
    /// the base optimizer.
    pub fn update(&mut self) -> f64 {
        let lr = self.schedule.value(self.position());
        self.base.set_learning_rate(lr);
        self.learning_rate = lr;
        self.pending_update = true;
        lr
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<(), TrainingError> {
        if !self.pending_update {
            return Err(TrainingError::runtime(
                "optimizer step called without a preceding learning-rate update",
            ));
        }
        self.base.step(grads)?;
        self.pending_update = false;
        self.global_step += 1;
        self.step += 1;
        if self.step == self.steps_per_epoch {
            self.step = 0;
            self.epoch += 1;
        }
        Ok(())
    }

    /// Most recently computed learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn step_in_epoch(&self) -> usize {
        self.step
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }

    pub fn base(&self) -> &O {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::piecewise;
    use candle_core::{Device, Tensor};

    /// Base optimizer that only counts calls.
    #[derive(Default)]
    struct Recorder {
        lr: f64,
        steps: usize,
        seen_lrs: Vec<f64>,
    }

    impl BaseOptimizer for Recorder {
        fn learning_rate(&self) -> f64 {
            self.lr
        }

        fn set_learning_rate(&mut self, lr: f64) {
            self.lr = lr;
        }

        fn step(&mut self, _grads: &GradStore) -> Result<(), TrainingError> {
            self.steps += 1;
            self.seen_lrs.push(self.lr);
            Ok(())
        }
    }

    fn grads() -> GradStore {
        let var = Var::from_tensor(&Tensor::new(&[1f32], &Device::Cpu).unwrap()).unwrap();
        var.as_tensor().sum_all().unwrap().backward().unwrap()
    }

    fn scheduled(steps_per_epoch: usize) -> ScheduledOptimizer<Recorder> {
        let schedule = piecewise(vec![0.0, 4.0, 25.0], vec![0.025, 0.4, 0.0001]).unwrap();
        ScheduledOptimizer::new(
            Vec::new(),
            |_, _| Ok(Recorder::default()),
            steps_per_epoch,
            Box::new(schedule),
            HyperParameters::default(),
        )
        .unwrap()
    }

    #[test]
    fn epoch_rolls_over_after_steps_per_epoch() {
        let mut opt = scheduled(3);
        let grads = grads();
        for expected_step in [1, 2] {
            opt.update();
            opt.step(&grads).unwrap();
            assert_eq!(opt.step_in_epoch(), expected_step);
            assert_eq!(opt.epoch(), 0);
        }
        opt.update();
        opt.step(&grads).unwrap();
        assert_eq!(opt.step_in_epoch(), 0);
        assert_eq!(opt.epoch(), 1);
        assert_eq!(opt.global_step(), 3);
        assert_eq!(opt.base().steps, 3);
    }

    #[test]
    fn update_interpolates_fractional_positions() {
        let mut opt = scheduled(4);
        let grads = grads();
        assert!((opt.update() - 0.025).abs() < 1e-12);
        opt.step(&grads).unwrap();
        // position 0.25 of the first segment
        let expected = 0.025 + 0.25 / 4.0 * (0.4 - 0.025);
        assert!((opt.update() - expected).abs() < 1e-12);
        assert!((opt.learning_rate() - expected).abs() < 1e-12);
        opt.step(&grads).unwrap();
        assert!((opt.base().seen_lrs[1] - expected).abs() < 1e-12);
    }

    #[test]
    fn one_epoch_of_a_hundred_steps() {
        let mut opt = scheduled(100);
        let grads = grads();
        for _ in 0..100 {
            opt.update();
            opt.step(&grads).unwrap();
        }
        assert_eq!(opt.base().steps, 100);
        assert_eq!(opt.epoch(), 1);
        assert_eq!(opt.step_in_epoch(), 0);
    }

    #[test]
    fn step_requires_update() {
        let mut opt = scheduled(2);
        assert!(opt.step(&grads()).is_err());
        opt.update();
        opt.step(&grads()).unwrap();
        assert!(opt.step(&grads()).is_err());
    }

    #[test]
    fn zero_steps_per_epoch_is_rejected() {
        let schedule = piecewise(vec![0.0], vec![0.1]).unwrap();
        let result = ScheduledOptimizer::new(
            Vec::new(),
            |_, _| Ok(Recorder::default()),
            0,
            Box::new(schedule),
            HyperParameters::default(),
        );
        assert!(matches!(result, Err(TrainingError::Configuration(_))));
    }

    #[test]
    fn learning_rate_is_read_only() {
        let mut opt = scheduled(10);
        let lr = opt.update();
        assert_eq!(opt.learning_rate(), lr);
        assert_eq!(opt.learning_rate(), lr);
        assert_eq!(opt.base().learning_rate(), lr);
    }
}
