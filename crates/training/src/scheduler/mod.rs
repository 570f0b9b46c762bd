//! Learning-rate schedules indexed by a fractional epoch position.
//!
//! A schedule maps `epoch + step / steps_per_epoch` to a rate. [`Piecewise`]
//! interpolates linearly between control points and clamps outside them;
//! [`ChangeScale`] multiplies another schedule by a constant.

use crate::{config, TrainingError};

pub trait Schedule: Send + Sync {
    fn value(&self, position: f64) -> f64;

    fn scaled(self, factor: f64) -> ChangeScale<Self>
    where
        Self: Sized,
    {
        change_scale(self, factor)
    }
}

impl<S: Schedule + ?Sized> Schedule for Box<S> {
    fn value(&self, position: f64) -> f64 {
        (**self).value(position)
    }
}

/// Piecewise-linear schedule through `(xs[i], ys[i])`.
#[derive(Debug, Clone, PartialEq)]
pub struct Piecewise {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

impl Piecewise {
    pub fn new(xs: Vec<f64>, ys: Vec<f64>) -> Result<Self, TrainingError> {
        if xs.is_empty() {
            return Err(TrainingError::configuration(
                "piecewise schedule needs at least one control point",
            ));
        }
        if xs.len() != ys.len() {
            return Err(TrainingError::configuration(format!(
                "piecewise schedule has {} breakpoints but {} values",
                xs.len(),
                ys.len()
            )));
        }
        if xs.iter().chain(ys.iter()).any(|v| !v.is_finite()) {
            return Err(TrainingError::configuration(
                "piecewise schedule control points must be finite",
            ));
        }
        if xs.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(TrainingError::configuration(format!(
                "piecewise schedule breakpoints must be strictly increasing, got {:?}",
                xs
            )));
        }
        Ok(Self { xs, ys })
    }

    pub fn breakpoints(&self) -> &[f64] {
        &self.xs
    }

    pub fn values(&self) -> &[f64] {
        &self.ys
    }
}

impl Schedule for Piecewise {
    fn value(&self, position: f64) -> f64 {
        let last = self.xs.len() - 1;
        if position.is_nan() || position <= self.xs[0] {
            return self.ys[0];
        }
        if position >= self.xs[last] {
            return self.ys[last];
        }
        // first breakpoint strictly greater than `position`; 1..=last here
        let upper = self.xs.partition_point(|&x| x <= position);
        let lower = upper - 1;
        let span = self.xs[upper] - self.xs[lower];
        let t = (position - self.xs[lower]) / span;
        self.ys[lower] + t * (self.ys[upper] - self.ys[lower])
    }
}

/// `inner` scaled by a constant factor.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeScale<S> {
    inner: S,
    factor: f64,
}

impl<S: Schedule> Schedule for ChangeScale<S> {
    fn value(&self, position: f64) -> f64 {
        self.inner.value(position) * self.factor
    }
}

pub fn piecewise(xs: Vec<f64>, ys: Vec<f64>) -> Result<Piecewise, TrainingError> {
    Piecewise::new(xs, ys)
}

pub fn change_scale<S: Schedule>(inner: S, factor: f64) -> ChangeScale<S> {
    ChangeScale { inner, factor }
}

/// Resolved schedule description built from the training configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub breakpoints: Vec<f64>,
    pub values: Vec<f64>,
    pub scale: f64,
}

impl SchedulerConfig {
    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        epochs: usize,
        batch_size: usize,
    ) -> Result<Self, TrainingError> {
        if batch_size == 0 {
            return Err(TrainingError::configuration(
                "scheduler requires a batch size greater than zero",
            ));
        }
        let scale = if cfg.per_sample_scaling {
            1.0 / batch_size as f64
        } else {
            1.0
        };
        Ok(Self {
            breakpoints: cfg.resolved_breakpoints(epochs),
            values: cfg.values.clone(),
            scale,
        })
    }

    pub fn build(self) -> Result<Box<dyn Schedule>, TrainingError> {
        let base = piecewise(self.breakpoints, self.values)?;
        Ok(Box::new(change_scale(base, self.scale)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> Piecewise {
        piecewise(vec![0.0, 4.0, 25.0], vec![0.025, 0.4, 0.0001]).unwrap()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn exact_at_breakpoints() {
        let schedule = reference();
        assert!(close(schedule.value(0.0), 0.025));
        assert!(close(schedule.value(4.0), 0.4));
        assert!(close(schedule.value(25.0), 0.0001));
    }

    #[test]
    fn interpolates_fractional_positions() {
        let schedule = reference();
        assert!(close(schedule.value(2.0), 0.2125));
        assert!(close(schedule.value(0.5), 0.025 + 0.125 * 0.375));
        assert!(close(schedule.value(14.5), (0.4 + 0.0001) / 2.0));
        assert!(schedule.value(0.01) > schedule.value(0.0));
    }

    #[test]
    fn clamps_outside_the_range() {
        let schedule = reference();
        assert!(close(schedule.value(-3.0), 0.025));
        assert!(close(schedule.value(25.0 + 1e-9), 0.0001));
        assert!(close(schedule.value(1e6), 0.0001));
    }

    #[test]
    fn single_point_is_constant() {
        let schedule = piecewise(vec![1.0], vec![0.3]).unwrap();
        assert!(close(schedule.value(0.0), 0.3));
        assert!(close(schedule.value(7.0), 0.3));
    }

    #[test]
    fn rejects_malformed_control_points() {
        assert!(matches!(
            piecewise(vec![0.0, 1.0], vec![0.1]),
            Err(TrainingError::Configuration(_))
        ));
        assert!(piecewise(vec![0.0, 2.0, 2.0], vec![0.1, 0.2, 0.3]).is_err());
        assert!(piecewise(vec![3.0, 1.0], vec![0.1, 0.2]).is_err());
        assert!(piecewise(vec![], vec![]).is_err());
    }

    #[test]
    fn change_scale_multiplies_output() {
        let scaled = change_scale(reference(), 1.0 / 500.0);
        assert!(close(scaled.value(4.0), 0.4 / 500.0));
        assert!(close(scaled.value(2.0), 0.2125 / 500.0));
        assert_eq!(reference().scaled(1.0 / 500.0), scaled);
    }

    #[test]
    fn built_from_config_divides_by_batch_size() {
        let cfg = config::SchedulerConfig::default();
        let schedule = SchedulerConfig::from_training_config(&cfg, 25, 500)
            .unwrap()
            .build()
            .unwrap();
        assert!(close(schedule.value(4.0) * 500.0, 0.4));
    }
}
