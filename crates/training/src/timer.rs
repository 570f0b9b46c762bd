use std::{
    fmt,
    time::{Duration, Instant},
};

/// Wall-clock accumulator keyed by phase name.
///
/// Every [`lap`](Timer::lap) charges the time since the previous boundary to
/// one phase, both in the run-long accumulation and in the current step's
/// table. Accumulations are only cleared by [`reset`](Timer::reset).
#[derive(Debug, Clone)]
pub struct Timer {
    boundary: Instant,
    accumulation: Vec<(String, Duration)>,
    current_step: Vec<(String, Duration)>,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self {
            boundary: Instant::now(),
            accumulation: Vec::new(),
            current_step: Vec::new(),
        }
    }

    /// Closes the running interval, charges it to `phase` and returns its length.
    pub fn lap(&mut self, phase: &str) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.boundary);
        self.boundary = now;
        add(&mut self.accumulation, phase, elapsed);
        add(&mut self.current_step, phase, elapsed);
        elapsed
    }

    /// Starts a new step table, then laps `phase`.
    pub fn begin_step(&mut self, phase: &str) -> Duration {
        self.current_step.clear();
        self.lap(phase)
    }

    /// Total seconds charged to `phase` so far.
    pub fn accumulated(&self, phase: &str) -> f64 {
        lookup(&self.accumulation, phase).as_secs_f64()
    }

    /// Seconds charged to `phase` since the last [`begin_step`](Timer::begin_step).
    pub fn step_seconds(&self, phase: &str) -> f64 {
        lookup(&self.current_step, phase).as_secs_f64()
    }

    pub fn phases(&self) -> impl Iterator<Item = (&str, f64)> {
        self.accumulation
            .iter()
            .map(|(name, total)| (name.as_str(), total.as_secs_f64()))
    }

    pub fn reset(&mut self) {
        self.boundary = Instant::now();
        self.accumulation.clear();
        self.current_step.clear();
    }
}

impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (name, step)) in self.current_step.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }
            let total = lookup(&self.accumulation, name);
            write!(
                f,
                "{}:{:.3}s({:.2}s)",
                name,
                step.as_secs_f64(),
                total.as_secs_f64()
            )?;
        }
        Ok(())
    }
}

fn add(table: &mut Vec<(String, Duration)>, phase: &str, elapsed: Duration) {
    match table.iter_mut().find(|(name, _)| name == phase) {
        Some((_, total)) => *total += elapsed,
        None => table.push((phase.to_string(), elapsed)),
    }
}

fn lookup(table: &[(String, Duration)], phase: &str) -> Duration {
    table
        .iter()
        .find(|(name, _)| name == phase)
        .map_or(Duration::ZERO, |(_, total)| *total)
}
