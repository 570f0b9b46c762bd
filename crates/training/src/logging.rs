use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use log::LevelFilter;
use prost::Message;

use crate::{timer::Timer, trainer::EpochSummary, TrainingError};

/// Installs the process logger: `[time] [LEVEL] [file:line] message`, INFO
/// (DEBUG when `debug`), on stderr or appended to `log_file`.
pub fn init_logging(debug: bool, log_file: Option<&Path>) -> Result<(), TrainingError> {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).format(|buf, record| {
        let file = record
            .file()
            .and_then(|path| Path::new(path).file_name())
            .and_then(|name| name.to_str())
            .unwrap_or("?");
        writeln!(
            buf,
            "[{}] [{}] [{}:{:03}] {}",
            buf.timestamp_millis(),
            record.level(),
            file,
            record.line().unwrap_or(0),
            record.args()
        )
    });
    if let Some(path) = log_file {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder
        .try_init()
        .map_err(|err| TrainingError::runtime(format!("failed to install logger: {err}")))
}

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
    /// Factor applied to the learning rate in epoch lines (the batch size when
    /// the schedule is per sample).
    pub lr_display_scale: f64,
}

impl LoggingSettings {
    pub fn new(tensorboard_dir: Option<PathBuf>, lr_display_scale: f64) -> Self {
        Self {
            tensorboard_dir,
            tensorboard_flush_every_n: 16,
            lr_display_scale,
        }
    }

    pub fn with_flush_every(mut self, flush_every: usize) -> Self {
        self.tensorboard_flush_every_n = flush_every.max(1);
        self
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self::new(None, 1.0)
    }
}

/// Epoch and step reporting through `log`, mirrored to TensorBoard when a
/// directory is configured.
pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = if let Some(dir) = settings.tensorboard_dir.as_ref() {
            Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?)
        } else {
            None
        };
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    /// Formats the per-epoch line; `timer` renders the phases of this epoch.
    pub fn epoch_line(&self, summary: &EpochSummary, timer: &Timer) -> String {
        format!(
            "[{:02}] train loss:{:.3} test loss:{:.3} accuracy:{:.3} lr:{:.3} {}",
            summary.epoch,
            summary.train_loss,
            summary.eval_loss,
            summary.accuracy,
            summary.learning_rate * self.settings.lr_display_scale,
            timer
        )
    }

    pub fn log_epoch(&mut self, summary: &EpochSummary, timer: &Timer) {
        log::info!("{}", self.epoch_line(summary, timer));

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = summary.epoch as i64;
            let _ = writer.write_scalar("train/loss", step, summary.train_loss);
            let _ = writer.write_scalar("train/hours", step, summary.hours);
            let _ = writer.write_scalar("train/learning_rate", step, summary.learning_rate);
            let _ = writer.write_scalar("eval/loss", step, summary.eval_loss);
            for (name, value) in &summary.metrics {
                let _ = writer.write_scalar(&format!("eval/{name}"), step, *value);
            }
        }
    }

    pub fn log_step(&mut self, global_step: usize, loss: f64, smoothed: f64, lr: f64) {
        log::debug!(
            "step={} loss={:.4} loss_ema={:.4} lr={:.5e}",
            global_step,
            loss,
            smoothed,
            lr
        );
        if let Some(writer) = self.tensorboard.as_mut() {
            let step = global_step as i64;
            let _ = writer.write_scalar("train/step_loss", step, loss);
            let _ = writer.write_scalar("train/step_learning_rate", step, lr);
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.flush();
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let timestamp = current_unix_timestamp();
        let hostname = hostname();
        let filename = format!("events.out.tfevents.{}.{}", timestamp, hostname);
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let wall_time = current_wall_time();
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        let event = Event {
            wall_time,
            step,
            summary: Some(summary),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;

        let data = buffer.freeze();
        let len = data.len() as u64;

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&len.to_le_bytes());
        let len_crc = masked_crc32(&len_bytes);
        let data_crc = masked_crc32(data.as_ref());

        let len_crc_bytes = len_crc.to_le_bytes();
        let data_crc_bytes = data_crc.to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> EpochSummary {
        EpochSummary {
            epoch: 3,
            hours: 0.01,
            train_loss: 1.23456,
            eval_loss: 0.5,
            accuracy: 0.875,
            learning_rate: 0.0008,
            metrics: vec![("top1".to_string(), 0.875)],
        }
    }

    #[test]
    fn epoch_line_scales_learning_rate() {
        let logger = Logger::new(LoggingSettings::new(None, 500.0)).unwrap();
        let line = logger.epoch_line(&summary(), &Timer::new());
        assert!(
            line.starts_with("[03] train loss:1.235 test loss:0.500 accuracy:0.875 lr:0.400"),
            "{line}"
        );
    }

    #[test]
    fn tensorboard_events_are_framed() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger =
            Logger::new(LoggingSettings::new(Some(dir.path().to_path_buf()), 1.0)).unwrap();
        logger.log_epoch(&summary(), &Timer::new());
        logger.flush();

        let entry = fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
        let bytes = fs::read(entry.path()).unwrap();
        let len = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
        let len_crc = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        assert_eq!(len_crc, masked_crc32(&bytes[..8]));
        let event = Event::decode(&bytes[12..12 + len]).unwrap();
        assert_eq!(event.step, 3);
        assert_eq!(event.summary.unwrap().value[0].tag, "train/loss");
    }
}
