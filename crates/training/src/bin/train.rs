use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use serde_json::{Map, Number, Value};
use training::{config::Precision, init_logging, Trainer, TrainingConfig, TrainingError};

fn main() {
    if let Err(err) = run() {
        log::error!("training failed: {}", err);
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Fast CIFAR-10 training", long_about = None)]
struct Args {
    #[arg(long, value_name = "DIR", help = "Directory holding (or receiving) cifar10/")]
    dataset_base: Option<PathBuf>,

    #[arg(long, value_name = "N", help = "Training batch size")]
    batch: Option<usize>,

    #[arg(long, value_name = "N", help = "Number of epochs")]
    epoch: Option<usize>,

    #[arg(long, help = "Download the dataset before training")]
    download: bool,

    #[arg(long, value_name = "PATH", help = "Write logs to this file instead of stderr")]
    log_filename: Option<PathBuf>,

    #[arg(long, help = "Enable debug logging")]
    debug: bool,

    #[arg(short, long, value_name = "PATH", help = "TOML or JSON training config")]
    config: Option<PathBuf>,

    #[arg(long, help = "Half precision weights and activations")]
    half: bool,

    #[arg(long, value_name = "N", help = "Host preprocessing threads")]
    workers: Option<usize>,

    #[arg(long, value_name = "N")]
    seed: Option<u64>,

    #[arg(long, value_name = "DIR", help = "Write TensorBoard scalars here")]
    tensorboard: Option<PathBuf>,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override a config value by dot-separated path, e.g. scheduler.values=[0.1,0.2]"
    )]
    overrides: Vec<OverrideArg>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();
    init_logging(args.debug, args.log_filename.as_deref())?;

    let mut config = match args.config.as_ref() {
        Some(path) => TrainingConfig::load(path)?,
        None => TrainingConfig::default(),
    };
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    apply_flags(&mut config, &args);
    config.validate()?;

    let report = Trainer::from_config(&config)?.run()?;
    println!("{}", report.render());
    Ok(())
}

fn apply_flags(config: &mut TrainingConfig, args: &Args) {
    if let Some(base) = args.dataset_base.clone() {
        config.data.root = base;
    }
    if let Some(batch) = args.batch {
        config.data.batch_size = batch;
    }
    if let Some(epochs) = args.epoch {
        config.runtime.epochs = epochs;
    }
    if let Some(workers) = args.workers {
        config.data.num_workers = workers;
    }
    if let Some(seed) = args.seed {
        config.runtime.seed = seed;
    }
    if let Some(dir) = args.tensorboard.clone() {
        config.runtime.tensorboard_dir = Some(dir);
    }
    config.data.download |= args.download;
    if args.half {
        config.runtime.precision = Precision::Fp16;
    }
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config)?;
    for override_arg in overrides {
        let keys: Vec<&str> = override_arg.path.split('.').collect();
        assign(&mut value, &keys, parse_override_value(&override_arg.value))?;
    }
    Ok(serde_json::from_value(value)?)
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if let Ok(flag) = trimmed.parse::<bool>() {
        return Value::Bool(flag);
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn assign(target: &mut Value, keys: &[&str], new_value: Value) -> Result<(), TrainingError> {
    let Some((key, rest)) = keys.split_first() else {
        *target = new_value;
        return Ok(());
    };
    if key.is_empty() {
        return Err(TrainingError::configuration("override path has an empty segment"));
    }
    if target.is_null() {
        *target = Value::Object(Map::new());
    }
    let map = target.as_object_mut().ok_or_else(|| {
        TrainingError::configuration(format!("override segment '{key}' points into a non-object"))
    })?;
    let entry = map.entry(key.to_string()).or_insert(Value::Null);
    assign(entry, rest, new_value)
}
