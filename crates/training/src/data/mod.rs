//! Device-side batch pipeline.
//!
//! [`PrefetchLoader`] runs a host batch source on a staging thread, uploads
//! each batch to the target device and dtype, and hands finished batches to
//! the caller in source order through a bounded channel.

use std::{
    sync::{
        mpsc::{self, Receiver, SyncSender},
        Arc,
    },
    thread::{self, JoinHandle},
};

use candle_core::{DType, Device, Tensor};
use cifar_data::{BatchLoader, Compose, DataError, Dataset, HostBatch, LoaderConfig};
use rayon::ThreadPool;

use crate::TrainingError;

pub type Result<T> = std::result::Result<T, TrainingError>;

/// A batch materialized on the compute device.
///
/// `inputs` is `(B, C, H, W)`, or `(B, V, C, H, W)` when every sample carries
/// `V` test-time views; `targets` is `(B,)` `u32`.
#[derive(Debug, Clone)]
pub struct DeviceBatch {
    pub inputs: Tensor,
    pub targets: Tensor,
    pub len: usize,
}

impl DeviceBatch {
    /// Number of views per sample, when the batch carries several.
    pub fn views(&self) -> Option<usize> {
        match self.inputs.dims() {
            [_, views, _, _, _] => Some(*views),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    pub device: Device,
    /// Dtype of the uploaded inputs; targets are always `u32`.
    pub dtype: DType,
    /// Batches prepared ahead of the consumer.
    pub depth: usize,
}

impl PrefetchConfig {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self {
            device,
            dtype,
            depth: 1,
        }
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }
}

enum PrefetchMessage {
    Batch(DeviceBatch),
    Failed(TrainingError),
}

/// Overlaps host preparation and upload of batch `N + 1` with the caller's
/// use of batch `N`.
///
/// At most `depth` batches are prepared ahead. After the source ends or fails
/// the loader is finished and every further pull returns `Ok(None)`. A
/// panicking staging thread is reported as an error on the pull that finds
/// the channel closed.
pub struct PrefetchLoader {
    receiver: Option<Receiver<PrefetchMessage>>,
    handle: Option<JoinHandle<()>>,
    delivered: usize,
    finished: bool,
}

impl PrefetchLoader {
    pub fn spawn<I>(source: I, config: PrefetchConfig) -> Result<Self>
    where
        I: Iterator<Item = std::result::Result<HostBatch, DataError>> + Send + 'static,
    {
        if config.depth == 0 {
            return Err(TrainingError::configuration(
                "prefetch depth must be greater than zero",
            ));
        }
        // the worker holds one finished batch while blocked on send
        let (sender, receiver) = mpsc::sync_channel(config.depth - 1);
        let handle = thread::Builder::new()
            .name("prefetch".into())
            .spawn(move || stage(source, config, sender))?;
        Ok(Self {
            receiver: Some(receiver),
            handle: Some(handle),
            delivered: 0,
            finished: false,
        })
    }

    /// Blocks until the next batch is on the device.
    pub fn next_batch(&mut self) -> Result<Option<DeviceBatch>> {
        if self.finished {
            return Ok(None);
        }
        let message = match self.receiver.as_ref().map(Receiver::recv) {
            Some(Ok(message)) => message,
            Some(Err(_)) | None => {
                self.finished = true;
                return self.join_worker().map(|()| None);
            }
        };
        match message {
            PrefetchMessage::Batch(batch) => {
                self.delivered += 1;
                Ok(Some(batch))
            }
            PrefetchMessage::Failed(err) => {
                self.finished = true;
                Err(err)
            }
        }
    }

    /// Like [`next_batch`](Self::next_batch), but exhaustion is an error.
    pub fn expect_batch(&mut self) -> Result<DeviceBatch> {
        self.next_batch()?.ok_or_else(|| {
            TrainingError::data_exhausted(format!(
                "batch source ran dry after {} batches",
                self.delivered
            ))
        })
    }

    /// Batches handed to the caller so far.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    fn join_worker(&mut self) -> Result<()> {
        match self.handle.take().map(JoinHandle::join) {
            Some(Err(panic)) => Err(TrainingError::runtime(format!(
                "prefetch worker panicked after {} batches: {}",
                self.delivered,
                panic_message(panic.as_ref())
            ))),
            _ => Ok(()),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

impl Drop for PrefetchLoader {
    fn drop(&mut self) {
        // closing the channel makes a blocked send fail and the worker exit
        drop(self.receiver.take());
        if let Some(Err(err)) = self.handle.take().map(JoinHandle::join) {
            log::error!("prefetch worker panicked: {:?}", err);
        }
    }
}

fn stage<I>(source: I, config: PrefetchConfig, sender: SyncSender<PrefetchMessage>)
where
    I: Iterator<Item = std::result::Result<HostBatch, DataError>>,
{
    for batch in source {
        let message = match batch
            .map_err(TrainingError::from)
            .and_then(|batch| upload(batch, &config))
        {
            Ok(batch) => PrefetchMessage::Batch(batch),
            Err(err) => {
                let _ = sender.send(PrefetchMessage::Failed(err));
                return;
            }
        };
        if sender.send(message).is_err() {
            log::debug!("prefetch consumer gone, stopping");
            return;
        }
    }
}

fn upload(batch: HostBatch, config: &PrefetchConfig) -> Result<DeviceBatch> {
    let len = batch.len();
    if batch.shape.first() != Some(&len) {
        return Err(TrainingError::configuration(format!(
            "batch shape {:?} does not lead with its {} targets",
            batch.shape, len
        )));
    }
    let inputs = Tensor::from_vec(batch.inputs, batch.shape, &config.device)?
        .to_dtype(config.dtype)?;
    let targets = Tensor::from_vec(batch.targets, len, &config.device)?;
    Ok(DeviceBatch {
        inputs,
        targets,
        len,
    })
}

/// A finite evaluation source that can be replayed in the same order.
///
/// The gathering pool is built once and reused by every pass.
pub struct EvalPipeline {
    dataset: Arc<dyn Dataset>,
    transforms: Arc<Compose>,
    loader: LoaderConfig,
    prefetch: PrefetchConfig,
    pool: Arc<ThreadPool>,
}

impl EvalPipeline {
    pub fn new(
        dataset: Arc<dyn Dataset>,
        transforms: Arc<Compose>,
        loader: LoaderConfig,
        prefetch: PrefetchConfig,
    ) -> Result<Self> {
        if loader.infinite || loader.shuffle {
            return Err(TrainingError::configuration(
                "evaluation loader must be finite and unshuffled",
            ));
        }
        let pool = Arc::new(cifar_data::build_pool(loader.num_workers)?);
        Ok(Self {
            dataset,
            transforms,
            loader,
            prefetch,
            pool,
        })
    }

    /// Starts one pass over the evaluation set.
    pub fn open(&self) -> Result<PrefetchLoader> {
        let source = BatchLoader::with_pool(
            Arc::clone(&self.dataset),
            Arc::clone(&self.transforms),
            self.loader,
            Arc::clone(&self.pool),
        )?;
        PrefetchLoader::spawn(source, self.prefetch.clone())
    }

    /// Batches one pass is expected to yield.
    pub fn batches(&self) -> usize {
        self.dataset.len().div_ceil(self.loader.batch_size.max(1))
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }
}
