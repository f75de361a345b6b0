use crate::batch::{Batch, BatchAccumulator, DEFAULT_BATCH_SIZE};
use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::records::{classify, DetectionRecord, Shape, StatusRecord};
use crate::retry::{RetryPolicy, RetryingWriter};
use crate::store::{Persist, RecordSink};
use crate::stream_parser::RecordStream;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument};

/// A creation event delivered by the directory watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub is_dir: bool,
}

impl FileEvent {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            is_dir: false,
        }
    }

    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            is_dir: true,
        }
    }
}

/// Lifecycle of one drop file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStage {
    Notified,
    Classified,
    Streaming,
    BatchWrite,
    Done,
    Failed,
}

impl fmt::Display for FileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileStage::Notified => "notified",
            FileStage::Classified => "classified",
            FileStage::Streaming => "streaming",
            FileStage::BatchWrite => "batch_write",
            FileStage::Done => "done",
            FileStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How processing of a file ended
#[derive(Debug)]
pub enum FileOutcome {
    /// Filename matched no known shape
    Ignored,
    Done,
    Failed(IngestError),
}

/// Summary of one processed file
#[derive(Debug)]
pub struct FileReport {
    pub path: PathBuf,
    pub shape: Option<Shape>,
    /// Records decoded from the file
    pub records: usize,
    /// Batches committed to the store
    pub batches: usize,
    /// Rows inside committed batches
    pub rows_committed: usize,
    pub outcome: FileOutcome,
}

impl FileReport {
    fn new(path: &Path, shape: Option<Shape>) -> Self {
        Self {
            path: path.to_path_buf(),
            shape,
            records: 0,
            batches: 0,
            rows_committed: 0,
            outcome: FileOutcome::Ignored,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.outcome, FileOutcome::Done)
    }

    pub fn error(&self) -> Option<&IngestError> {
        match &self.outcome {
            FileOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Tunables for file processing
#[derive(Debug, Clone, Copy)]
pub struct DispatcherSettings {
    pub batch_size: usize,
    pub parse_buffer: usize,
    pub retry: RetryPolicy,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            parse_buffer: 1024,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&IngestConfig> for DispatcherSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            parse_buffer: config.parse_buffer,
            retry: config.retry_policy(),
        }
    }
}

/// Drives drop files from notification to committed batches.
pub struct IngestDispatcher<S: ?Sized> {
    settings: DispatcherSettings,
    writer: RetryingWriter,
    sink: Arc<S>,
}

impl<S> IngestDispatcher<S>
where
    S: RecordSink + ?Sized + 'static,
{
    pub fn new(sink: Arc<S>, settings: DispatcherSettings) -> Self {
        Self {
            writer: RetryingWriter::new(settings.retry),
            settings,
            sink,
        }
    }

    /// Pull notifications until shutdown or until the queue closes.
    ///
    /// Every classified file gets its own task. Files of the same shape run one
    /// after another in arrival order; different shapes run concurrently. The
    /// returned tracker is closed and can be awaited for in-flight files.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<FileEvent>,
        shutdown: CancellationToken,
    ) -> TaskTracker {
        let tracker = TaskTracker::new();
        let mut lane_tails: HashMap<Shape, oneshot::Receiver<()>> = HashMap::new();

        info!("Dispatcher started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting files");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event, &tracker, &mut lane_tails),
                    None => {
                        debug!("Notification queue closed");
                        break;
                    }
                }
            }
        }

        tracker.close();
        tracker
    }

    fn dispatch(
        self: &Arc<Self>,
        event: FileEvent,
        tracker: &TaskTracker,
        lane_tails: &mut HashMap<Shape, oneshot::Receiver<()>>,
    ) {
        if event.is_dir {
            debug!(path = %event.path.display(), "Ignoring directory creation");
            return;
        }

        let Some(shape) = classify(&event.path) else {
            debug!(path = %event.path.display(), "Ignoring unrecognised file");
            metrics::counter!("loader.files.ignored").increment(1);
            return;
        };

        // Chain onto the previous file of the same shape
        let (done_tx, done_rx) = oneshot::channel();
        let previous = lane_tails.insert(shape, done_rx);
        let dispatcher = Arc::clone(self);

        tracker.spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            dispatcher.process_file(&event.path).await;
            let _ = done_tx.send(());
        });
    }

    /// Ingest one file end to end. Failures are logged and reported, never raised.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn process_file(&self, path: &Path) -> FileReport {
        debug!(stage = %FileStage::Notified, "File ready");

        let Some(shape) = classify(path) else {
            debug!("Filename matches no known shape, skipping");
            metrics::counter!("loader.files.ignored").increment(1);
            return FileReport::new(path, None);
        };

        debug!(stage = %FileStage::Classified, shape = %shape, "File classified");

        let mut report = FileReport::new(path, Some(shape));
        let result = match shape {
            Shape::Detection => self.ingest::<DetectionRecord>(path, &mut report).await,
            Shape::Status => self.ingest::<StatusRecord>(path, &mut report).await,
        };

        match result {
            Ok(()) => {
                debug!(stage = %FileStage::Done, "File complete");
                info!(
                    shape = %shape,
                    records = report.records,
                    batches = report.batches,
                    "File ingested"
                );
                metrics::counter!("loader.files.completed").increment(1);
                report.outcome = FileOutcome::Done;
            }
            Err(e) => {
                debug!(stage = %FileStage::Failed, "File failed");
                error!(
                    shape = %shape,
                    kind = %e.kind(),
                    error = %e,
                    records = report.records,
                    batches_committed = report.batches,
                    "File ingestion failed"
                );
                metrics::counter!("loader.files.failed").increment(1);
                report.outcome = FileOutcome::Failed(e);
            }
        }

        report
    }

    async fn ingest<T: Persist>(&self, path: &Path, report: &mut FileReport) -> Result<(), IngestError> {
        debug!(stage = %FileStage::Streaming, "Streaming records");

        let mut stream = RecordStream::<T>::open(path, self.settings.parse_buffer);
        let mut accumulator = BatchAccumulator::new(self.settings.batch_size);

        while let Some(item) = stream.next().await {
            let record = item?;
            report.records += 1;

            if let Some(batch) = accumulator.push(record) {
                self.write_batch(path, &batch, report).await?;
            }
        }

        if let Some(batch) = accumulator.finish() {
            self.write_batch(path, &batch, report).await?;
        }

        Ok(())
    }

    async fn write_batch<T: Persist>(
        &self,
        path: &Path,
        batch: &Batch<T>,
        report: &mut FileReport,
    ) -> Result<(), IngestError> {
        debug!(
            stage = %FileStage::BatchWrite,
            shape = %T::SHAPE,
            batch_size = batch.len(),
            "Writing batch"
        );

        let sink = self.sink.as_ref();
        let file = path.display().to_string();
        self.writer
            .write(T::SHAPE, &file, || async move {
                T::persist(sink, batch).await.map_err(IngestError::from)
            })
            .await?;

        report.batches += 1;
        report.rows_committed += batch.len();
        metrics::counter!("loader.batches.committed").increment(1);
        metrics::counter!("loader.records.ingested").increment(batch.len() as u64);
        Ok(())
    }
}
