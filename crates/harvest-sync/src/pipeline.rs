//! Chunk-oriented read → process → write step with retry and skip budgets.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use harvest_core::{BatchError, BatchStatus, ErrorKind, StepCounters};
use harvest_storage::BackoffPolicy;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn, Instrument};

#[async_trait]
pub trait ItemReader: Send {
    type Item: Send + Sync;

    async fn open(&mut self) -> Result<(), BatchError>;

    /// `Ok(None)` ends the stream.
    async fn read(&mut self) -> Result<Option<Self::Item>, BatchError>;

    /// Called once a chunk has been written; everything read so far is durable.
    async fn checkpoint(&mut self) -> Result<(), BatchError> {
        Ok(())
    }

    /// `completed` is false when the step failed or was stopped.
    async fn close(&mut self, completed: bool) -> Result<(), BatchError>;
}

#[async_trait]
pub trait ItemProcessor: Send + Sync {
    type Input: Send + Sync;
    type Output: Send + Sync;

    /// `Ok(None)` filters the item out.
    async fn process(&self, item: &Self::Input) -> Result<Option<Self::Output>, BatchError>;
}

#[async_trait]
pub trait ItemWriter: Send + Sync {
    type Item: Send + Sync;

    async fn write(&self, items: &[Self::Item]) -> Result<(), BatchError>;
}

/// Cooperative stop request, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultMode {
    /// Retry and skip budgets apply.
    Tolerant,
    /// Non-fatal item errors are logged and the item dropped.
    LogAndContinue,
}

impl FaultMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tolerant" | "fault-tolerant" => Some(FaultMode::Tolerant),
            "log-and-continue" | "log" => Some(FaultMode::LogAndContinue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Retry,
    Skip,
    Fatal,
}

#[derive(Debug, Clone)]
pub struct FaultTolerancePolicy {
    pub mode: FaultMode,
    pub retryable: Vec<ErrorKind>,
    pub skippable: Vec<ErrorKind>,
    pub no_skip: Vec<ErrorKind>,
    /// Attempts per operation, first try included.
    pub retry_limit: usize,
    /// Skips tolerated per run; one more fails the step.
    pub skip_limit: u64,
    pub backoff: BackoffPolicy,
}

impl Default for FaultTolerancePolicy {
    fn default() -> Self {
        Self {
            mode: FaultMode::Tolerant,
            retryable: vec![ErrorKind::StoreTransient, ErrorKind::StoreAccess],
            skippable: vec![ErrorKind::Io],
            no_skip: vec![ErrorKind::IllegalArgument, ErrorKind::MissingReference],
            retry_limit: 3,
            skip_limit: 100,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl FaultTolerancePolicy {
    fn disposition(&self, kind: ErrorKind) -> Disposition {
        if self.no_skip.contains(&kind) {
            Disposition::Fatal
        } else if self.retryable.contains(&kind) {
            Disposition::Retry
        } else if self.skippable.contains(&kind) {
            Disposition::Skip
        } else {
            Disposition::Fatal
        }
    }

    fn attempts(&self) -> usize {
        match self.mode {
            FaultMode::Tolerant => self.retry_limit.max(1),
            FaultMode::LogAndContinue => 1,
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable kind, or runs out of attempts.
    async fn retrying<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, BatchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BatchError>>,
    {
        let attempts = self.attempts();
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if self.disposition(err.kind()) != Disposition::Retry || attempt >= attempts {
                        return Err(err);
                    }
                    let delay = self.backoff.delay_for_attempt(attempt - 1);
                    debug!(what, attempt, ?delay, error = %err, "retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub status: BatchStatus,
    pub counters: StepCounters,
    pub failure: Option<BatchError>,
}

#[derive(Debug, Clone, Copy)]
enum SkipPhase {
    Read,
    Process,
    Write,
}

enum ChunkEnd {
    More,
    Exhausted,
}

pub struct ChunkedStep<R, P, W> {
    name: String,
    reader: R,
    processor: P,
    writer: W,
    chunk_size: usize,
    concurrency: usize,
    policy: FaultTolerancePolicy,
    counters: StepCounters,
}

impl<R, P, W> ChunkedStep<R, P, W>
where
    R: ItemReader,
    P: ItemProcessor<Input = R::Item>,
    W: ItemWriter<Item = P::Output>,
{
    pub fn new(
        name: impl Into<String>,
        reader: R,
        processor: P,
        writer: W,
        policy: FaultTolerancePolicy,
    ) -> Self {
        Self {
            name: name.into(),
            reader,
            processor,
            writer,
            chunk_size: 100,
            concurrency: 1,
            policy,
            counters: StepCounters::default(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Items of one chunk processed at the same time; output order is preserved.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn run(mut self, stop: &StopSignal) -> StepReport {
        let span = info_span!("step", step = %self.name);
        async move {
            if let Err(err) = self.reader.open().await {
                error!(error = %err, "reader failed to open");
                return self.finish(BatchStatus::Failed, Some(err)).await;
            }
            info!(chunk_size = self.chunk_size, mode = ?self.policy.mode, "step started");

            let mut chunk_index = 0usize;
            loop {
                if stop.is_stop_requested() {
                    warn!(chunk_index, "stop requested; ending step");
                    return self.finish(BatchStatus::Stopped, None).await;
                }
                let outcome = self
                    .run_chunk()
                    .instrument(info_span!("chunk", index = chunk_index))
                    .await;
                match outcome {
                    Ok(ChunkEnd::More) => chunk_index += 1,
                    Ok(ChunkEnd::Exhausted) => {
                        return self.finish(BatchStatus::Completed, None).await;
                    }
                    Err(err) => {
                        error!(error = %err, "step failed");
                        return self.finish(BatchStatus::Failed, Some(err)).await;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn finish(mut self, status: BatchStatus, failure: Option<BatchError>) -> StepReport {
        let completed = status == BatchStatus::Completed;
        if let Err(err) = self.reader.close(completed).await {
            warn!(error = %err, "reader failed to close");
        }
        info!(
            %status,
            read = self.counters.read_count,
            written = self.counters.write_count,
            filtered = self.counters.filter_count,
            skipped = self.counters.skip_count(),
            commits = self.counters.commit_count,
            "step finished"
        );
        StepReport {
            status,
            counters: self.counters,
            failure,
        }
    }

    async fn run_chunk(&mut self) -> Result<ChunkEnd, BatchError> {
        let (read, written, end) = match self.transact_chunk().await {
            Ok(done) => done,
            Err(err) => {
                self.counters.rollback_count += 1;
                return Err(err);
            }
        };
        if read == 0 {
            return Ok(end);
        }
        self.counters.commit_count += 1;
        self.checkpoint_with_retry().await?;
        debug!(read, written, "chunk committed");
        Ok(end)
    }

    /// Read, process and write one chunk; returns how many items were read and written.
    async fn transact_chunk(&mut self) -> Result<(usize, usize, ChunkEnd), BatchError> {
        let (inputs, end) = self.read_chunk().await?;
        if inputs.is_empty() {
            return Ok((0, 0, end));
        }
        let outputs = self.process_chunk(&inputs).await?;
        if !outputs.is_empty() {
            self.write_chunk(&outputs).await?;
        }
        Ok((inputs.len(), outputs.len(), end))
    }

    async fn read_chunk(&mut self) -> Result<(Vec<R::Item>, ChunkEnd), BatchError> {
        let mut items = Vec::with_capacity(self.chunk_size);
        let mut consecutive_failures = 0usize;
        while items.len() < self.chunk_size {
            let result = self.read_with_retry().await;
            match result {
                Ok(Some(item)) => {
                    consecutive_failures = 0;
                    self.counters.read_count += 1;
                    items.push(item);
                }
                Ok(None) => return Ok((items, ChunkEnd::Exhausted)),
                Err(err) => {
                    self.on_item_error(SkipPhase::Read, err)?;
                    consecutive_failures += 1;
                    if self.policy.mode == FaultMode::LogAndContinue
                        && consecutive_failures >= self.policy.retry_limit.max(1)
                    {
                        return Err(BatchError::Other(format!(
                            "reader failed {consecutive_failures} times in a row"
                        )));
                    }
                }
            }
        }
        Ok((items, ChunkEnd::More))
    }

    /// Reader calls cannot go through [`FaultTolerancePolicy::retrying`] since each one
    /// borrows the reader mutably.
    async fn read_with_retry(&mut self) -> Result<Option<R::Item>, BatchError> {
        let attempts = self.policy.attempts();
        let mut attempt = 0;
        loop {
            match self.reader.read().await {
                Ok(item) => return Ok(item),
                Err(err) => {
                    attempt += 1;
                    if self.policy.disposition(err.kind()) != Disposition::Retry
                        || attempt >= attempts
                    {
                        return Err(err);
                    }
                    let delay = self.policy.backoff.delay_for_attempt(attempt - 1);
                    debug!(attempt, ?delay, error = %err, "retrying read");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// A failed checkpoint leaves the reader where it was; the committed chunk is re-read
    /// on restart, which the writer's merge absorbs.
    async fn checkpoint_with_retry(&mut self) -> Result<(), BatchError> {
        let attempts = self.policy.attempts();
        let mut attempt = 0;
        loop {
            match self.reader.checkpoint().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    if self.policy.disposition(err.kind()) != Disposition::Retry
                        || attempt >= attempts
                    {
                        return Err(err);
                    }
                    let delay = self.policy.backoff.delay_for_attempt(attempt - 1);
                    debug!(attempt, ?delay, error = %err, "retrying checkpoint");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn process_chunk(&mut self, inputs: &[R::Item]) -> Result<Vec<P::Output>, BatchError> {
        let processor = &self.processor;
        let policy = &self.policy;
        let pending: Vec<BoxFuture<'_, Result<Option<P::Output>, BatchError>>> = inputs
            .iter()
            .map(|item| {
                policy
                    .retrying("process", move || processor.process(item))
                    .boxed()
            })
            .collect();
        let results: Vec<Result<Option<P::Output>, BatchError>> = stream::iter(pending)
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut outputs = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(Some(output)) => outputs.push(output),
                Ok(None) => self.counters.filter_count += 1,
                Err(err) => self.on_item_error(SkipPhase::Process, err)?,
            }
        }
        Ok(outputs)
    }

    async fn write_chunk(&mut self, outputs: &[P::Output]) -> Result<(), BatchError> {
        let writer = &self.writer;
        match self.policy.retrying("write", || writer.write(outputs)).await {
            Ok(()) => {
                self.counters.write_count += outputs.len() as u64;
                Ok(())
            }
            Err(err) => {
                match self.policy.disposition(err.kind()) {
                    Disposition::Skip => {}
                    Disposition::Retry if self.policy.mode == FaultMode::LogAndContinue => {}
                    _ => return Err(err),
                }
                self.counters.rollback_count += 1;
                warn!(error = %err, items = outputs.len(), "chunk write failed; writing items one by one");
                self.scan_chunk(outputs).await
            }
        }
    }

    async fn scan_chunk(&mut self, outputs: &[P::Output]) -> Result<(), BatchError> {
        for item in outputs {
            let writer = &self.writer;
            let single = std::slice::from_ref(item);
            match self.policy.retrying("write", || writer.write(single)).await {
                Ok(()) => self.counters.write_count += 1,
                Err(err) => self.on_item_error(SkipPhase::Write, err)?,
            }
        }
        Ok(())
    }

    /// Account for one failed item; `Err` means the step must fail.
    fn on_item_error(&mut self, phase: SkipPhase, err: BatchError) -> Result<(), BatchError> {
        let disposition = self.policy.disposition(err.kind());
        let skippable = match self.policy.mode {
            FaultMode::Tolerant => disposition == Disposition::Skip,
            FaultMode::LogAndContinue => disposition != Disposition::Fatal,
        };
        if !skippable {
            return Err(err);
        }

        match phase {
            SkipPhase::Read => self.counters.read_skip_count += 1,
            SkipPhase::Process => self.counters.process_skip_count += 1,
            SkipPhase::Write => self.counters.write_skip_count += 1,
        }
        let skips = self.counters.skip_count();
        warn!(?phase, skips, error = %err, "skipping item");

        if self.policy.mode == FaultMode::Tolerant && skips > self.policy.skip_limit {
            return Err(BatchError::Other(format!(
                "skip limit {} exceeded: {err}",
                self.policy.skip_limit
            )));
        }
        Ok(())
    }
}
