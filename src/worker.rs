//! Worker pool and per-request orchestration for CPU-bound image work
//!
//! Each request runs `Decoding -> Transforming -> Encoding` on the engine's
//! worker pool under a deadline. Native calls cannot be interrupted: on
//! expiry the caller gets [`PipelineError::Timeout`] at once, the job's
//! cancellation token fires, and the chain stops at its next stage boundary.
//! A call already running finishes, its handle is released and the result
//! is dropped.

use crate::config::Config;
use crate::encoder::EncodedBuffer;
use crate::engine::{Engine, EngineState};
use crate::error::PipelineError;
use crate::pipeline::TransformRequest;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type JobResult = Result<EncodedBuffer, PipelineError>;

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    Decoding,
    Transforming,
    Encoding,
    Completed,
    Failed,
}

impl fmt::Display for RequestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestStage::Received => "received",
            RequestStage::Decoding => "decoding",
            RequestStage::Transforming => "transforming",
            RequestStage::Encoding => "encoding",
            RequestStage::Completed => "completed",
            RequestStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Jobs that have been submitted and not yet finished.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn new(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(in_flight))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// A transformation job
struct Job {
    input: Bytes,
    request: TransformRequest,
    comment: Option<String>,
    cancel: CancellationToken,
    response_tx: oneshot::Sender<JobResult>,
    _in_flight: InFlightGuard,
}

/// Drives one job through its stages.
struct Orchestration<'a> {
    engine: &'a Engine,
    cancel: &'a CancellationToken,
    stage: RequestStage,
    failed_at: Option<RequestStage>,
}

impl<'a> Orchestration<'a> {
    fn new(engine: &'a Engine, cancel: &'a CancellationToken) -> Self {
        Self {
            engine,
            cancel,
            stage: RequestStage::Received,
            failed_at: None,
        }
    }

    fn drive(
        &mut self,
        input: &[u8],
        request: &TransformRequest,
        comment: Option<String>,
    ) -> JobResult {
        let result = self.run(input, request, comment);
        if result.is_err() {
            self.failed_at = Some(self.stage);
            self.stage = RequestStage::Failed;
        }
        result
    }

    fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Timeout);
        }
        Ok(())
    }

    fn enter(&mut self, stage: RequestStage) -> Result<(), PipelineError> {
        self.checkpoint()?;
        self.stage = stage;
        Ok(())
    }

    fn run(
        &mut self,
        input: &[u8],
        request: &TransformRequest,
        comment: Option<String>,
    ) -> JobResult {
        self.enter(RequestStage::Decoding)?;
        let mut handle = self.engine.decode(input)?;
        if let Some(comment) = comment {
            handle.set_user_comment(comment);
        }

        self.enter(RequestStage::Transforming)?;
        if let Some((width, height)) = request.resize {
            handle = self.engine.resize(handle, width, height)?;
            self.checkpoint()?;
        }
        if request.grayscale {
            handle = self.engine.grayscale(handle)?;
            self.checkpoint()?;
        }
        if let Some(sigma) = request.blur {
            handle = self.engine.blur(handle, sigma)?;
        }

        self.enter(RequestStage::Encoding)?;
        let encoded = self.engine.encode(&handle, request.format)?;
        handle.retire();

        self.stage = RequestStage::Completed;
        Ok(encoded)
    }
}

/// Run the full chain for one request on the calling thread.
fn execute(
    engine: &Engine,
    input: &[u8],
    request: &TransformRequest,
    comment: Option<String>,
    cancel: &CancellationToken,
) -> JobResult {
    let started = Instant::now();
    let mut orchestration = Orchestration::new(engine, cancel);
    let result = orchestration.drive(input, request, comment);
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let stage = orchestration.failed_at.unwrap_or(orchestration.stage);

    match &result {
        Ok(encoded) => debug!(
            format = %encoded.format(),
            bytes = encoded.len(),
            elapsed_ms,
            "Pipeline completed"
        ),
        Err(PipelineError::Timeout) => debug!(
            stage = %stage,
            elapsed_ms,
            "Pipeline abandoned after deadline"
        ),
        Err(
            e @ (PipelineError::EmptyInput
            | PipelineError::UnrecognizedFormat
            | PipelineError::Decode(_)
            | PipelineError::ImageTooLarge { .. }
            | PipelineError::InvalidParameter(_)),
        ) => warn!(
            stage = %stage,
            error = %e,
            "Pipeline rejected input"
        ),
        Err(e) => error!(
            stage = %stage,
            error = %e,
            "Pipeline failed"
        ),
    }

    result
}

/// Worker pool for handling transformation jobs
pub struct WorkerPool {
    engine: Arc<Engine>,
    job_tx: mpsc::Sender<Job>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<InFlight>,
    request_timeout: Duration,
    max_dimension: u32,
}

impl WorkerPool {
    /// Create a new worker pool feeding `engine`
    pub fn new(engine: Arc<Engine>, config: &Config) -> Self {
        let (job_tx, mut job_rx) = mpsc::channel::<Job>(config.queue_size.max(1));
        let semaphore = Arc::new(Semaphore::new(config.worker_count.max(1)));

        let sem = semaphore.clone();
        let dispatch_engine = engine.clone();
        tokio::spawn(async move {
            while let Some(job) = job_rx.recv().await {
                // Acquire a permit before spawning: at most `worker_count` jobs
                // run, and the channel fills up and rejects requests when busy.
                let permit = match sem.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };

                if job.cancel.is_cancelled() {
                    let _ = job.response_tx.send(Err(PipelineError::Timeout));
                    continue;
                }

                let Job {
                    input,
                    request,
                    comment,
                    cancel,
                    response_tx,
                    _in_flight: in_flight,
                } = job;

                let engine = dispatch_engine.clone();
                let spawned = dispatch_engine.spawn(move || {
                    // Released in reverse order: the permit, then the in-flight count.
                    let _in_flight = in_flight;
                    let _permit = permit;

                    let result = execute(&engine, &input, &request, comment, &cancel);
                    // Receiver is gone when the deadline passed
                    let _ = response_tx.send(result);
                });

                if let Err(e) = spawned {
                    warn!(error = %e, "Dropping job, engine not accepting work");
                }
            }
            debug!("Worker dispatcher stopped");
        });

        Self {
            engine,
            job_tx,
            semaphore,
            in_flight: Arc::default(),
            request_timeout: config.handler_timeout(),
            max_dimension: config.max_output_dimension,
        }
    }

    /// Override the per-request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Submit a job for processing
    ///
    /// # Returns
    /// * `Ok(oneshot::Receiver)` - Receiver for the result
    /// * `Err(PipelineError::QueueFull)` - Queue is full
    fn submit(
        &self,
        input: Bytes,
        request: TransformRequest,
        comment: Option<String>,
        cancel: CancellationToken,
    ) -> Result<oneshot::Receiver<JobResult>, PipelineError> {
        let (response_tx, response_rx) = oneshot::channel();

        let job = Job {
            input,
            request,
            comment,
            cancel,
            response_tx,
            _in_flight: InFlightGuard::new(&self.in_flight),
        };

        self.job_tx
            .try_send(job)
            .map_err(|_| PipelineError::QueueFull)?;

        Ok(response_rx)
    }

    /// Validate, run and await one request under the pool's deadline.
    ///
    /// `comment` is stamped on the decoded handle before any transform.
    pub async fn process(
        &self,
        input: Bytes,
        request: TransformRequest,
        comment: Option<String>,
    ) -> JobResult {
        request.validate(self.max_dimension)?;

        let cancel = CancellationToken::new();
        // Dropping this future (client gone) also stops the chain.
        let _cancel_on_drop = cancel.clone().drop_guard();

        let response_rx = self.submit(input, request, comment, cancel.clone())?;

        match tokio::time::timeout(self.request_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(match self.engine.state() {
                EngineState::Ready => PipelineError::Internal("Worker dropped".to_string()),
                state => PipelineError::EngineNotReady(state),
            }),
            Err(_) => {
                cancel.cancel();
                info!(
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "Request exceeded its deadline"
                );
                Err(PipelineError::Timeout)
            }
        }
    }

    /// Jobs submitted and not yet finished, including abandoned ones.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Resolves once no job is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Get current worker capacity
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::OutputFormat;
    use crate::test_support::{gradient, jpeg_bytes, ready_engine};
    use image::GenericImageView;

    fn test_config() -> Config {
        Config {
            worker_count: 2,
            queue_size: 16,
            ..Config::default()
        }
    }

    fn resize_request(width: u32, height: u32, format: OutputFormat) -> TransformRequest {
        TransformRequest {
            resize: Some((width, height)),
            ..TransformRequest::new(format)
        }
    }

    #[tokio::test]
    async fn processes_full_chain() {
        let engine = ready_engine();
        let pool = WorkerPool::new(engine.clone(), &test_config());
        let input = Bytes::from(jpeg_bytes(&gradient(400, 300)));

        let request = TransformRequest {
            resize: Some((200, 200)),
            grayscale: true,
            blur: Some(2.0),
            format: OutputFormat::Webp,
        };
        let encoded = pool.process(input, request, None).await.unwrap();
        assert_eq!(encoded.format(), OutputFormat::Webp);

        let decoded = image::load_from_memory(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.dimensions(), (200, 200));

        pool.wait_idle().await;
        assert_eq!(engine.live_handles(), 0);
    }

    #[tokio::test]
    async fn validates_before_touching_engine() {
        // Engine never initialized: validation still answers first.
        let engine = Arc::new(Engine::new(crate::test_support::engine_options()));
        let pool = WorkerPool::new(engine, &test_config());

        let request = resize_request(0, 10, OutputFormat::Jpeg);
        let err = pool.process(Bytes::new(), request, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameter(_)));
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn stage_errors_abort_the_chain() {
        let engine = ready_engine();
        let pool = WorkerPool::new(engine.clone(), &test_config());

        let err = pool
            .process(Bytes::from_static(&[0u8; 5]), TransformRequest::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnrecognizedFormat));

        let err = pool
            .process(Bytes::new(), TransformRequest::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyInput));

        pool.wait_idle().await;
        assert_eq!(engine.live_handles(), 0);
    }

    #[tokio::test]
    async fn comment_reaches_jpeg_output() {
        let engine = ready_engine();
        let pool = WorkerPool::new(engine, &test_config());
        let input = Bytes::from(jpeg_bytes(&gradient(64, 64)));

        let encoded = pool
            .process(
                input,
                resize_request(32, 32, OutputFormat::Jpeg),
                Some("Picsum ID: 7".to_string()),
            )
            .await
            .unwrap();

        let needle = b"Picsum ID: 7";
        assert!(encoded.as_bytes().windows(needle.len()).any(|w| w == needle));
    }

    #[tokio::test]
    async fn deadline_reports_timeout_and_releases_handles() {
        let engine = ready_engine();
        let pool = WorkerPool::new(engine.clone(), &test_config())
            .with_request_timeout(Duration::from_millis(1));
        let input = Bytes::from(jpeg_bytes(&gradient(1500, 1500)));

        let request = TransformRequest {
            blur: Some(10.0),
            ..TransformRequest::default()
        };
        let err = pool.process(input, request, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Timeout));

        tokio::time::timeout(Duration::from_secs(120), pool.wait_idle())
            .await
            .expect("abandoned job never finished");
        assert_eq!(engine.live_handles(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_are_independent() {
        let engine = ready_engine();
        let pool = Arc::new(WorkerPool::new(engine.clone(), &test_config()));
        let input = Bytes::from(jpeg_bytes(&gradient(320, 240)));

        let tasks: Vec<_> = (1..=6u32)
            .map(|i| {
                let pool = pool.clone();
                let input = input.clone();
                tokio::spawn(async move {
                    let request = resize_request(20 * i, 10 * i, OutputFormat::Jpeg);
                    let encoded = pool.process(input, request, None).await.unwrap();
                    let decoded = image::load_from_memory(encoded.as_bytes()).unwrap();
                    assert_eq!(decoded.dimensions(), (20 * i, 10 * i));
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        pool.wait_idle().await;
        assert_eq!(engine.live_handles(), 0);
        assert_eq!(pool.available_permits(), 2);
    }

    #[tokio::test]
    async fn stopped_engine_is_reported() {
        let engine = ready_engine();
        let pool = WorkerPool::new(engine.clone(), &test_config());
        engine.shutdown().unwrap();

        let input = Bytes::from(jpeg_bytes(&gradient(16, 16)));
        let err = pool
            .process(input, TransformRequest::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::EngineNotReady(EngineState::Stopped)
        ));
    }
}
