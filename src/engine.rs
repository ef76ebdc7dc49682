//! Transformation engine lifecycle
//!
//! The engine owns the worker pool that runs CPU-bound image work and gates
//! every pipeline operation on its lifecycle state:
//!
//! `Uninitialized -> Ready -> ShuttingDown -> Stopped`
//!
//! Operations on individual handles take no locks. The pool slot is only
//! written by [`Engine::initialize`] and [`Engine::shutdown`].

use crate::config::Config;
use crate::encoder::{self, EncodedBuffer, OutputFormat};
use crate::error::PipelineError;
use crate::handle::{ImageHandle, Lease};
use crate::pipeline;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::{debug, error, info, warn, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Uninitialized = 0,
    Ready = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Uninitialized,
            1 => EngineState::Ready,
            2 => EngineState::ShuttingDown,
            _ => EngineState::Stopped,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Ready => "ready",
            EngineState::ShuttingDown => "shutting down",
            EngineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Settings fixed for the lifetime of an engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Threads in the engine's worker pool
    pub worker_threads: usize,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    /// Maximum decoded width or height
    pub max_resolution: u32,
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            worker_threads: config.worker_count,
            jpeg_quality: config.jpeg_quality,
            max_resolution: config.max_resolution,
        }
    }
}

pub struct Engine {
    options: EngineOptions,
    state: AtomicU8,
    pool: RwLock<Option<ThreadPool>>,
    span: OnceLock<Span>,
    live_handles: Arc<AtomicUsize>,
}

impl Engine {
    /// Create an engine in the `Uninitialized` state.
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            state: AtomicU8::new(EngineState::Uninitialized as u8),
            pool: RwLock::new(None),
            span: OnceLock::new(),
            live_handles: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Allocate the worker pool, probe the JPEG codec and move to `Ready`.
    ///
    /// Engine diagnostics are emitted inside `span`. Must be called once.
    pub fn initialize(&self, span: Span) -> Result<(), PipelineError> {
        let mut slot = self.pool.write().unwrap_or_else(PoisonError::into_inner);

        let state = self.state();
        if state != EngineState::Uninitialized {
            return Err(PipelineError::EngineInit(format!(
                "engine cannot be initialized while {state}"
            )));
        }

        let entered = span.enter();

        turbojpeg::Compressor::new()
            .map_err(|e| PipelineError::EngineInit(format!("jpeg codec unavailable: {e}")))?;

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.options.worker_threads.max(1))
            .thread_name(|i| format!("picsum-engine-{i}"))
            .panic_handler(|_| error!("Engine worker panicked"))
            .build()
            .map_err(|e| PipelineError::EngineInit(e.to_string()))?;

        info!(
            threads = pool.current_num_threads(),
            jpeg_quality = self.options.jpeg_quality,
            max_resolution = self.options.max_resolution,
            "Engine ready"
        );

        *slot = Some(pool);
        drop(entered);
        let _ = self.span.set(span);
        self.state.store(EngineState::Ready as u8, Ordering::Release);

        Ok(())
    }

    /// Release the worker pool and move to `Stopped`.
    ///
    /// Does not wait for outstanding work; callers drain first. Jobs already
    /// queued on the pool still run to completion.
    pub fn shutdown(&self) -> Result<(), PipelineError> {
        let mut slot = self.pool.write().unwrap_or_else(PoisonError::into_inner);

        self.state
            .compare_exchange(
                EngineState::Ready as u8,
                EngineState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|s| PipelineError::EngineNotReady(EngineState::from_u8(s)))?;

        let _entered = self.enter();
        info!("Engine shutting down");

        let live = self.live_handles();
        if live > 0 {
            warn!(live_handles = live, "Engine stopping with live image handles");
        }

        drop(slot.take());
        self.state.store(EngineState::Stopped as u8, Ordering::Release);
        info!("Engine stopped");

        Ok(())
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of engine-created handles not yet released.
    pub fn live_handles(&self) -> usize {
        self.live_handles.load(Ordering::Acquire)
    }

    fn ensure_ready(&self) -> Result<(), PipelineError> {
        match self.state() {
            EngineState::Ready => Ok(()),
            state => Err(PipelineError::EngineNotReady(state)),
        }
    }

    fn enter(&self) -> Option<tracing::span::Entered<'_>> {
        self.span.get().map(Span::enter)
    }

    /// Run `job` on the engine's worker pool.
    pub fn spawn<F>(&self, job: F) -> Result<(), PipelineError>
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = self.pool.read().unwrap_or_else(PoisonError::into_inner);
        self.ensure_ready()?;

        match slot.as_ref() {
            Some(pool) => {
                pool.spawn(job);
                Ok(())
            }
            None => Err(PipelineError::EngineNotReady(self.state())),
        }
    }

    pub fn decode(&self, buffer: &[u8]) -> Result<ImageHandle, PipelineError> {
        self.ensure_ready()?;
        let _entered = self.enter();

        let image = pipeline::decode(buffer, self.options.max_resolution)?;
        let handle = ImageHandle::new(image, Lease::acquire(&self.live_handles));
        debug!(
            dimensions = ?handle.dimensions(),
            colorspace = ?handle.colorspace(),
            bytes = buffer.len(),
            "Decoded image"
        );

        Ok(handle)
    }

    pub fn resize(
        &self,
        handle: ImageHandle,
        width: u32,
        height: u32,
    ) -> Result<ImageHandle, PipelineError> {
        self.ensure_ready()?;
        let _entered = self.enter();
        debug!(from = ?handle.dimensions(), width, height, "Resizing image");

        pipeline::resize(handle, width, height)
    }

    pub fn grayscale(&self, handle: ImageHandle) -> Result<ImageHandle, PipelineError> {
        self.ensure_ready()?;
        let _entered = self.enter();
        debug!("Converting image to grayscale");

        pipeline::grayscale(handle)
    }

    pub fn blur(&self, handle: ImageHandle, sigma: f32) -> Result<ImageHandle, PipelineError> {
        self.ensure_ready()?;
        let _entered = self.enter();
        debug!(sigma, "Blurring image");

        pipeline::blur(handle, sigma)
    }

    pub fn encode_jpeg(&self, handle: &ImageHandle) -> Result<EncodedBuffer, PipelineError> {
        self.ensure_ready()?;
        let _entered = self.enter();

        encoder::encode_jpeg(handle, self.options.jpeg_quality)
    }

    pub fn encode_webp(&self, handle: &ImageHandle) -> Result<EncodedBuffer, PipelineError> {
        self.ensure_ready()?;
        let _entered = self.enter();

        encoder::encode_webp(handle)
    }

    pub fn encode(
        &self,
        handle: &ImageHandle,
        format: OutputFormat,
    ) -> Result<EncodedBuffer, PipelineError> {
        match format {
            OutputFormat::Jpeg => self.encode_jpeg(handle),
            OutputFormat::Webp => self.encode_webp(handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Colorspace;
    use crate::test_support::{engine_options, gradient, jpeg_bytes, png_bytes, ready_engine, webp_bytes};
    use image::GenericImageView;
    use std::sync::mpsc;

    #[test]
    fn lifecycle_transitions() {
        let engine = Engine::new(engine_options());
        assert_eq!(engine.state(), EngineState::Uninitialized);

        engine.initialize(Span::none()).unwrap();
        assert_eq!(engine.state(), EngineState::Ready);

        engine.shutdown().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn initialize_and_shutdown_are_single_shot() {
        let engine = ready_engine();
        assert!(matches!(
            engine.initialize(Span::none()),
            Err(PipelineError::EngineInit(_))
        ));

        engine.shutdown().unwrap();
        assert!(matches!(
            engine.shutdown(),
            Err(PipelineError::EngineNotReady(EngineState::Stopped))
        ));
        assert!(matches!(
            engine.initialize(Span::none()),
            Err(PipelineError::EngineInit(_))
        ));
    }

    #[test]
    fn operations_require_ready_engine() {
        let engine = Engine::new(engine_options());

        // State is checked before parameters or handle contents.
        let errors = [
            engine.resize(ImageHandle::empty(), 500, 500).unwrap_err(),
            engine.grayscale(ImageHandle::empty()).unwrap_err(),
            engine.blur(ImageHandle::empty(), 0.0).unwrap_err(),
            engine.encode_jpeg(&ImageHandle::empty()).unwrap_err(),
            engine.decode(&[]).unwrap_err(),
        ];
        for err in errors {
            assert!(
                matches!(err, PipelineError::EngineNotReady(EngineState::Uninitialized)),
                "{err}"
            );
        }
        assert!(engine.spawn(|| {}).is_err());
    }

    #[test]
    fn operations_fail_after_shutdown() {
        let engine = ready_engine();
        let handle = engine.decode(&jpeg_bytes(&gradient(20, 20))).unwrap();
        engine.shutdown().unwrap();

        let err = engine.grayscale(handle).unwrap_err();
        assert!(matches!(err, PipelineError::EngineNotReady(EngineState::Stopped)));
        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn decode_errors() {
        let engine = ready_engine();
        assert!(matches!(engine.decode(&[]), Err(PipelineError::EmptyInput)));
        assert!(matches!(
            engine.decode(&[0u8; 5]),
            Err(PipelineError::UnrecognizedFormat)
        ));
    }

    #[test]
    fn decode_then_encode_keeps_dimensions() {
        let engine = ready_engine();
        let source = gradient(97, 61);

        for input in [jpeg_bytes(&source), png_bytes(&source), webp_bytes(&source)] {
            let handle = engine.decode(&input).unwrap();
            for format in [OutputFormat::Jpeg, OutputFormat::Webp] {
                let encoded = engine.encode(&handle, format).unwrap();
                let decoded = image::load_from_memory(encoded.as_bytes()).unwrap();
                assert_eq!(decoded.dimensions(), (97, 61), "{format}");
            }
        }
    }

    #[test]
    fn resize_1000x800_jpeg_to_square() {
        let engine = ready_engine();
        let handle = engine.decode(&jpeg_bytes(&gradient(1000, 800))).unwrap();
        let resized = engine.resize(handle, 500, 500).unwrap();
        let encoded = engine.encode_jpeg(&resized).unwrap();

        let decoded = image::load_from_memory(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.dimensions(), (500, 500));
    }

    #[test]
    fn grayscale_webp_has_one_effective_channel() {
        let engine = ready_engine();
        let handle = engine.decode(&jpeg_bytes(&gradient(64, 48))).unwrap();
        let gray = engine.grayscale(handle).unwrap();
        assert_eq!(gray.colorspace(), Some(Colorspace::Luma));

        let encoded = engine.encode_webp(&gray).unwrap();
        let decoded = image::load_from_memory(encoded.as_bytes()).unwrap().to_rgb8();
        assert!(decoded.pixels().all(|p| p[0] == p[1] && p[1] == p[2]));
    }

    #[test]
    fn encode_does_not_retire_its_input() {
        let engine = ready_engine();
        let handle = engine.decode(&jpeg_bytes(&gradient(120, 90))).unwrap();
        let blurred = engine.blur(handle, 5.0).unwrap();

        let first = engine.encode_jpeg(&blurred).unwrap();
        let second = engine.encode_jpeg(&blurred).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
        assert_eq!(engine.live_handles(), 1);

        blurred.retire();
        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn blur_rejects_non_positive_sigma() {
        let engine = ready_engine();
        let handle = engine.decode(&jpeg_bytes(&gradient(8, 8))).unwrap();
        assert!(matches!(
            engine.blur(handle, -2.0),
            Err(PipelineError::InvalidParameter(_))
        ));
        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn empty_handle_errors_never_panic() {
        let engine = ready_engine();
        let errors = [
            engine.resize(ImageHandle::empty(), 10, 10).unwrap_err(),
            engine.grayscale(ImageHandle::empty()).unwrap_err(),
            engine.blur(ImageHandle::empty(), 5.0).unwrap_err(),
            engine.encode_jpeg(&ImageHandle::empty()).unwrap_err(),
            engine.encode_webp(&ImageHandle::empty()).unwrap_err(),
        ];
        for err in errors {
            assert!(err.is_no_image_data(), "{err}");
        }
    }

    #[test]
    fn concurrent_pipelines_are_isolated() {
        let engine = ready_engine();
        let input = jpeg_bytes(&gradient(300, 200));

        std::thread::scope(|scope| {
            for i in 1..=8u32 {
                let engine = &engine;
                let input = &input;
                scope.spawn(move || {
                    let handle = engine.decode(input).unwrap();
                    let resized = engine.resize(handle, 10 * i, 7 * i).unwrap();
                    let encoded = engine.encode_webp(&resized).unwrap();
                    let decoded = image::load_from_memory(encoded.as_bytes()).unwrap();
                    assert_eq!(decoded.dimensions(), (10 * i, 7 * i));
                });
            }
        });

        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn spawn_runs_on_engine_pool() {
        let engine = ready_engine();
        let (tx, rx) = mpsc::channel();
        engine
            .spawn(move || {
                let name = std::thread::current().name().map(str::to_string);
                tx.send(name).unwrap();
            })
            .unwrap();

        let name = rx.recv().unwrap().unwrap();
        assert!(name.starts_with("picsum-engine-"));
    }
}
