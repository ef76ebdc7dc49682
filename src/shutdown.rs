//! Graceful shutdown
//!
//! `Running -> Draining -> Stopped`. On a signal or when the HTTP server task
//! exits, the coordinator stops the health checker, tells the server to stop
//! accepting connections, waits for in-flight work up to the drain deadline,
//! and finally shuts the engine down. Work still running at the deadline is
//! abandoned: the server task is aborted and its responses are never sent.

use crate::engine::Engine;
use crate::worker::WorkerPool;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Running = 0,
    Draining = 1,
    Stopped = 2,
}

/// What started the shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Signal,
    /// The server task ended by itself, with its error if any.
    ServerExited(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub trigger: Trigger,
    /// Whether every in-flight request finished before the deadline.
    pub drained: bool,
}

impl ShutdownReport {
    /// Shutdown was requested rather than forced by a server failure.
    pub fn is_clean(&self) -> bool {
        self.trigger == Trigger::Signal
    }
}

pub struct ShutdownCoordinator {
    server_token: CancellationToken,
    health_token: CancellationToken,
    drain_timeout: Duration,
    phase: AtomicU8,
}

impl ShutdownCoordinator {
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            server_token: CancellationToken::new(),
            health_token: CancellationToken::new(),
            drain_timeout,
            phase: AtomicU8::new(Phase::Running as u8),
        }
    }

    /// Fires when the server should stop accepting connections.
    pub fn server_token(&self) -> CancellationToken {
        self.server_token.clone()
    }

    /// Fires when the health checker should stop.
    pub fn health_token(&self) -> CancellationToken {
        self.health_token.clone()
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        match self.phase.load(Ordering::Acquire) {
            0 => Phase::Running,
            1 => Phase::Draining,
            _ => Phase::Stopped,
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Wait for a trigger, drain, then stop the engine.
    pub async fn run<S>(
        &self,
        mut server: JoinHandle<io::Result<()>>,
        signal: S,
        workers: &WorkerPool,
        engine: &Engine,
    ) -> ShutdownReport
    where
        S: Future<Output = ()>,
    {
        let trigger = tokio::select! {
            _ = signal => Trigger::Signal,
            result = &mut server => {
                let cause = match result {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(e) => Some(e.to_string()),
                };
                error!(cause = ?cause, "HTTP server stopped unexpectedly");
                Trigger::ServerExited(cause)
            }
        };

        self.set_phase(Phase::Draining);
        let deadline = Instant::now() + self.drain_timeout;
        info!(
            drain_timeout_secs = self.drain_timeout.as_secs_f64(),
            in_flight = workers.in_flight(),
            "Draining in-flight requests"
        );

        self.health_token.cancel();
        self.server_token.cancel();

        let server_drained = match trigger {
            Trigger::ServerExited(_) => true,
            Trigger::Signal => match tokio::time::timeout_at(deadline, &mut server).await {
                Ok(Ok(Err(e))) => {
                    warn!(error = %e, "HTTP server reported an error while draining");
                    true
                }
                Ok(_) => true,
                Err(_) => {
                    server.abort();
                    false
                }
            },
        };

        let workers_drained = tokio::time::timeout_at(deadline, workers.wait_idle())
            .await
            .is_ok();

        let drained = server_drained && workers_drained;
        if !drained {
            warn!(
                in_flight = workers.in_flight(),
                "Drain deadline elapsed, abandoning in-flight requests"
            );
        }

        if let Err(e) = engine.shutdown() {
            warn!(error = %e, "Engine shutdown failed");
        }

        self.set_phase(Phase::Stopped);
        info!(drained, "Shutdown complete");

        ShutdownReport { trigger, drained }
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::EngineState;
    use crate::test_support::ready_engine;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn workers(engine: &Arc<Engine>) -> WorkerPool {
        let config = Config {
            worker_count: 2,
            queue_size: 8,
            ..Config::default()
        };
        WorkerPool::new(engine.clone(), &config)
    }

    /// A server that stops `delay` after being asked to and then reports
    /// delivery of its last response.
    fn fake_server(
        token: CancellationToken,
        delay: Duration,
    ) -> (JoinHandle<io::Result<()>>, oneshot::Receiver<()>) {
        let (delivered_tx, delivered_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(delay).await;
            let _ = delivered_tx.send(());
            Ok(())
        });
        (handle, delivered_rx)
    }

    #[tokio::test]
    async fn signal_drains_and_stops_engine() {
        let engine = ready_engine();
        let pool = workers(&engine);
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let health = coordinator.health_token();
        assert_eq!(coordinator.phase(), Phase::Running);

        let (server, delivered) =
            fake_server(coordinator.server_token(), Duration::from_millis(20));
        let report = coordinator
            .run(server, std::future::ready(()), &pool, &engine)
            .await;

        assert_eq!(report.trigger, Trigger::Signal);
        assert!(report.drained);
        assert!(report.is_clean());
        assert!(delivered.await.is_ok());
        assert!(health.is_cancelled());
        assert_eq!(coordinator.phase(), Phase::Stopped);
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn requests_past_the_deadline_are_abandoned() {
        let engine = ready_engine();
        let pool = workers(&engine);
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(100));

        let (server, delivered) = fake_server(coordinator.server_token(), Duration::from_secs(30));

        let started = std::time::Instant::now();
        let report = coordinator
            .run(server, std::future::ready(()), &pool, &engine)
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!report.drained);
        // The aborted server never delivered its response.
        assert!(delivered.await.is_err());
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn server_failure_triggers_shutdown() {
        let engine = ready_engine();
        let pool = workers(&engine);
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));

        let server = tokio::spawn(async {
            Err(io::Error::new(io::ErrorKind::AddrInUse, "address in use"))
        });
        let report = coordinator
            .run(server, std::future::pending(), &pool, &engine)
            .await;

        assert_eq!(
            report.trigger,
            Trigger::ServerExited(Some("address in use".to_string()))
        );
        assert!(!report.is_clean());
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn engine_stops_after_in_flight_work_completes() {
        use crate::pipeline::TransformRequest;
        use crate::test_support::{gradient, jpeg_bytes};
        use bytes::Bytes;

        let engine = ready_engine();
        let pool = Arc::new(workers(&engine));
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(60));

        let request = {
            let pool = pool.clone();
            let input = Bytes::from(jpeg_bytes(&gradient(600, 400)));
            tokio::spawn(async move {
                let request = TransformRequest {
                    resize: Some((300, 300)),
                    ..TransformRequest::default()
                };
                pool.process(input, request, None).await
            })
        };
        tokio::task::yield_now().await;

        let (server, _delivered) = fake_server(coordinator.server_token(), Duration::ZERO);
        let report = coordinator
            .run(server, std::future::ready(()), &pool, &engine)
            .await;

        assert!(report.drained);
        assert_eq!(engine.live_handles(), 0);
        assert!(request.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn in_flight_request_past_deadline_is_abandoned_and_released() {
        use crate::pipeline::TransformRequest;
        use crate::test_support::{gradient, jpeg_bytes};
        use bytes::Bytes;

        let engine = ready_engine();
        let pool = Arc::new(workers(&engine));
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(100));

        // The server is busy with one slow request and only answers once it is done.
        let input = Bytes::from(jpeg_bytes(&gradient(2500, 2500)));
        let (delivered_tx, delivered_rx) = oneshot::channel();
        let server = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let request = TransformRequest {
                    grayscale: true,
                    blur: Some(10.0),
                    ..TransformRequest::default()
                };
                let result = pool.process(input, request, None).await;
                let _ = delivered_tx.send(result.is_ok());
                Ok(())
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(pool.in_flight(), 1);

        let report = coordinator
            .run(server, std::future::ready(()), &pool, &engine)
            .await;

        assert!(!report.drained);
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(delivered_rx.await.is_err());

        // The engine call that was running finishes and lets go of its handle.
        tokio::time::timeout(Duration::from_secs(120), pool.wait_idle())
            .await
            .expect("abandoned job never finished");
        assert_eq!(engine.live_handles(), 0);
    }
}
