//! Background axis pipeline.
//!
//! A long-lived worker that takes [`AxisInput`]s from a bounded queue, fans
//! each one out to its axes, and publishes every [`AxisOutput`] to a
//! bounded output queue as soon as that axis settles.
//!
//! Shutdown drains instead of dropping: once [`BackgroundProcessor::shutdown`]
//! is called the input queue stops accepting work, every input already
//! queued is still evaluated, in-flight axes are awaited, and only then is
//! the output queue closed. Consumers therefore see a clean end-of-stream
//! (`recv()` returning `None`).

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use muse_types::{AxisInput, AxisOutput};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::axis::{SharedAxis, spawn_axis};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BackgroundConfig {
    /// Capacity of the input queue; producers block or are rejected beyond it.
    pub input_queue: usize,
    /// Capacity of the output queue.
    pub output_queue: usize,
    pub tick: Duration,
    /// Re-run the axes over the most recent input on every tick. A tick is
    /// skipped while an earlier run over that input is still in flight.
    pub rerun_on_tick: bool,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            input_queue: 10,
            output_queue: 100,
            tick: Duration::from_secs(5),
            rerun_on_tick: false,
        }
    }
}

/// Why an input was not accepted. The input is handed back.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("background input queue is full")]
    Full(AxisInput),
    #[error("background processor is shut down")]
    Closed(AxisInput),
}

// ─────────────────────────────────────────────────────────────────────────────
// BackgroundProcessor
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to a running background pipeline.
pub struct BackgroundProcessor {
    input: mpsc::Sender<AxisInput>,
    shutdown: CancellationToken,
    worker: JoinHandle<()>,
}

impl BackgroundProcessor {
    /// Start the worker; returns the handle and the output queue.
    pub fn start(
        axes: Vec<SharedAxis>,
        config: BackgroundConfig,
    ) -> (Self, mpsc::Receiver<AxisOutput>) {
        let (input, input_rx) = mpsc::channel(config.input_queue.max(1));
        let (output_tx, output_rx) = mpsc::channel(config.output_queue.max(1));
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run(axes, config, input_rx, output_tx, shutdown.clone()));
        info!("background axis processor started");
        (
            Self {
                input,
                shutdown,
                worker,
            },
            output_rx,
        )
    }

    /// Queue `input`, waiting while the queue is full.
    pub async fn submit(&self, input: AxisInput) -> Result<(), SubmitError> {
        self.input
            .send(input)
            .await
            .map_err(|e| SubmitError::Closed(e.0))
    }

    /// Queue `input` without waiting.
    pub fn try_submit(&self, input: AxisInput) -> Result<(), SubmitError> {
        self.input.try_send(input).map_err(|e| match e {
            mpsc::error::TrySendError::Full(i) => SubmitError::Full(i),
            mpsc::error::TrySendError::Closed(i) => SubmitError::Closed(i),
        })
    }

    /// Token that triggers the drain-then-close shutdown when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting input, finish all queued and in-flight work, close the
    /// output queue and wait for the worker to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        drop(self.input);
        if let Err(e) = self.worker.await {
            tracing::warn!(error = %e, "background worker ended abnormally");
        }
    }
}

/// An axis run tagged with the input generation it belongs to.
type Tagged = BoxFuture<'static, (u64, Option<AxisOutput>)>;

async fn run(
    axes: Vec<SharedAxis>,
    config: BackgroundConfig,
    mut input_rx: mpsc::Receiver<AxisInput>,
    output_tx: mpsc::Sender<AxisOutput>,
    shutdown: CancellationToken,
) {
    let mut in_flight: FuturesUnordered<Tagged> = FuturesUnordered::new();
    let mut last: Option<Arc<AxisInput>> = None;
    // Generation of `last` and how many of its axis runs are unsettled.
    let mut generation: u64 = 0;
    let mut running_for_last: usize = 0;
    let mut stopping = false;

    let mut ticker = tokio::time::interval(config.tick.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately.
    ticker.tick().await;

    let dispatch = |input: &Arc<AxisInput>, tag: u64, in_flight: &mut FuturesUnordered<Tagged>| {
        for axis in &axes {
            let (pending, _abort) = spawn_axis(Arc::clone(axis), Arc::clone(input));
            in_flight.push(pending.map(move |out| (tag, out)).boxed());
        }
        axes.len()
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled(), if !stopping => {
                debug!("background processor draining");
                stopping = true;
                input_rx.close();
            }
            received = input_rx.recv() => match received {
                Some(input) => {
                    let input = Arc::new(input);
                    generation += 1;
                    running_for_last = dispatch(&input, generation, &mut in_flight);
                    last = Some(input);
                }
                None => break,
            },
            Some((tag, settled)) = in_flight.next(), if !in_flight.is_empty() => {
                if tag == generation {
                    running_for_last = running_for_last.saturating_sub(1);
                }
                publish(&output_tx, settled).await;
            }
            _ = ticker.tick(), if config.rerun_on_tick && !stopping => {
                match &last {
                    Some(_) if running_for_last > 0 => {
                        debug!(running = running_for_last, "previous run still in flight; tick skipped");
                    }
                    Some(input) => {
                        running_for_last = dispatch(input, generation, &mut in_flight);
                    }
                    None => {}
                }
            }
        }
    }

    // No more input will arrive; let running axes finish.
    while let Some((_, settled)) = in_flight.next().await {
        publish(&output_tx, settled).await;
    }
    info!("background axis processor stopped");
}

async fn publish(output_tx: &mpsc::Sender<AxisOutput>, settled: Option<AxisOutput>) {
    let Some(output) = settled else { return };
    if output_tx.send(output).await.is_err() {
        debug!("background output dropped; no consumer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::tests::{Failing, Fixed};
    use crate::axis::{Axis, AxisError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn input(text: &str) -> AxisInput {
        AxisInput {
            user_text: text.into(),
            ..Default::default()
        }
    }

    /// Waits for a permit before finishing.
    struct Slow(Arc<Notify>);

    #[async_trait]
    impl Axis for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        async fn run(&self, i: &AxisInput) -> Result<AxisOutput, AxisError> {
            self.0.notified().await;
            Ok(AxisOutput::new("slow", 1, i.user_text.clone()))
        }
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Axis for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        async fn run(&self, _: &AxisInput) -> Result<AxisOutput, AxisError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(AxisOutput::new("counting", n as i64, "tick"))
        }
    }

    async fn collect_all(mut rx: mpsc::Receiver<AxisOutput>) -> Vec<AxisOutput> {
        let mut out = Vec::new();
        while let Some(o) = rx.recv().await {
            out.push(o);
        }
        out
    }

    #[tokio::test]
    async fn outputs_flow_and_stream_ends_on_shutdown() {
        let axes: Vec<SharedAxis> = vec![Arc::new(Fixed("a", 1)), Arc::new(Failing)];
        let (bp, rx) = BackgroundProcessor::start(axes, BackgroundConfig::default());
        bp.submit(input("one")).await.unwrap();
        bp.submit(input("two")).await.unwrap();
        bp.shutdown().await;

        let out = collect_all(rx).await;
        assert_eq!(out.len(), 4);
        assert_eq!(out.iter().filter(|o| o.axis == "failing").count(), 2);
        assert!(out.iter().filter(|o| o.axis == "failing").all(|o| o.score == 0));
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_axes() {
        let gate = Arc::new(Notify::new());
        let axes: Vec<SharedAxis> = vec![Arc::new(Slow(gate.clone()))];
        let (bp, rx) = BackgroundProcessor::start(axes, BackgroundConfig::default());
        bp.submit(input("pending work")).await.unwrap();

        let token = bp.shutdown_token();
        let stopping = tokio::spawn(bp.shutdown());
        token.cancelled().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stopping.is_finished());

        gate.notify_one();
        stopping.await.unwrap();
        let out = collect_all(rx).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].reason, "pending work");
    }

    #[tokio::test]
    async fn full_queue_rejects_try_submit() {
        let gate = Arc::new(Notify::new());
        let axes: Vec<SharedAxis> = vec![Arc::new(Slow(gate.clone()))];
        let config = BackgroundConfig {
            input_queue: 1,
            ..Default::default()
        };
        let (bp, _rx) = BackgroundProcessor::start(axes, config);

        // Without yielding, the worker has not taken anything off the queue.
        bp.try_submit(input("first")).unwrap();
        let err = bp.try_submit(input("second")).unwrap_err();
        match err {
            SubmitError::Full(back) => assert_eq!(back.user_text, "second"),
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_closed() {
        let axes: Vec<SharedAxis> = vec![Arc::new(Fixed("a", 1))];
        let (bp, _rx) = BackgroundProcessor::start(axes, BackgroundConfig::default());
        bp.shutdown_token().cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = bp.try_submit(input("late")).unwrap_err();
        assert!(matches!(err, SubmitError::Closed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn tick_reruns_last_input_when_enabled() {
        let count = Arc::new(AtomicUsize::new(0));
        let axes: Vec<SharedAxis> = vec![Arc::new(Counting(count.clone()))];
        let config = BackgroundConfig {
            tick: Duration::from_secs(5),
            rerun_on_tick: true,
            ..Default::default()
        };
        let (bp, mut rx) = BackgroundProcessor::start(axes, config);
        bp.submit(input("hello")).await.unwrap();
        assert!(rx.recv().await.is_some());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(count.load(Ordering::SeqCst) >= 3);
        bp.shutdown().await;
    }

    /// Counts starts, then waits for a permit.
    struct Gated {
        started: Arc<AtomicUsize>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl Axis for Gated {
        fn name(&self) -> &str {
            "gated"
        }
        async fn run(&self, _: &AxisInput) -> Result<AxisOutput, AxisError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(AxisOutput::new("gated", 1, "released"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tick_skips_while_previous_run_is_in_flight() {
        let started = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let axes: Vec<SharedAxis> = vec![Arc::new(Gated {
            started: started.clone(),
            gate: gate.clone(),
        })];
        let config = BackgroundConfig {
            tick: Duration::from_secs(5),
            rerun_on_tick: true,
            ..Default::default()
        };
        let (bp, mut rx) = BackgroundProcessor::start(axes, config);
        bp.submit(input("hello")).await.unwrap();

        // Six ticks pass while the first run is blocked.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        gate.notify_one();
        assert!(rx.recv().await.is_some());

        // Released: the next tick reruns, and that run blocks again.
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(started.load(Ordering::SeqCst), 2);

        gate.notify_one();
        bp.shutdown().await;
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn tick_does_nothing_by_default() {
        let count = Arc::new(AtomicUsize::new(0));
        let axes: Vec<SharedAxis> = vec![Arc::new(Counting(count.clone()))];
        let (bp, rx) = BackgroundProcessor::start(axes, BackgroundConfig::default());
        bp.submit(input("hello")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        bp.shutdown().await;
        assert_eq!(collect_all(rx).await.len(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
