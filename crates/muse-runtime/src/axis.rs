//! Axis framework: independent evaluators over a shared input.
//!
//! An [`Axis`] scores one aspect of an [`AxisInput`]. [`run_immediate`]
//! fans one input out to every axis, each on its own task, and collects
//! whatever they produce. Axes never affect each other: an axis that
//! returns an error or panics is reported as a degraded output (score `0`,
//! reason describing the fault) and the rest of the batch is unaffected.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use muse_runtime::axis::{run_immediate, Axis, AxisError, SharedAxis};
//! use muse_types::{AxisInput, AxisOutput};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Length;
//!
//! #[async_trait]
//! impl Axis for Length {
//!     fn name(&self) -> &str { "length" }
//!     async fn run(&self, input: &AxisInput) -> Result<AxisOutput, AxisError> {
//!         Ok(AxisOutput::new("length", input.user_text.len() as i64, "characters"))
//!     }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let input = AxisInput { user_text: "hello".into(), ..Default::default() };
//! let axes: Vec<SharedAxis> = vec![Arc::new(Length)];
//! let outputs = run_immediate(input, &axes, CancellationToken::new()).await;
//! assert_eq!(outputs[0].score, 5);
//! # });
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use muse_types::{AxisInput, AxisOutput, MuseError};
use thiserror::Error;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors an axis may report instead of an output.
#[derive(Error, Debug)]
pub enum AxisError {
    #[error("{0}")]
    External(#[from] MuseError),
    #[error("Missing input: {0}")]
    MissingInput(&'static str),
    #[error("{0}")]
    Other(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Axis trait
// ─────────────────────────────────────────────────────────────────────────────

/// One independent scoring function.
#[async_trait]
pub trait Axis: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, input: &AxisInput) -> Result<AxisOutput, AxisError>;
}

pub type SharedAxis = Arc<dyn Axis>;

/// A spawned axis: resolves to its output, or `None` if it was aborted.
pub(crate) type Pending = BoxFuture<'static, Option<AxisOutput>>;

/// Spawn `axis` over `input` on its own task.
pub(crate) fn spawn_axis(axis: SharedAxis, input: Arc<AxisInput>) -> (Pending, AbortHandle) {
    let name = axis.name().to_string();
    let handle = tokio::spawn(async move { axis.run(&input).await });
    let abort = handle.abort_handle();
    let pending = async move {
        match handle.await {
            Ok(Ok(output)) => Some(output),
            Ok(Err(e)) => {
                warn!(axis = %name, error = %e, "axis failed");
                Some(AxisOutput::degraded(name, e))
            }
            Err(e) if e.is_panic() => {
                warn!(axis = %name, "axis panicked");
                Some(AxisOutput::degraded(name, "panicked"))
            }
            Err(_) => None,
        }
    }
    .boxed();
    (pending, abort)
}

// ─────────────────────────────────────────────────────────────────────────────
// Immediate mode
// ─────────────────────────────────────────────────────────────────────────────

/// Aborts the tasks it holds when dropped, so a caller that stops polling
/// does not leave axes running behind it.
pub(crate) struct AbortOnDrop(Vec<AbortHandle>);

impl AbortOnDrop {
    pub(crate) fn new() -> Self {
        Self(Vec::new())
    }

    pub(crate) fn push(&mut self, handle: AbortHandle) {
        self.0.push(handle);
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Run every axis over `input` concurrently and wait for all of them.
///
/// If `cancel` fires first, outputs that already finished are returned and
/// the unfinished axes are aborted. Dropping the returned future aborts
/// every axis still running. Output order is unspecified.
pub async fn run_immediate(
    input: AxisInput,
    axes: &[SharedAxis],
    cancel: CancellationToken,
) -> Vec<AxisOutput> {
    collect(input, axes, cancel.cancelled_owned()).await
}

/// [`run_immediate`] with a deadline instead of a cancellation token.
pub async fn run_immediate_with_timeout(
    input: AxisInput,
    axes: &[SharedAxis],
    timeout: Duration,
) -> Vec<AxisOutput> {
    collect(input, axes, tokio::time::sleep(timeout)).await
}

async fn collect(
    input: AxisInput,
    axes: &[SharedAxis],
    stop: impl Future<Output = ()>,
) -> Vec<AxisOutput> {
    let input = Arc::new(input);
    let mut pending = FuturesUnordered::new();
    let mut aborts = AbortOnDrop::new();
    for axis in axes {
        let (fut, abort) = spawn_axis(Arc::clone(axis), Arc::clone(&input));
        pending.push(fut);
        aborts.push(abort);
    }

    let mut outputs = Vec::with_capacity(axes.len());
    tokio::pin!(stop);
    loop {
        tokio::select! {
            biased;
            next = pending.next() => match next {
                Some(Some(output)) => outputs.push(output),
                Some(None) => {}
                None => return outputs,
            },
            _ = &mut stop => break,
        }
    }

    // Keep whatever settled by the time the stop signal was seen.
    while let Some(Some(next)) = pending.next().now_or_never() {
        outputs.extend(next);
    }
    drop(aborts);
    debug!(
        finished = outputs.len(),
        dropped = axes.len().saturating_sub(outputs.len()),
        "axis run stopped early"
    );
    outputs
}
