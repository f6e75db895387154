//! Ordered phases with bounded per-resource concurrency
//!
//! Items of one phase run concurrently, at most `batch_size` at a time.
//! A failing item is recorded and dropped; the phase only fails when
//! every item does. The next phase never starts before the current one
//! has settled, and a checkpoint stops the run right after its phase.

use crate::{Error, Result, state::RunSummary};
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// A numbered step of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase {
    /// 1-based position in the workflow
    pub index: usize,
    /// Short name for logs and the summary
    pub name: &'static str,
}

impl Phase {
    /// Create a phase
    pub const fn new(index: usize, name: &'static str) -> Self {
        Self { index, name }
    }
}

/// Result of one phase
#[derive(Debug)]
pub struct PhaseOutcome<U> {
    /// Outputs of the items that succeeded, in input order
    pub completed: Vec<U>,
    /// Labels and errors of the items that were dropped
    pub failed: Vec<(String, Error)>,
}

/// Drives phases for one run
#[derive(Debug, Clone)]
pub struct PhaseRunner {
    batch_size: Option<usize>,
    checkpoint: Option<usize>,
    summary: Arc<RunSummary>,
}

impl PhaseRunner {
    /// Create a runner recording into `summary`
    pub fn new(summary: Arc<RunSummary>) -> Self {
        Self {
            batch_size: None,
            checkpoint: None,
            summary,
        }
    }

    /// Cap concurrent items per phase (default: all of them)
    pub fn with_batch_size(mut self, batch_size: Option<usize>) -> Self {
        self.batch_size = batch_size.filter(|n| *n > 0);
        self
    }

    /// Stop after the phase with this index
    pub fn with_checkpoint(mut self, checkpoint: Option<usize>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// The run's summary
    pub fn summary(&self) -> &Arc<RunSummary> {
        &self.summary
    }

    /// Run `work` for every item of `phase`
    ///
    /// Failed items are recorded in the summary and returned in
    /// [`PhaseOutcome::failed`] so the caller can clean up after them.
    pub async fn run<T, U, L, F, Fut>(
        &self,
        phase: Phase,
        items: Vec<T>,
        label: L,
        work: F,
    ) -> Result<PhaseOutcome<U>>
    where
        L: Fn(&T) -> String,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<U>>,
    {
        let total = items.len();
        info!("Phase {} ({}): {} item(s)", phase.index, phase.name, total);

        let limit = self.batch_size.unwrap_or(total).max(1);
        let mut results: Vec<(usize, String, Result<U>)> = stream::iter(items.into_iter().enumerate())
            .map(|(n, item)| {
                let label = label(&item);
                let fut = work(item);
                async move { (n, label, fut.await) }
            })
            .buffer_unordered(limit)
            .collect()
            .await;
        results.sort_by_key(|(n, _, _)| *n);

        let mut outcome = PhaseOutcome {
            completed: Vec::new(),
            failed: Vec::new(),
        };
        for (_, label, result) in results {
            match result {
                Ok(value) => outcome.completed.push(value),
                Err(e) => {
                    self.summary.fail(phase.name, &label, &e);
                    outcome.failed.push((label, e));
                }
            }
        }

        if total > 0 && outcome.completed.is_empty() {
            return Err(Error::PhaseFailed {
                index: phase.index,
                name: phase.name.to_string(),
                failures: outcome.failed.len(),
            });
        }
        self.check(phase)?;
        Ok(outcome)
    }

    /// Stop here if `phase` is the checkpoint
    pub fn check(&self, phase: Phase) -> Result<()> {
        if self.checkpoint == Some(phase.index) {
            info!("Checkpoint reached after phase {} ({})", phase.index, phase.name);
            return Err(Error::Checkpoint {
                index: phase.index,
                name: phase.name.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runner() -> PhaseRunner {
        PhaseRunner::new(Arc::new(RunSummary::new()))
    }

    #[smol_potat::test]
    async fn test_failed_items_are_dropped() {
        let runner = runner();
        let outcome = runner
            .run(
                Phase::new(1, "tag"),
                vec!["a", "b", "c"],
                |s| s.to_string(),
                |s| async move {
                    if s == "b" {
                        Err(Error::resource(s, "tag write failed"))
                    } else {
                        Ok(s.to_uppercase())
                    }
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.completed, vec!["A", "C"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "b");
        assert_eq!(runner.summary().failures().len(), 1);
    }

    #[smol_potat::test]
    async fn test_all_failed_is_fatal() {
        let err = runner()
            .run(
                Phase::new(2, "launch"),
                vec![1, 2],
                |n| n.to_string(),
                |n| async move { Err::<(), _>(Error::resource(n.to_string(), "boom")) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PhaseFailed { index: 2, failures: 2, .. }));
    }

    #[smol_potat::test]
    async fn test_checkpoint_stops_after_phase() {
        let runner = runner().with_checkpoint(Some(3));
        let ran = AtomicUsize::new(0);
        let ran = &ran;
        let err = runner
            .run(Phase::new(3, "wait"), vec![1, 2], |n| n.to_string(), move |_| async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert!(matches!(err, Error::Checkpoint { index: 3, .. }));
        assert!(runner.check(Phase::new(2, "earlier")).is_ok());
    }

    #[smol_potat::test]
    async fn test_batch_size_bounds_concurrency() {
        let runner = runner().with_batch_size(Some(2));
        let (active, peak) = (AtomicUsize::new(0), AtomicUsize::new(0));
        let (active, peak) = (&active, &peak);
        runner
            .run(Phase::new(1, "work"), (0..6).collect(), |n: &i32| n.to_string(), move |_| async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                smol::Timer::after(std::time::Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
