// ============================================================
// Layer 6 — Distributed Coordinator
// ============================================================
// Data-parallel training with W replicas, one thread each.
//
//   launch(W)
//     ├─ rank 0 ─┐ (leader: validation, checkpoints, metrics)
//     ├─ rank 1 ─┤
//     │   ...    ├─▶ Collective::all_reduce_sum  (once per step)
//     └─ rank W-1┘
//
// Every replica starts from the same serialised parameter blob,
// trains on its own shard and, once per optimizer step, sums its
// flattened gradient vector with everyone else's. All replicas get
// the identical sum back (accumulated in rank order), so they apply
// identical updates and stay identical.
//
// Failure handling: a replica that errors or panics aborts the
// collective. Replicas blocked in (or later entering) an all-reduce
// then fail with SyncError::Aborted instead of waiting forever, and
// launch() reports the error that caused the abort.
//
// Learning rate is scaled linearly with the world size.

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use thiserror::Error;

/// World sizes the launcher accepts: one device or a full 8-core host.
pub const SUPPORTED_WORLD_SIZES: [usize; 2] = [1, 8];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    #[error("collective aborted: {0}")]
    Aborted(String),

    #[error("rank {rank} waited {waited:?} for the other replicas")]
    Timeout { rank: usize, waited: Duration },

    #[error("rank {rank} contributed {got} values, rank 0 contributed {expected}")]
    LengthMismatch { rank: usize, expected: usize, got: usize },

    #[error("rank {rank} is outside a world of size {world_size}")]
    BadRank { rank: usize, world_size: usize },
}

/// Linear learning-rate scaling for data parallelism.
pub fn scaled_learning_rate(base: f64, world_size: usize) -> f64 {
    base * world_size as f64
}

// ─── Collective ───────────────────────────────────────────────────────────────
/// The one synchronisation point between replicas.
pub trait Collective: Send + Sync {
    /// Element-wise sum of every rank's `values`; blocks until all
    /// ranks have contributed. Every rank receives the same vector.
    fn all_reduce_sum(&self, rank: usize, values: Vec<f32>) -> Result<Vec<f32>, SyncError>;

    /// Fail every pending and future reduction.
    fn abort(&self, rank: usize, reason: &str);
}

struct Round {
    generation: u64,
    slots:      Vec<Option<Vec<f32>>>,
    result:     Arc<Vec<f32>>,
    aborted:    Option<String>,
}

/// Mutex + Condvar all-reduce between threads of one process.
pub struct InProcessCollective {
    world_size: usize,
    timeout:    Duration,
    round:      Mutex<Round>,
    ready:      Condvar,
}

impl InProcessCollective {
    pub fn new(world_size: usize, timeout: Duration) -> Self {
        Self {
            world_size,
            timeout,
            round: Mutex::new(Round {
                generation: 0,
                slots:      vec![None; world_size],
                result:     Arc::new(Vec::new()),
                aborted:    None,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Round> {
        // A panicking replica poisons the lock; the state is still
        // consistent because every mutation completes before unlock.
        self.round.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last rank in: sum the slots in rank order and publish.
    fn complete(&self, round: &mut Round) -> Result<(), SyncError> {
        let expected = round.slots[0].as_ref().map_or(0, Vec::len);
        let mut sum  = vec![0.0f32; expected];

        for (rank, slot) in round.slots.iter_mut().enumerate() {
            let values = slot.take().unwrap_or_default();
            if values.len() != expected {
                return Err(SyncError::LengthMismatch { rank, expected, got: values.len() });
            }
            for (acc, v) in sum.iter_mut().zip(values) {
                *acc += v;
            }
        }

        round.result      = Arc::new(sum);
        round.generation += 1;
        Ok(())
    }
}

impl Collective for InProcessCollective {
    fn all_reduce_sum(&self, rank: usize, values: Vec<f32>) -> Result<Vec<f32>, SyncError> {
        if rank >= self.world_size {
            return Err(SyncError::BadRank { rank, world_size: self.world_size });
        }

        let mut round = self.lock();
        if let Some(reason) = &round.aborted {
            return Err(SyncError::Aborted(reason.clone()));
        }

        round.slots[rank] = Some(values);
        let generation    = round.generation;

        if round.slots.iter().all(Option::is_some) {
            if let Err(e) = self.complete(&mut round) {
                round.aborted = Some(e.to_string());
                self.ready.notify_all();
                return Err(e);
            }
            self.ready.notify_all();
            return Ok(round.result.as_ref().clone());
        }

        let started = Instant::now();
        loop {
            let remaining = self.timeout.saturating_sub(started.elapsed());
            let (guard, _) = self
                .ready
                .wait_timeout(round, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            round = guard;

            if round.generation != generation {
                return Ok(round.result.as_ref().clone());
            }
            if let Some(reason) = &round.aborted {
                return Err(SyncError::Aborted(reason.clone()));
            }
            if started.elapsed() >= self.timeout {
                let err = SyncError::Timeout { rank, waited: started.elapsed() };
                round.aborted = Some(err.to_string());
                self.ready.notify_all();
                return Err(err);
            }
        }
    }

    fn abort(&self, rank: usize, reason: &str) {
        let mut round = self.lock();
        if round.aborted.is_none() {
            round.aborted = Some(format!("rank {rank}: {reason}"));
        }
        self.ready.notify_all();
    }
}

// ─── Replica context ──────────────────────────────────────────────────────────
/// Where a replica sits in the job.
#[derive(Clone)]
pub struct ReplicaContext {
    pub rank:       usize,
    pub world_size: usize,
    /// None for single-replica runs
    pub collective: Option<Arc<dyn Collective>>,
}

impl ReplicaContext {
    pub fn single() -> Self {
        Self { rank: 0, world_size: 1, collective: None }
    }

    pub fn is_leader(&self) -> bool {
        self.rank == 0
    }
}

/// Aborts the collective unless disarmed, so a panicking replica
/// releases the others while it unwinds.
struct AbortGuard<'a> {
    collective: &'a dyn Collective,
    rank:       usize,
    armed:      bool,
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.collective.abort(self.rank, "replica panicked");
        }
    }
}

// ─── launch ───────────────────────────────────────────────────────────────────
/// Run `replica` on `world_size` threads and collect the per-rank
/// results in rank order. With one replica it runs on the calling
/// thread without a collective.
pub fn launch<T, F>(world_size: usize, timeout: Duration, replica: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(ReplicaContext) -> Result<T> + Sync,
{
    if world_size == 0 {
        return Err(anyhow!("world size must be at least 1"));
    }
    if world_size == 1 {
        return Ok(vec![replica(ReplicaContext::single())?]);
    }

    let collective: Arc<dyn Collective> = Arc::new(InProcessCollective::new(world_size, timeout));
    tracing::info!("Launching {} replicas", world_size);

    let outcomes: Vec<Result<T>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let replica    = &replica;
                let collective = Arc::clone(&collective);
                thread::Builder::new()
                    .name(format!("replica-{rank}"))
                    .spawn_scoped(scope, move || {
                        let mut guard = AbortGuard { collective: collective.as_ref(), rank, armed: true };
                        let ctx = ReplicaContext {
                            rank,
                            world_size,
                            collective: Some(Arc::clone(&collective)),
                        };
                        let outcome = replica(ctx);
                        if let Err(e) = &outcome {
                            tracing::error!("Replica {} failed: {:#}", rank, e);
                            collective.abort(rank, &format!("{e:#}"));
                        }
                        guard.armed = false;
                        outcome
                    })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| match handle {
                Ok(h) => h.join().unwrap_or_else(|_| Err(anyhow!("replica {rank} panicked"))),
                Err(e) => {
                    collective.abort(rank, "thread spawn failed");
                    Err(anyhow!("cannot spawn replica {rank}: {e}"))
                }
            })
            .collect()
    });

    first_cause(outcomes)
}

/// All Ok → values in rank order. Otherwise the first error that is
/// not merely a consequence of another replica's abort.
fn first_cause<T>(outcomes: Vec<Result<T>>) -> Result<Vec<T>> {
    let mut values = Vec::with_capacity(outcomes.len());
    let mut errors = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(v)  => values.push(v),
            Err(e) => errors.push(e),
        }
    }

    if errors.is_empty() {
        return Ok(values);
    }

    let is_echo = |e: &anyhow::Error| {
        matches!(e.downcast_ref::<SyncError>(), Some(SyncError::Aborted(_)))
    };
    let pos = errors.iter().position(|e| !is_echo(e)).unwrap_or(0);
    Err(errors.swap_remove(pos))
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(10);

    #[test]
    fn test_scaled_learning_rate() {
        assert_eq!(scaled_learning_rate(3e-4, 1), 3e-4);
        assert!((scaled_learning_rate(3e-4, 8) - 2.4e-3).abs() < 1e-12);
    }

    #[test]
    fn test_all_reduce_sums_in_every_rank() {
        let results = launch(4, LONG, |ctx| {
            let c     = ctx.collective.expect("multi-replica run has a collective");
            let mine  = vec![ctx.rank as f32, 1.0];
            let first = c.all_reduce_sum(ctx.rank, mine)?;
            // A second round reuses the same collective
            let second = c.all_reduce_sum(ctx.rank, vec![2.0, 0.5])?;
            Ok((first, second))
        })
        .unwrap();

        assert_eq!(results.len(), 4);
        for (first, second) in results {
            assert_eq!(first, vec![6.0, 4.0]);
            assert_eq!(second, vec![8.0, 2.0]);
        }
    }

    #[test]
    fn test_single_replica_runs_inline() {
        let out = launch(1, LONG, |ctx| {
            assert!(ctx.is_leader());
            assert!(ctx.collective.is_none());
            Ok(ctx.world_size)
        })
        .unwrap();
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn test_failing_replica_releases_the_others() {
        let err = launch(3, LONG, |ctx| {
            if ctx.rank == 1 {
                return Err(anyhow!("disk full"));
            }
            let c = ctx.collective.expect("collective");
            c.all_reduce_sum(ctx.rank, vec![1.0])?;
            Ok(())
        })
        .unwrap_err();

        // The root cause wins over the echoed SyncErrors
        assert!(err.to_string().contains("disk full"), "{err:#}");
    }

    #[test]
    fn test_panicking_replica_releases_the_others() {
        let err = launch(2, LONG, |ctx| {
            if ctx.rank == 0 {
                panic!("boom");
            }
            let c = ctx.collective.expect("collective");
            c.all_reduce_sum(ctx.rank, vec![1.0])?;
            Ok(())
        })
        .unwrap_err();
        assert!(err.to_string().contains("panicked"), "{err:#}");
    }

    #[test]
    fn test_length_mismatch_is_an_error() {
        let err = launch(2, LONG, |ctx| {
            let c = ctx.collective.expect("collective");
            c.all_reduce_sum(ctx.rank, vec![0.0; ctx.rank + 1])?;
            Ok(())
        })
        .unwrap_err();
        let sync = err.downcast_ref::<SyncError>().expect("a SyncError");
        assert!(matches!(sync, SyncError::LengthMismatch { .. } | SyncError::Aborted(_)));
    }

    #[test]
    fn test_timeout_when_a_rank_never_arrives() {
        let c = InProcessCollective::new(2, Duration::from_millis(50));
        let err = c.all_reduce_sum(0, vec![1.0]).unwrap_err();
        assert!(matches!(err, SyncError::Timeout { rank: 0, .. }));
        // The collective stays poisoned afterwards
        assert!(matches!(c.all_reduce_sum(1, vec![1.0]), Err(SyncError::Aborted(_))));
    }

    #[test]
    fn test_bad_rank() {
        let c = InProcessCollective::new(2, LONG);
        assert_eq!(
            c.all_reduce_sum(5, vec![]),
            Err(SyncError::BadRank { rank: 5, world_size: 2 })
        );
    }
}
