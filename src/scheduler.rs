//! Manager/Scheduler: keeps a bounded pool of probe workers running,
//! enforcing the anti-hammer invariant that no two concurrently active
//! paths share a relay fingerprint, and stopping once the requested
//! number of circuits has been probed.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::error::FatalError;
use crate::node::{Fingerprint, Path};
use crate::sampler::PathSampler;
use crate::worker::{ProbeWorker, WorkerShared};

/// How many sampled-but-not-yet-admitted paths the scheduler keeps on
/// hand, relative to `max_parallel`, so admission never stalls waiting
/// on a fresh `FINDPATH` round-trip.
const WAITING_QUEUE_FACTOR: usize = 2;

struct State {
    in_use: HashSet<Fingerprint>,
    waiting: VecDeque<Path>,
    active: usize,
    launched: u64,
}

/// Admits sampled paths onto a bounded pool of concurrently running
/// [`ProbeWorker`]s.
pub struct Scheduler {
    sampler: PathSampler,
    worker_shared: Arc<WorkerShared>,
    max_parallel: usize,
    target_circuits: u64,
    /// Whether the anti-hammer invariant is enforced at all
    /// (`--network-protection`/`--no-network-protection`, `spec.md`
    /// §6). Disabling it is a deliberate operator override for test
    /// networks with too few relays to keep the waiting queue moving;
    /// it never affects correctness of an individual probe.
    network_protection: bool,
    state: Mutex<State>,
    notify: Notify,
}

impl Scheduler {
    pub fn new(
        sampler: PathSampler,
        worker_shared: Arc<WorkerShared>,
        max_parallel: usize,
        target_circuits: u64,
        network_protection: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            sampler,
            worker_shared,
            max_parallel,
            target_circuits,
            network_protection,
            state: Mutex::new(State {
                in_use: HashSet::new(),
                waiting: VecDeque::new(),
                active: 0,
                launched: 0,
            }),
            notify: Notify::new(),
        })
    }

    /// Run until `target_circuits` probes have completed.
    ///
    /// Guard rotation happens per sample inside
    /// [`crate::sampler::PathSampler::sample_path`], not here.
    pub async fn run(self: &Arc<Self>) -> Result<(), FatalError> {
        self.sampler.wait_until_ready().await?;

        let sampling = {
            let this = self.clone();
            tokio::spawn(async move { this.sampling_loop().await })
        };
        let admission = self.admission_loop().await;
        sampling.abort();
        admission
    }

    async fn sampling_loop(self: &Arc<Self>) {
        loop {
            let want_more = {
                let state = self.state.lock().await;
                state.waiting.len() < WAITING_QUEUE_FACTOR * self.max_parallel
                    && state.launched + state.active as u64 + state.waiting.len() as u64
                        < self.target_circuits
            };
            if !want_more {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                continue;
            }
            match self.sampler.sample_path().await {
                Ok(Some(path)) => {
                    let mut state = self.state.lock().await;
                    state.waiting.push_back(path);
                    drop(state);
                    self.notify.notify_waiters();
                }
                Ok(None) => {
                    tracing::warn!("path sampling exhausted its attempt budget, retrying");
                }
                Err(e) => {
                    tracing::error!(error = %e, "path sampling failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn admission_loop(self: &Arc<Self>) -> Result<(), FatalError> {
        loop {
            let admitted = self.try_admit_one().await;
            let done = {
                let state = self.state.lock().await;
                state.launched >= self.target_circuits && state.active == 0
            };
            if done {
                return Ok(());
            }
            if !admitted {
                self.notify.notified().await;
            }
        }
    }

    /// Pop the first waiting path whose fingerprints don't intersect
    /// the in-use set and spawn a worker for it. Returns whether a
    /// worker was admitted.
    async fn try_admit_one(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock().await;
        if state.active >= self.max_parallel || state.launched >= self.target_circuits {
            return false;
        }
        let pos = state
            .waiting
            .iter()
            .position(|path| !self.network_protection || !conflicts(path, &state.in_use));
        let Some(pos) = pos else {
            return false;
        };
        let path = state.waiting.remove(pos).unwrap();
        for fp in path.fingerprints() {
            state.in_use.insert(fp);
        }
        state.active += 1;
        state.launched += 1;
        drop(state);

        let this = self.clone();
        let worker_shared = self.worker_shared.clone();
        let fps = path.fingerprints();
        tokio::spawn(async move {
            let worker = ProbeWorker::new(worker_shared);
            if let Err(e) = worker.run(path).await {
                tracing::error!(error = %e, "probe worker ended fatally");
            }
            let mut state = this.state.lock().await;
            for fp in &fps {
                state.in_use.remove(fp);
            }
            state.active -= 1;
            drop(state);
            this.notify.notify_waiters();
        });
        true
    }
}

/// Whether `path`'s three fingerprints overlap the given in-use set —
/// the anti-hammer invariant this scheduler must never violate.
fn conflicts(path: &Path, in_use: &HashSet<Fingerprint>) -> bool {
    path.fingerprints().iter().any(|fp| in_use.contains(fp))
}
