//! The admission scheduler: a tick-driven loop that polls the store for
//! pending queries, applies per-user and global concurrency caps with a
//! round-robin fairness rule, and spawns a [`crate::worker::QueryWorker`]
//! task for everything it admits.
//!
//! The admission algorithm itself ([`admit`]) is plain, synchronous logic
//! over in-memory maps so it can be unit tested without a database.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::Instrument;

use crate::config::{ExportConfig, SchedulerConfig};
use crate::export::Exporter;
use crate::flag::ShutdownFlag;
use crate::lifecycle::LifecycleRecorder;
use crate::models::{Query, RunningByUser};
use crate::store::Store;
use crate::transfer::TransferService;
use crate::worker::QueryWorker;

/// A candidate for admission: just enough of a [`Query`] to run the
/// fairness algorithm without cloning the whole row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub query_id: i64,
    pub user_id: i64,
}

/// Apply round-robin fair admission over `pending`, given how many slots
/// each user currently occupies (`running`) and the global/per-user caps.
///
/// Queries are grouped by owner preserving each owner's original (FIFO)
/// order, then admitted one-per-user-per-pass in owner order until either
/// the global cap is hit or every user's queue or cap is exhausted. This
/// keeps one prolific user from starving everyone else behind a long queue,
/// while never admitting a user past their own cap.
pub(crate) fn admit(
    pending: &[Candidate],
    running: &RunningByUser,
    global_max: usize,
    user_max: impl Fn(i64) -> usize,
    global_running: usize,
) -> Vec<Candidate> {
    let mut by_user: BTreeMap<i64, VecDeque<&Candidate>> = BTreeMap::new();
    for candidate in pending {
        by_user.entry(candidate.user_id).or_default().push_back(candidate);
    }

    let mut occupied: HashMap<i64, usize> = running.clone().into_iter().collect();
    let mut admitted = Vec::new();
    let mut global_count = global_running;

    loop {
        let mut admitted_this_pass = false;

        for (&user_id, queue) in by_user.iter_mut() {
            if global_count >= global_max {
                break;
            }

            let cap = user_max(user_id);
            let slots_used = occupied.get(&user_id).copied().unwrap_or(0);
            if slots_used >= cap {
                continue;
            }

            if let Some(candidate) = queue.pop_front() {
                admitted.push(candidate.clone());
                *occupied.entry(user_id).or_insert(0) += 1;
                global_count += 1;
                admitted_this_pass = true;
            }
        }

        if !admitted_this_pass || global_count >= global_max {
            break;
        }
    }

    admitted
}

pub struct AdmissionScheduler {
    config: SchedulerConfig,
    export: ExportConfig,
    store: Store,
    lifecycle: LifecycleRecorder,
    transfer: Arc<TransferService>,
    exporter: Arc<Exporter>,
    shutdown: ShutdownFlag,
    shutdown_deadline: Duration,

    active: HashMap<i64, i64>,
    active_by_user: RunningByUser,
    tasks: JoinSet<(i64, i64)>,
}

impl AdmissionScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        export: ExportConfig,
        store: Store,
        lifecycle: LifecycleRecorder,
        transfer: Arc<TransferService>,
        exporter: Arc<Exporter>,
        shutdown: ShutdownFlag,
        shutdown_deadline: Duration,
    ) -> Self {
        Self {
            config,
            export,
            store,
            lifecycle,
            transfer,
            exporter,
            shutdown,
            shutdown_deadline,
            active: HashMap::new(),
            active_by_user: RunningByUser::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Seed the in-memory ledger from whatever the store considers active.
    /// Only meaningful right after the startup reaper has run; during
    /// steady-state operation the ledger tracks admissions itself.
    pub async fn seed(&mut self) -> anyhow::Result<()> {
        self.active_by_user = self.store.running_counts_by_user().await?;
        Ok(())
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut shutdown = std::pin::pin!(self.shutdown.wait());
        let mut next = Instant::now();

        'outer: loop {
            tokio::select! {
                biased;

                _ = shutdown.as_mut() => break 'outer,
                finished = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.release(finished);
                    continue;
                }
                _ = tokio::time::sleep_until(next.into()) => (),
            }

            if let Err(error) = self.tick().await {
                tracing::error!(%error, "admission tick failed");
            }

            next = Instant::now() + self.config.check_interval();
        }

        tracing::info!("admission scheduler draining {} workers", self.tasks.len());
        let drained = tokio::time::timeout(self.shutdown_deadline, async {
            loop {
                let finished = self.tasks.join_next().await;
                if finished.is_none() {
                    break;
                }
                self.release(finished);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = self.tasks.len(),
                "shutdown deadline elapsed with workers still outstanding"
            );
        }

        Ok(())
    }

    /// Free up the admission slot a finished worker held. `finished` comes
    /// straight from [`JoinSet::join_next`]; a panicked worker still frees
    /// its slot, it just has no `(query_id, user_id)` to report so the
    /// ledger entry is left for the next full reconciliation to catch.
    fn release(&mut self, finished: Option<Result<(i64, i64), tokio::task::JoinError>>) {
        let Some(Ok((query_id, user_id))) = finished else {
            return;
        };

        self.active.remove(&query_id);
        if let Some(count) = self.active_by_user.get_mut(&user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.active_by_user.remove(&user_id);
            }
        }
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let pending = self.store.list_pending().await?;
        let candidates: Vec<Candidate> = pending
            .iter()
            .filter(|q| !self.active.contains_key(&q.id))
            .map(|q| Candidate {
                query_id: q.id,
                user_id: q.user_id,
            })
            .collect();

        if candidates.is_empty() {
            return Ok(());
        }

        let global_running = self.active.len();
        let default_user_max = self.config.default_user_max_parallel;

        // Per-user caps require settings lookups; cache them for this tick.
        let mut cap_cache: HashMap<i64, usize> = HashMap::new();
        for candidate in &candidates {
            if cap_cache.contains_key(&candidate.user_id) {
                continue;
            }
            let cap = match self.store.user_settings(candidate.user_id).await? {
                Some(settings) => settings.max_parallel(default_user_max),
                None => default_user_max,
            };
            cap_cache.insert(candidate.user_id, cap);
        }

        let admitted = admit(
            &candidates,
            &self.active_by_user,
            self.config.global_max_parallel,
            |user_id| cap_cache.get(&user_id).copied().unwrap_or(default_user_max),
            global_running,
        );

        let by_id: HashMap<i64, &Query> = pending.iter().map(|q| (q.id, q)).collect();

        for candidate in admitted {
            let Some(query) = by_id.get(&candidate.query_id) else {
                continue;
            };

            self.active.insert(candidate.query_id, candidate.user_id);
            *self.active_by_user.entry(candidate.user_id).or_insert(0) += 1;

            let default_export_type = self
                .export
                .default_export_type
                .parse()
                .unwrap_or(crate::models::ExportType::Csv);

            let worker = QueryWorker::new(
                (*query).clone(),
                self.store.clone(),
                self.lifecycle.clone(),
                self.transfer.clone(),
                self.exporter.clone(),
                std::path::PathBuf::from(&self.export.tmp_export_location),
                default_export_type,
                self.export.default_export_location.clone(),
            );

            let query_id = candidate.query_id;
            let user_id = candidate.user_id;
            let span = tracing::info_span!("query", query_id, user_id);
            self.tasks.spawn(
                async move {
                    if let Err(error) = worker.run().await {
                        tracing::error!(%error, "query worker failed");
                    }
                    (query_id, user_id)
                }
                .instrument(span),
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(query_id: i64, user_id: i64) -> Candidate {
        Candidate { query_id, user_id }
    }

    #[test]
    fn admits_up_to_global_cap() {
        let pending = vec![candidate(1, 1), candidate(2, 1), candidate(3, 1)];
        let running = RunningByUser::new();

        let admitted = admit(&pending, &running, 2, |_| 10, 0);

        assert_eq!(admitted.len(), 2);
        assert_eq!(admitted[0].query_id, 1);
        assert_eq!(admitted[1].query_id, 2);
    }

    #[test]
    fn respects_per_user_cap() {
        let pending = vec![candidate(1, 1), candidate(2, 1), candidate(3, 2)];
        let running = RunningByUser::new();

        let admitted = admit(&pending, &running, 10, |_| 1, 0);

        let ids: Vec<i64> = admitted.iter().map(|c| c.query_id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn round_robins_across_users_instead_of_starving() {
        let pending = vec![
            candidate(1, 1),
            candidate(2, 1),
            candidate(3, 1),
            candidate(4, 2),
        ];
        let running = RunningByUser::new();

        // User 1 has three queued queries and a cap big enough to run them
        // all; user 2 has just one. A naive FIFO-only admission would drain
        // user 1 first. Round-robin instead interleaves so user 2's single
        // query is not starved behind user 1's backlog.
        let admitted = admit(&pending, &running, 10, |_| 10, 0);

        let ids: Vec<i64> = admitted.iter().map(|c| c.query_id).collect();
        assert_eq!(ids, vec![1, 4, 2, 3]);
    }

    #[test]
    fn already_running_queries_count_against_the_cap() {
        let pending = vec![candidate(2, 1)];
        let mut running = RunningByUser::new();
        running.insert(1, 3);

        let admitted = admit(&pending, &running, 10, |_| 3, 3);

        assert!(admitted.is_empty());
    }
}
