//! Runs builds and publishes their results.
//!
//! A single task owns the build loop. Changes to the object cache fire a
//! [`Trigger`]; triggers that arrive while a build runs collapse into one
//! stored permit, so a burst of changes causes at most one further build, and
//! that build lists the cache only when it starts.
//!
//! Each published graph is an immutable `Arc<Dag>` on a watch channel.
//! Readers clone the handle and never wait on a build.

use crate::{
    builder::{self, BuildConfig},
    cache::ObjectSource,
    metrics::BuildMetrics,
};
use ingress_controller_core::{Dag, ReportVerdict, Verdict};
use std::sync::Arc;
use tokio::{
    sync::{watch, Notify},
    time,
};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, instrument};

/// Signals that the object cache changed.
#[derive(Clone, Debug, Default)]
pub struct Trigger(Arc<Notify>);

/// A published graph and the build that produced it.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub generation: u64,
    pub dag: Arc<Dag>,
}

/// Observes published graphs.
#[derive(Clone, Debug)]
pub struct DagReader(watch::Receiver<Snapshot>);

pub struct Coordinator<S, R> {
    source: S,
    config: BuildConfig,
    trigger: Trigger,
    reporter: R,
    metrics: BuildMetrics,
    tx: watch::Sender<Snapshot>,
    generation: u64,
}

// === impl Trigger ===

impl Trigger {
    /// Requests a build. Requests made before the build loop wakes are merged.
    pub fn fire(&self) {
        self.0.notify_one();
    }

    /// Waits for the next request.
    pub async fn fired(&self) {
        self.0.notified().await
    }
}

// === impl DagReader ===

impl DagReader {
    /// Returns the latest published graph.
    pub fn get(&self) -> Arc<Dag> {
        self.0.borrow().dag.clone()
    }

    /// The generation of the latest published graph. Zero until the first
    /// build completes.
    pub fn generation(&self) -> u64 {
        self.0.borrow().generation
    }

    /// Waits until a graph newer than the last one seen by this reader is
    /// published.
    pub async fn changed(&mut self) -> Result<Arc<Dag>, watch::error::RecvError> {
        self.0.changed().await?;
        Ok(self.0.borrow_and_update().dag.clone())
    }

    /// Streams every published graph, starting with the current one.
    pub fn watch(&self) -> WatchStream<Snapshot> {
        WatchStream::new(self.0.clone())
    }
}

// === impl Coordinator ===

impl<S, R> Coordinator<S, R>
where
    S: ObjectSource,
    R: ReportVerdict,
{
    pub fn new(
        source: S,
        config: BuildConfig,
        trigger: Trigger,
        reporter: R,
        metrics: BuildMetrics,
    ) -> (Self, DagReader) {
        let (tx, rx) = watch::channel(Snapshot::default());
        let coordinator = Self {
            source,
            config,
            trigger,
            reporter,
            metrics,
            tx,
            generation: 0,
        };
        (coordinator, DagReader(rx))
    }

    /// Builds whenever the trigger fires. Completes when every reader has
    /// been dropped.
    pub async fn run(mut self) {
        loop {
            let fired = tokio::select! {
                biased;
                _ = self.tx.closed() => false,
                _ = self.trigger.fired() => true,
            };
            if !fired {
                debug!("All readers dropped");
                return;
            }
            self.rebuild();
        }
    }

    /// Lists the cache, builds, and publishes the result.
    ///
    /// When the cache cannot be listed the previous graph stays published.
    #[instrument(skip(self), fields(generation = self.generation + 1))]
    pub fn rebuild(&mut self) {
        let objects = match self.source.list_all() {
            Ok(objects) => objects,
            Err(error) => {
                info!(%error, "Skipping build");
                self.metrics.listing_failed();
                return;
            }
        };

        let start = time::Instant::now();
        let (dag, verdicts) = builder::build(&objects, &self.config);
        let elapsed = start.elapsed();

        self.generation += 1;
        let generation = self.generation;
        let invalid = verdicts
            .values()
            .filter(|v| matches!(v, Verdict::Invalid(_)))
            .count();
        self.metrics.built(elapsed, dag.route_count(), invalid);
        debug!(routes = dag.route_count(), invalid, ?elapsed, "Built graph");

        let dag = Arc::new(dag);
        self.tx.send_if_modified(|snapshot| {
            if snapshot.generation >= generation {
                return false;
            }
            *snapshot = Snapshot { generation, dag };
            true
        });

        self.reporter.report_all(&verdicts);
    }
}
