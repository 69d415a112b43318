use prometheus_client::{
    metrics::{counter::Counter, histogram::Histogram},
    registry::{Registry, Unit},
};

#[derive(Clone, Debug)]
pub struct IndexMetrics {
    pub(crate) patches_enqueued: Counter,
    pub(crate) patches_channel_full: Counter,
}

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    pub(crate) patches_sent: Counter,
    pub(crate) patches_failed: Counter,
    pub(crate) patches_timeout: Counter,
    pub(crate) patches_dropped: Counter,
    pub(crate) patch_duration: Histogram,
}

// === impl IndexMetrics ===

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patches_enqueued = Counter::default();
        prom.register(
            "patches_enqueued",
            "Number of status patches queued for the controller",
            patches_enqueued.clone(),
        );

        let patches_channel_full = Counter::default();
        prom.register(
            "patches_channel_full",
            "Number of status patches not queued because the channel was full",
            patches_channel_full.clone(),
        );

        Self {
            patches_enqueued,
            patches_channel_full,
        }
    }
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patches_sent = Counter::default();
        prom.register(
            "patches_sent",
            "Number of status patches applied",
            patches_sent.clone(),
        );

        let patches_failed = Counter::default();
        prom.register(
            "patches_failed",
            "Number of status patches rejected by the API server",
            patches_failed.clone(),
        );

        let patches_timeout = Counter::default();
        prom.register(
            "patches_timeout",
            "Number of status patches that timed out",
            patches_timeout.clone(),
        );

        let patches_dropped = Counter::default();
        prom.register(
            "patches_dropped",
            "Number of status patches dropped because the lease is not held",
            patches_dropped.clone(),
        );

        let patch_duration =
            Histogram::new([0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0].into_iter());
        prom.register_with_unit(
            "patch_duration",
            "Time taken to apply a status patch",
            Unit::Seconds,
            patch_duration.clone(),
        );

        Self {
            patches_sent,
            patches_failed,
            patches_timeout,
            patches_dropped,
            patch_duration,
        }
    }
}
