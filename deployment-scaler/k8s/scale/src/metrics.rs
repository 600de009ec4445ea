use deployment_scaler_core::Error;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct ScaleMetrics {
    requests: Family<OutcomeLabels, Counter>,
    duration: Histogram,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Ok,
    Invalid,
    NotFound,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    result: &'static str,
}

// === impl ScaleMetrics ===

impl ScaleMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::default();
        reg.register(
            "requests",
            "Count of scale requests by result",
            requests.clone(),
        );

        // Writes are bounded by a timeout of a few seconds.
        let duration = Self::mk_histogram();
        reg.register_with_unit(
            "duration",
            "Histogram of scale write latency (seconds)",
            Unit::Seconds,
            duration.clone(),
        );

        Self { requests, duration }
    }

    fn mk_histogram() -> Histogram {
        Histogram::new([0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0])
    }

    pub(crate) fn observe(&self, outcome: Outcome, elapsed: time::Duration) {
        let result = match outcome {
            Outcome::Ok => "ok",
            Outcome::Invalid => "invalid",
            Outcome::NotFound => "not_found",
            Outcome::Failed => "failed",
        };
        self.requests.get_or_create(&OutcomeLabels { result }).inc();
        self.duration.observe(elapsed.as_secs_f64());
    }
}

impl Default for ScaleMetrics {
    fn default() -> Self {
        Self {
            requests: Family::default(),
            duration: Self::mk_histogram(),
        }
    }
}

// === impl Outcome ===

impl Outcome {
    pub(crate) fn of<T>(res: &Result<T, Error>) -> Self {
        match res {
            Ok(_) => Self::Ok,
            Err(Error::InvalidInput(_)) => Self::Invalid,
            Err(Error::NotFound(_)) => Self::NotFound,
            Err(Error::WriteFailed { .. }) => Self::Failed,
        }
    }
}
