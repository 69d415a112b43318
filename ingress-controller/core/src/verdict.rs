use crate::ObjectRef;
use parking_lot::RwLock;
use std::{collections::BTreeMap, fmt, sync::Arc};

/// The outcome of a build for a single source object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid(String),

    /// An `HTTPProxy` that no root includes. It is not served, but it is not in
    /// error either.
    Orphaned,
}

/// Verdicts for every source object in a build, in a stable order.
pub type Verdicts = BTreeMap<ObjectRef, Verdict>;

/// Receives the verdicts of each build.
pub trait ReportVerdict {
    fn report_verdict(&mut self, object: &ObjectRef, verdict: &Verdict);

    /// Reports a complete set of verdicts.
    ///
    /// Objects absent from `verdicts` no longer exist.
    fn report_all(&mut self, verdicts: &Verdicts) {
        for (object, verdict) in verdicts {
            self.report_verdict(object, verdict);
        }
    }
}

// === impl Verdict ===

impl Verdict {
    pub const ORPHANED_DESCRIPTION: &'static str =
        "this HTTPProxy is not part of a delegation chain from a root HTTPProxy";

    pub fn invalid(reason: impl ToString) -> Self {
        Self::Invalid(reason.to_string())
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid(_) => "invalid",
            Self::Orphaned => "orphaned",
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Self::Valid => "valid HTTPProxy",
            Self::Invalid(reason) => reason,
            Self::Orphaned => Self::ORPHANED_DESCRIPTION,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Valid => f.write_str("valid"),
            Self::Invalid(reason) => write!(f, "invalid: {reason}"),
            Self::Orphaned => f.write_str("orphaned"),
        }
    }
}

// === impl ReportVerdict ===

/// Verdicts are discarded when there is no reporter.
impl<T: ReportVerdict> ReportVerdict for Option<T> {
    fn report_verdict(&mut self, object: &ObjectRef, verdict: &Verdict) {
        if let Some(reporter) = self {
            reporter.report_verdict(object, verdict)
        }
    }

    fn report_all(&mut self, verdicts: &Verdicts) {
        if let Some(reporter) = self {
            reporter.report_all(verdicts)
        }
    }
}

impl<T: ReportVerdict> ReportVerdict for Arc<RwLock<T>> {
    fn report_verdict(&mut self, object: &ObjectRef, verdict: &Verdict) {
        self.write().report_verdict(object, verdict)
    }

    fn report_all(&mut self, verdicts: &Verdicts) {
        self.write().report_all(verdicts)
    }
}
