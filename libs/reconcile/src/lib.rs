//! Reconciliation primitives.
//!
//! Helpers shared by the collector's reconciliation cycle, which converges
//! the persisted history toward the scheduler's current state. Key concepts:
//!
//! - **Cycle start**: the instant a reconciliation pass begins. Entities not
//!   seen in the pass are soft-deleted as of that instant.
//! - **Scope**: a unit of fetching (a partition, a queue). A failed scope does
//!   not stop the others; failures are aggregated.
//! - **Backoff**: retry delays grow exponentially up to a cap.
//!
//! # Invariants
//!
//! - Soft deletes never touch an entity present in the current pass
//! - Flattening a hierarchy visits every node exactly once
//! - Backoff delays are monotonic in the retry count and never exceed the cap

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use yhs_events::QueueInfo;

/// Default interval between full reconciliation passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default delay before the first retry of a failed job.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on any retry delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Retry count above which every further retry is logged at error level.
pub const RETRY_LOG_THRESHOLD: u32 = 20;

// =============================================================================
// Errors
// =============================================================================

/// A failure confined to one reconciliation scope.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// Fetching state for the scope failed.
    #[error("fetch {scope}: {message}")]
    Fetch { scope: String, message: String },

    /// The persistence job for the scope could not be queued.
    #[error("enqueue {scope}: {message}")]
    Enqueue { scope: String, message: String },
}

impl ReconcileError {
    pub fn fetch(scope: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::Fetch {
            scope: scope.into(),
            message: err.to_string(),
        }
    }

    pub fn enqueue(scope: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::Enqueue {
            scope: scope.into(),
            message: err.to_string(),
        }
    }

    /// The scope this error belongs to.
    pub fn scope(&self) -> &str {
        match self {
            Self::Fetch { scope, .. } | Self::Enqueue { scope, .. } => scope,
        }
    }
}

/// Every scope failure from one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiError {
    errors: Vec<ReconcileError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: ReconcileError) {
        self.errors.push(err);
    }

    pub fn extend(&mut self, other: MultiError) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[ReconcileError] {
        &self.errors
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} scope(s) failed", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

impl From<ReconcileError> for MultiError {
    fn from(err: ReconcileError) -> Self {
        Self { errors: vec![err] }
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Capped exponential backoff without jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_INITIAL_DELAY,
            max: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `retry` (1-based): `min(base * 2^(retry-1), max)`.
    ///
    /// Retry 0 means "first attempt" and has no delay.
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        2u32.checked_pow(retry - 1)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

// =============================================================================
// Hierarchies
// =============================================================================

/// A tree whose nodes can be copied out individually.
pub trait Hierarchy: Sized {
    fn children(&self) -> &[Self];

    /// This node without its children, inheriting scope from `parent`.
    fn detach(&self, parent: Option<&Self>) -> Self;
}

impl Hierarchy for QueueInfo {
    fn children(&self) -> &[Self] {
        &self.children
    }

    fn detach(&self, parent: Option<&Self>) -> Self {
        let mut queue = QueueInfo {
            children: Vec::new(),
            ..self.clone()
        };
        if let Some(parent) = parent {
            queue.partition = parent.partition.clone();
            queue.parent = Some(parent.queue_name.clone());
        }
        queue
    }
}

/// Flatten trees depth-first (pre-order), propagating scope from each root.
pub fn flatten<T: Hierarchy + Clone>(roots: &[T]) -> Vec<T> {
    fn visit<T: Hierarchy + Clone>(node: &T, parent: Option<&T>, out: &mut Vec<T>) {
        let detached = node.detach(parent);
        out.push(detached.clone());
        for child in node.children() {
            visit(child, Some(&detached), out);
        }
    }

    let mut out = Vec::new();
    for root in roots {
        visit(root, None, &mut out);
    }
    out
}

/// Current wall-clock time as Unix nanoseconds.
pub fn unix_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn queue(name: &str, children: Vec<QueueInfo>) -> QueueInfo {
        QueueInfo {
            queue_name: name.to_string(),
            children,
            ..Default::default()
        }
    }

    #[test]
    fn test_flatten_propagates_partition() {
        let grandchild = queue("root.child1.grandchild", vec![]);
        let mut root = queue("root", vec![queue("root.child1", vec![grandchild])]);
        root.partition = "default".to_string();

        let flat = flatten(&[root]);

        let names: Vec<_> = flat.iter().map(|q| q.queue_name.as_str()).collect();
        assert_eq!(names, ["root", "root.child1", "root.child1.grandchild"]);
        assert!(flat.iter().all(|q| q.partition == "default"));
        assert!(flat.iter().all(|q| q.children.is_empty()));
        assert_eq!(flat[2].parent.as_deref(), Some("root.child1"));
    }

    #[test]
    fn test_flatten_is_depth_first() {
        let root = queue(
            "root",
            vec![
                queue("root.a", vec![queue("root.a.x", vec![])]),
                queue("root.b", vec![]),
            ],
        );

        let names: Vec<_> = flatten(&[root])
            .into_iter()
            .map(|q| q.queue_name)
            .collect();
        assert_eq!(names, ["root", "root.a", "root.a.x", "root.b"]);
    }

    #[test]
    fn test_backoff_policy() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(300));

        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(9), Duration::from_secs(256));
        assert_eq!(policy.delay(10), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_max_does_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(64), DEFAULT_MAX_BACKOFF);
        assert_eq!(policy.delay(u32::MAX), DEFAULT_MAX_BACKOFF);
    }

    #[test]
    fn test_multi_error_display() {
        let mut errors = MultiError::new();
        assert!(errors.is_empty());

        errors.push(ReconcileError::fetch("partition/default", "connection refused"));
        errors.push(ReconcileError::enqueue("nodes/default", "queue full"));

        assert_eq!(errors.len(), 2);
        assert_eq!(errors.errors()[0].scope(), "partition/default");
        assert_eq!(
            errors.to_string(),
            "2 scope(s) failed: fetch partition/default: connection refused; enqueue nodes/default: queue full"
        );
    }

    fn arb_tree() -> impl Strategy<Value = QueueInfo> {
        let leaf = "[a-z]{1,6}".prop_map(|name| queue(&name, vec![]));
        leaf.prop_recursive(4, 32, 4, |inner| {
            ("[a-z]{1,6}", prop::collection::vec(inner, 0..4))
                .prop_map(|(name, children)| queue(&name, children))
        })
    }

    proptest! {
        #[test]
        fn prop_flatten_visits_every_node(mut root in arb_tree(), partition in "[a-z]{1,8}") {
            root.partition = partition.clone();
            let flat = flatten(std::slice::from_ref(&root));

            prop_assert_eq!(flat.len(), root.tree_size());
            prop_assert!(flat.iter().all(|q| q.partition == partition));
        }

        #[test]
        fn prop_backoff_is_monotonic(base_ms in 1u64..10_000, retry in 1u32..40) {
            let policy = BackoffPolicy::new(Duration::from_millis(base_ms), DEFAULT_MAX_BACKOFF);
            prop_assert!(policy.delay(retry) <= policy.delay(retry + 1));
            prop_assert!(policy.delay(retry + 1) <= DEFAULT_MAX_BACKOFF);
        }
    }
}
