use std::path::PathBuf;

/// A broken invariant of the executor.
///
/// These are never turned into user-visible strings. The service halts on the
/// first one and every later call fails with [`IntegrityError::Halted`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("chat keys {existing:?} and {incoming:?} both map to workspace {}", path.display())]
    PathCollision {
        existing: String,
        incoming: String,
        path: PathBuf,
    },
    #[error("workspace {} escapes shared root {}", path.display(), root.display())]
    ContainmentViolation { path: PathBuf, root: PathBuf },
    #[error("concurrency slot {slot} released twice")]
    DoubleRelease { slot: u64 },
    #[error("concurrency slot {slot} was not issued by this controller")]
    ForeignSlot { slot: u64 },
    #[error("{held} slots held with a pool of {max}")]
    CapacityExceeded { held: usize, max: usize },
    #[error("illegal execution state transition {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("executor halted after integrity fault: {0}")]
    Halted(String),
}
