//! Core engine for tagledger: record model, time resolution, diagnostics,
//! repair planning, CSV reconciliation and live polling.

pub mod audit;
pub mod commit;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod interchange;
pub mod poller;
pub mod reconcile;
pub mod record;
pub mod repair;
pub mod repository;
pub mod summary;
pub mod timeparse;
pub mod tracking;

pub use error::{ExitStatus, LedgerError};
pub use record::{Record, TimeWindow};
pub use repository::{RecordRepository, RepositoryError};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    /// Serializes tests that mutate process environment variables.
    pub fn lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::version;

    #[test]
    fn version_is_not_empty() {
        assert!(!version().is_empty());
    }
}
