//! Recovery module
//!
//! - `coordinator`: Recovery coordinator (identity, erase and reservation
//!   passes, marker lookup)
//! - `replayer`: newest-first log replay (LogReplayer, ReplayStats)

pub mod coordinator;
pub mod replayer;

pub use coordinator::{
    scan_erase_history, spare_is_clean, MarkerState, RecoveryCoordinator, RecoveryPlan,
};
pub use replayer::{LogReplayer, ReplayStats, Replayed};
