//! Runtime layer: settings, persistence, the run loop, traces, and the
//! background scheduler.

pub mod runner;
pub mod scheduler;
pub mod settings;
pub mod store;
#[cfg(feature = "sqlite")]
pub mod store_sqlite;
pub mod trace;

pub use runner::{AuthoringCatalog, ControlAction, ControlOutcome, FlowchartRunner, RunnerError};
pub use scheduler::{IndexJobLauncher, Scheduler, SchedulerConfig};
pub use settings::{RuntimeSettings, SettingCipher, SettingsError};
pub use store::{InMemoryRunStore, ReplayOutcome, RunStore, StoreError};
#[cfg(feature = "sqlite")]
pub use store_sqlite::SqliteRunStore;
pub use trace::{TraceQuery, run_status, run_trace};
