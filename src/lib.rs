// Taskscan - Parallel Scheduled-Task Inventory
//
// Fans a per-host collection out over many targets with a bounded pool of
// execution contexts, a per-job timeout, and one result per target.

pub mod collect;
pub mod config;
pub mod engine;
pub mod output;

pub use collect::{HostInventory, ScheduledTask, ScheduledTaskCollector};
pub use config::{ScanConfig, ScanFile};
pub use engine::{run, Credential, Dispatcher, HostResult, LocalHostSet, Payload, Route};
pub use output::{OutputFormat, ScanError, ScanEvent};

/// Version of the taskscan tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ScanConfig;
    pub use crate::engine::{
        run, ConnectionMode, Credential, Dispatcher, HostResult, JobError, LocalHostSet, Payload,
        Route,
    };
    pub use crate::output::{EventEmitter, ScanError, ScanEvent};
}
