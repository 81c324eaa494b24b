// Engine module - bounded, timeout-aware fan-out over hosts

use async_trait::async_trait;

pub mod aggregate;
pub mod classify;
pub mod credential;
pub mod dispatcher;
pub mod job;
pub mod pool;

pub use aggregate::{HostResult, ResultAggregator, ResultStatus, ScanRecap};
pub use classify::{classify, ConnectionMode, LocalHostSet};
pub use credential::Credential;
pub use dispatcher::{run, Dispatcher, RunState};
pub use job::{Job, JobError, JobHandle, JobId, JobState};
pub use pool::{ContextLease, ExecutionContext, ExecutionPool, JobTimer, JobTimers, SharedState};

/// How a payload should reach its target
#[derive(Debug, Clone)]
pub struct Route {
    pub mode: ConnectionMode,
    /// Present only for remote routes
    pub credential: Option<Credential>,
}

impl Route {
    pub fn local() -> Self {
        Route {
            mode: ConnectionMode::Local,
            credential: None,
        }
    }

    pub fn remote(credential: Option<Credential>) -> Self {
        Route {
            mode: ConnectionMode::Remote,
            credential,
        }
    }
}

/// The per-host operation the engine fans out
///
/// The engine never looks inside the output or the error; it only wraps them
/// in a [`HostResult`].
#[async_trait]
pub trait Payload: Send + Sync + 'static {
    type Output: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn collect(&self, target: &str, route: &Route) -> Result<Self::Output, Self::Error>;
}
