//! Application state.

use std::sync::Arc;

use vrelay_scheduler::{DependencyBuilder, LeaseManager, SchedulerConfig};
use vrelay_store::AgentRepository;

use crate::config::ApiConfig;
use crate::gateway::RunnerGateway;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub scheduler: Arc<SchedulerConfig>,
    pub agents: Arc<dyn AgentRepository>,
    pub leases: Arc<LeaseManager>,
    pub builder: Arc<DependencyBuilder>,
    pub gateway: Arc<RunnerGateway>,
}
