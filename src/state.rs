use std::sync::Arc;

use crate::config::settings::AppConfig;
use crate::modules::jobs::repository::JobRepository;
use crate::modules::transcoding::coordinator::JobCoordinator;
use crate::modules::transcoding::lock::LockManager;
use crate::modules::transcoding::storage::StorageGateway;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub repo: Arc<dyn JobRepository>,
    pub storage: Arc<dyn StorageGateway>,
    pub locks: Arc<dyn LockManager>,
    pub coordinator: JobCoordinator,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        repo: Arc<dyn JobRepository>,
        storage: Arc<dyn StorageGateway>,
        locks: Arc<dyn LockManager>,
        coordinator: JobCoordinator,
    ) -> Self {
        Self {
            config,
            repo,
            storage,
            locks,
            coordinator,
        }
    }
}
