use std::sync::Arc;

use crate::config::AppConfig;
use crate::directory::DirectoryService;
use crate::notify::Notifier;
use crate::shared::utils::DbPool;

pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    pub directory: Arc<dyn DirectoryService>,
    pub notifier: Arc<dyn Notifier>,
}

impl AppState {
    pub fn new(
        conn: DbPool,
        config: AppConfig,
        directory: Arc<dyn DirectoryService>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            conn,
            config,
            directory,
            notifier,
        }
    }
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            config: self.config.clone(),
            directory: Arc::clone(&self.directory),
            notifier: Arc::clone(&self.notifier),
        }
    }
}
