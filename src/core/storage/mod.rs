pub mod models;
pub mod repository;

use repository::SourceRepository;

#[derive(Debug, Clone)]
pub struct StorageService {
    repository: SourceRepository,
}

impl StorageService {
    pub fn new(repository: SourceRepository) -> Self {
        Self { repository }
    }

    pub fn name(&self) -> &'static str {
        "storage"
    }

    pub async fn status(&self) -> &'static str {
        match self.repository.ping().await {
            Ok(()) => "ready",
            Err(error) => {
                tracing::warn!(%error, "storage health check failed");
                "error"
            }
        }
    }
}
