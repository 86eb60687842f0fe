pub mod scheduler;
pub mod settings;
pub mod status;
pub mod worker;

use status::SyncStatusHandle;

#[derive(Debug, Clone)]
pub struct SyncService {
    status: SyncStatusHandle,
}

impl SyncService {
    pub fn new(status: SyncStatusHandle) -> Self {
        Self { status }
    }

    pub fn name(&self) -> &'static str {
        "sync"
    }

    pub async fn status(&self) -> &'static str {
        if self.status.is_running().await {
            "running"
        } else {
            "ready"
        }
    }
}
