pub mod content;
pub mod error;
pub mod feed;
pub mod importer;
pub mod llm;
pub mod normalize;
pub mod storage;
pub mod sync;
pub mod translation;

use std::collections::BTreeMap;
use std::time::Duration;

use content::extractor::{ContentExtractor, FeedContentExtractor, LivePageExtractor};
use content::pipeline::ContentPipeline;
use feed::fetcher::FetchClient;
use feed::FeedService;
use importer::Importer;
use llm::client::LlmClient;
use llm::LlmService;
use storage::repository::SourceRepository;
use storage::StorageService;
use sync::scheduler::SyncScheduler;
use sync::worker::SourceSyncWorker;
use sync::SyncService;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use translation::TitleTranslationPoller;

/// Knobs for the services that are not stored in the database.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub translate_interval: Duration,
    pub translate_batch: i64,
    pub translate_language: String,
    pub article_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            translate_interval: Duration::from_secs(900),
            translate_batch: 10,
            translate_language: "Chinese".to_string(),
            article_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Clone)]
pub struct AppServices {
    repository: SourceRepository,
    importer: Importer,
    scheduler: SyncScheduler,
    pipeline: ContentPipeline,
    translator: TitleTranslationPoller,
    feed: FeedService,
    llm: LlmService,
    storage: StorageService,
    sync: SyncService,
}

impl AppServices {
    pub fn new(repository: SourceRepository, options: ServiceOptions) -> Result<Self, reqwest::Error> {
        let fetch_client = FetchClient::new()?;
        let worker = SourceSyncWorker::new(repository.clone(), fetch_client);
        let scheduler = SyncScheduler::new(worker);

        let article_client = reqwest::Client::builder()
            .user_agent(concat!("rssr/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let extractors: Vec<Box<dyn ContentExtractor>> = vec![
            Box::new(LivePageExtractor::new(article_client, options.article_timeout)),
            Box::new(FeedContentExtractor),
        ];
        let pipeline = ContentPipeline::new(
            repository.clone(),
            LlmClient::new()?,
            extractors,
            options.translate_language.clone(),
        );
        let translator = TitleTranslationPoller::new(
            repository.clone(),
            pipeline.clone(),
            options.translate_interval,
            options.translate_batch,
            options.translate_language,
        );

        Ok(Self {
            importer: Importer::new(repository.clone()),
            sync: SyncService::new(scheduler.status().clone()),
            llm: LlmService::new(repository.clone()),
            storage: StorageService::new(repository.clone()),
            feed: FeedService,
            repository,
            scheduler,
            pipeline,
            translator,
        })
    }

    pub fn repository(&self) -> &SourceRepository {
        &self.repository
    }

    pub fn importer(&self) -> &Importer {
        &self.importer
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub fn pipeline(&self) -> &ContentPipeline {
        &self.pipeline
    }

    pub fn translator(&self) -> &TitleTranslationPoller {
        &self.translator
    }

    /// Starts the timer-driven sync and the title translation poller.
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let scheduler = self.scheduler.clone();
        let sync_cancel = cancel.clone();
        let translator = self.translator.clone();
        let translate_cancel = cancel.clone();
        vec![
            tokio::spawn(async move { scheduler.run_periodic(sync_cancel).await }),
            tokio::spawn(async move { translator.run(translate_cancel).await }),
        ]
    }

    pub async fn health_report(&self) -> BTreeMap<String, String> {
        let mut report = BTreeMap::new();
        report.insert(self.feed.name().to_string(), self.feed.status().to_string());
        report.insert(
            self.importer.name().to_string(),
            self.importer.status().to_string(),
        );
        report.insert(
            self.llm.name().to_string(),
            self.llm.status().await.to_string(),
        );
        report.insert(
            self.storage.name().to_string(),
            self.storage.status().await.to_string(),
        );
        report.insert(
            self.sync.name().to_string(),
            self.sync.status().await.to_string(),
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_report_lists_every_component() {
        let repository = SourceRepository::connect("sqlite::memory:")
            .await
            .expect("connect");
        let services = AppServices::new(repository, ServiceOptions::default()).expect("services");
        let report = services.health_report().await;

        assert_eq!(
            report.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["feed", "importer", "llm", "storage", "sync"]
        );
        assert_eq!(report["storage"], "ready");
        assert_eq!(report["sync"], "ready");
    }

    #[test]
    fn title_poller_runs_less_often_than_sync_by_default() {
        assert!(
            ServiceOptions::default().translate_interval
                > sync::settings::SyncSettings::default().interval()
        );
    }
}
