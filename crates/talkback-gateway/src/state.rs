//! Gateway shared state.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "metrics")]
use metrics_exporter_prometheus::PrometheusHandle;

use talkback_core::config::Config;
use talkback_core::store::MemoryStore;
use talkback_providers::factory::{build_llm_provider, build_stt_provider, build_tts_provider};
use talkback_voice::directory::StaticDirectory;
use talkback_voice::summary::LlmSummarizer;
use talkback_voice::{Orchestrator, Pipeline, TalkService};

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub talk: TalkService,
    pub orchestrator: Orchestrator,
    /// Set when the gateway owns an in-process store that needs periodic purging.
    pub memory_store: Option<Arc<MemoryStore>>,
    #[cfg(feature = "metrics")]
    pub metrics: Option<PrometheusHandle>,
    connections: AtomicUsize,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, pipeline: Pipeline) -> Self {
        Self {
            config,
            talk: TalkService::new(pipeline.clone()),
            orchestrator: Orchestrator::new(pipeline),
            memory_store: None,
            #[cfg(feature = "metrics")]
            metrics: None,
            connections: AtomicUsize::new(0),
        }
    }

    /// Build providers, directory, and an in-memory store from `config`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let stt = build_stt_provider(&config.providers.stt)?;
        let llm = build_llm_provider(&config.providers.llm)?;
        let tts = build_tts_provider(&config.providers.tts)?;

        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(StaticDirectory::from_config(&config));
        let pipeline = Pipeline::new(
            stt,
            llm.clone(),
            tts,
            store.clone(),
            directory.clone(),
            directory,
            &config.talk,
        )
        .with_summarizer(Arc::new(LlmSummarizer::new(llm)));

        let mut state = Self::new(Arc::new(config), pipeline);
        state.memory_store = Some(store);
        Ok(state)
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn connection_opened(&self) -> usize {
        self.connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn connection_closed(&self) -> usize {
        self.connections.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }

    /// Open streaming connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}
