use std::collections::HashMap;
use std::sync::Arc;

use agent_runtime::sequencer::Sequencer;
use common::{storage::db::SurrealDbClient, utils::config::AppConfig};
use kg_pipeline::{GraphSearch, KgBuilder};
use orchestrator::{PipelineOrchestrator, SessionStreams};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use validation_pipeline::{RequirementScorer, SuggestionService, ValidationDelegator};

/// Shared state for the API routers; built once at startup and cloned per
/// request.
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub scorer: Arc<dyn RequirementScorer>,
    pub validation: Arc<ValidationDelegator>,
    pub suggestions: Arc<SuggestionService>,
    pub kg_builder: Arc<KgBuilder>,
    pub graph_search: Arc<GraphSearch>,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub sequencer: Arc<Sequencer>,
    pub streams: Arc<SessionStreams>,
    /// Cancellation handles per running workflow session.
    pub cancellations: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl ApiState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<SurrealDbClient>,
        config: AppConfig,
        scorer: Arc<dyn RequirementScorer>,
        validation: Arc<ValidationDelegator>,
        suggestions: Arc<SuggestionService>,
        kg_builder: Arc<KgBuilder>,
        graph_search: Arc<GraphSearch>,
        orchestrator: Arc<PipelineOrchestrator>,
        sequencer: Arc<Sequencer>,
        streams: Arc<SessionStreams>,
    ) -> Self {
        Self {
            db,
            config,
            scorer,
            validation,
            suggestions,
            kg_builder,
            graph_search,
            orchestrator,
            sequencer,
            streams,
            cancellations: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}
