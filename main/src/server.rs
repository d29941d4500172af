use std::{sync::Arc, time::Duration};

use agent_runtime::{
    agents::{PlannerAgent, ReqWorkerAgent, SolverAgent, VerifierAgent},
    bus::{MessageBus, TOPIC_DTO, TOPIC_PLAN, TOPIC_SOLVE, TOPIC_VERIFY},
    context::AgentContext,
    sequencer::Sequencer,
    trace::SurrealTraceSink,
    workbench::{VectorSearchTool, Workbench},
};
use api_router::{api_routes_v1, api_state::ApiState};
use axum::Router;
use common::{
    llm::{ChatClient, OpenAiChatClient},
    storage::{
        db::SurrealDbClient,
        vector::{SurrealVectorStore, VectorStore},
    },
    utils::{
        config::get_config,
        embedding::{Embedder, EmbeddingProvider},
    },
};
use kg_pipeline::{DuplicateDetector, GraphSearch, KgBuilder, Lexicon};
use mining_pipeline::{DefaultDocumentParser, MiningAgent};
use orchestrator::{PipelineOrchestrator, SessionStreams};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use validation_pipeline::{
    ArtifactCache, EvaluationService, RequirementScorer, RewriteDelegator, SuggestionService,
    ValidationDelegator,
};

const REFLECTION_MAX_ROUNDS: usize = 3;
const REFLECTION_ROUND_TIMEOUT: Duration = Duration::from_secs(90);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;

    let openai_client = Arc::new(async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(config.openai_api_key.clone().unwrap_or_default())
            .with_api_base(&config.openai_base_url),
    ));
    let llm_available = config.openai_api_key.is_some();

    let chat: Arc<dyn ChatClient> = Arc::new(OpenAiChatClient::new(
        Arc::clone(&openai_client),
        config.model_name.clone(),
        Duration::from_secs(config.validation_timeout),
    ));
    // Scoring falls back to deterministic heuristics without an API key.
    let scoring_chat: Option<Arc<dyn ChatClient>> = llm_available.then(|| Arc::clone(&chat));

    let embedding_provider: Arc<dyn Embedder> = Arc::new(EmbeddingProvider::from_config(
        &config,
        Some(Arc::clone(&openai_client)),
    )?);
    info!(
        embedding_backend = embedding_provider.backend_label(),
        embedding_dimension = embedding_provider.dimension(),
        llm_available,
        "providers initialized"
    );

    let store: Arc<dyn VectorStore> = Arc::new(SurrealVectorStore::new(Arc::clone(&db)));

    // Agent runtime: bus, shared context, workbench, trace sink and the
    // reflection triad, all wired once at startup.
    let bus = Arc::new(MessageBus::new());
    let context = Arc::new(AgentContext::default());
    let trace_sink = Arc::new(SurrealTraceSink::new(
        Arc::clone(&db),
        Arc::clone(&store),
        Some(Arc::clone(&embedding_provider)),
    ));

    let mut workbench = Workbench::new();
    workbench.register(Arc::new(VectorSearchTool::new(
        Arc::clone(&store),
        Arc::clone(&embedding_provider),
    )));
    let workbench = Arc::new(workbench);

    bus.subscribe(
        TOPIC_PLAN,
        "planner",
        Arc::new(PlannerAgent::new(
            Arc::clone(&chat),
            Arc::clone(&bus),
            Arc::clone(&context),
            trace_sink.clone() as Arc<dyn agent_runtime::trace::TraceSink>,
        )),
    )
    .await;
    bus.subscribe(
        TOPIC_SOLVE,
        "solver",
        Arc::new(SolverAgent::new(
            Arc::clone(&chat),
            Arc::clone(&bus),
            Arc::clone(&context),
            trace_sink.clone() as Arc<dyn agent_runtime::trace::TraceSink>,
            Arc::clone(&store),
            Arc::clone(&embedding_provider),
            Some(Arc::clone(&workbench)),
        )),
    )
    .await;
    bus.subscribe(
        TOPIC_VERIFY,
        "verifier",
        Arc::new(VerifierAgent::new(
            Arc::clone(&chat),
            Arc::clone(&bus),
            Arc::clone(&context),
            trace_sink as Arc<dyn agent_runtime::trace::TraceSink>,
            Some(Arc::clone(&workbench)),
        )),
    )
    .await;
    bus.subscribe(
        TOPIC_DTO,
        "req_worker",
        Arc::new(ReqWorkerAgent::new(config.req_worker_endpoint.clone())),
    )
    .await;

    let sequencer = Arc::new(Sequencer::new(
        Arc::clone(&bus),
        REFLECTION_MAX_ROUNDS,
        REFLECTION_ROUND_TIMEOUT,
    ));

    // Pipelines.
    let cache = ArtifactCache::new(Arc::clone(&db));
    let scorer: Arc<dyn RequirementScorer> = Arc::new(EvaluationService::new(
        scoring_chat.clone(),
        cache.clone(),
        config.model_name.clone(),
    ));
    let suggestions = Arc::new(SuggestionService::new(
        scoring_chat.clone(),
        cache.clone(),
        config.model_name.clone(),
    ));

    let streams = Arc::new(SessionStreams::new());

    let validation = Arc::new(ValidationDelegator::new(
        Arc::clone(&scorer),
        config.validation_max_concurrent,
        Duration::from_secs(config.validation_timeout),
        config.verdict_threshold,
    ));
    let rewrite = Arc::new(RewriteDelegator::new(
        Arc::clone(&chat),
        Arc::clone(&scorer),
        cache,
        config.rewrite_max_concurrent,
        Duration::from_secs(config.rewrite_timeout.saturating_mul(6)),
        3,
        config.verdict_threshold,
        true,
        config.model_name.clone(),
    ));

    let miner = Arc::new(MiningAgent::new(
        Arc::clone(&chat),
        Arc::new(DefaultDocumentParser),
        Some(Arc::clone(&bus)),
    ));
    let kg_builder = Arc::new(KgBuilder::new(
        scoring_chat,
        Arc::clone(&store),
        Arc::clone(&embedding_provider),
        Lexicon::default(),
    ));
    let graph_search = Arc::new(GraphSearch::new(
        Arc::clone(&store),
        Arc::clone(&embedding_provider),
    ));
    let duplicates = Arc::new(DuplicateDetector::new(Arc::clone(&embedding_provider), None));

    let pipeline_orchestrator = Arc::new(PipelineOrchestrator::new(
        Arc::clone(&db),
        miner,
        Arc::clone(&kg_builder),
        Arc::clone(&validation),
        rewrite,
        duplicates,
        Arc::clone(&store),
        Arc::clone(&embedding_provider),
        Arc::clone(&streams),
    ));

    let api_state = ApiState::new(
        db,
        config.clone(),
        scorer,
        validation,
        suggestions,
        kg_builder,
        graph_search,
        pipeline_orchestrator,
        sequencer,
        streams,
    );

    let app: Router = api_routes_v1(&api_state).with_state(api_state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    info!(port = config.http_port, "server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
