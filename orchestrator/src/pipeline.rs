use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    error::AppError,
    model::{Chunk, Requirement},
    storage::{
        db::SurrealDbClient,
        vector::{VectorRecord, VectorStore, REQUIREMENTS_COLLECTION},
    },
    utils::embedding::Embedder,
};
use kg_pipeline::{DuplicateCandidate, DuplicateDetector, DuplicateReport, KgBuildOptions, KgBuilder};
use mining_pipeline::{ChunkingOptions, FileOrText, MiningAgent, MiningOptions};
use serde_json::json;
use state_machines::{core::GuardError, state_machine};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use validation_pipeline::{
    AgentMessageSink, FailedRequirement, RewriteDelegator, ValidationDelegator, ValidationItem,
};

use crate::{
    clarification::{ask_and_wait, ClarificationOutcome, ANSWER_TIMEOUT},
    events::{SessionStreams, WorkflowEvent, WorkflowStatus},
    report::WorkflowReport,
};

state_machine! {
    name: WorkflowMachine,
    state: WorkflowState,
    initial: Ready,
    states: [Ready, Mined, Persisted, Analyzed, Refined, Reported, Failed],
    events {
        mine { transition: { from: Ready, to: Mined } }
        persist { transition: { from: Mined, to: Persisted } }
        analyze { transition: { from: Persisted, to: Analyzed } }
        refine { transition: { from: Analyzed, to: Refined } }
        report { transition: { from: Refined, to: Reported } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: Mined, to: Failed }
            transition: { from: Persisted, to: Failed }
            transition: { from: Analyzed, to: Failed }
            transition: { from: Refined, to: Failed }
        }
    }
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid workflow transition during {event}: {guard:?}"
    ))
}

#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    pub chunking: Option<ChunkingOptions>,
    pub neighbor_refs: bool,
    pub model: Option<String>,
    pub use_llm_kg: bool,
    /// Guided mode may pause for user clarification.
    pub guided: bool,
    pub validation_threshold: Option<f32>,
    pub clarification_timeout: Duration,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            chunking: None,
            neighbor_refs: false,
            model: None,
            use_llm_kg: false,
            guided: false,
            validation_threshold: None,
            clarification_timeout: ANSWER_TIMEOUT,
        }
    }
}

/// Sequences a full run: mining, chunk persistence, KG build in parallel
/// with validation, feedback rewriting of failures, duplicate detection and
/// the final report. Stages pass values only; progress streams per session;
/// cancellation is honored at stage boundaries.
pub struct PipelineOrchestrator {
    db: Arc<SurrealDbClient>,
    miner: Arc<MiningAgent>,
    kg_builder: Arc<KgBuilder>,
    validation: Arc<ValidationDelegator>,
    rewrite: Arc<RewriteDelegator>,
    duplicates: Arc<DuplicateDetector>,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    streams: Arc<SessionStreams>,
}

impl PipelineOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<SurrealDbClient>,
        miner: Arc<MiningAgent>,
        kg_builder: Arc<KgBuilder>,
        validation: Arc<ValidationDelegator>,
        rewrite: Arc<RewriteDelegator>,
        duplicates: Arc<DuplicateDetector>,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        streams: Arc<SessionStreams>,
    ) -> Self {
        Self {
            db,
            miner,
            kg_builder,
            validation,
            rewrite,
            duplicates,
            store,
            embedder,
            streams,
        }
    }

    pub fn streams(&self) -> &Arc<SessionStreams> {
        &self.streams
    }

    async fn emit_agent(&self, session_id: &str, agent: &str, message: String) {
        self.streams
            .emit(session_id, WorkflowEvent::agent_message(agent, message))
            .await;
    }

    /// Sync sink the delegators can call from progress callbacks; messages
    /// hop onto the session stream via spawned emits.
    fn session_sink(&self, session_id: &str) -> AgentMessageSink {
        let streams = Arc::clone(&self.streams);
        let session_id = session_id.to_string();
        Arc::new(move |agent: &str, message: &str| {
            let streams = Arc::clone(&streams);
            let session_id = session_id.clone();
            let event = WorkflowEvent::agent_message(agent, message);
            tokio::spawn(async move {
                streams.emit(&session_id, event).await;
            });
        })
    }

    /// Runs the whole workflow for a session. Always emits a terminal
    /// `workflow_status` event; the error path carries the reason.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn run(
        &self,
        session_id: &str,
        inputs: Vec<FileOrText>,
        options: WorkflowOptions,
        cancel: CancellationToken,
    ) -> Result<WorkflowReport, AppError> {
        self.streams.register(session_id).await;
        self.streams
            .emit(session_id, WorkflowEvent::status(WorkflowStatus::Running))
            .await;

        match self.drive(session_id, inputs, options, &cancel).await {
            Ok(report) => {
                self.streams
                    .emit(session_id, WorkflowEvent::status(WorkflowStatus::Completed))
                    .await;
                self.streams
                    .emit(
                        session_id,
                        WorkflowEvent::WorkflowResult {
                            result: serde_json::to_value(&report).unwrap_or_default(),
                        },
                    )
                    .await;
                Ok(report)
            }
            Err(err) => {
                let reason = match &err {
                    AppError::Canceled => "canceled".to_string(),
                    other => other.to_string(),
                };
                self.streams
                    .emit(session_id, WorkflowEvent::failed(reason))
                    .await;
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        session_id: &str,
        inputs: Vec<FileOrText>,
        options: WorkflowOptions,
        cancel: &CancellationToken,
    ) -> Result<WorkflowReport, AppError> {
        let machine = WorkflowMachine::new(());
        let started = Instant::now();

        // Stage 1: mining.
        let input_count = inputs.len();
        self.emit_agent(
            session_id,
            "ChunkMiner",
            format!("Mining requirements from {input_count} document(s)..."),
        )
        .await;
        let mining_options = MiningOptions {
            model: options.model.clone(),
            neighbor_refs: options.neighbor_refs,
            chunking: options.chunking,
        };
        let (requirements, chunks) = self
            .miner
            .mine_with_chunks(inputs, &mining_options)
            .await?;
        self.emit_agent(
            session_id,
            "ChunkMiner",
            format!("Extracted {} requirements", requirements.len()),
        )
        .await;
        let machine = machine
            .mine()
            .map_err(|(_, guard)| map_guard_error("mine", &guard))?;

        let requirements = if requirements.is_empty() && options.guided {
            self.clarify_empty_mining(session_id, &options, cancel).await?;
            requirements
        } else {
            requirements
        };

        if cancel.is_cancelled() {
            let _failed = machine
                .abort()
                .map_err(|(_, guard)| map_guard_error("abort", &guard))?;
            return Err(AppError::Canceled);
        }

        // Stage 2: persist chunks for retrieval. Non-fatal when the vector
        // store is down; mining results are still worth reporting.
        self.emit_agent(
            session_id,
            "System",
            format!("Persisting {} chunks for retrieval...", chunks.len()),
        )
        .await;
        if let Err(err) = self.persist_chunks(&chunks).await {
            warn!(error = %err, "chunk persistence failed");
            self.emit_agent(
                session_id,
                "System",
                format!("Chunk persistence failed (non-critical): {err}"),
            )
            .await;
        }
        let machine = machine
            .persist()
            .map_err(|(_, guard)| map_guard_error("persist", &guard))?;

        if cancel.is_cancelled() {
            let _failed = machine
                .abort()
                .map_err(|(_, guard)| map_guard_error("abort", &guard))?;
            return Err(AppError::Canceled);
        }

        // Stage 3: KG build and validation run concurrently; they only share
        // the immutable requirement list.
        self.emit_agent(
            session_id,
            "KGAgent",
            "Building Knowledge Graph from requirements...".to_string(),
        )
        .await;
        self.emit_agent(
            session_id,
            "Validator",
            format!("Validating {} requirements...", requirements.len()),
        )
        .await;

        let kg_options = KgBuildOptions {
            use_llm: options.use_llm_kg,
            llm_fallback: true,
            dedupe: true,
            persist: true,
            model: options.model.clone(),
        };
        let validation_items: Vec<ValidationItem> = requirements
            .iter()
            .map(|r| ValidationItem {
                req_id: r.req_id.clone(),
                text: r.title.clone(),
                tag: Some(r.tag.as_str().to_string()),
            })
            .collect();

        let sink = self.session_sink(session_id);
        let (kg_result, validation) = tokio::join!(
            self.kg_builder.build(&requirements, &kg_options),
            self.validation.validate(
                validation_items,
                None,
                options.validation_threshold,
                Some(Arc::clone(&sink)),
            )
        );

        self.emit_agent(
            session_id,
            "KGAgent",
            format!(
                "Created {} nodes and {} edges",
                kg_result.stats.nodes, kg_result.stats.edges
            ),
        )
        .await;
        self.emit_agent(
            session_id,
            "Validator",
            format!(
                "Validation complete: {} passed, {} failed",
                validation.passed, validation.failed
            ),
        )
        .await;
        let machine = machine
            .analyze()
            .map_err(|(_, guard)| map_guard_error("analyze", &guard))?;

        if cancel.is_cancelled() {
            let _failed = machine
                .abort()
                .map_err(|(_, guard)| map_guard_error("abort", &guard))?;
            return Err(AppError::Canceled);
        }

        // Stage 4: rewrite the failures with their evaluation feedback; the
        // delegator re-validates internally.
        let failed: Vec<FailedRequirement> = validation
            .results
            .iter()
            .filter(|r| r.verdict == "fail")
            .map(|r| FailedRequirement {
                req_id: r.req_id.clone(),
                text: r.title.clone(),
                score: r.score,
                evaluation: r.evaluation.clone(),
                tag: r.tag.clone(),
            })
            .collect();
        if !failed.is_empty() {
            self.emit_agent(
                session_id,
                "RewriteDelegator",
                format!("Rewriting {} failed requirements...", failed.len()),
            )
            .await;
        }
        let rewrites = self.rewrite.rewrite_batch(failed, Some(sink)).await;
        let machine = machine
            .refine()
            .map_err(|(_, guard)| map_guard_error("refine", &guard))?;

        if cancel.is_cancelled() {
            let _failed = machine
                .abort()
                .map_err(|(_, guard)| map_guard_error("abort", &guard))?;
            return Err(AppError::Canceled);
        }

        // Stage 5: near-duplicate clustering over the refined titles.
        let duplicates = self
            .detect_duplicates(&requirements, &rewrites.results)
            .await;
        if let Some(report) = &duplicates {
            self.emit_agent(
                session_id,
                "DuplicateDetector",
                format!(
                    "Found {} duplicate group(s) via {}",
                    report.groups.len(),
                    report.stats.method
                ),
            )
            .await;
        }

        let report = WorkflowReport::summarize(
            requirements,
            kg_result.stats,
            validation,
            rewrites,
            duplicates,
        );
        let _machine = machine
            .report()
            .map_err(|(_, guard)| map_guard_error("report", &guard))?;

        info!(
            session_id,
            total_ms = started.elapsed().as_millis() as u64,
            requirements = report.summary.total_requirements,
            "workflow finished"
        );
        Ok(report)
    }

    async fn clarify_empty_mining(
        &self,
        session_id: &str,
        options: &WorkflowOptions,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let outcome = ask_and_wait(
            &self.db,
            &self.streams,
            session_id,
            "No requirements could be mined from the documents. Continue with an empty set?",
            vec!["continue".to_string(), "abort".to_string()],
            options.clarification_timeout,
            cancel,
        )
        .await?;

        match outcome {
            ClarificationOutcome::Answered(answer) if answer.trim().eq_ignore_ascii_case("abort") => {
                Err(AppError::Validation("aborted by user clarification".into()))
            }
            ClarificationOutcome::Answered(_) => Ok(()),
            ClarificationOutcome::TimedOut => {
                self.emit_agent(session_id, "System", "no answer (timeout)".to_string())
                    .await;
                Ok(())
            }
            ClarificationOutcome::Canceled => Err(AppError::Canceled),
        }
    }

    /// Embeds and upserts the chunk windows so the solver and the workbench
    /// search tool can cite them later.
    async fn persist_chunks(&self, chunks: &[Chunk]) -> Result<(), AppError> {
        if chunks.is_empty() {
            return Ok(());
        }
        self.store
            .ensure_collection(REQUIREMENTS_COLLECTION, self.embedder.dimension())
            .await?;

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;

        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| VectorRecord {
                id: format!("{}-{}", chunk.payload.sha1, chunk.payload.chunk_index),
                embedding: Some(embedding),
                payload: json!({
                    "text": chunk.text,
                    "sourceFile": chunk.payload.source_file,
                    "sha1": chunk.payload.sha1,
                    "chunkIndex": chunk.payload.chunk_index,
                    "tokenLen": chunk.payload.token_len,
                }),
            })
            .collect();

        self.store.upsert(REQUIREMENTS_COLLECTION, records).await?;
        Ok(())
    }

    /// Dedup runs over the freshest text per requirement: the rewrite when
    /// one was produced, the mined title otherwise.
    async fn detect_duplicates(
        &self,
        requirements: &[Requirement],
        rewrites: &[validation_pipeline::RewriteResult],
    ) -> Option<DuplicateReport> {
        if requirements.len() < 2 {
            return None;
        }
        let candidates: Vec<DuplicateCandidate> = requirements
            .iter()
            .map(|requirement| {
                let rewritten = rewrites
                    .iter()
                    .find(|r| r.req_id == requirement.req_id && r.error.is_none())
                    .map(|r| r.rewritten_text.clone());
                DuplicateCandidate {
                    req_id: requirement.req_id.clone(),
                    title: rewritten.unwrap_or_else(|| requirement.title.clone()),
                }
            })
            .collect();
        Some(self.duplicates.find_duplicates(&candidates).await)
    }
}
