use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, info, warn};

use scoop_core::config::ScoopConfig;
use scoop_core::{ChatMessage, FinishReason, ModelResponse, Part, Role};
use scoop_inference::HybridManager;
use scoop_memory::MemoryStore;

use crate::buffer::{BufferSnapshot, QuickReply, ResponseBuffer};
use crate::compact::ContextCompactor;
use crate::error::EngineError;
use crate::events::SseEvent;
use crate::executor::{tool_definitions, ToolBackend, ToolExecutor};
use crate::floop::{FunctionLoop, LoopCallbacks, LoopConfig, LoopOutput};
use crate::preflight;
use crate::prompt;
use crate::provider::{LlmClient, SessionConfig};
use crate::thinking::{loader_steps, ThinkingStrategy};

/// Synthetic prefix carrying the previous-conversation summary into the
/// prompt; stripped back out before persisting.
const SUMMARY_PREFIX: &str = "[წინა საუბრის შეჯამება]";

/// A SAFETY-terminated stream with less text than this gets one
/// fallback re-execution.
const SAFETY_TEXT_THRESHOLD: usize = 300;

/// Outcome of one full pipeline run.
struct PipelineOutcome {
    snapshot: BufferSnapshot,
    products_markdown: String,
    session_id: String,
    model_used: String,
    rounds: usize,
    fallback_used: bool,
    elapsed_seconds: f64,
    thinking_steps: u32,
}

/// Result of `process_message` (sync mode).
#[derive(Debug, Clone)]
pub struct ConversationResult {
    pub text: String,
    pub products: Vec<serde_json::Value>,
    pub products_markdown: String,
    pub tip: Option<String>,
    pub quick_replies: Vec<QuickReply>,
    pub session_id: String,
    pub model_used: String,
    pub rounds: usize,
    pub elapsed_seconds: f64,
    pub fallback_used: bool,
}

/// Emits thinking events into the stream and counts them; doubles as the
/// loop callback target so native thoughts flow straight through.
struct EventSink {
    tx: Option<mpsc::UnboundedSender<SseEvent>>,
    native_thinking: bool,
    steps: u32,
}

impl EventSink {
    fn silent() -> Self {
        Self {
            tx: None,
            native_thinking: false,
            steps: 0,
        }
    }

    fn emit_thinking(&mut self, content: &str, is_final: bool) {
        if let Some(tx) = &self.tx {
            self.steps += 1;
            let _ = tx.send(SseEvent::Thinking {
                content: content.to_string(),
                step: self.steps,
                is_final,
            });
        }
    }
}

impl LoopCallbacks for EventSink {
    fn on_thought(&mut self, text: &str) {
        if self.native_thinking {
            self.emit_thinking(text, false);
        }
    }
}

/// The top-level orchestrator. One engine instance serves all requests;
/// global handles arrive through the constructor.
pub struct ConversationEngine {
    llm: Arc<dyn LlmClient>,
    store: Arc<MemoryStore>,
    hybrid: Arc<HybridManager>,
    tools: Arc<dyn ToolBackend>,
    compactor: ContextCompactor,
    config: ScoopConfig,
    thinking: ThinkingStrategy,
}

impl ConversationEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<MemoryStore>,
        hybrid: Arc<HybridManager>,
        tools: Arc<dyn ToolBackend>,
        config: ScoopConfig,
    ) -> Self {
        let compactor = ContextCompactor::new(
            Arc::clone(&llm),
            Arc::clone(&store),
            config.models.fallback.clone(),
        );
        let thinking = ThinkingStrategy::parse(&config.engine.thinking);
        Self {
            llm,
            store,
            hybrid,
            tools,
            compactor,
            config,
            thinking,
        }
    }

    /// Process a message synchronously.
    pub async fn process_message(
        &self,
        user_id: &str,
        message: &str,
        session_id: Option<&str>,
    ) -> Result<ConversationResult, EngineError> {
        let mut sink = EventSink::silent();
        let outcome = self
            .run_pipeline(user_id, message, session_id, false, &mut sink)
            .await?;
        Ok(ConversationResult {
            text: outcome.snapshot.text,
            products: outcome.snapshot.products,
            products_markdown: outcome.products_markdown,
            tip: outcome.snapshot.tip,
            quick_replies: outcome.snapshot.quick_replies,
            session_id: outcome.session_id,
            model_used: outcome.model_used,
            rounds: outcome.rounds,
            elapsed_seconds: outcome.elapsed_seconds,
            fallback_used: outcome.fallback_used,
        })
    }

    /// Process a message as an ordered SSE event stream:
    /// `thinking* text products? tip? quick_replies? done`, or a single
    /// `error` event on failure.
    pub fn stream_message(
        self: Arc<Self>,
        user_id: String,
        message: String,
        session_id: Option<String>,
    ) -> UnboundedReceiverStream<SseEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            self.run_streaming(&user_id, &message, session_id.as_deref(), tx)
                .await;
        });
        UnboundedReceiverStream::new(rx)
    }

    async fn run_streaming(
        &self,
        user_id: &str,
        message: &str,
        session_id: Option<&str>,
        tx: mpsc::UnboundedSender<SseEvent>,
    ) {
        let mut sink = EventSink {
            tx: Some(tx.clone()),
            native_thinking: self.thinking == ThinkingStrategy::Native,
            steps: 0,
        };

        if self.thinking == ThinkingStrategy::SimpleLoader {
            let steps = loader_steps(message);
            let count = steps.len();
            for (i, step) in steps.into_iter().enumerate() {
                sink.emit_thinking(&step, i + 1 == count);
                tokio::time::sleep(Duration::from_millis(self.config.engine.thinking_delay_ms))
                    .await;
            }
        }

        // The pipeline is abandoned at its next suspension point when the
        // client disconnects (the receiver side of the channel is gone).
        let pipeline = self.run_pipeline(user_id, message, session_id, true, &mut sink);
        tokio::pin!(pipeline);
        let result = tokio::select! {
            result = &mut pipeline => result,
            _ = tx.closed() => {
                info!(user_id, "client disconnected, request abandoned");
                return;
            }
        };

        match result {
            Ok(outcome) => {
                let _ = tx.send(SseEvent::Text {
                    content: outcome.snapshot.text.clone(),
                });
                if !outcome.snapshot.products.is_empty() {
                    let _ = tx.send(SseEvent::Products {
                        content: outcome.products_markdown.clone(),
                    });
                }
                if let Some(tip) = &outcome.snapshot.tip {
                    let _ = tx.send(SseEvent::Tip {
                        content: tip.clone(),
                    });
                }
                if !outcome.snapshot.quick_replies.is_empty() {
                    let _ = tx.send(SseEvent::QuickReplies {
                        replies: outcome.snapshot.quick_replies.clone(),
                    });
                }
                let _ = tx.send(SseEvent::Done {
                    success: true,
                    session_id: outcome.session_id,
                    elapsed_seconds: outcome.elapsed_seconds,
                    thinking_steps: outcome.thinking_steps,
                    model_used: outcome.model_used,
                    fallback_used: outcome.fallback_used.then_some(true),
                });
            }
            Err(e) => {
                let code = e.code();
                warn!(error = %e, code = code.as_str(), "streaming request failed");
                let _ = tx.send(SseEvent::Error {
                    code: code.as_str().to_string(),
                    message: code.user_message().to_string(),
                    can_retry: code.can_retry(),
                });
            }
        }
    }

    /// The shared pipeline: context load → compaction → preflight →
    /// routing → loop with recovery → assembly → guarded persist →
    /// accounting.
    async fn run_pipeline(
        &self,
        user_id: &str,
        message: &str,
        session_id: Option<&str>,
        streaming: bool,
        sink: &mut EventSink,
    ) -> Result<PipelineOutcome, EngineError> {
        let started = Instant::now();

        // 1. Context load.
        let stored = match self.store.load_session(user_id, session_id)? {
            Some(s) => s,
            None => self.store.create_session(user_id)?,
        };
        let mut history = stored.history.clone();
        if let Some(summary) = &stored.summary {
            history.insert(
                0,
                ChatMessage::user_text(format!("{SUMMARY_PREFIX} {summary}")),
            );
        }
        let profile = self.store.get_profile(user_id)?;
        let profile_json = serde_json::to_value(&profile)
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        let system_instruction =
            prompt::build_system_instruction(prompt::BASE_SYSTEM_PROMPT, &profile);

        // Compaction against the primary model's budget.
        let primary_cfg = self
            .hybrid
            .router()
            .model_config(self.hybrid.router().primary_model());
        let system_tokens = self.hybrid.estimator().estimate(&system_instruction);
        history = self
            .compactor
            .maybe_compact(
                user_id,
                history,
                system_tokens,
                &primary_cfg,
                self.hybrid.estimator(),
            )
            .await;

        // 2. Search-first preflight.
        let mut message_text = message.to_string();
        if self.config.engine.search_first {
            if let Some(keyword) = preflight::product_query_keyword(message, history.len()) {
                match self
                    .tools
                    .search_products(user_id, &json!({ "query": keyword }))
                    .await
                {
                    Ok(result) => {
                        let products = result
                            .get("products")
                            .and_then(|v| v.as_array())
                            .cloned()
                            .unwrap_or_default();
                        if !products.is_empty() {
                            info!(keyword, count = products.len(), "preflight injected products");
                            message_text = preflight::inject_products(message, &products);
                        }
                    }
                    Err(e) => warn!(error = %e, "preflight search failed, using original message"),
                }
            }
        }

        // 3. Routing.
        let routing = self.hybrid.route_request(&message_text, &history, false);

        // 4–8. Loop execution with safety/empty fallback recovery.
        let recovery = self
            .execute_with_recovery(
                routing.model,
                &system_instruction,
                &history,
                user_id,
                &profile_json,
                &message_text,
                streaming,
                sink,
            )
            .await;
        let (output, session_history, model_used, fallback_used) = match recovery {
            Ok(v) => v,
            Err(e) => {
                // Streaming safety net: the main save never ran, so at
                // least the user turn is kept.
                if streaming {
                    let (lead, mut kept) = split_leading_summary(history);
                    kept.push(ChatMessage::user_text(message_text.clone()));
                    if let Err(se) = self.store.save_session(
                        &stored.session_id,
                        user_id,
                        &kept,
                        lead.as_deref().or(stored.summary.as_deref()),
                        &stored.metadata,
                    ) {
                        error!(error = %se, session = %stored.session_id, "safety-net save failed");
                    }
                }
                return Err(e);
            }
        };

        // 9. Assembly.
        let buffer = ResponseBuffer::new();
        buffer.set_text(&output.text);
        buffer.add_products(&output.products);
        buffer.extract_and_set_tip();
        buffer.parse_quick_replies();
        let products_markdown = buffer.format_products_markdown();
        let snapshot = buffer.snapshot();

        // 11. Guarded persist: failures are logged, never surfaced.
        let (lead_summary, final_history) = split_leading_summary(session_history);
        let summary_for_save = lead_summary.or_else(|| stored.summary.clone());
        if let Err(e) = self.store.save_session(
            &stored.session_id,
            user_id,
            &final_history,
            summary_for_save.as_deref(),
            &stored.metadata,
        ) {
            error!(error = %e, session = %stored.session_id, "history save failed");
        }
        if let Err(e) = self.store.bump_usage(user_id) {
            error!(error = %e, user_id, "usage bump failed");
        }

        // 12. Accounting.
        self.hybrid.record_success(Some(&model_used));

        info!(
            user_id,
            session = %stored.session_id,
            model = %model_used,
            rounds = output.rounds,
            products = snapshot.product_count,
            fallback_used,
            "request complete"
        );

        Ok(PipelineOutcome {
            snapshot,
            products_markdown,
            session_id: stored.session_id,
            model_used,
            rounds: output.rounds,
            fallback_used,
            elapsed_seconds: started.elapsed().as_secs_f64(),
            thinking_steps: sink.steps,
        })
    }

    /// Run the loop, applying at most one same-model retry (transient
    /// provider errors) and at most one model-level fallback
    /// (safety-terminated short output, or an empty response).
    #[allow(clippy::too_many_arguments)]
    async fn execute_with_recovery(
        &self,
        initial_model: String,
        system_instruction: &str,
        history: &[ChatMessage],
        user_id: &str,
        profile_json: &serde_json::Value,
        message_text: &str,
        streaming: bool,
        sink: &mut EventSink,
    ) -> Result<(LoopOutput, Vec<ChatMessage>, String, bool), EngineError> {
        let mut model = initial_model;
        let mut fallback_used = false;
        let mut transient_retry_available = true;
        // Request-scoped summary-retry budget. The loop consumes it at
        // most once across every re-execution below — a retry spent on
        // the primary model stays spent on the fallback.
        let mut summary_retry_used = false;

        loop {
            let attempt = self
                .attempt(
                    &model,
                    system_instruction,
                    history,
                    user_id,
                    profile_json,
                    message_text,
                    streaming,
                    sink,
                    &mut summary_retry_used,
                )
                .await;

            match attempt {
                Ok((output, session_history)) => {
                    let short = output.text.chars().count() < SAFETY_TEXT_THRESHOLD;
                    if output.last_finish_reason == Some(FinishReason::Safety)
                        && short
                        && !fallback_used
                    {
                        // Record the safety failure regardless of whether a
                        // fallback exists.
                        let parts = if output.text.is_empty() {
                            Vec::new()
                        } else {
                            vec![Part::text(output.text.clone())]
                        };
                        self.hybrid.record_failure(
                            None,
                            Some(&ModelResponse {
                                parts,
                                finish_reason: Some(FinishReason::Safety),
                                block_reason: None,
                            }),
                        );
                        if let Some(fb) = self.hybrid.get_fallback_model(Some(&model)) {
                            warn!(from = %model, to = %fb, "safety fallback re-execution");
                            sink.emit_thinking("ვცდილობ სათადარიგო მოდელით...", false);
                            fallback_used = true;
                            model = fb;
                            continue;
                        }
                        if output.text.is_empty() {
                            return Err(EngineError::ContentBlocked {
                                reason: "SAFETY".to_string(),
                            });
                        }
                    }
                    return Ok((output, session_history, model, fallback_used));
                }
                Err(EngineError::EmptyResponse) => {
                    self.hybrid
                        .record_failure(None, Some(&ModelResponse::default()));
                    if !fallback_used {
                        if let Some(fb) = self.hybrid.get_fallback_model(Some(&model)) {
                            warn!(from = %model, to = %fb, "empty response fallback");
                            sink.emit_thinking("ვცდილობ სათადარიგო მოდელით...", false);
                            fallback_used = true;
                            model = fb;
                            continue;
                        }
                    }
                    return Err(EngineError::EmptyResponse);
                }
                Err(EngineError::Llm(e)) => {
                    let (should_retry, fallback_routing) =
                        self.hybrid.record_failure(Some(&e), None);
                    if should_retry && transient_retry_available {
                        warn!(error = %e, model = %model, "transient error, retrying once");
                        transient_retry_available = false;
                        continue;
                    }
                    if let Some(routing) = fallback_routing {
                        if !fallback_used {
                            warn!(from = %model, to = %routing.model, "error-driven fallback");
                            fallback_used = true;
                            model = routing.model;
                            continue;
                        }
                    }
                    return Err(EngineError::Llm(e));
                }
                Err(e) => {
                    // Timeouts and the rest are terminal for the request.
                    if let EngineError::LoopTimeout { secs } = e {
                        self.hybrid.record_failure(
                            Some(&scoop_core::LlmError::Timeout { secs }),
                            None,
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    /// One loop execution against one model: build session, build
    /// executor, run. `summary_retry_used` is shared across attempts by
    /// `execute_with_recovery`.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        model: &str,
        system_instruction: &str,
        history: &[ChatMessage],
        user_id: &str,
        profile_json: &serde_json::Value,
        message_text: &str,
        streaming: bool,
        sink: &mut EventSink,
        summary_retry_used: &mut bool,
    ) -> Result<(LoopOutput, Vec<ChatMessage>), EngineError> {
        let model_cfg = self.hybrid.router().model_config(model);
        let session_config = SessionConfig {
            model: model.to_string(),
            system_instruction: system_instruction.to_string(),
            tools: tool_definitions(),
            temperature: self.config.engine.temperature,
            max_output_tokens: self.config.engine.max_output_tokens.min(model_cfg.max_output),
            thinking: model_cfg.thinking,
            disable_automatic_function_calling: true,
        };

        let mut session = self.llm.start_chat(session_config, history.to_vec());
        let mut executor = ToolExecutor::new(
            user_id,
            profile_json.clone(),
            Arc::clone(&self.tools),
            self.config.engine.max_unique_queries,
        );
        let floop = FunctionLoop::new(LoopConfig {
            max_rounds: self.config.engine.max_rounds,
            round_timeout: Duration::from_secs(self.config.engine.round_timeout_secs),
            enable_retry: self.config.engine.enable_retry,
        });

        let first = vec![Part::text(message_text)];
        let output = if streaming {
            floop
                .execute_streaming(session.as_mut(), &mut executor, first, sink, summary_retry_used)
                .await?
        } else {
            floop
                .execute(session.as_mut(), &mut executor, first, summary_retry_used)
                .await?
        };
        Ok((output, session.history()))
    }
}

/// Pull a synthetic summary prefix off the front of a history, returning
/// its text (for the session's summary column) and the rest.
fn split_leading_summary(history: Vec<ChatMessage>) -> (Option<String>, Vec<ChatMessage>) {
    if let Some(first) = history.first() {
        if first.role == Role::User {
            let text = first.visible_text();
            if let Some(rest) = text.strip_prefix(SUMMARY_PREFIX) {
                return (Some(rest.trim().to_string()), history[1..].to_vec());
            }
        }
    }
    (None, history)
}
