pub mod compaction;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod identity;
pub mod inference;
pub mod storage;
pub mod tools;
pub mod types;

use std::path::PathBuf;

use tracing::{debug, info, warn};

pub use compaction::{FileOperations, SUMMARY_MARKER};
pub use config::Config;
pub use context::{estimate_str_tokens, estimate_tokens, select_messages, Overflow, Selection};
pub use conversation::ConversationStore;
pub use error::{AgentError, ConfigError, InferenceError, StorageError};
pub use identity::{build_system_prompt, load_identity_files, IdentityFiles};
pub use inference::{AnthropicProvider, InferenceProvider};
pub use storage::Storage;
pub use tools::{ToolDefinition, ToolHandler, ToolRegistry, ToolSummary};
pub use types::{
    ContentBlock, ConversationMetadata, InferenceRequest, InferenceResponse, Message,
    MessageContent, MetadataPatch, Role, StopReason, ToolResultContent, Usage,
};

/// More model calls than this in one turn means a runaway tool loop.
const MAX_MODEL_CALLS_PER_TURN: u32 = 25;
/// Two compactions per turn; a third overflow means compaction cannot win.
const MAX_COMPACTIONS_PER_TURN: u32 = 2;

/// Agent configuration.
pub struct AgentConfig {
    pub model: String,
    pub max_tokens: u32,
    pub context_window: u32,
    /// Root of the identity files, re-read on every loop iteration.
    pub home_dir: PathBuf,
}

/// Result of one turn.
#[derive(Debug)]
pub struct TurnResult {
    pub text: String,
    pub model_calls: u32,
    pub usage: Usage,
}

/// The entity's runtime: one conversation, one process, one loop. Wires
/// the store, identity, selector, tools, and compaction together around an
/// injected inference provider.
pub struct Agent {
    provider: Box<dyn InferenceProvider>,
    store: ConversationStore,
    tools: ToolRegistry,
    config: AgentConfig,
    // Tools have no side-effect reporting channel yet, so these sets stay
    // empty and the summary footer stays silent.
    file_ops: FileOperations,
}

impl Agent {
    pub fn new(
        provider: impl InferenceProvider + 'static,
        store: ConversationStore,
        tools: ToolRegistry,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider: Box::new(provider),
            store,
            tools,
            config,
            file_ops: FileOperations::default(),
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// One full turn: append the user input, then alternate model calls
    /// and tool dispatch until the model stops, compacting whenever the
    /// transcript no longer fits the budget. Every intermediate message
    /// hits disk before the next suspension point.
    pub async fn process_turn(&mut self, input: &str) -> Result<TurnResult, AgentError> {
        self.store.append_message(Message::user_text(input))?;

        let mut model_calls: u32 = 0;
        let mut compaction_attempts: u32 = 0;
        let mut usage = Usage::default();

        loop {
            // Identity edits take effect here, every iteration.
            let identity = load_identity_files(&self.config.home_dir)?;
            let system =
                build_system_prompt(&identity, &self.tools.summaries(), chrono::Utc::now());
            let budget = self.config.context_window as i64
                - estimate_str_tokens(&system) as i64
                - self.config.max_tokens as i64;
            if budget <= 0 {
                return Err(AgentError::TokenBudgetExhausted);
            }
            let budget = budget as u32;

            let (selected, overflow) = {
                let selection = select_messages(self.store.messages()?, budget, estimate_tokens);
                (selection.selected.to_vec(), selection.overflow)
            };

            if let Some(overflow) = overflow {
                if compaction_attempts >= MAX_COMPACTIONS_PER_TURN {
                    return Err(AgentError::CompactionExhausted {
                        attempts: compaction_attempts,
                        dropped_count: overflow.dropped_count,
                        estimated_dropped_tokens: overflow.estimated_dropped_tokens,
                    });
                }
                compaction_attempts += 1;
                debug!(
                    attempt = compaction_attempts,
                    dropped = overflow.dropped_count,
                    over_tokens = overflow.estimated_dropped_tokens,
                    "transcript over budget"
                );
                self.compact(budget, identity.soul.as_deref(), &mut model_calls, &mut usage)
                    .await?;
                continue;
            }

            if model_calls >= MAX_MODEL_CALLS_PER_TURN {
                return Err(AgentError::TurnBudgetExhausted(model_calls));
            }

            let request = InferenceRequest {
                model: self.config.model.clone(),
                max_tokens: self.config.max_tokens,
                system: Some(system),
                tools: if self.tools.is_empty() {
                    Vec::new()
                } else {
                    self.tools.export_for_api()
                },
                messages: selected,
            };
            model_calls += 1;
            let response = self.provider.infer(request).await?;
            usage.accumulate(&response.usage);
            debug!(
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                "model call complete"
            );

            // Persist the whole content array, tool_use blocks included.
            // This is what makes recovery possible.
            self.store
                .append_message(Message::assistant(response.content.clone()))?;

            match response.stop_reason {
                StopReason::EndTurn | StopReason::MaxTokens => {
                    info!(
                        model_calls,
                        compactions = compaction_attempts,
                        "turn complete"
                    );
                    return Ok(TurnResult {
                        text: extract_text(&response.content),
                        model_calls,
                        usage,
                    });
                }
                StopReason::ToolUse => {
                    let results = self.dispatch_tools(&response.content).await;
                    if results.is_empty() {
                        warn!("stop_reason tool_use without tool_use blocks");
                        return Ok(TurnResult {
                            text: extract_text(&response.content),
                            model_calls,
                            usage,
                        });
                    }
                    self.store.append_message(Message {
                        role: Role::User,
                        content: MessageContent::Blocks(results),
                    })?;
                }
            }
        }
    }

    /// Execute the response's tool_use blocks serially, in order. Each
    /// outcome becomes a tool_result block; an unknown name or a failing
    /// handler becomes an error-flagged one. Result order equals call
    /// order.
    async fn dispatch_tools(&self, content: &[ContentBlock]) -> Vec<ContentBlock> {
        let mut results = Vec::new();
        for block in content {
            let ContentBlock::ToolUse { id, name, input } = block else {
                continue;
            };
            let outcome = match self.tools.find(name) {
                Some(tool) => tool.invoke(input).await,
                None => Err(format!("Tool not found: {name}")),
            };
            let (text, is_error) = match outcome {
                Ok(output) => (output, None),
                Err(error) => {
                    warn!(tool = %name, error = %error, "tool failed");
                    (error, Some(true))
                }
            };
            results.push(ContentBlock::ToolResult {
                tool_use_id: id.clone(),
                content: ToolResultContent::Text(text),
                is_error,
            });
        }
        results
    }

    /// Replace the head of the transcript with a first-person summary. A
    /// failed summarizer call fails the turn; substituting a placeholder
    /// would silently erase history.
    async fn compact(
        &mut self,
        budget: u32,
        soul: Option<&str>,
        model_calls: &mut u32,
        usage: &mut Usage,
    ) -> Result<(), AgentError> {
        if *model_calls >= MAX_MODEL_CALLS_PER_TURN {
            return Err(AgentError::TurnBudgetExhausted(*model_calls));
        }

        let (request, kept, failures) = {
            let messages = self.store.messages()?;
            let plan = compaction::plan(messages, budget);
            compaction::check_input_size(plan.dropped, self.config.context_window)?;
            info!(
                dropped = plan.dropped.len(),
                kept = plan.kept.len(),
                recursive = plan.previous_summary.is_some(),
                "compacting transcript"
            );
            (
                compaction::build_summarizer_request(&self.config.model, soul, &plan),
                plan.kept.to_vec(),
                compaction::extract_tool_failures(plan.dropped),
            )
        };

        *model_calls += 1;
        let response = self.provider.infer(request).await?;
        usage.accumulate(&response.usage);

        let summary = compaction::render_summary(
            &extract_text(&response.content),
            &failures,
            &self.file_ops,
        );
        let transcript = compaction::rebuild_transcript(&summary, &kept);
        self.store.replace_transcript(&transcript)?;

        let compaction_count = self.store.metadata()?.compaction_count + 1;
        self.store.update_metadata(MetadataPatch {
            compaction_count: Some(compaction_count),
            model: None,
        })?;
        info!(
            compaction_count,
            transcript_len = transcript.len(),
            "compaction complete"
        );
        Ok(())
    }
}

/// Concatenated text blocks of a content array.
fn extract_text(content: &[ContentBlock]) -> String {
    content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}
