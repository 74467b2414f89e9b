mod conversation;

use anyhow::Result;
use gemcode_core::{AgentConfig, Message, Part, TokenUsage};
use gemcode_llm::ModelClient;
use gemcode_observe::Observer;
use gemcode_tools::ToolDispatcher;
use std::sync::Arc;
use thiserror::Error;

pub use conversation::ConversationState;

/// Built-in system instruction, used when the settings file does not
/// override it.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "\
You are a helpful AI coding agent.

When a user asks a question or makes a request, make a function call plan. \
You can perform the following operations:

- List files and directories
- Read file contents
- Write or overwrite files
- Execute Python files with optional arguments

All paths you provide should be relative to the working directory. You do not \
need to specify the working directory in your function calls as it is \
automatically injected for security reasons.";

#[derive(Debug, Error)]
pub enum LoopError {
    /// The round budget ran out before the model produced a final answer.
    #[error("no final response after {rounds} rounds; aborting")]
    IterationBudgetExceeded { rounds: u64 },
    /// A round dispatched tool calls but none of them produced a
    /// well-formed response part. The standard dispatcher always yields a
    /// result or error payload, so this only fires for a broken dispatcher;
    /// it is a hard stop because the model-turn message carrying the calls
    /// is already in the history.
    #[error("tool dispatch produced no usable results")]
    NoToolResults,
}

/// What a completed run produced.
#[derive(Debug)]
pub struct RunOutcome {
    /// The model's final plain-text answer.
    pub text: String,
    /// Rounds consumed, including faulted ones.
    pub rounds: u64,
    /// Token usage summed over every well-formed response.
    pub usage: TokenUsage,
    /// Rounds lost to malformed responses or transport faults.
    pub faults: u64,
}

/// The agent loop: one model call per round, dispatching any requested tool
/// calls and feeding the results back until the model answers in plain text
/// or the round budget runs out.
pub struct AgentLoop {
    client: Arc<dyn ModelClient + Send + Sync>,
    dispatcher: ToolDispatcher,
    observer: Arc<Observer>,
    cfg: AgentConfig,
}

impl AgentLoop {
    pub fn new(
        client: Arc<dyn ModelClient + Send + Sync>,
        dispatcher: ToolDispatcher,
        observer: Arc<Observer>,
        cfg: AgentConfig,
    ) -> Self {
        Self {
            client,
            dispatcher,
            observer,
            cfg,
        }
    }

    fn system_instruction(&self) -> &str {
        if self.cfg.system_instruction.is_empty() {
            DEFAULT_SYSTEM_INSTRUCTION
        } else {
            &self.cfg.system_instruction
        }
    }

    /// Run the loop to completion for one user prompt.
    ///
    /// A round that fails before anything is appended — transport fault from
    /// the client, or a response missing its usage metadata — is logged,
    /// counted against the budget, and retried; nothing from such a round
    /// enters the history. A dispatched round yielding zero usable tool
    /// results instead aborts the run: the history must never advance with
    /// responses missing for calls already appended.
    pub fn run(&self, prompt: &str) -> Result<RunOutcome> {
        let mut state = ConversationState::new();
        state.push(Message::user(prompt));
        self.observer.verbose_log(&format!("User prompt: {prompt}"));

        let tools = self.dispatcher.declarations();
        let system = self.system_instruction();
        let mut usage_total = TokenUsage::default();
        let mut faults: u64 = 0;

        for round in 1..=self.cfg.max_rounds {
            self.observer.log(&format!("round {round} started"));
            let turn = match self.client.generate_turn(state.history(), &tools, system) {
                Ok(turn) => turn,
                Err(err) => {
                    faults += 1;
                    self.observer
                        .warn_log(&format!("round {round} failed: {err}"));
                    continue;
                }
            };

            let Some(usage) = turn.usage else {
                faults += 1;
                self.observer.warn_log(&format!(
                    "round {round} returned a malformed response (missing usage metadata)"
                ));
                continue;
            };
            usage_total.accumulate(&usage);
            self.observer
                .verbose_log(&format!("Prompt tokens: {}", usage.prompt_tokens));
            self.observer
                .verbose_log(&format!("Response tokens: {}", usage.response_tokens));

            if turn.tool_calls.is_empty() {
                let Some(text) = turn.text.filter(|t| !t.is_empty()) else {
                    // Neither text nor tool calls: nothing to append or act on.
                    faults += 1;
                    self.observer
                        .warn_log(&format!("round {round} returned an empty response"));
                    continue;
                };
                state.push(Message::model(vec![Part::text(text.clone())]));
                self.observer.log(&format!("run finished in {round} rounds"));
                return Ok(RunOutcome {
                    text,
                    rounds: round,
                    usage: usage_total,
                    faults,
                });
            }

            let mut model_parts = Vec::new();
            if let Some(text) = &turn.text {
                model_parts.push(Part::text(text.clone()));
            }
            for call in &turn.tool_calls {
                model_parts.push(Part::FunctionCall {
                    name: call.name.clone(),
                    args: call.args.clone(),
                });
            }
            state.push(Message::model(model_parts));

            let mut response_parts = Vec::new();
            for call in &turn.tool_calls {
                let part = self.dispatcher.dispatch(call);
                if !part.is_well_formed_response() {
                    self.observer.warn_log(&format!(
                        "discarding malformed result for tool {}",
                        call.name
                    ));
                    continue;
                }
                if self.observer.is_verbose()
                    && let Part::FunctionResponse { response, .. } = &part
                {
                    self.observer.verbose_log(&format!("-> {response}"));
                }
                response_parts.push(part);
            }
            if response_parts.is_empty() {
                return Err(LoopError::NoToolResults.into());
            }
            state.push(Message::tool(response_parts));
        }

        Err(LoopError::IterationBudgetExceeded {
            rounds: self.cfg.max_rounds,
        }
        .into())
    }
}
