//! Conversation engine: the multi-round LLM/tool state machine.
//!
//! One call to [`ChatEngine::run_turn`] drives a turn:
//!
//! ```text
//! BuildingContext → CallingLlm ─┬─ no tool calls ──────────────→ Finished
//!                       ▲       └─ tool calls → ExecutingTools ─┬─ round done ──┐
//!                       └───────────────────────────────────────┼───────────────┘
//!                                                               └─ auth required → AuthInterrupted
//! ```
//!
//! Every message is persisted atomically before its frames are streamed, so a
//! client that reloads history sees exactly what was streamed. Fatal errors
//! leave already-committed messages in place.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;

use super::errors::ChatError;
use super::history::{render_tool_content, to_provider_messages};
use super::locks::ChatLocks;
use super::stream::{AuthRequestData, FrameSink, StreamFrame, SystemMessageData};
use crate::inference::{AssistantReply, ChatMessage, LlmClient, Role, ToolCall, ToolCallResponse, ToolDefinition};
use crate::store::{AuthRequest, MessageRole, NewMessage, Part, Store, StoredMessage};
use crate::tool_server::registry::split_qualified;
use crate::tool_server::{CatalogEntry, ToolCatalog, ToolDispatcher, ToolOutcome};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Tool result body persisted when a tool reports expired credentials.
pub const AUTH_REQUIRED_BODY: &str = "Function could not be executed because user is unauthorized. User must re-authenticate to continue.";

fn tools_disabled_message(instance_id: &str) -> String {
    format!(
        "Tools for the tool server instance `{instance_id}` have been disabled. Do not call these functions as they will not work. When the user has re-authenticated you will be notified and can use the tools."
    )
}

fn reauthenticated_message(provider: &str) -> String {
    format!("The user has re-authenticated with `{provider}`. Tools that use it are available again.")
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// The `engine:` section of `toolchat.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on LLM calls per turn.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    /// Feed tool errors back to the model instead of aborting the turn.
    #[serde(default)]
    pub continue_on_tool_error: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            continue_on_tool_error: false,
        }
    }
}

fn default_max_rounds() -> usize {
    16
}

// ─── Turn State ──────────────────────────────────────────────────────────────

enum TurnState {
    BuildingContext,
    CallingLlm,
    ExecutingTools(Vec<ToolCall>),
    Finished,
    AuthInterrupted(String),
}

/// How a turn that did not fail came to an end.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The model replied without tool calls.
    Completed { rounds: usize },
    /// A tool reported expired credentials; the turn waits for re-authentication.
    AuthRequired { auth_request_id: String },
}

enum RoundOutcome {
    Completed,
    AuthInterrupted(String),
}

// ─── ChatEngine ──────────────────────────────────────────────────────────────

pub struct ChatEngine {
    store: Arc<Store>,
    llm: Arc<dyn LlmClient>,
    dispatcher: Arc<dyn ToolDispatcher>,
    locks: ChatLocks,
    config: EngineConfig,
}

impl ChatEngine {
    pub fn new(
        store: Arc<Store>,
        llm: Arc<dyn LlmClient>,
        dispatcher: Arc<dyn ToolDispatcher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            llm,
            dispatcher,
            locks: ChatLocks::new(),
            config,
        }
    }

    /// Validate an inbound message and resolve its chat, minting one when
    /// `chat_id` is absent. Nothing else is persisted.
    pub fn prepare_chat(&self, chat_id: Option<&str>, content: &str) -> Result<String, ChatError> {
        validate_content(content)?;
        match chat_id {
            Some(id) => {
                if !self.store.chat_exists(id)? {
                    return Err(ChatError::ChatNotFound {
                        chat_id: id.to_string(),
                    });
                }
                Ok(id.to_string())
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                self.store.create_chat(&id)?;
                tracing::info!(chat_id = %id, "chat created");
                Ok(id)
            }
        }
    }

    /// Run a turn in its own task and return the frame stream.
    ///
    /// The task is not tied to the receiver: a client that disconnects stops
    /// reading, the turn still runs to completion.
    pub fn spawn_turn(
        self: &Arc<Self>,
        chat_id: String,
        content: String,
    ) -> tokio::sync::mpsc::UnboundedReceiver<StreamFrame> {
        let (sink, rx) = FrameSink::channel();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.run_turn(&chat_id, &content, &sink).await {
                Ok(_) => {
                    sink.send(StreamFrame::Finish);
                    sink.send(StreamFrame::Done);
                }
                Err(e) => {
                    tracing::warn!(chat_id = %chat_id, error = %e, "turn aborted");
                    sink.send(StreamFrame::Error {
                        error_text: e.to_string(),
                    });
                }
            }
        });
        rx
    }

    /// Drive one turn for an existing chat. Frames go to `sink`; the caller
    /// emits the closing `finish` / `[DONE]` or `error`.
    pub async fn run_turn(
        &self,
        chat_id: &str,
        content: &str,
        sink: &FrameSink,
    ) -> Result<TurnOutcome, ChatError> {
        validate_content(content)?;
        let _guard = self.locks.acquire(chat_id).await;

        self.store.insert_message(chat_id, &NewMessage::human(content))?;

        let mut history: Vec<ChatMessage> = Vec::new();
        let mut catalog = ToolCatalog::default();
        let mut tools: Vec<ToolDefinition> = Vec::new();
        let mut seen_call_ids: HashSet<String> = HashSet::new();
        let mut rounds = 0usize;
        let mut state = TurnState::BuildingContext;

        loop {
            state = match state {
                TurnState::BuildingContext => {
                    let stored = self.store.get_messages(chat_id)?;
                    seen_call_ids = requested_call_ids(&stored);
                    history = to_provider_messages(&stored);
                    catalog = ToolCatalog::build(&self.store)?;
                    tools = tool_definitions(&catalog);
                    TurnState::CallingLlm
                }
                TurnState::CallingLlm => {
                    if rounds >= self.config.max_rounds {
                        return Err(ChatError::Upstream {
                            reason: format!(
                                "turn exceeded {} LLM rounds",
                                self.config.max_rounds
                            ),
                        });
                    }
                    rounds += 1;
                    tracing::info!(
                        chat_id = %chat_id,
                        round = rounds,
                        messages = history.len(),
                        tools = tools.len(),
                        "calling LLM"
                    );

                    let mut reply = self.llm.complete(&history, &tools).await?;
                    reissue_duplicate_call_ids(chat_id, &mut reply.tool_calls, &mut seen_call_ids);
                    self.persist_reply(chat_id, &reply, sink)?;
                    history.push(assistant_message(&reply));

                    if reply.tool_calls.is_empty() {
                        TurnState::Finished
                    } else {
                        TurnState::ExecutingTools(reply.tool_calls)
                    }
                }
                TurnState::ExecutingTools(calls) => {
                    match self
                        .execute_round(chat_id, &catalog, &calls, &mut history, sink)
                        .await?
                    {
                        RoundOutcome::Completed => TurnState::CallingLlm,
                        RoundOutcome::AuthInterrupted(id) => TurnState::AuthInterrupted(id),
                    }
                }
                TurnState::Finished => {
                    tracing::info!(chat_id = %chat_id, rounds, "turn completed");
                    return Ok(TurnOutcome::Completed { rounds });
                }
                TurnState::AuthInterrupted(auth_request_id) => {
                    tracing::info!(
                        chat_id = %chat_id,
                        auth_request_id = %auth_request_id,
                        "turn paused for re-authentication"
                    );
                    return Ok(TurnOutcome::AuthRequired { auth_request_id });
                }
            };
        }
    }

    /// Full persisted history of a chat.
    pub fn history(&self, chat_id: &str) -> Result<Vec<StoredMessage>, ChatError> {
        if !self.store.chat_exists(chat_id)? {
            return Err(ChatError::ChatNotFound {
                chat_id: chat_id.to_string(),
            });
        }
        Ok(self.store.get_messages(chat_id)?)
    }

    /// Store the user's new refresh token, resolve every open auth request for
    /// `provider` and tell each affected chat that its tools work again.
    pub async fn reauthenticate(
        &self,
        provider: &str,
        refresh_token: &str,
    ) -> Result<Vec<AuthRequest>, ChatError> {
        if refresh_token.trim().is_empty() {
            return Err(ChatError::Validation {
                reason: "refresh_token must not be empty".into(),
            });
        }

        self.store.upsert_oauth_token(provider, refresh_token)?;
        let resolved = self.store.resolve_auth_requests(provider)?;

        let mut notified: Vec<&str> = Vec::new();
        for request in &resolved {
            if notified.contains(&request.chat_id.as_str()) {
                continue;
            }
            let _guard = self.locks.acquire(&request.chat_id).await;
            self.store.insert_message(
                &request.chat_id,
                &NewMessage::system(&reauthenticated_message(provider)),
            )?;
            notified.push(&request.chat_id);
        }

        tracing::info!(
            provider = %provider,
            resolved = resolved.len(),
            chats = notified.len(),
            "auth requests resolved"
        );
        Ok(resolved)
    }

    // ─── Internals ───────────────────────────────────────────────────────

    /// Persist the assistant reply as one message, then stream its parts.
    fn persist_reply(
        &self,
        chat_id: &str,
        reply: &AssistantReply,
        sink: &FrameSink,
    ) -> Result<StoredMessage, ChatError> {
        let text = reply.text.clone().unwrap_or_default();
        let with_text = !text.is_empty() || reply.tool_calls.is_empty();

        let mut parts = Vec::with_capacity(reply.tool_calls.len() + 1);
        if with_text {
            parts.push(Part::Text {
                content: text.clone(),
            });
        }
        for (index, call) in reply.tool_calls.iter().enumerate() {
            parts.push(Part::ToolCallRequest {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                index: index as u32,
            });
        }

        let stored = self.store.insert_message(
            chat_id,
            &NewMessage {
                role: MessageRole::Assistant,
                parts,
                auth_request_id: None,
                stop_reason: reply.stop_reason.clone(),
            },
        )?;

        sink.send(StreamFrame::Start {
            message_id: stored.id.clone(),
        });
        if with_text {
            sink.send_text(&format!("{}-text", stored.id), &text);
        }
        for call in &reply.tool_calls {
            sink.send(StreamFrame::ToolInputStart {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
            });
            sink.send(StreamFrame::ToolInputAvailable {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                input: serde_json::from_str(&call.arguments)
                    .unwrap_or_else(|_| serde_json::Value::String(call.arguments.clone())),
            });
        }
        Ok(stored)
    }

    /// Execute one round's calls sequentially, in the order the model gave them.
    async fn execute_round(
        &self,
        chat_id: &str,
        catalog: &ToolCatalog,
        calls: &[ToolCall],
        history: &mut Vec<ChatMessage>,
        sink: &FrameSink,
    ) -> Result<RoundOutcome, ChatError> {
        for call in calls {
            let entry = catalog.get(&call.name).ok_or_else(|| ChatError::Upstream {
                reason: format!("model called unknown tool '{}'", call.name),
            })?;
            let arguments = parse_arguments(call)?;
            let instance_id = split_qualified(&call.name)
                .map(|(instance, _)| instance)
                .unwrap_or(entry.instance_id.as_str());

            tracing::info!(
                chat_id = %chat_id,
                tool_call_id = %call.id,
                instance_id = %instance_id,
                tool = %entry.tool_name,
                "dispatching tool call"
            );

            let outcome = self
                .dispatcher
                .call_tool(&entry.address, &entry.tool_name, arguments, &call.id)
                .await?;

            match outcome {
                ToolOutcome::Success { content } => {
                    self.persist_result(chat_id, &call.id, &content, false, sink)?;
                    history.push(ChatMessage::tool(&call.id, render_tool_content(&content)));
                }
                ToolOutcome::ToolError { content } => {
                    self.persist_result(chat_id, &call.id, &content, true, sink)?;
                    if !self.config.continue_on_tool_error {
                        return Err(ChatError::Upstream {
                            reason: format!(
                                "tool '{}' failed: {}",
                                call.name,
                                render_tool_content(&content)
                            ),
                        });
                    }
                    history.push(ChatMessage::tool(&call.id, render_tool_content(&content)));
                }
                ToolOutcome::AuthRequired { provider } => {
                    let provider = provider.or_else(|| entry.provider.clone()).ok_or_else(|| {
                        ChatError::Upstream {
                            reason: format!(
                                "tool '{}' reported an auth failure but has no OAuth provider",
                                call.name
                            ),
                        }
                    })?;
                    let auth_request_id =
                        self.interrupt_for_auth(chat_id, &call.id, entry, &provider, sink)?;
                    return Ok(RoundOutcome::AuthInterrupted(auth_request_id));
                }
            }
        }
        Ok(RoundOutcome::Completed)
    }

    fn persist_result(
        &self,
        chat_id: &str,
        tool_call_id: &str,
        content: &[serde_json::Value],
        is_error: bool,
        sink: &FrameSink,
    ) -> Result<(), ChatError> {
        let json = serde_json::to_string(content).map_err(crate::store::StoreError::from)?;
        self.store.insert_message(
            chat_id,
            &NewMessage::tool_result(tool_call_id, json, is_error),
        )?;
        sink.send(StreamFrame::ToolOutputAvailable {
            tool_call_id: tool_call_id.to_string(),
            output: serde_json::Value::Array(content.to_vec()),
        });
        Ok(())
    }

    /// Record the failed call, open an auth request and stream both.
    fn interrupt_for_auth(
        &self,
        chat_id: &str,
        tool_call_id: &str,
        entry: &CatalogEntry,
        provider: &str,
        sink: &FrameSink,
    ) -> Result<String, ChatError> {
        let body = serde_json::json!([{"type": "text", "text": AUTH_REQUIRED_BODY}]).to_string();
        self.store
            .insert_message(chat_id, &NewMessage::tool_result(tool_call_id, body, true))?;
        sink.send(StreamFrame::ToolOutputError {
            tool_call_id: tool_call_id.to_string(),
            error_text: AUTH_REQUIRED_BODY.to_string(),
        });

        let text = tools_disabled_message(&entry.instance_id);
        let (request, message) = self.store.insert_auth_interrupt(
            chat_id,
            provider,
            Some(&entry.instance_id),
            &text,
        )?;
        tracing::warn!(
            chat_id = %chat_id,
            instance_id = %entry.instance_id,
            provider = %provider,
            auth_request_id = %request.id,
            "tool credentials rejected; auth request opened"
        );

        sink.send(StreamFrame::DataSystemMessage {
            id: message.id,
            data: SystemMessageData {
                text,
                auth_request_id: request.id.clone(),
                provider: provider.to_string(),
            },
        });
        sink.send(StreamFrame::DataAuthRequest {
            id: request.id.clone(),
            data: AuthRequestData {
                provider: provider.to_string(),
                authorization_url: self.authorization_url(provider, &request.id)?,
            },
        });
        Ok(request.id)
    }

    /// Consent URL for `provider`, carrying the auth request id as `state`.
    fn authorization_url(
        &self,
        provider: &str,
        auth_request_id: &str,
    ) -> Result<Option<String>, ChatError> {
        let Some(p) = self.store.get_oauth_provider(provider)? else {
            tracing::warn!(provider = %provider, "auth request for unregistered provider");
            return Ok(None);
        };
        let scope = p.scopes.join(" ");
        let url = reqwest::Url::parse_with_params(
            &p.authorization_endpoint,
            &[
                ("client_id", p.client_id.as_str()),
                ("redirect_uri", p.callback_url.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", auth_request_id),
            ],
        );
        match url {
            Ok(url) => Ok(Some(url.to_string())),
            Err(e) => {
                tracing::warn!(provider = %provider, error = %e, "invalid authorization endpoint");
                Ok(None)
            }
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn validate_content(content: &str) -> Result<(), ChatError> {
    if content.trim().is_empty() {
        return Err(ChatError::Validation {
            reason: "message content must not be empty".into(),
        });
    }
    Ok(())
}

fn tool_definitions(catalog: &ToolCatalog) -> Vec<ToolDefinition> {
    catalog
        .entries()
        .iter()
        .map(|entry| {
            let parameters = if entry.input_schema.is_object() {
                entry.input_schema.clone()
            } else {
                serde_json::json!({"type": "object", "properties": {}})
            };
            ToolDefinition::function(&entry.qualified_name, &entry.description, parameters)
        })
        .collect()
}

fn assistant_message(reply: &AssistantReply) -> ChatMessage {
    ChatMessage {
        role: Role::Assistant,
        content: reply.text.clone().filter(|t| !t.is_empty()),
        tool_call_id: None,
        tool_calls: (!reply.tool_calls.is_empty())
            .then(|| reply.tool_calls.iter().map(ToolCallResponse::from).collect()),
    }
}

fn requested_call_ids(messages: &[StoredMessage]) -> HashSet<String> {
    messages
        .iter()
        .flat_map(|m| m.parts.iter())
        .filter_map(|part| match part {
            Part::ToolCallRequest { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect()
}

/// Give a fresh id to every call whose id was already requested in this chat,
/// so each id is executed and answered at most once.
fn reissue_duplicate_call_ids(chat_id: &str, calls: &mut [ToolCall], seen: &mut HashSet<String>) {
    for call in calls.iter_mut() {
        if call.id.is_empty() || seen.contains(&call.id) {
            let fresh = format!("call_{}", uuid::Uuid::new_v4().simple());
            tracing::warn!(
                chat_id = %chat_id,
                reused_id = %call.id,
                new_id = %fresh,
                "model reused a tool call id"
            );
            call.id = fresh;
        }
        seen.insert(call.id.clone());
    }
}

/// Arguments must decode to a JSON object. An empty string means no arguments.
fn parse_arguments(call: &ToolCall) -> Result<serde_json::Value, ChatError> {
    if call.arguments.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    match serde_json::from_str::<serde_json::Value>(&call.arguments) {
        Ok(value) if value.is_object() => Ok(value),
        Ok(_) => Err(ChatError::Upstream {
            reason: format!("arguments for '{}' are not a JSON object", call.name),
        }),
        Err(e) => Err(ChatError::Upstream {
            reason: format!("arguments for '{}' are not valid JSON: {e}", call.name),
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
