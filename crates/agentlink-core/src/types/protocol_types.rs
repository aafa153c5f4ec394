//! Agent protocol payload types
//!
//! Only the payloads used by the typed client are modelled here. Every other
//! method stays reachable through the untyped `call`/`notify` surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Agent protocol version supported by this client
pub const AGENT_PROTOCOL_VERSION: u32 = 1;

/// Client information sent in the `initialize` handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_configuration: Option<ExtensionConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<ClientCapabilities>,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "AgentLink".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: AGENT_PROTOCOL_VERSION,
            workspace_root_uri: None,
            extension_configuration: None,
            capabilities: Some(ClientCapabilities::default()),
        }
    }
}

/// Client capabilities declared during initialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    #[serde(default)]
    pub chat: bool,
    #[serde(default)]
    pub completions: bool,
    #[serde(default)]
    pub code_lenses: bool,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            chat: true,
            completions: true,
            code_lenses: true,
        }
    }
}

/// Worker information returned from `initialize`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub protocol_version: Option<u32>,
    #[serde(default)]
    pub authenticated: Option<bool>,
    #[serde(default)]
    pub cody_enabled: Option<bool>,
}

/// Connection settings handed to the worker
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionConfiguration {
    pub server_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default)]
    pub access_token: String,
    #[serde(default, rename = "anonymousUserID", skip_serializing_if = "Option::is_none")]
    pub anonymous_user_id: Option<String>,
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autocomplete_advanced_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autocomplete_advanced_server_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autocomplete_advanced_access_token: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub verbose_debug: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codebase: Option<String>,
}

// Tokens must not end up in logs.
impl fmt::Debug for ExtensionConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionConfiguration")
            .field("server_endpoint", &self.server_endpoint)
            .field("proxy", &self.proxy)
            .field("access_token", &redact(&self.access_token))
            .field("anonymous_user_id", &self.anonymous_user_id)
            .field("custom_headers", &self.custom_headers.keys().collect::<Vec<_>>())
            .field(
                "autocomplete_advanced_provider",
                &self.autocomplete_advanced_provider,
            )
            .field(
                "autocomplete_advanced_server_endpoint",
                &self.autocomplete_advanced_server_endpoint,
            )
            .field(
                "autocomplete_advanced_access_token",
                &self.autocomplete_advanced_access_token.as_deref().map(redact),
            )
            .field("debug", &self.debug)
            .field("verbose_debug", &self.verbose_debug)
            .field("codebase", &self.codebase)
            .finish()
    }
}

fn redact(token: &str) -> &'static str {
    if token.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

/// Zero-based position in a text document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// Text document state shared with the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolTextDocument {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Range>,
}

impl ProtocolTextDocument {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            content: None,
            selection: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

/// File attached as chat context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextFile {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
}

/// Message sent from the chat panel to the worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebviewMessage {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_enhanced_context: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_files: Vec<ContextFile>,
}

impl WebviewMessage {
    /// A user chat submission
    pub fn submit(text: impl Into<String>) -> Self {
        Self {
            command: "submit".to_string(),
            text: Some(text.into()),
            submit_type: Some("user".to_string()),
            add_enhanced_context: Some(false),
            context_files: Vec::new(),
        }
    }

    pub fn with_enhanced_context(mut self, enabled: bool) -> Self {
        self.add_enhanced_context = Some(enabled);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSubmitMessageParams {
    /// Chat panel id returned by `chat/new`
    pub id: String,
    pub message: WebviewMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Human,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatError {
    pub message: String,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub speaker: Speaker,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub display_text: Option<String>,
    #[serde(default)]
    pub error: Option<ChatError>,
}

/// Chat transcript update returned by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub is_message_in_progress: Option<bool>,
    #[serde(default, rename = "chatID")]
    pub chat_id: Option<String>,
}

impl ExtensionMessage {
    /// The assistant's latest reply, if any
    pub fn last_reply(&self) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.speaker == Speaker::Assistant)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerKind {
    Automatic,
    Invoke,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutocompleteParams {
    pub uri: String,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_kind: Option<TriggerKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutocompleteItem {
    pub id: String,
    pub insert_text: String,
    pub range: Range,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutocompleteResult {
    #[serde(default)]
    pub items: Vec<AutocompleteItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCommandParams {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Value>,
}

/// Worker log line (`debug/message`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugMessage {
    pub channel: String,
    pub message: String,
}

impl DebugMessage {
    pub fn is_error(&self) -> bool {
        self.message.contains("ERROR") || self.message.contains("PANIC")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolCommand {
    pub title: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub tooltip: Option<String>,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolCodeLens {
    pub range: Range,
    #[serde(default)]
    pub command: Option<ProtocolCommand>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayCodeLensParams {
    pub uri: String,
    #[serde(default)]
    pub code_lenses: Vec<ProtocolCodeLens>,
}

/// `$/cancelRequest` parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelParams {
    pub id: Value,
}
