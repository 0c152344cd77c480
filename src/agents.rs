use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use eventsource_stream::{EventStreamError, Eventsource};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::{CitationStyle, FinalAnswer, ResponseAggregator};
use crate::auth::CredentialSigner;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::stream::parse_payload;

const USER_AGENT: &str = concat!("cortex-agent-chat/", env!("CARGO_PKG_VERSION"));
const TOKEN_TYPE_HEADER: &str = "X-Snowflake-Authorization-Token-Type";
const KEYPAIR_JWT: &str = "KEYPAIR_JWT";

pub const SEARCH_TOOL_TYPE: &str = "cortex_search";
pub const ANALYST_TOOL_TYPE: &str = "cortex_analyst_text_to_sql";

// ============================================================================
// Request Types (matching the agent:run API)
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: Vec<MessageContent>,
}

impl Message {
    pub fn new_user(text: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: vec![MessageContent::Text {
                text: text.to_string(),
            }],
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum MessageContent {
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Tool {
    pub tool_spec: ToolSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ToolResource {
    // search specific fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_results: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_column: Option<String>,

    // text2sql specific fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_model_file: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AgentRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
    pub tool_resources: HashMap<String, ToolResource>,
}

impl AgentRequest {
    /// A single-turn request declaring the search and text-to-SQL tools.
    pub fn for_query(config: &AgentConfig, query: &str) -> Self {
        let search = &config.search;
        let analyst = &config.analyst;

        let tools = vec![
            Tool {
                tool_spec: ToolSpec {
                    tool_type: SEARCH_TOOL_TYPE.to_string(),
                    name: search.tool_name.clone(),
                },
            },
            Tool {
                tool_spec: ToolSpec {
                    tool_type: ANALYST_TOOL_TYPE.to_string(),
                    name: analyst.tool_name.clone(),
                },
            },
        ];

        let mut tool_resources = HashMap::new();
        tool_resources.insert(
            search.tool_name.clone(),
            ToolResource {
                name: Some(search.service.clone()),
                max_results: Some(search.max_results),
                title_column: Some(search.title_column.clone()),
                id_column: Some(search.id_column.clone()),
                ..ToolResource::default()
            },
        );
        tool_resources.insert(
            analyst.tool_name.clone(),
            ToolResource {
                semantic_model_file: Some(analyst.semantic_model_file.clone()),
                ..ToolResource::default()
            },
        );

        Self {
            model: config.model.clone(),
            messages: vec![Message::new_user(query)],
            tools,
            tool_resources,
        }
    }
}

// ============================================================================
// Stream driver
// ============================================================================

/// A body chunk, or the blank line appended once the body ends.
enum Chunk<B> {
    Body(B),
    Terminator,
}

impl<B: AsRef<[u8]>> AsRef<[u8]> for Chunk<B> {
    fn as_ref(&self) -> &[u8] {
        match self {
            Chunk::Body(bytes) => bytes.as_ref(),
            Chunk::Terminator => b"\n\n",
        }
    }
}

/// Drains an SSE byte stream into a [`FinalAnswer`].
///
/// Records are framed by `eventsource-stream`, so a record split across reads
/// or several records in one read are handled before parsing. A final record
/// the server did not close with a blank line is still dispatched. The answer
/// is only produced once the byte stream ends; a transport error part way
/// through discards everything accumulated so far.
pub async fn collect_answer<S, B, E>(
    bytes: S,
    citation_style: CitationStyle,
) -> Result<FinalAnswer, AgentError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    let mut aggregator = ResponseAggregator::new(citation_style);
    let framed = bytes
        .map(|chunk| chunk.map(Chunk::Body))
        .chain(stream::once(async { Ok(Chunk::Terminator) }));
    let mut events = Box::pin(framed.eventsource());

    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                debug!(event = %event.event, data = %event.data, "agent stream record");
                aggregator.fold(parse_payload(&event.data));
            }
            Err(EventStreamError::Transport(e)) => {
                return Err(AgentError::Stream(e.to_string()));
            }
            Err(e) => warn!(error = %e, "skipping unreadable stream record"),
        }
    }

    Ok(aggregator.finish())
}

// ============================================================================
// Client Implementation
// ============================================================================

/// Sends questions to a Cortex agent and assembles the streamed answers.
///
/// Cheap to clone; clones share the HTTP connection pool and the signer.
#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    signer: Arc<CredentialSigner>,
    config: Arc<AgentConfig>,
    endpoint: String,
}

impl AgentClient {
    pub fn new(config: AgentConfig, signer: Arc<CredentialSigner>) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout)
            .build()?;
        let endpoint = config.endpoint_url();

        Ok(Self {
            http,
            signer,
            config: Arc::new(config),
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn signer(&self) -> &CredentialSigner {
        &self.signer
    }

    /// Asks a question, turning any failure into [`FinalAnswer::failure`].
    pub async fn ask(&self, query: &str) -> FinalAnswer {
        match self.try_ask(query).await {
            Ok(answer) => answer,
            Err(e) => {
                error!(error = %e, "agent request failed");
                FinalAnswer::failure()
            }
        }
    }

    pub async fn try_ask(&self, query: &str) -> Result<FinalAnswer, AgentError> {
        let request_id = Uuid::new_v4();
        self.run(query)
            .instrument(info_span!("agent_request", %request_id))
            .await
    }

    async fn run(&self, query: &str) -> Result<FinalAnswer, AgentError> {
        let token = self.signer.current_token()?;
        let request_body = AgentRequest::for_query(&self.config, query);

        if tracing::enabled!(tracing::Level::DEBUG) {
            let request_body_json = serde_json::to_string_pretty(&request_body)
                .unwrap_or_else(|e| format!("Failed to serialize request body: {}", e));
            debug!("agent request body:\n{}", request_body_json);
        }

        let response = self
            .http
            .post(&self.endpoint)
            .header(TOKEN_TYPE_HEADER, KEYPAIR_JWT)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .bearer_auth(token)
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AgentError::Status { status, body });
        }

        collect_answer(response.bytes_stream(), self.config.citation_style).await
    }
}

impl fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.config.model)
            .field("signer", &self.signer)
            .finish()
    }
}
