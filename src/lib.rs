//! Key-pair authenticated streaming client for Snowflake Cortex agents.
//!
//! A question goes out as one `agent:run` request; the answer comes back as
//! an SSE stream of text deltas interleaved with tool results (generated SQL,
//! search citations), which is folded into a single [`FinalAnswer`].

pub mod agents;
pub mod aggregate;
pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod stream;

pub use agents::{collect_answer, AgentClient, AgentRequest};
pub use aggregate::{AnswerKind, CitationStyle, FinalAnswer, ResponseAggregator};
pub use auth::{Clock, Credential, CredentialSigner, KeyMaterial, Principal, SystemClock, TokenTimings};
pub use config::{AgentConfig, WarehouseConfig};
pub use engine::{QueryExecutor, QueryResult, SnowflakeEngine};
pub use error::{AgentError, ConfigError, CredentialError, QueryError};
pub use stream::{parse_payload, parse_record, MessageDelta, StreamEvent, ToolResult};
