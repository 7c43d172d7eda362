pub mod budget;
pub mod debug_buffer;
pub mod engine;
pub mod error;
pub mod guard;
pub mod metrics;
pub mod model;
pub mod ports;
pub mod resolver;
pub mod responses;
pub mod sanitize;
pub mod stream;
pub mod tool_calls;

#[cfg(test)]
mod testing;

pub use budget::{BudgetDecision, TokenBudget, estimate_prompt_tokens};
pub use debug_buffer::{DebugEntry, FormatCensus, ToolCallDebugBuffer};
pub use engine::{
    GatewayContext, GatewayEngine, GatewayParts, GatewaySettings, InboundRequest,
    PreparedRequest, StageHandler,
};
pub use error::CoreError;
pub use guard::{AccessGuard, extract_credential};
pub use metrics::{MetricsSnapshot, ToolCallMetrics};
pub use model::{Account, BackendSpec, Credential, ModelRegistration, ServerNode, UsageRecord};
pub use ports::{
    AccountStore, BackendClient, CredentialStore, LineStream, ModelRegistry, ServerPool,
    UsageStore,
};
pub use resolver::{BackendAddress, BackendResolver, LoopbackPolicy};
pub use responses::{PreparedResponse, response_events};
pub use sanitize::{SanitizeOptions, SanitizedRequest, accepts_event_stream};
pub use stream::{ReassemblyStep, StreamReassembler};
