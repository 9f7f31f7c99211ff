//! Client-side realtime chat engine: one shared connection, optimistic message
//! delivery, typing presence and chat switching.

pub mod api;
pub mod config;
pub mod delivery;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod render;
pub mod session;
pub mod transport;
pub mod typing;

pub use api::{ChatBackend, HttpChatApi};
pub use config::{load_config, ClientConfig};
pub use delivery::{DeliveryOptions, DeliveryPipeline, InboundOutcome, SessionPage};
pub use error::{ChatError, ChatResult};
pub use gateway::{ConnectionGateway, ConnectionState, GatewayOptions, InboundHandler};
pub use orchestrator::{ChatSessionOrchestrator, NavigationHistory, SessionPhase, SwitchOutcome};
pub use render::{EventRenderSink, RenderEvent, RenderSink};
pub use session::{ActiveSession, SessionReader};
pub use transport::{RealtimeTransport, WebSocketTransport};
pub use typing::{format_typing_summary, TypingEntry, TypingOptions, TypingTracker};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
