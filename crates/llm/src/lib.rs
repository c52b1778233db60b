use std::sync::Arc;

mod model;
mod provider;
mod rig_adapter;
mod session;

pub use model::{DEFAULT_GEMINI_MODEL, GenerationConfig};
pub use provider::{
    BoxFuture, LlmProvider, ProviderConfig, ProviderError, ProviderEventStream, ProviderResult,
    ProviderStreamHandle, ProviderWorker, StreamEventMapped, StreamEventPayload, StreamRequest,
    StreamTarget, make_event_stream,
};
pub use rig_adapter::{GeminiProvider, RIG_GEMINI_PROVIDER_ID};
pub use session::{ModelSession, SessionHandle, SessionStream};

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_GEMINI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "gemini" | "google" | "rig-gemini" => {
            config.provider_id = RIG_GEMINI_PROVIDER_ID.to_string();
            Ok(Arc::new(GeminiProvider::new(config)?))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}
