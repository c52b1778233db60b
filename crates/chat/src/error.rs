use phoenix_llm::ProviderError;
use phoenix_storage::StorageError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("model API key is not configured; set `model_api_key` or GEMINI_API_KEY"))]
    MissingCredential { stage: &'static str },
    #[snafu(display("model provider failed on `{stage}`: {source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("chat history storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;
