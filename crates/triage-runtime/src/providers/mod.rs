pub mod gemini;

pub use gemini::{
    GeminiChatModel, GeminiConfig, DEFAULT_GEMINI_MODEL, DEFAULT_MODEL_TIMEOUT, DEFAULT_TEMPERATURE,
};
