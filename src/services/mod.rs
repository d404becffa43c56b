pub mod embedding_provider;
pub mod gemini;
pub mod vector_index;

pub use embedding_provider::{
    EmbeddingBatch, EmbeddingProvider, ProviderError, RetryPolicy, RetryingProvider,
};
pub use gemini::GeminiProvider;
pub use vector_index::{VectorIndex, VectorIndexError, VectorIndexProvider};
