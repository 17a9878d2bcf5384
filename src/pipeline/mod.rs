//! The card pipeline: Stage A summarizes a module's chunks, Stage B drafts evidence-backed
//! cards, and the verifier decides which of them may be published.

pub mod error;
pub mod generator;
pub mod json;
pub mod llm;
pub mod summarizer;
pub mod text;
pub mod types;
pub mod verifier;

pub use error::StageError;
pub use generator::{Generator, GeneratorSettings};
pub use llm::{LLM_BREAKER_KEY, LlmInvoker};
pub use summarizer::Summarizer;
pub use types::{
    CandidateCard, Chunk, Deck, Difficulty, Evidence, HallucinationRisk, StageAOutput, Verdict,
};
pub use verifier::{BatchVerification, VerificationMode, Verifier};
