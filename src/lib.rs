//! cardforge turns course-module learning material into verified flashcard decks.
//!
//! Source chunks flow through a two-stage LLM pipeline (summarize, then generate),
//! every candidate card is checked against the evidence it cites, and only grounded
//! cards are published. Everything that talks to the model goes through the shared
//! [`resilience`] primitives.

pub mod anthropic;
pub mod cli;
pub mod config;
pub mod content;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod resilience;
pub mod review;
pub mod state_machine;
pub mod store;
pub mod ui;
pub mod web;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::CardforgeConfig;
pub use error::CardforgeError;
pub use orchestrator::Orchestrator;
