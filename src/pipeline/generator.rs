//! Stage B: candidate flashcards with cited evidence.

use std::collections::HashMap;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::StageError;
use super::json::parse_model_json;
use super::llm::LlmInvoker;
use super::text;
use super::types::{CandidateCard, Chunk, Difficulty, Evidence, StageAOutput};

const SYSTEM_PROMPT: &str = "You write study flashcards. Every answer must be supported by the \
course material you are given, and you cite the chunk ids you used. You answer with JSON only.";

const EXCERPT_CHARS: usize = 280;

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorSettings {
    pub cards_per_module: usize,
    pub min_cards: usize,
    pub max_prompt_chars: usize,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            cards_per_module: 10,
            min_cards: 1,
            max_prompt_chars: 24_000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvidence {
    chunk_id: String,
    #[serde(default)]
    excerpt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCard {
    #[serde(default)]
    question: String,
    #[serde(default)]
    answer: String,
    #[serde(default)]
    difficulty: Option<String>,
    #[serde(default)]
    evidence: Vec<RawEvidence>,
}

/// Models reply with either `{"cards": [...]}` or a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDeck {
    Wrapped { cards: Vec<RawCard> },
    Bare(Vec<RawCard>),
}

impl RawDeck {
    fn into_cards(self) -> Vec<RawCard> {
        match self {
            RawDeck::Wrapped { cards } | RawDeck::Bare(cards) => cards,
        }
    }
}

pub struct Generator {
    llm: Option<LlmInvoker>,
    settings: GeneratorSettings,
}

impl Generator {
    /// `llm = None` runs the deterministic offline mode.
    pub fn new(llm: Option<LlmInvoker>, settings: GeneratorSettings) -> Self {
        Self { llm, settings }
    }

    pub async fn generate(
        &self,
        stage_a: &StageAOutput,
        chunks: &[Chunk],
        cancel: &CancellationToken,
    ) -> Result<Vec<CandidateCard>, StageError> {
        if chunks.is_empty() {
            return Err(StageError::InsufficientContent);
        }

        let cards = match &self.llm {
            None => generate_mock(stage_a, chunks, self.settings.cards_per_module),
            Some(llm) => {
                let prompt = build_prompt(stage_a, chunks, &self.settings);
                let raw_cards = llm
                    .complete_parsed(SYSTEM_PROMPT, &prompt, cancel, |reply| {
                        parse_model_json::<RawDeck>(reply).map(RawDeck::into_cards)
                    })
                    .await?;
                normalize(raw_cards, chunks, stage_a.estimated_difficulty)
            }
        };

        let mut cards = cards;
        cards.truncate(self.settings.cards_per_module);
        if cards.len() < self.settings.min_cards.max(1) {
            return Err(StageError::GenerationEmpty {
                produced: cards.len(),
                required: self.settings.min_cards.max(1),
            });
        }

        info!(
            module_id = %stage_a.module_id,
            cards = cards.len(),
            "stage B complete"
        );
        Ok(cards)
    }
}

fn build_prompt(stage_a: &StageAOutput, chunks: &[Chunk], settings: &GeneratorSettings) -> String {
    let mut material = String::new();
    for chunk in chunks {
        let block = format!("[{}]\n{}\n\n", chunk.chunk_id, chunk.text.trim());
        if !material.is_empty() && material.len() + block.len() > settings.max_prompt_chars {
            break;
        }
        material.push_str(&text::clip(&block, settings.max_prompt_chars));
    }

    format!(
        "Write {count} flashcards for module {module}.\n\
         Target difficulty: {difficulty}.\n\
         Learning objectives:\n{objectives}\n\
         Key terms: {terms}\n\
         \n\
         Respond with ONLY valid JSON in this format:\n\
         {{\"cards\": [\n  \
           {{\"question\": \"...\", \"answer\": \"...\", \"difficulty\": \"beginner|intermediate|advanced\",\n   \
             \"evidence\": [{{\"chunk_id\": \"<id from the material>\", \"excerpt\": \"<verbatim supporting text>\"}}]}}\n\
         ]}}\n\
         \n\
         Rules:\n\
         - Every card cites at least one chunk id from the material\n\
         - Excerpts are copied verbatim from the cited chunk\n\
         - Answers contain no facts or numbers that are not in the excerpts\n\
         \n\
         Material:\n{material}",
        count = settings.cards_per_module,
        module = stage_a.module_id,
        difficulty = stage_a.estimated_difficulty,
        objectives = stage_a
            .learning_objectives
            .iter()
            .map(|o| format!("- {o}"))
            .collect::<Vec<_>>()
            .join("\n"),
        terms = stage_a.key_terms.join(", "),
    )
}

/// Drop blank cards and evidence that cites unknown chunks; fill missing excerpts
/// from the cited chunk.
fn normalize(raw: Vec<RawCard>, chunks: &[Chunk], default_difficulty: Difficulty) -> Vec<CandidateCard> {
    let by_id: HashMap<&str, &Chunk> = chunks.iter().map(|c| (c.chunk_id.as_str(), c)).collect();
    let mut cards = Vec::new();

    for card in raw {
        let question = card.question.trim();
        let answer = card.answer.trim();
        if question.is_empty() || answer.is_empty() {
            debug!("dropping card with blank question or answer");
            continue;
        }

        let evidence: Vec<Evidence> = card
            .evidence
            .into_iter()
            .filter_map(|ev| {
                let Some(chunk) = by_id.get(ev.chunk_id.as_str()) else {
                    debug!(chunk_id = %ev.chunk_id, "dropping evidence for unknown chunk");
                    return None;
                };
                let excerpt = ev
                    .excerpt
                    .map(|e| e.trim().to_string())
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| text::clip(chunk.text.trim(), EXCERPT_CHARS));
                Some(Evidence {
                    chunk_id: ev.chunk_id,
                    excerpt,
                })
            })
            .collect();

        cards.push(CandidateCard {
            card_id: Uuid::new_v4().to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
            difficulty: card
                .difficulty
                .as_deref()
                .map(Difficulty::parse_lenient)
                .unwrap_or(default_difficulty),
            evidence,
            verification: None,
        });
    }
    cards
}

/// Offline Stage B: one card per key term, answered with the first sentence that
/// mentions the term and citing that sentence.
pub fn generate_mock(stage_a: &StageAOutput, chunks: &[Chunk], count: usize) -> Vec<CandidateCard> {
    let mut cards = Vec::new();
    for term in &stage_a.key_terms {
        if cards.len() >= count {
            break;
        }
        let needle = term.to_lowercase();
        let hit = chunks.iter().find_map(|chunk| {
            text::sentences(&chunk.text)
                .into_iter()
                .find(|s| s.to_lowercase().contains(&needle))
                .map(|s| (chunk, s))
        });
        let Some((chunk, sentence)) = hit else {
            continue;
        };
        let topic = chunk
            .heading
            .as_deref()
            .map(|h| format!(" in the context of {h}"))
            .unwrap_or_default();
        cards.push(CandidateCard {
            card_id: Uuid::new_v4().to_string(),
            question: format!("What does the material say about \"{term}\"{topic}?"),
            answer: sentence.clone(),
            difficulty: stage_a.estimated_difficulty,
            evidence: vec![Evidence {
                chunk_id: chunk.chunk_id.clone(),
                excerpt: sentence,
            }],
            verification: None,
        });
    }
    cards
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::anthropic::ModelTier;
    use crate::pipeline::summarizer::summarize_mock;
    use crate::resilience::{ResilienceRegistry, RetryOptions};
    use crate::test_support::{ScriptedSender, hr_chunks};

    fn stage_a() -> StageAOutput {
        summarize_mock("hr-101", Some("HR Basics"), &hr_chunks()).unwrap()
    }

    fn llm_generator(sender: Arc<ScriptedSender>, settings: GeneratorSettings) -> Generator {
        let retry = RetryOptions {
            jitter: false,
            ..RetryOptions::default()
        };
        let llm = LlmInvoker::new(
            sender,
            Arc::new(ResilienceRegistry::default()),
            ModelTier::Sonnet,
            retry,
        );
        Generator::new(Some(llm), settings)
    }

    #[tokio::test]
    async fn mock_cards_cite_the_sentence_they_answer_with() {
        let generator = Generator::new(None, GeneratorSettings::default());
        let cards = generator
            .generate(&stage_a(), &hr_chunks(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!cards.is_empty());
        for card in &cards {
            assert_eq!(card.evidence.len(), 1);
            assert_eq!(card.answer, card.evidence[0].excerpt);
            assert!(card.verification.is_none());
        }
    }

    #[tokio::test]
    async fn llm_cards_are_normalized() {
        let reply = r#"{"cards": [
            {"question": "How long is onboarding?", "answer": "90 days.",
             "evidence": [{"chunk_id": "hr-1", "excerpt": "lasts 90 days"},
                          {"chunk_id": "nope", "excerpt": "made up"}]},
            {"question": "Who approves leave?", "answer": "The line manager.",
             "difficulty": "advanced",
             "evidence": [{"chunk_id": "hr-3"}]},
            {"question": "", "answer": "blank question"}
        ]}"#;
        let sender = Arc::new(ScriptedSender::new(vec![Ok(reply.into())]));
        let cards = llm_generator(sender, GeneratorSettings::default())
            .generate(&stage_a(), &hr_chunks(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].evidence.len(), 1);
        assert_eq!(cards[0].evidence[0].chunk_id, "hr-1");
        assert_eq!(cards[0].difficulty, stage_a().estimated_difficulty);
        assert_eq!(cards[1].difficulty, Difficulty::Advanced);
        assert!(cards[1].evidence[0].excerpt.starts_with("Employees accrue"));
        assert_ne!(cards[0].card_id, cards[1].card_id);
    }

    #[tokio::test]
    async fn bare_array_reply_is_accepted_and_truncated() {
        let reply = r#"[
            {"question": "Q1", "answer": "A1", "evidence": [{"chunk_id": "hr-1"}]},
            {"question": "Q2", "answer": "A2", "evidence": [{"chunk_id": "hr-2"}]},
            {"question": "Q3", "answer": "A3", "evidence": [{"chunk_id": "hr-3"}]}
        ]"#;
        let settings = GeneratorSettings {
            cards_per_module: 2,
            ..Default::default()
        };
        let sender = Arc::new(ScriptedSender::new(vec![Ok(reply.into())]));
        let cards = llm_generator(sender, settings)
            .generate(&stage_a(), &hr_chunks(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cards.len(), 2);
    }

    #[tokio::test]
    async fn zero_cards_is_generation_empty() {
        let sender = Arc::new(ScriptedSender::new(vec![Ok(r#"{"cards": []}"#.into())]));
        let err = llm_generator(sender.clone(), GeneratorSettings::default())
            .generate(&stage_a(), &hr_chunks(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StageError::GenerationEmpty {
                produced: 0,
                required: 1
            }
        ));
        // An empty but well-formed reply is not retried.
        assert_eq!(sender.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_json_is_retried_under_its_own_cap() {
        let sender = Arc::new(ScriptedSender::repeating(Ok("cards: none, sorry".into())));
        let err = llm_generator(sender.clone(), GeneratorSettings::default())
            .generate(&stage_a(), &hr_chunks(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::MalformedOutput(_)));
        // default max_malformed_retries = 2
        assert_eq!(sender.calls(), 3);
    }

    #[test]
    fn prompt_lists_objectives_and_material() {
        let prompt = build_prompt(&stage_a(), &hr_chunks(), &GeneratorSettings::default());
        assert!(prompt.contains("Write 10 flashcards for module hr-101"));
        assert!(prompt.contains("[hr-3]"));
        assert!(prompt.contains("- Explain the key points of Leave Policy"));
    }

    #[test]
    fn oversized_first_chunk_is_clipped_to_budget() {
        let settings = GeneratorSettings {
            max_prompt_chars: 500,
            ..GeneratorSettings::default()
        };
        let huge = Chunk::new("hr-big", "leave ".repeat(2_000));
        let base = build_prompt(&stage_a(), &[], &settings).chars().count();
        let prompt = build_prompt(&stage_a(), &[huge], &settings);
        assert!(prompt.contains("[hr-big]"));
        assert!(prompt.chars().count() <= base + 500);
    }
}
