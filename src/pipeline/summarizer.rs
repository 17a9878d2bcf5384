//! Stage A: module summary, learning objectives, key terms and difficulty.

use std::time::Instant;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::StageError;
use super::json::parse_model_json;
use super::llm::LlmInvoker;
use super::text;
use super::types::{Chunk, Difficulty, StageAOutput};

pub const MIN_OBJECTIVES: usize = 2;
pub const MAX_OBJECTIVES: usize = 10;

const SYSTEM_PROMPT: &str = "You are an instructional designer. You read course material and \
extract what a student must learn from it. You answer with JSON only.";

/// Raw model reply. Everything is optional so a partial answer can still be coerced
/// into a valid output; only the hard minimums fail validation.
#[derive(Debug, Default, Deserialize)]
struct RawSummary {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    summaries: Vec<String>,
    #[serde(default)]
    learning_objectives: Vec<String>,
    #[serde(default)]
    key_terms: Vec<String>,
    #[serde(default)]
    content_themes: Vec<String>,
    #[serde(default)]
    estimated_difficulty: Option<String>,
}

pub struct Summarizer {
    llm: Option<LlmInvoker>,
    max_prompt_chars: usize,
}

impl Summarizer {
    /// `llm = None` runs the deterministic offline mode.
    pub fn new(llm: Option<LlmInvoker>, max_prompt_chars: usize) -> Self {
        Self {
            llm,
            max_prompt_chars,
        }
    }

    pub async fn summarize(
        &self,
        module_id: &str,
        title: Option<&str>,
        chunks: &[Chunk],
        cancel: &CancellationToken,
    ) -> Result<StageAOutput, StageError> {
        if chunks.is_empty() {
            return Err(StageError::InsufficientContent);
        }
        let Some(llm) = &self.llm else {
            return summarize_mock(module_id, title, chunks);
        };

        let started = Instant::now();
        let prompt = build_prompt(module_id, title, chunks, self.max_prompt_chars);
        let raw = llm
            .complete_parsed(SYSTEM_PROMPT, &prompt, cancel, |reply| {
                let raw: RawSummary = parse_model_json(reply)?;
                validate(&raw)?;
                Ok(raw)
            })
            .await?;

        let output = into_output(module_id, raw, chunks.len(), started);
        info!(
            module_id,
            objectives = output.learning_objectives.len(),
            key_terms = output.key_terms.len(),
            difficulty = %output.estimated_difficulty,
            elapsed_ms = output.processing_time_ms,
            "stage A complete"
        );
        Ok(output)
    }
}

fn build_prompt(module_id: &str, title: Option<&str>, chunks: &[Chunk], budget: usize) -> String {
    let mut material = String::new();
    let mut included = 0usize;
    for chunk in chunks {
        let heading = chunk.heading.as_deref().unwrap_or("");
        let block = format!("[{}] {}\n{}\n\n", chunk.chunk_id, heading, chunk.text.trim());
        if !material.is_empty() && material.len() + block.len() > budget {
            break;
        }
        material.push_str(&text::clip(&block, budget));
        included += 1;
    }
    if included < chunks.len() {
        debug!(
            module_id,
            included,
            total = chunks.len(),
            "prompt budget reached, trailing chunks left out"
        );
    }

    let title_line = title
        .map(|t| format!("Module title: {t}\n"))
        .unwrap_or_default();
    format!(
        "Module id: {module_id}\n{title_line}\
         Read the course material below and respond with ONLY valid JSON in this format:\n\
         {{\"summary\": \"<3-5 sentence summary>\",\n \
          \"learning_objectives\": [\"<objective>\", ...],\n \
          \"key_terms\": [\"<term>\", ...],\n \
          \"content_themes\": [\"<theme>\", ...],\n \
          \"estimated_difficulty\": \"beginner|intermediate|advanced\"}}\n\
         \n\
         Rules:\n\
         - Provide between {MIN_OBJECTIVES} and {MAX_OBJECTIVES} learning objectives, each starting with a verb\n\
         - Provide at least one key term that appears in the material\n\
         - Use only facts present in the material\n\
         \n\
         Material:\n{material}"
    )
}

fn validate(raw: &RawSummary) -> Result<(), String> {
    let objectives = non_empty(&raw.learning_objectives).count();
    if objectives < MIN_OBJECTIVES {
        return Err(format!(
            "expected at least {MIN_OBJECTIVES} learning objectives, got {objectives}"
        ));
    }
    if non_empty(&raw.key_terms).count() == 0 {
        return Err("expected at least one key term".into());
    }
    Ok(())
}

fn non_empty(items: &[String]) -> impl Iterator<Item = String> + '_ {
    items
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn into_output(module_id: &str, raw: RawSummary, chunk_count: usize, started: Instant) -> StageAOutput {
    let mut summaries: Vec<String> = raw.summary.into_iter().collect();
    summaries.extend(raw.summaries);
    StageAOutput {
        module_id: module_id.to_string(),
        summaries: non_empty(&summaries).collect(),
        learning_objectives: non_empty(&raw.learning_objectives)
            .take(MAX_OBJECTIVES)
            .collect(),
        key_terms: non_empty(&raw.key_terms).collect(),
        content_themes: non_empty(&raw.content_themes).collect(),
        estimated_difficulty: raw
            .estimated_difficulty
            .as_deref()
            .map(Difficulty::parse_lenient)
            .unwrap_or(Difficulty::Intermediate),
        chunk_count,
        processing_time_ms: started.elapsed().as_millis() as u64,
    }
}

/// Offline Stage A: lead sentences as summaries, frequency-ranked key terms, and
/// objectives derived from headings and terms.
pub fn summarize_mock(
    module_id: &str,
    title: Option<&str>,
    chunks: &[Chunk],
) -> Result<StageAOutput, StageError> {
    if chunks.is_empty() {
        return Err(StageError::InsufficientContent);
    }
    let started = Instant::now();

    let summaries: Vec<String> = chunks
        .iter()
        .filter_map(|c| text::sentences(&c.text).into_iter().next())
        .take(5)
        .collect();

    let mut key_terms = text::top_terms(chunks.iter().map(|c| c.text.as_str()), 8);
    if key_terms.is_empty() {
        key_terms.push(module_id.to_string());
    }

    let mut themes: Vec<String> = Vec::new();
    for heading in chunks.iter().filter_map(|c| c.heading.as_deref()) {
        let heading = heading.trim();
        if !heading.is_empty() && !themes.iter().any(|t| t == heading) {
            themes.push(heading.to_string());
        }
    }

    let subject = title.unwrap_or(module_id);
    let mut objectives: Vec<String> = themes
        .iter()
        .map(|t| format!("Explain the key points of {t}"))
        .collect();
    for term in &key_terms {
        if objectives.len() >= MAX_OBJECTIVES {
            break;
        }
        objectives.push(format!("Define {term} and describe how it applies in {subject}"));
    }
    if objectives.len() < MIN_OBJECTIVES {
        objectives.push(format!("Summarize the main ideas of {subject}"));
    }
    objectives.truncate(MAX_OBJECTIVES);

    let all_words: Vec<String> = chunks.iter().flat_map(|c| text::words(&c.text)).collect();
    let avg_len = if all_words.is_empty() {
        0.0
    } else {
        all_words.iter().map(|w| w.chars().count()).sum::<usize>() as f64 / all_words.len() as f64
    };
    let estimated_difficulty = if avg_len < 5.0 {
        Difficulty::Beginner
    } else if avg_len < 6.5 {
        Difficulty::Intermediate
    } else {
        Difficulty::Advanced
    };

    Ok(StageAOutput {
        module_id: module_id.to_string(),
        summaries,
        learning_objectives: objectives,
        key_terms,
        content_themes: themes,
        estimated_difficulty,
        chunk_count: chunks.len(),
        processing_time_ms: started.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::anthropic::ModelTier;
    use crate::resilience::{ResilienceRegistry, RetryOptions};
    use crate::test_support::{ScriptedSender, hr_chunks};

    fn llm_summarizer(sender: Arc<ScriptedSender>) -> Summarizer {
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
        Summarizer::new(Some(llm), 24_000)
    }

    #[test]
    fn mock_on_hr_chunks_meets_output_contract() {
        let out = summarize_mock("hr-101", Some("HR Basics"), &hr_chunks()).unwrap();
        assert!((2..=10).contains(&out.learning_objectives.len()));
        assert!(!out.key_terms.is_empty());
        assert_eq!(out.chunk_count, 3);
        assert_eq!(out.summaries.len(), 3);
        assert_eq!(out.content_themes.len(), 3);
    }

    #[test]
    fn mock_is_deterministic() {
        let a = summarize_mock("hr-101", None, &hr_chunks()).unwrap();
        let b = summarize_mock("hr-101", None, &hr_chunks()).unwrap();
        assert_eq!(a.key_terms, b.key_terms);
        assert_eq!(a.learning_objectives, b.learning_objectives);
    }

    #[test]
    fn mock_pads_objectives_for_tiny_input() {
        let chunks = vec![Chunk::new("c1", "Ok.")];
        let out = summarize_mock("m", None, &chunks).unwrap();
        assert!(out.learning_objectives.len() >= MIN_OBJECTIVES);
        assert_eq!(out.key_terms, vec!["m"]);
    }

    #[tokio::test]
    async fn empty_input_fails_without_calling_the_model() {
        let sender = Arc::new(ScriptedSender::repeating(Ok("{}".into())));
        let summarizer = llm_summarizer(sender.clone());
        let err = summarizer
            .summarize("m1", None, &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::InsufficientContent));
        assert_eq!(sender.calls(), 0);
    }

    #[tokio::test]
    async fn llm_reply_is_parsed_and_coerced() {
        let reply = r#"```json
        {"summary": "HR basics.",
         "learning_objectives": ["Describe onboarding", "Explain leave rules", ""],
         "key_terms": ["onboarding"],
         "estimated_difficulty": "Beginner"}
        ```"#;
        let sender = Arc::new(ScriptedSender::new(vec![Ok(reply.into())]));
        let out = llm_summarizer(sender.clone())
            .summarize("hr-101", Some("HR"), &hr_chunks(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.summaries, vec!["HR basics."]);
        assert_eq!(out.learning_objectives.len(), 2);
        assert!(out.content_themes.is_empty());
        assert_eq!(out.estimated_difficulty, Difficulty::Beginner);
        assert_eq!(out.chunk_count, 3);
        assert!(sender.prompts()[0].contains("[hr-2]"));
    }

    #[tokio::test(start_paused = true)]
    async fn too_few_objectives_is_retried_as_malformed() {
        let thin = r#"{"learning_objectives": ["Only one"], "key_terms": ["x"]}"#;
        let good = r#"{"learning_objectives": ["One", "Two"], "key_terms": ["x"]}"#;
        let sender = Arc::new(ScriptedSender::new(vec![Ok(thin.into()), Ok(good.into())]));
        let out = llm_summarizer(sender.clone())
            .summarize("m", None, &hr_chunks(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.learning_objectives, vec!["One", "Two"]);
        assert_eq!(sender.calls(), 2);
    }

    #[tokio::test]
    async fn objectives_are_capped_at_ten() {
        let many: Vec<String> = (0..14).map(|i| format!("\"Objective {i}\"")).collect();
        let reply = format!(
            r#"{{"learning_objectives": [{}], "key_terms": ["leave"]}}"#,
            many.join(",")
        );
        let sender = Arc::new(ScriptedSender::new(vec![Ok(reply)]));
        let out = llm_summarizer(sender)
            .summarize("m", None, &hr_chunks(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.learning_objectives.len(), MAX_OBJECTIVES);
    }

    #[test]
    fn prompt_respects_budget() {
        let chunks = vec![
            Chunk::new("a", "x".repeat(300)),
            Chunk::new("b", "y".repeat(300)),
        ];
        let prompt = build_prompt("m", None, &chunks, 350);
        assert!(prompt.contains("[a]"));
        assert!(!prompt.contains("[b]"));
    }
}
