//! Evidence verifier: decides whether a card's answer is grounded in the excerpts it
//! cites. Cards that fail are not errors; they are routed to the review queue.

use std::collections::{BTreeSet, HashSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::json::parse_model_json;
use super::llm::LlmInvoker;
use super::text;
use super::types::{CandidateCard, HallucinationRisk, Verdict};

pub const ISSUE_NO_EVIDENCE: &str = "No evidence provided";
pub const ISSUE_UNGROUNDED_NUMBERS: &str = "Numeric values not grounded";

const SYSTEM_PROMPT: &str = "You are a strict fact checker. You judge whether a flashcard answer \
is fully supported by the quoted evidence and nothing else. You answer with JSON only.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMode {
    Heuristic,
    Llm,
}

impl std::fmt::Display for VerificationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationMode::Heuristic => write!(f, "heuristic"),
            VerificationMode::Llm => write!(f, "llm"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchVerification {
    pub results: Vec<Verdict>,
    pub total_verified: usize,
    pub total_failed: usize,
    pub verification_rate: f64,
    pub processing_time_ms: u64,
}

#[derive(Debug, Deserialize)]
struct RawJudgement {
    verified: bool,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    evidence_coverage: Option<f64>,
    #[serde(default)]
    hallucination_risk: Option<String>,
    #[serde(default)]
    note: Option<String>,
}

pub struct Verifier {
    llm: Option<LlmInvoker>,
    coverage_threshold: f64,
}

impl Verifier {
    pub fn new(llm: Option<LlmInvoker>, coverage_threshold: f64) -> Self {
        Self {
            llm,
            coverage_threshold,
        }
    }

    pub fn heuristic(coverage_threshold: f64) -> Self {
        Self::new(None, coverage_threshold)
    }

    pub async fn verify_card_evidence(
        &self,
        card: &CandidateCard,
        mode: VerificationMode,
        cancel: &CancellationToken,
    ) -> Verdict {
        let heuristic = verify_heuristic(card, self.coverage_threshold);
        if mode == VerificationMode::Heuristic || card.evidence.is_empty() {
            return heuristic;
        }
        let Some(llm) = &self.llm else {
            warn!(card_id = %card.card_id, "llm verification requested without a model, using heuristic");
            return heuristic;
        };

        let prompt = build_judge_prompt(card);
        match llm
            .complete_parsed(SYSTEM_PROMPT, &prompt, cancel, parse_model_json::<RawJudgement>)
            .await
        {
            Ok(raw) => apply_hard_rules(card, judgement_to_verdict(raw)),
            Err(e) => {
                warn!(card_id = %card.card_id, error = %e, "llm judge unavailable, using heuristic");
                let mut verdict = heuristic;
                verdict.note = format!("{} (llm judge unavailable: {})", verdict.note, e.code());
                verdict
            }
        }
    }

    /// Verify every card independently, writing each verdict onto its card.
    pub async fn verify_cards_batch(
        &self,
        cards: &mut [CandidateCard],
        mode: VerificationMode,
        cancel: &CancellationToken,
    ) -> BatchVerification {
        let started = Instant::now();
        let mut results = Vec::with_capacity(cards.len());
        for card in cards.iter_mut() {
            let verdict = self.verify_card_evidence(card, mode, cancel).await;
            card.verification = Some(verdict.clone());
            results.push(verdict);
        }

        let total_verified = results.iter().filter(|v| v.verified).count();
        let total_failed = results.len() - total_verified;
        let verification_rate = if results.is_empty() {
            0.0
        } else {
            total_verified as f64 / results.len() as f64
        };
        let processing_time_ms = started.elapsed().as_millis() as u64;
        info!(
            %mode,
            total = results.len(),
            total_verified,
            total_failed,
            verification_rate,
            "verification batch complete"
        );

        BatchVerification {
            results,
            total_verified,
            total_failed,
            verification_rate,
            processing_time_ms,
        }
    }
}

/// Lexical-overlap verdict.
pub fn verify_heuristic(card: &CandidateCard, coverage_threshold: f64) -> Verdict {
    if card.evidence.is_empty() {
        return Verdict {
            verified: false,
            confidence: 0.0,
            issues: vec![ISSUE_NO_EVIDENCE.to_string()],
            evidence_coverage: 0.0,
            hallucination_risk: HallucinationRisk::High,
            note: "card cites no evidence".into(),
        };
    }

    let evidence_text: String = card
        .evidence
        .iter()
        .map(|e| e.excerpt.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let evidence_words: HashSet<String> = text::content_words(&evidence_text).into_iter().collect();
    let answer_words: BTreeSet<String> = text::content_words(&card.answer).into_iter().collect();

    let mut issues = Vec::new();
    let evidence_coverage = if answer_words.is_empty() {
        issues.push("Answer has no verifiable content".to_string());
        0.0
    } else {
        let grounded = answer_words
            .iter()
            .filter(|w| evidence_words.contains(*w))
            .count();
        grounded as f64 / answer_words.len() as f64
    };

    let ungrounded = ungrounded_numbers(card, &evidence_text);
    if !ungrounded.is_empty() {
        issues.push(ISSUE_UNGROUNDED_NUMBERS.to_string());
    }

    let below_threshold = evidence_coverage < coverage_threshold;
    if below_threshold && !answer_words.is_empty() {
        issues.push(format!("Low evidence coverage ({evidence_coverage:.2})"));
    }

    let hallucination_risk = if !ungrounded.is_empty() {
        HallucinationRisk::High
    } else {
        risk_for_coverage(evidence_coverage)
    };
    let confidence = if ungrounded.is_empty() {
        evidence_coverage
    } else {
        evidence_coverage / 2.0
    };
    let verified = !below_threshold && ungrounded.is_empty();

    let note = if verified {
        format!("{:.0}% of answer terms found in evidence", evidence_coverage * 100.0)
    } else if !ungrounded.is_empty() {
        format!(
            "answer mentions {} which the evidence does not",
            ungrounded.into_iter().collect::<Vec<_>>().join(", ")
        )
    } else {
        format!(
            "only {:.0}% of answer terms found in evidence",
            evidence_coverage * 100.0
        )
    };

    Verdict {
        verified,
        confidence,
        issues,
        evidence_coverage,
        hallucination_risk,
        note,
    }
}

fn risk_for_coverage(coverage: f64) -> HallucinationRisk {
    if coverage >= 0.75 {
        HallucinationRisk::Low
    } else if coverage >= 0.5 {
        HallucinationRisk::Medium
    } else {
        HallucinationRisk::High
    }
}

fn ungrounded_numbers(card: &CandidateCard, evidence_text: &str) -> BTreeSet<String> {
    let evidence_numbers = text::numbers(evidence_text);
    text::numbers(&card.answer)
        .into_iter()
        .filter(|n| !evidence_numbers.contains(n))
        .collect()
}

fn judgement_to_verdict(raw: RawJudgement) -> Verdict {
    let coverage = raw.evidence_coverage.unwrap_or(if raw.verified { 1.0 } else { 0.0 });
    let risk = raw
        .hallucination_risk
        .as_deref()
        .map(|r| match r.trim().to_lowercase().as_str() {
            "low" => HallucinationRisk::Low,
            "medium" => HallucinationRisk::Medium,
            _ => HallucinationRisk::High,
        })
        .unwrap_or_else(|| risk_for_coverage(coverage));
    Verdict {
        verified: raw.verified,
        confidence: raw.confidence.unwrap_or(coverage).clamp(0.0, 1.0),
        issues: raw.issues,
        evidence_coverage: coverage.clamp(0.0, 1.0),
        hallucination_risk: risk,
        note: raw.note.unwrap_or_default(),
    }
}

/// Rules the judge cannot override: ungrounded numbers are always high risk.
fn apply_hard_rules(card: &CandidateCard, mut verdict: Verdict) -> Verdict {
    let evidence_text: String = card
        .evidence
        .iter()
        .map(|e| e.excerpt.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    if !ungrounded_numbers(card, &evidence_text).is_empty() {
        if !verdict.issues.iter().any(|i| i == ISSUE_UNGROUNDED_NUMBERS) {
            verdict.issues.push(ISSUE_UNGROUNDED_NUMBERS.to_string());
        }
        verdict.hallucination_risk = HallucinationRisk::High;
        verdict.verified = false;
    }
    verdict
}

fn build_judge_prompt(card: &CandidateCard) -> String {
    let evidence = card
        .evidence
        .iter()
        .map(|e| format!("[{}] \"{}\"", e.chunk_id, e.excerpt))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Question: {question}\n\
         Answer: {answer}\n\
         Evidence:\n{evidence}\n\
         \n\
         Respond with ONLY valid JSON:\n\
         {{\"verified\": true|false, \"confidence\": 0.0-1.0, \"issues\": [\"...\"],\n \
          \"evidence_coverage\": 0.0-1.0, \"hallucination_risk\": \"low|medium|high\", \"note\": \"...\"}}",
        question = card.question,
        answer = card.answer,
    )
}
