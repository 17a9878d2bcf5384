//! Data carried through the pipeline: source chunks, Stage A output, candidate cards,
//! verdicts and published decks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable unit of source content, produced by the content fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub text: String,
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub slide_or_page: Option<u32>,
    #[serde(default)]
    pub heading: Option<String>,
    #[serde(default)]
    pub tokens_est: Option<u32>,
}

impl Chunk {
    pub fn new(chunk_id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let tokens_est = Some((text.split_whitespace().count() as f64 * 1.3).ceil() as u32);
        Self {
            chunk_id: chunk_id.into(),
            text,
            source_file: None,
            provider: None,
            slide_or_page: None,
            heading: None,
            tokens_est,
        }
    }

    pub fn with_heading(mut self, heading: impl Into<String>) -> Self {
        self.heading = Some(heading.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
}

impl Difficulty {
    /// Lenient parse of model output; unknown values fall back to intermediate.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "beginner" | "easy" | "basic" => Difficulty::Beginner,
            "advanced" | "hard" | "expert" => Difficulty::Advanced,
            _ => Difficulty::Intermediate,
        }
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Difficulty::Beginner => write!(f, "beginner"),
            Difficulty::Intermediate => write!(f, "intermediate"),
            Difficulty::Advanced => write!(f, "advanced"),
        }
    }
}

/// Stage A artifact, consumed only by Stage B of the same run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAOutput {
    pub module_id: String,
    pub summaries: Vec<String>,
    pub learning_objectives: Vec<String>,
    pub key_terms: Vec<String>,
    pub content_themes: Vec<String>,
    pub estimated_difficulty: Difficulty,
    pub chunk_count: usize,
    pub processing_time_ms: u64,
}

/// A chunk excerpt a card cites as support for its answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub chunk_id: String,
    pub excerpt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HallucinationRisk {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for HallucinationRisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HallucinationRisk::Low => write!(f, "low"),
            HallucinationRisk::Medium => write!(f, "medium"),
            HallucinationRisk::High => write!(f, "high"),
        }
    }
}

/// Verifier judgement attached to a card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub verified: bool,
    pub confidence: f64,
    pub issues: Vec<String>,
    pub evidence_coverage: f64,
    pub hallucination_risk: HallucinationRisk,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateCard {
    pub card_id: String,
    pub question: String,
    pub answer: String,
    pub difficulty: Difficulty,
    pub evidence: Vec<Evidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verdict>,
}

impl CandidateCard {
    /// Only verified cards with at least one piece of evidence may be published
    /// without a human looking at them.
    pub fn is_publishable(&self) -> bool {
        !self.evidence.is_empty() && self.verification.as_ref().is_some_and(|v| v.verified)
    }
}

/// Versioned, published set of cards for one module. Never mutated once stored; new
/// generations and review approvals produce a new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deck {
    pub module_id: String,
    pub course_id: String,
    pub cards: Vec<CandidateCard>,
    pub generated_at: DateTime<Utc>,
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(verified: bool) -> Verdict {
        Verdict {
            verified,
            confidence: 0.9,
            issues: vec![],
            evidence_coverage: 0.9,
            hallucination_risk: HallucinationRisk::Low,
            note: String::new(),
        }
    }

    fn card(evidence: Vec<Evidence>, verification: Option<Verdict>) -> CandidateCard {
        CandidateCard {
            card_id: "c1".into(),
            question: "Q".into(),
            answer: "A".into(),
            difficulty: Difficulty::Beginner,
            evidence,
            verification,
        }
    }

    #[test]
    fn empty_evidence_is_never_publishable() {
        assert!(!card(vec![], Some(verdict(true))).is_publishable());
    }

    #[test]
    fn unverified_or_unchecked_cards_are_not_publishable() {
        let ev = vec![Evidence {
            chunk_id: "k".into(),
            excerpt: "e".into(),
        }];
        assert!(!card(ev.clone(), None).is_publishable());
        assert!(!card(ev.clone(), Some(verdict(false))).is_publishable());
        assert!(card(ev, Some(verdict(true))).is_publishable());
    }

    #[test]
    fn difficulty_parses_leniently() {
        assert_eq!(Difficulty::parse_lenient(" Advanced "), Difficulty::Advanced);
        assert_eq!(Difficulty::parse_lenient("easy"), Difficulty::Beginner);
        assert_eq!(Difficulty::parse_lenient("???"), Difficulty::Intermediate);
    }

    #[test]
    fn chunk_deserializes_with_only_required_fields() {
        let chunk: Chunk =
            serde_json::from_str(r#"{"chunk_id": "m1-0", "text": "Payroll runs monthly."}"#)
                .unwrap();
        assert_eq!(chunk.chunk_id, "m1-0");
        assert!(chunk.heading.is_none());
    }

    #[test]
    fn risk_orders_low_to_high() {
        assert!(HallucinationRisk::Low < HallucinationRisk::Medium);
        assert!(HallucinationRisk::Medium < HallucinationRisk::High);
    }
}
