//! Terminal output for `generate`, `verify` and `demo`: an `indicatif` spinner while a
//! job runs and `console` colours for the results.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::pipeline::{BatchVerification, CandidateCard, Deck, HallucinationRisk};
use crate::state_machine::{Job, JobStatus, ModuleResult};

pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
    printed: usize,
}

impl JobProgress {
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg} {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(description.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
            printed: 0,
        }
    }

    /// Refresh the spinner from a job snapshot and print modules finished since the
    /// last call.
    pub fn update(&mut self, job: &Job) {
        for result in job.module_results.iter().skip(self.printed) {
            self.pb.println(self.module_line(result));
        }
        self.printed = job.module_results.len();

        let progress = match job.expected_modules {
            Some(n) => format!("{}/{n} modules", job.module_results.len()),
            None => "expanding target".to_string(),
        };
        self.pb.set_message(format!("{} {} ({progress})", job.status, job.job_id));
    }

    fn module_line(&self, result: &ModuleResult) -> String {
        if result.success {
            format!(
                "  {} {}/{}: {} published, {} for review {}",
                self.green.apply_to("✓"),
                result.course_id,
                result.module_id,
                result.cards_published,
                result.cards_for_review,
                self.dim.apply_to(format!("({} ms)", result.duration_ms)),
            )
        } else {
            format!(
                "  {} {}/{}: {}",
                self.red.apply_to("✗"),
                result.course_id,
                result.module_id,
                result.error.as_deref().unwrap_or("failed"),
            )
        }
    }

    pub fn complete(mut self, job: &Job) {
        self.update(job);
        self.pb.finish_and_clear();
        let style = match job.status {
            JobStatus::Completed => &self.green,
            JobStatus::Failed => &self.red,
            _ => &self.yellow,
        };
        let outcome = job
            .outcome
            .map(|o| format!(" ({o:?})"))
            .unwrap_or_default();
        println!(
            "{} job {} {}{outcome}: {}/{} modules succeeded",
            style.apply_to("■"),
            job.job_id,
            style.apply_to(job.status),
            job.succeeded_modules(),
            job.module_results.len(),
        );
        if let Some(error) = &job.error {
            println!("  {}", self.red.apply_to(error));
        }
    }
}

fn risk_style(risk: HallucinationRisk) -> Style {
    match risk {
        HallucinationRisk::Low => Style::new().green(),
        HallucinationRisk::Medium => Style::new().yellow(),
        HallucinationRisk::High => Style::new().red(),
    }
}

fn print_card(index: usize, card: &CandidateCard) {
    let bold = Style::new().bold();
    println!("{} {}", bold.apply_to(format!("{index:>2}.")), card.question);
    println!("    {}", card.answer);
    let cited: Vec<&str> = card.evidence.iter().map(|e| e.chunk_id.as_str()).collect();
    let verdict = card
        .verification
        .as_ref()
        .map(|v| {
            risk_style(v.hallucination_risk)
                .apply_to(format!(
                    "{} risk, coverage {:.0}%",
                    v.hallucination_risk,
                    v.evidence_coverage * 100.0
                ))
                .to_string()
        })
        .unwrap_or_else(|| "unverified".to_string());
    println!(
        "    {}",
        Style::new()
            .dim()
            .apply_to(format!("[{}] {} · {verdict}", card.difficulty, cited.join(", ")))
    );
}

pub fn print_deck(deck: &Deck) {
    println!();
    println!(
        "{}",
        Style::new().cyan().bold().apply_to(format!(
            "─── {}/{} v{} ({} cards) ───",
            deck.course_id,
            deck.module_id,
            deck.version,
            deck.cards.len()
        ))
    );
    for (i, card) in deck.cards.iter().enumerate() {
        print_card(i + 1, card);
    }
}

pub fn print_verification(cards: &[CandidateCard], batch: &BatchVerification) {
    for (i, card) in cards.iter().enumerate() {
        print_card(i + 1, card);
        if let Some(verdict) = &card.verification {
            for issue in &verdict.issues {
                println!("    {} {issue}", Style::new().yellow().apply_to("!"));
            }
        }
    }
    println!();
    println!(
        "{} verified, {} failed, rate {:.0}% ({} ms)",
        Style::new().green().apply_to(batch.total_verified),
        Style::new().red().apply_to(batch.total_failed),
        batch.verification_rate * 100.0,
        batch.processing_time_ms,
    );
}
