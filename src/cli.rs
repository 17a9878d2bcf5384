//! cardforge command line, built on clap derive.
//!
//! [`Cli`] holds the global flags (`--config`, `--mock`, `--verbose`) and one of the
//! [`Command`] subcommands.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::pipeline::VerificationMode;
use crate::state_machine::{JobRequest, JobSettings};

/// Turns course modules into verified flashcard decks.
#[derive(Debug, Parser)]
#[command(name = "cardforge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the config file. Defaults to ./cardforge.toml when present.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Never call the model; use the deterministic offline pipeline.
    #[arg(long, global = true, default_value_t = false)]
    pub mock: bool,

    /// Debug-level logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VerificationArg {
    Heuristic,
    Llm,
}

impl From<VerificationArg> for VerificationMode {
    fn from(arg: VerificationArg) -> Self {
        match arg {
            VerificationArg::Heuristic => VerificationMode::Heuristic,
            VerificationArg::Llm => VerificationMode::Llm,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP API.
    Serve {
        /// Listen address, overriding the config file.
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one generation job in-process and wait for it to finish.
    Generate(GenerateArgs),

    /// Check a JSON file of cards against their evidence.
    Verify {
        /// File holding a JSON array of cards or a deck object.
        file: PathBuf,

        #[arg(long, value_enum, default_value_t = VerificationArg::Heuristic)]
        mode: VerificationArg,
    },

    /// Generate a deck from built-in HR sample material, offline.
    Demo,
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// Course to generate for. Required unless --all is given.
    #[arg(long, required_unless_present = "all")]
    pub course: Option<String>,

    /// Restrict the job to a single module of --course.
    #[arg(long, requires = "course")]
    pub module: Option<String>,

    /// Every module of every course.
    #[arg(long, conflicts_with_all = ["course", "module"])]
    pub all: bool,

    /// Directory of `<course>/<module>.json` chunk files, overriding the config.
    #[arg(long)]
    pub content: Option<PathBuf>,

    #[arg(long)]
    pub cards: Option<usize>,

    #[arg(long, value_enum)]
    pub verification: Option<VerificationArg>,

    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Write the resulting job as JSON to this file.
    #[arg(long)]
    pub out: Option<PathBuf>,
}

impl GenerateArgs {
    pub fn to_request(&self) -> JobRequest {
        let request = match (self.all, &self.course, &self.module) {
            (true, _, _) => JobRequest::all_courses(),
            (false, Some(course), Some(module)) => JobRequest::single_module(course, module),
            (false, Some(course), None) => JobRequest::course(course),
            // clap guarantees a course unless --all; validation reports anything else.
            (false, None, _) => JobRequest::course(""),
        };
        let settings = JobSettings {
            cards_per_module: self.cards,
            verification_mode: self.verification.map(Into::into),
            max_concurrent_modules: self.concurrency,
            use_mock: None,
        };
        if settings == JobSettings::default() {
            request
        } else {
            request.with_settings(settings)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::JobMode;
    use clap::CommandFactory;

    fn generate(args: &[&str]) -> GenerateArgs {
        let mut argv = vec!["cardforge", "generate"];
        argv.extend_from_slice(args);
        match Cli::parse_from(argv).command {
            Command::Generate(args) => args,
            other => panic!("expected Generate, got {other:?}"),
        }
    }

    #[test]
    fn parses_global_flags() {
        let cli = Cli::parse_from(["cardforge", "--config", "x.toml", "--mock", "-v", "demo"]);
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(cli.mock);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Demo));
    }

    #[test]
    fn generate_single_module_request() {
        let args = generate(&["--course", "hr", "--module", "onboarding", "--cards", "4"]);
        let request = args.to_request();
        assert_eq!(request.mode, JobMode::SingleModule);
        assert_eq!(request.target.module_id.as_deref(), Some("onboarding"));
        assert_eq!(request.settings.unwrap().cards_per_module, Some(4));
    }

    #[test]
    fn generate_course_and_all() {
        let request = generate(&["--course", "hr"]).to_request();
        assert_eq!(request.mode, JobMode::Course);
        assert!(request.settings.is_none());

        let request = generate(&["--all", "--verification", "llm"]).to_request();
        assert_eq!(request.mode, JobMode::AllCourses);
        assert_eq!(
            request.settings.unwrap().verification_mode,
            Some(VerificationMode::Llm)
        );
    }

    #[test]
    fn generate_requires_a_target() {
        assert!(Cli::try_parse_from(["cardforge", "generate"]).is_err());
        assert!(Cli::try_parse_from(["cardforge", "generate", "--module", "m"]).is_err());
        assert!(Cli::try_parse_from(["cardforge", "generate", "--all", "--course", "hr"]).is_err());
    }

    #[test]
    fn parses_serve_and_verify() {
        let cli = Cli::parse_from(["cardforge", "serve", "--bind", "0.0.0.0:9000"]);
        assert!(matches!(cli.command, Command::Serve { bind: Some(ref b) } if b == "0.0.0.0:9000"));

        let cli = Cli::parse_from(["cardforge", "verify", "cards.json", "--mode", "llm"]);
        match cli.command {
            Command::Verify { file, mode } => {
                assert_eq!(file, PathBuf::from("cards.json"));
                assert_eq!(mode, VerificationArg::Llm);
            }
            other => panic!("expected Verify, got {other:?}"),
        }
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
