use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cardforge::anthropic::{AnthropicClient, MessageSender};
use cardforge::cli::{Cli, Command, GenerateArgs};
use cardforge::config::CardforgeConfig;
use cardforge::content::{ContentFetcher, demo_catalog};
use cardforge::logging::init_logging;
use cardforge::orchestrator::Orchestrator;
use cardforge::pipeline::{CandidateCard, Deck, LlmInvoker, VerificationMode, Verifier};
use cardforge::resilience::ResilienceRegistry;
use cardforge::state_machine::{Job, JobRequest};
use cardforge::ui::{self, JobProgress};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = CardforgeConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    if cli.mock {
        config.orchestrator.use_mock = true;
    }
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    init_logging(&level, config.log_format);

    match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            serve(config).await
        }
        Command::Generate(args) => generate(config, &args).await,
        Command::Verify { file, mode } => verify(config, &file, mode.into()).await,
        Command::Demo => demo(config).await,
    }
}

fn build_sender(config: &CardforgeConfig) -> Result<Option<Arc<dyn MessageSender>>> {
    if config.mock_mode() {
        info!("no API key or mock requested, running offline");
        return Ok(None);
    }
    let client = match &config.models.base_url {
        Some(url) => AnthropicClient::with_base_url(config.api_key.clone(), url.clone()),
        None => AnthropicClient::new(config.api_key.clone()),
    }
    .context("failed to build Anthropic client")?;
    Ok(Some(Arc::new(client)))
}

fn start_orchestrator(
    config: CardforgeConfig,
    fetcher: Option<Arc<dyn ContentFetcher>>,
) -> Result<Arc<Orchestrator>> {
    let sender = build_sender(&config)?;
    let mut builder = Orchestrator::builder(config);
    if let Some(sender) = sender {
        builder = builder.sender(sender);
    }
    if let Some(fetcher) = fetcher {
        builder = builder.fetcher(fetcher);
    }
    Ok(builder.start())
}

async fn serve(config: CardforgeConfig) -> Result<()> {
    if config.is_production() && config.server.api_token.is_none() {
        warn!("production server running without CARDFORGE_API_TOKEN");
    }
    let orchestrator = start_orchestrator(config, None)?;
    cardforge::web::serve(orchestrator, async {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("could not listen for ctrl-c");
        }
    })
    .await
    .context("HTTP server failed")
}

async fn generate(mut config: CardforgeConfig, args: &GenerateArgs) -> Result<()> {
    if let Some(root) = &args.content {
        config.content.root = Some(root.clone());
    }
    let orchestrator = start_orchestrator(config, None)?;
    let job = run_to_completion(&orchestrator, args.to_request()).await?;

    if let Some(out) = &args.out {
        let json = serde_json::to_string_pretty(&job)?;
        std::fs::write(out, json).with_context(|| format!("writing {}", out.display()))?;
        println!("job written to {}", out.display());
    }
    print_decks(&orchestrator, &job).await?;
    orchestrator.shutdown().await;
    Ok(())
}

async fn demo(mut config: CardforgeConfig) -> Result<()> {
    config.orchestrator.use_mock = true;
    config.content.root = None;
    let orchestrator = start_orchestrator(config, Some(Arc::new(demo_catalog())))?;
    let job = run_to_completion(&orchestrator, JobRequest::course("hr-101")).await?;
    print_decks(&orchestrator, &job).await?;

    let pending = orchestrator.review_queue().list_pending(50).await?;
    if !pending.is_empty() {
        println!("\n{} card(s) waiting for review", pending.len());
    }
    orchestrator.shutdown().await;
    Ok(())
}

/// Enqueue `request` and show progress until the job is terminal. Ctrl-C cancels it.
async fn run_to_completion(orchestrator: &Arc<Orchestrator>, request: JobRequest) -> Result<Job> {
    let job = orchestrator.enqueue(request).await?;
    let mut progress = JobProgress::start(&format!("queued {}", job.job_id));

    let interrupted = CancellationToken::new();
    let on_ctrl_c = interrupted.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let mut cancel_sent = false;
    loop {
        let snapshot = orchestrator.get_job_status(&job.job_id).await?;
        if snapshot.status.is_terminal() {
            progress.complete(&snapshot);
            return Ok(snapshot);
        }
        progress.update(&snapshot);

        tokio::select! {
            _ = interrupted.cancelled(), if !cancel_sent => {
                cancel_sent = true;
                if let Err(e) = orchestrator.cancel(&job.job_id).await {
                    warn!(error = %e, "cancel failed");
                }
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

async fn print_decks(orchestrator: &Orchestrator, job: &Job) -> Result<()> {
    for result in job.module_results.iter().filter(|r| r.deck_version.is_some()) {
        if let Some(deck) = orchestrator
            .get_module_deck(&result.course_id, &result.module_id)
            .await?
        {
            ui::print_deck(&deck);
        }
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CardsFile {
    Deck(Deck),
    Cards(Vec<CandidateCard>),
}

async fn verify(config: CardforgeConfig, file: &Path, mode: VerificationMode) -> Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let mut cards = match serde_json::from_str::<CardsFile>(&raw)
        .with_context(|| format!("{} is neither a deck nor a card array", file.display()))?
    {
        CardsFile::Deck(deck) => deck.cards,
        CardsFile::Cards(cards) => cards,
    };
    if cards.is_empty() {
        bail!("{} contains no cards", file.display());
    }

    let threshold = config.orchestrator.coverage_threshold;
    let verifier = match (mode, build_sender(&config)?) {
        (VerificationMode::Llm, Some(sender)) => {
            let registry = Arc::new(ResilienceRegistry::new(
                (&config.circuit_breaker).into(),
                (&config.rate_limit).into(),
            ));
            let judge = LlmInvoker::new(sender, registry, config.models.judge, config.retry.verification())
                .with_max_tokens(config.models.max_tokens)
                .with_timeout(config.models.llm_timeout());
            Verifier::new(Some(judge), threshold)
        }
        (VerificationMode::Llm, None) => {
            warn!("llm verification needs an API key; falling back to heuristic");
            Verifier::heuristic(threshold)
        }
        (VerificationMode::Heuristic, _) => Verifier::heuristic(threshold),
    };

    let batch = verifier
        .verify_cards_batch(&mut cards, mode, &CancellationToken::new())
        .await;
    ui::print_verification(&cards, &batch);
    Ok(())
}
