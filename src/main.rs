use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vocablink::config::Config;
use vocablink::item_id::ItemId;
use vocablink::suggest::{SuggestionRequest, SuggestionService};

mod cli;

use cli::InputArgs;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load the snapshot, an optional model and replay the feedback log.
fn build_service(config: Config, input: &InputArgs) -> anyhow::Result<SuggestionService> {
    let service = SuggestionService::new(config)?;

    let items = cli::load_vocabulary(&input.vocabulary)?;
    match &input.embeddings {
        Some(path) => {
            let table = cli::load_embeddings(path)?;
            service.load_snapshot_with_table(items, table.vectors, table.dimensions)?
        }
        None => service.load_snapshot(items)?,
    };

    if let Some(path) = &input.model {
        if path.exists() {
            service.install_model(cli::load_model(path)?)?;
        } else {
            log::info!("no model at {}, starting untrained", path.display());
        }
    }

    if let Some(path) = &input.feedback {
        let events = cli::load_feedback(path)?;
        let mut skipped = 0;
        for (line, event) in &events {
            if let Err(err) = service.record_event(event) {
                log::warn!("skipping feedback line {line}: {err}");
                skipped += 1;
            }
        }
        log::info!("replayed {} feedback events ({skipped} skipped)", events.len());
    }

    Ok(service)
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = cli::Args::parse();

    let config = Config::load_with(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;

    match args.command {
        cli::Command::Suggest { input, from, limit } => {
            let service = build_service(config, &input)?;
            let request = SuggestionRequest {
                from: from.map(ItemId::from),
                limit,
                ..Default::default()
            };
            let response = service.suggest(&request)?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        cli::Command::Score { input, from, to } => {
            let service = build_service(config, &input)?;
            let candidate = service.score_pair(&ItemId::from(from), &ItemId::from(to))?;
            println!("{}", serde_json::to_string_pretty(&candidate)?);
        }

        cli::Command::Retrain { input, output } => {
            if input.feedback.is_none() {
                bail!("retrain needs a feedback log (--feedback)");
            }
            let service = build_service(config, &input)?;
            let _span = tracing::info_span!("retrain").entered();

            match service.retrain() {
                Ok(report) => {
                    if let (Some(path), Some(model)) = (&output, service.current_model()) {
                        cli::save_model(path, &model)?;
                        log::info!("model written to {}", path.display());
                    }
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                Err(err) if err.is_warning() => {
                    let rejected = serde_json::json!({
                        "status": "rejected",
                        "reason": err.to_string(),
                        "model": service.model_metadata(),
                    });
                    println!("{}", serde_json::to_string_pretty(&rejected)?);
                }
                Err(err) => return Err(err.into()),
            }
        }

        cli::Command::ModelInfo { input } => {
            let service = build_service(config, &input)?;
            println!("{}", serde_json::to_string_pretty(&service.model_metadata())?);
        }

        cli::Command::Config { output } => match output {
            Some(path) => {
                config.save(&path)?;
                println!("config written to {}", path.display());
            }
            None => print!("{}", serde_yml::to_string(&config)?),
        },
    }

    Ok(())
}
