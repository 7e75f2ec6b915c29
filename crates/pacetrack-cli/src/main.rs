use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pacetrack_sync::{
    list_campaigns, maybe_build_scheduler, prune_campaigns, render_campaigns, update_all,
    update_one, CampaignRunStatus, CampaignTaskStatus, PacetrackConfig, RunContext, UpdateOutcome,
};
use pacetrack_web::StaticSiteRenderer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pacetrack")]
#[command(about = "Track campaign progress against goals and render static reports")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, save and render campaigns that are due.
    Update {
        #[arg(long)]
        campaign: Option<String>,
        /// Ignore fetch frequency.
        #[arg(long)]
        force: bool,
    },
    /// Show every campaign and its latest snapshot.
    List,
    /// Apply the snapshot retention policy.
    Prune {
        #[arg(long)]
        campaign: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Re-render reports from saved snapshots.
    Render {
        #[arg(long)]
        campaign: Option<String>,
    },
    /// Run updates on the configured cron schedule until interrupted.
    Schedule,
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let mut config = PacetrackConfig::from_env();
    if matches!(cli.command, Some(Commands::Schedule)) {
        config.scheduler_enabled = true;
    }
    let renderer = Arc::new(StaticSiteRenderer::new(config.static_dir.clone()));
    let ctx = RunContext::new(config)?.with_renderer(renderer);

    match cli.command.unwrap_or(Commands::Update {
        campaign: None,
        force: false,
    }) {
        Commands::Update {
            campaign: Some(id),
            force,
        } => match update_one(&ctx, &id, force).await? {
            UpdateOutcome::Disabled => {
                println!("{id}: disabled; nothing fetched");
            }
            UpdateOutcome::Skipped { next_due } => {
                println!("{id}: not due until {next_due}");
            }
            UpdateOutcome::Updated {
                timestamp,
                items,
                goals_done,
                goals_total,
                pruned,
                rendered,
            } => {
                println!(
                    "{id}: updated at {timestamp} items={items} goals={goals_done}/{goals_total} pruned={pruned} rendered={rendered}"
                );
            }
        },
        Commands::Update {
            campaign: None,
            force,
        } => {
            let summary = update_all(&ctx, force).await?;
            for record in &summary.campaigns {
                let status = match &record.status {
                    CampaignRunStatus::Disabled => "disabled".to_string(),
                    CampaignRunStatus::Skipped { next_due } => format!("skipped, due {next_due}"),
                    CampaignRunStatus::Updated { timestamp, rendered } => {
                        format!("updated at {timestamp} rendered={rendered}")
                    }
                    CampaignRunStatus::Failed { phase, error } => format!("failed during {phase}: {error}"),
                };
                println!("{}: {status}", record.campaign_id);
            }
            println!(
                "update complete: run_id={} updated={} failed={}",
                summary.run_id,
                summary.updated(),
                summary.failed()
            );
            if summary.failed() > 0 {
                std::process::exit(1);
            }
        }
        Commands::List => {
            for listing in list_campaigns(&ctx).await? {
                match (listing.summary, listing.error) {
                    (Some(summary), _) => {
                        let latest = summary
                            .latest_timestamp
                            .map(|ts| ts.to_rfc3339())
                            .unwrap_or_else(|| "never".to_string());
                        let goals = summary
                            .results
                            .map(|r| format!("{}/{}", r.goals_done, r.goals_total))
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "{}\t{}\t{}\tstart={}\tlatest={}\tgoals={}{}",
                            summary.id,
                            summary.name,
                            summary.lang,
                            summary.campaign_start_date,
                            latest,
                            goals,
                            if summary.disabled { "\tdisabled" } else { "" }
                        );
                    }
                    (None, error) => {
                        println!(
                            "{}\terror: {}",
                            listing.dir.display(),
                            error.unwrap_or_default()
                        );
                    }
                }
            }
        }
        Commands::Prune { campaign, dry_run } => {
            let records = prune_campaigns(&ctx, campaign.as_deref(), dry_run).await?;
            for record in &records {
                match &record.status {
                    CampaignTaskStatus::Done(report) => println!(
                        "{}: bucket={} kept={} {}={}",
                        record.campaign_id,
                        report.bucket.as_deref().unwrap_or("-"),
                        report.kept_count(),
                        if report.dry_run { "would_prune" } else { "pruned" },
                        report.pruned_count()
                    ),
                    CampaignTaskStatus::Failed { phase, error } => {
                        println!("{}: failed during {phase}: {error}", record.campaign_id)
                    }
                }
            }
            if records.iter().any(|r| r.is_failed()) {
                std::process::exit(1);
            }
        }
        Commands::Render { campaign } => {
            let summary = render_campaigns(&ctx, campaign.as_deref()).await?;
            for record in &summary.campaigns {
                if let CampaignTaskStatus::Failed { phase, error } = &record.status {
                    println!("{}: failed during {phase}: {error}", record.campaign_id);
                }
            }
            println!(
                "rendered {} campaign page(s) into {} failed={}",
                summary.rendered(),
                ctx.config.static_dir.display(),
                summary.failed()
            );
            if summary.failed() > 0 {
                std::process::exit(1);
            }
        }
        Commands::Schedule => {
            let Some(sched) = maybe_build_scheduler(&ctx).await? else {
                anyhow::bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %ctx.config.update_cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
        }
    }

    Ok(())
}
