use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use daymark_core::{detect, local_date, parse_timezone};
use daymark_storage::RetentionHorizon;
use daymark_sync::{build_service_from_env, EntityFailure, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "daymark")]
#[command(about = "Fires a once-per-local-day sessionization trigger after each entity's midnight")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single tick now and exit.
    Tick,
    /// Start the cron scheduler and the ops API.
    Serve,
    /// Apply pending database migrations.
    Migrate,
    /// Call the sessionizer for one entity, bypassing the dedupe ledger.
    Rerun {
        #[arg(long)]
        entity: Uuid,
    },
    /// Delete ledger rows older than the retention horizon.
    Purge {
        #[arg(long)]
        older_than_days: Option<u32>,
    },
    /// Evaluate the midnight detector for one timezone without side effects.
    Detect {
        #[arg(long)]
        timezone: String,
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = 30)]
        window_minutes: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("daymark=info,sqlx=warn,tokio_cron_scheduler=warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Tick) {
        Commands::Tick => {
            let (_, service) = build_service_from_env().await?;
            let summary = match service.run_tick_now().await {
                Ok(summary) => summary,
                Err(err) => {
                    print_unprocessed(err.unprocessed());
                    return Err(err.into());
                }
            };
            println!(
                "tick complete: tick_id={} entities={} candidates={} invoked={} duplicates={} failed={}",
                summary.tick_id,
                summary.entities_scanned,
                summary.candidates,
                summary.invoked(),
                summary.duplicates,
                summary.failed
            );
            print_unprocessed(&summary.failures);
        }
        Commands::Serve => {
            let (config, service) = build_service_from_env().await?;
            let tick_cron = config.tick_cron();
            let sched = service
                .build_scheduler(&tick_cron, &config.retention_cron)
                .await?;
            sched.start().await.context("starting scheduler")?;
            info!(enabled = service.switch.is_enabled(), "scheduler started");
            daymark_web::serve(daymark_web::AppState::new(service, tick_cron), config.web_port).await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let pool = daymark_storage::connect(&config.database_url, config.db_max_connections).await?;
            daymark_storage::migrate(&pool).await?;
            println!("migrations applied");
        }
        Commands::Rerun { entity } => {
            let (_, service) = build_service_from_env().await?;
            let affected = service
                .rerun(entity)
                .await
                .with_context(|| format!("rerunning sessionizer for {entity}"))?;
            println!("rerun complete: entity={entity} rows_affected={affected}");
        }
        Commands::Purge { older_than_days } => {
            let (_, service) = build_service_from_env().await?;
            let horizon = match older_than_days {
                Some(days) => RetentionHorizon::days(days)?,
                None => service.retention,
            };
            let purged = service.driver.purge(horizon).await?;
            println!(
                "purge complete: removed={purged} older_than_days={}",
                horizon.duration().num_days()
            );
        }
        Commands::Detect {
            timezone,
            at,
            window_minutes,
        } => {
            let tz = parse_timezone(&timezone)?;
            let now = at.unwrap_or_else(Utc::now);
            let window = Duration::minutes(i64::from(window_minutes));
            let crossed = detect(now, window, tz);
            let before = now
                .checked_sub_signed(window)
                .map(|then| local_date(then, tz).to_string())
                .unwrap_or_else(|| "n/a".into());
            println!(
                "timezone={} now={} local_now={} local_before={} crossed={}",
                tz.name(),
                now.to_rfc3339(),
                local_date(now, tz),
                before,
                crossed
            );
        }
    }

    Ok(())
}

fn print_unprocessed(failures: &[EntityFailure]) {
    for failure in failures {
        eprintln!(
            "unprocessed: entity={} local_date={} error={}",
            failure.entity_id, failure.local_date, failure.error
        );
    }
}
