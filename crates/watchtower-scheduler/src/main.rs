//! Watchtower
//!
//! Runs one refresh or housekeeping job and prints its summary as JSON.
//! A host scheduler (cron, a queue worker, ...) decides when; every job is
//! idempotent and safe to run from several workers at once.

use anyhow::Result;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;
use watchtower_engine::ResourceChange;
use watchtower_query::{dependency_tags, infer_context, validate};

mod app;
mod config;

use app::App;
use config::WatchtowerConfig;

#[derive(Parser, Debug)]
#[command(name = "watchtower")]
#[command(about = "Watchtower compliance monitor jobs", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "watchtower.yaml", env = "WATCHTOWER_CONFIG")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Print the collected metrics after the job
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    job: Job,
}

#[derive(Subcommand, Debug)]
enum Job {
    /// Bind and evaluate monitors for every active tenant
    RefreshAll,

    /// Bind and evaluate monitors for one tenant
    RefreshTenant {
        #[arg(long)]
        tenant: Uuid,
    },

    /// Evaluate the monitors of a tenant that read changed resources
    RefreshDeps {
        #[arg(long)]
        tenant: Uuid,

        /// Dependency tags, e.g. `people_dependency`
        #[arg(long, value_delimiter = ',')]
        deps: Vec<String>,

        /// Content types of changed resources, e.g. `policy_policy`
        #[arg(long, value_delimiter = ',')]
        content_types: Vec<String>,
    },

    /// Evaluate one tenant monitor
    RunMonitor {
        #[arg(long)]
        tenant_monitor: Uuid,

        /// User requesting the run
        #[arg(long)]
        user: Option<Uuid>,
    },

    /// Remove inactive exclusions past their retention
    SweepExclusions {
        /// Defaults to `engine.exclusion_retention_days`
        #[arg(long)]
        retention_days: Option<i64>,
    },

    /// Remove gateway profiles without a usable credential
    CleanGateway,

    /// Check a monitor query without running it
    ValidateQuery { sql: String },

    /// Create or update the database schema
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let config = WatchtowerConfig::load(&cli.config)?;
    let metrics = init_metrics()?;

    let output = run(cli.job, &config).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    if cli.print_metrics {
        println!("{}", metrics.render());
    }
    Ok(())
}

async fn run(job: Job, config: &WatchtowerConfig) -> Result<serde_json::Value> {
    match job {
        Job::ValidateQuery { sql } => {
            let registry = app::registry(config)?;
            let analysis = validate(&sql, &registry)?;
            Ok(json!({
                "valid": true,
                "context": infer_context(&sql)?.label(),
                "dependencies": dependency_tags(&sql, &registry)?,
                "analysis": analysis,
            }))
        }
        Job::Migrate => {
            app::store(config).await?.migrate().await?;
            Ok(json!({ "migrated": true }))
        }
        job => {
            let app = App::build(config).await?;
            let output = run_job(&app, job, config).await;
            app.runtime.teardown().await;
            output
        }
    }
}

async fn run_job(app: &App, job: Job, config: &WatchtowerConfig) -> Result<serde_json::Value> {
    let scheduler = &app.scheduler;
    let summary = match job {
        Job::RefreshAll => scheduler.refresh_all().await?,
        Job::RefreshTenant { tenant } => scheduler.refresh_tenant(tenant).await?,
        Job::RefreshDeps {
            tenant,
            deps,
            content_types,
        } => {
            let mut summary = if deps.is_empty() {
                None
            } else {
                let deps: BTreeSet<String> = deps.into_iter().collect();
                Some(scheduler.refresh_by_dependencies(tenant, &deps).await?)
            };
            if !content_types.is_empty() {
                let changes: Vec<ResourceChange> = content_types
                    .into_iter()
                    .map(|content_type| ResourceChange {
                        tenant,
                        content_type,
                    })
                    .collect();
                let more = scheduler.handle_changes(&changes).await?;
                summary = Some(match summary {
                    Some(mut first) => {
                        first.evaluated += more.evaluated;
                        first.errors.extend(more.errors);
                        first.execution_time += more.execution_time;
                        first
                    }
                    None => more,
                });
            }
            match summary {
                Some(summary) => summary,
                None => anyhow::bail!("refresh-deps needs --deps or --content-types"),
            }
        }
        Job::RunMonitor {
            tenant_monitor,
            user,
        } => {
            let evaluation = scheduler.run_tenant_monitor(tenant_monitor, user).await?;
            return Ok(json!({
                "tenant_monitor": tenant_monitor,
                "result": evaluation.result.id,
                "status": evaluation.status().as_str(),
                "rows": evaluation.result.data.row_count(),
                "excluded": evaluation.result.data.excluded_results.len(),
                "execution_time": evaluation.result.execution_time,
                "exclusion_events": evaluation
                    .exclusion_events
                    .iter()
                    .map(|event| event.event_type.as_str())
                    .collect::<Vec<_>>(),
                "action_items": evaluation.reconcile,
            }));
        }
        Job::SweepExclusions { retention_days } => {
            let days = retention_days.unwrap_or(config.engine.exclusion_retention_days);
            scheduler
                .sweep_exclusions(chrono::Duration::days(days))
                .await?
        }
        Job::CleanGateway => scheduler.clean_gateway().await?,
        Job::ValidateQuery { .. } | Job::Migrate => {
            anyhow::bail!("job does not need the scheduler")
        }
    };

    info!(job = %summary.job, errors = summary.errors.len(), "Job complete");
    Ok(serde_json::to_value(summary)?)
}

/// Initialize tracing/logging on stderr; stdout carries the job output
fn init_tracing(verbose: bool, json: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("watchtower=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("watchtower=info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Install the Prometheus recorder and describe the engine's metrics
fn init_metrics() -> Result<PrometheusHandle> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use watchtower_engine::stats::{
        EVALUATIONS_TOTAL, EVALUATION_LATENCY_MS, EXCLUSION_EVENTS_TOTAL, NOTIFICATIONS_TOTAL,
    };

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics: {}", e))?;

    metrics::describe_counter!(EVALUATIONS_TOTAL, "Persisted evaluations by status");
    metrics::describe_histogram!(
        EVALUATION_LATENCY_MS,
        metrics::Unit::Milliseconds,
        "Evaluation latency in milliseconds"
    );
    metrics::describe_counter!(EXCLUSION_EVENTS_TOTAL, "Exclusion events by type");
    metrics::describe_counter!(NOTIFICATIONS_TOTAL, "Urgent notification emails sent");
    metrics::describe_counter!(
        "watchtower_gateway_retries_total",
        "Cloud gateway runs retried after a transient error"
    );

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_jobs() {
        let cli = Cli::try_parse_from([
            "watchtower",
            "--log-json",
            "refresh-deps",
            "--tenant",
            "7f1c2d3e-0000-4000-8000-000000000001",
            "--content-types",
            "policy_policy,user_user",
        ])
        .unwrap();
        assert!(cli.log_json);
        match cli.job {
            Job::RefreshDeps { content_types, deps, .. } => {
                assert_eq!(content_types, vec!["policy_policy", "user_user"]);
                assert!(deps.is_empty());
            }
            other => panic!("unexpected job {other:?}"),
        }
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["watchtower", "sweep-exclusions"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("watchtower.yaml"));
        assert!(matches!(
            cli.job,
            Job::SweepExclusions { retention_days: None }
        ));
    }

    #[tokio::test]
    async fn test_validate_query_needs_no_database() {
        let output = run(
            Job::ValidateQuery {
                sql: "select id from people".into(),
            },
            &WatchtowerConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(output["valid"], json!(true));
        assert_eq!(output["dependencies"], json!(["people_dependency"]));
    }
}
