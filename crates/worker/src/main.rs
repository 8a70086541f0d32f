use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use rollcall_infra::config::RollcallConfig;
use rollcall_infra::enrollment::{InMemoryEnrollmentStore, PostgresEnrollmentStore};
use rollcall_infra::handlers::{Collaborators, build_registry};
use rollcall_infra::jobs::payload::CleanupExpiredRequests;
use rollcall_infra::jobs::{InMemoryJobStore, PeriodicEnqueuer, PostgresJobStore, Processor};
use rollcall_infra::notifications::{LoggingNotificationDispatcher, PostgresNotificationDispatcher};
use rollcall_infra::schema::apply_schema;
use rollcall_infra::waitlist::{InMemoryWaitlistStore, PostgresWaitlistStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rollcall_observability::init();

    let config = RollcallConfig::from_env().context("invalid configuration")?;

    let collaborators = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(url)
                .await
                .context("failed to connect to Postgres")?;
            apply_schema(&pool).await.context("failed to apply schema")?;

            let enrollment = Arc::new(PostgresEnrollmentStore::new(pool.clone()));
            Collaborators {
                jobs: Arc::new(PostgresJobStore::new(pool.clone())),
                classes: enrollment.clone(),
                roster: enrollment.clone(),
                requests: enrollment,
                waitlist: Arc::new(PostgresWaitlistStore::new(pool.clone())),
                notifications: Arc::new(PostgresNotificationDispatcher::new(pool)),
                promotion: config.promotion.clone(),
            }
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores (nothing is persisted)");
            let enrollment = InMemoryEnrollmentStore::arc();
            Collaborators {
                jobs: InMemoryJobStore::arc(),
                classes: enrollment.clone(),
                roster: enrollment.clone(),
                requests: enrollment,
                waitlist: InMemoryWaitlistStore::arc(),
                notifications: Arc::new(LoggingNotificationDispatcher),
                promotion: config.promotion.clone(),
            }
        }
    };

    let registry = build_registry(&collaborators).context("invalid handler registry")?;
    let processor = Arc::new(Processor::new(
        collaborators.jobs.clone(),
        Arc::new(registry),
        config.processor.clone(),
    ));
    processor.start()?;

    let cleanup = PeriodicEnqueuer::spawn(
        "cleanup-expired-requests",
        collaborators.jobs.clone(),
        CleanupExpiredRequests::default(),
        config.cleanup_interval,
    );

    tracing::info!("rollcall worker running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutting down");
    cleanup.shutdown().await;
    processor.stop().await;

    let stats = processor.stats();
    tracing::info!(
        ticks = stats.ticks,
        completed = stats.jobs_completed,
        retried = stats.jobs_retried,
        failed = stats.jobs_failed,
        "worker stopped"
    );
    Ok(())
}
