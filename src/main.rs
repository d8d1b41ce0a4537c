use std::str::FromStr;
use std::sync::Arc;

use outflow::alert::{self, AlertSender};
use outflow::compose::{Composer, LinkSigner};
use outflow::config::OutflowConfig;
use outflow::http::{api_routes, ApiState};
use outflow::lock::LockManager;
use outflow::provider::smtp::SmtpImapProvider;
use outflow::provider::ProviderAdapter;
use outflow::queue::{JobKind, JobQueue};
use outflow::reconcile::{KeywordClassifier, Reconciler, ReputationMonitor};
use outflow::sequencer::Sequencer;
use outflow::shared::{MemorySharedStore, SharedStore};
use outflow::store::{Database, LibSqlBackend};
use outflow::worker::{
    spawn_health_check_loop, ReplyFetchWorker, SendWorker, TrackingWorker, WarmupWorker,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = OutflowConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export OUTFLOW_SIGNING_SECRET=...");
        eprintln!("  export OUTFLOW_WEBHOOK_TOKEN=...");
        std::process::exit(1);
    });

    eprintln!("📮 Outflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Base URL: {}", config.base_url);
    eprintln!("   HTTP: 0.0.0.0:{}", config.http_port);

    // ── Database ─────────────────────────────────────────────────────
    let db_path_ref = std::path::Path::new(&config.db_path);
    if let Some(parent) = db_path_ref.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(db_path_ref)
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.db_path);

    // Crash recovery: jobs left running by a dead worker go back to queued.
    match db.reset_running_jobs().await {
        Ok(0) => {}
        Ok(n) => eprintln!("   Recovered {n} interrupted jobs"),
        Err(e) => eprintln!("   Warning: could not reset interrupted jobs: {e}"),
    }

    // ── Shared services ──────────────────────────────────────────────
    let shared: Arc<dyn SharedStore> = Arc::new(MemorySharedStore::new());
    let locks = LockManager::new(Arc::clone(&shared), config.lock_ttl);
    let queue = JobQueue::new(Arc::clone(&db), config.max_job_attempts, config.backoff);
    let signer = LinkSigner::new(config.signing_secret.clone());
    let composer = Composer::new(config.base_url.clone(), signer.clone());
    let provider: Arc<dyn ProviderAdapter> = Arc::new(SmtpImapProvider::new());

    let (alerts, alert_rx) = AlertSender::channel();
    let _alert_handle = alert::spawn_log_consumer(alert_rx);

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&db),
        Arc::clone(&shared),
        alerts.clone(),
        Arc::new(KeywordClassifier),
    ));

    // ── Scheduling and delivery ──────────────────────────────────────
    let sequencer = Arc::new(Sequencer::new(
        Arc::clone(&db),
        Arc::clone(&shared),
        queue.clone(),
    ));
    let (_scan_handle, _scan_shutdown) = sequencer.spawn_scan_loop(config.scan_interval);

    let send_worker = Arc::new(SendWorker::new(
        Arc::clone(&db),
        Arc::clone(&shared),
        locks.clone(),
        composer,
        Arc::clone(&provider),
        ReputationMonitor::new(Arc::clone(&db), alerts.clone()),
    ));
    let _send_handles = queue.spawn_consumers(send_worker, config.send_concurrency, config.poll_interval);

    let tracking_worker = Arc::new(TrackingWorker::new(Arc::clone(&db)));
    let _tracking_handles = queue.spawn_consumers(tracking_worker, 1, config.poll_interval);

    let warmup_worker = Arc::new(WarmupWorker::new(
        Arc::clone(&db),
        Arc::clone(&shared),
        locks.clone(),
        Arc::clone(&provider),
    ));
    let _warmup_handles = queue.spawn_consumers(warmup_worker, 1, config.poll_interval);

    let fetch_worker = Arc::new(ReplyFetchWorker::new(
        Arc::clone(&db),
        locks.clone(),
        Arc::clone(&provider),
        Arc::clone(&reconciler),
    ));
    let _fetch_handles = queue.spawn_consumers(fetch_worker, 1, config.poll_interval);

    let fetch_schedule = cron::Schedule::from_str(&config.reply_fetch_cron).unwrap_or_else(|e| {
        eprintln!("Error: invalid OUTFLOW_REPLY_FETCH_CRON: {e}");
        std::process::exit(1);
    });
    let _fetch_ticker =
        queue.spawn_recurring(JobKind::ReplyFetch, serde_json::json!({}), fetch_schedule);

    let (_health_handle, _health_shutdown) = spawn_health_check_loop(
        Arc::clone(&db),
        Arc::clone(&provider),
        alerts.clone(),
        config.health_check_interval,
    );

    // ── HTTP ─────────────────────────────────────────────────────────
    let app = api_routes(ApiState {
        db: Arc::clone(&db),
        queue: queue.clone(),
        reconciler,
        signer,
        webhook_token: config.webhook_token.clone(),
    });
    let listener =
        tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    eprintln!("   Ready\n");
    axum::serve(listener, app).await?;

    Ok(())
}
