use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use quarry::config::Config;
use quarry::dispatcher::DispatcherService;
use quarry::dispatcher::handler::LoadHandler;
use quarry::queue::QueueManager;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Quarry - rate-limited crawler for paginated GitHub-style APIs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: String,

    /// Log formatter to use
    #[arg(long, value_enum, default_value_t = LogFormatter::Auto)]
    formatter: LogFormatter,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum LogFormatter {
    /// Use pretty formatter (default in debug mode)
    Pretty,
    /// Use JSON formatter (default in release mode)
    Json,
    /// Auto-select based on build mode (debug=pretty, release=json)
    Auto,
}

/// How long shutdown may take before remaining tasks are abandoned.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(8);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load configuration first to get log level
    let config: Config = Figment::new()
        .merge(Yaml::file(&args.config))
        .merge(Env::prefixed("QUARRY_").split("__"))
        .extract()
        .expect("Failed to load config");

    // Configure logging based on config
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,quarry={}", config.log_level)));

    // Select formatter based on CLI args
    let use_pretty = match args.formatter {
        LogFormatter::Pretty => true,
        LogFormatter::Json => false,
        LogFormatter::Auto => cfg!(debug_assertions),
    };

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if use_pretty {
        Box::new(
            FmtSubscriber::builder()
                .with_target(true)
                .with_env_filter(filter)
                .finish(),
        )
    } else {
        Box::new(
            FmtSubscriber::builder()
                .with_target(true)
                .with_env_filter(filter)
                .json()
                .finish(),
        )
    };
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        },
        "starting quarry"
    );

    // Create database connection pool
    let db_pool = PgPoolOptions::new()
        .min_connections(config.db_settings.min_connections)
        .max_connections(config.db_settings.max_connections)
        .connect(&config.db_settings.url())
        .await
        .expect("Failed to create database pool");

    sqlx::migrate!()
        .run(&db_pool)
        .await
        .expect("Failed to run database migrations");

    info!(
        queue_threshold = config.scheduler.sched_queue_threshold,
        objects_per_token = config.scheduler.sched_object_per_token,
        mark_window = config.scheduler.sched_mark_timestamp_delta,
        worker_count = config.scheduler.worker_count,
        per_page = config.github_api.per_page,
        "configuration loaded"
    );

    // Shared HTTP client for every fetch worker
    let client = reqwest::Client::builder()
        .user_agent(concat!("quarry/", env!("CARGO_PKG_VERSION")))
        .tcp_keepalive(Some(Duration::from_secs(60 * 5)))
        .read_timeout(Duration::from_secs(10))
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to create HTTP client");

    let manager = Arc::new(QueueManager::new(
        db_pool.clone(),
        &config.scheduler,
        config.github_api.per_page,
    ));
    let handler = Arc::new(LoadHandler::new(
        db_pool.clone(),
        manager.clone(),
        client,
        config.github_api.per_page,
    ));

    let mut service = DispatcherService::new(manager, handler, config.scheduler.worker_count);
    if let Err(e) = service.start().await {
        tracing::error!(error = ?e, "Failed to start dispatcher service");
        std::process::exit(1);
    }

    // Set up signal handling for both SIGINT (Ctrl+C) and SIGTERM
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("received ctrl+c, gracefully shutting down...");
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm_stream =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM signal handler");
        sigterm_stream.recv().await;
        info!("received SIGTERM, gracefully shutting down...");
    };

    #[cfg(not(unix))]
    let sigterm = async {
        // On non-Unix systems, create a future that never completes
        std::future::pending::<()>().await;
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm => {}
    }

    let mut exit_code = 0;
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, service.shutdown()).await {
        Ok(Ok(())) => info!("graceful shutdown complete"),
        Ok(Err(e)) => {
            warn!(error = ?e, "shutdown finished with failures");
            exit_code = 1;
        }
        Err(_) => {
            warn!(
                timeout = format!("{SHUTDOWN_TIMEOUT:.2?}"),
                "graceful shutdown elapsed - abandoning remaining tasks"
            );
            exit_code = 2;
        }
    }

    info!(exit_code, "application shutdown complete");
    std::process::exit(exit_code);
}
