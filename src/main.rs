//! Binary entrypoint: loads configuration, wires C2-C7 into the dispatch
//! loop (C8), and drives graceful shutdown on SIGTERM/SIGINT.
//!
//! Grounded on `examples/original_source/gemini-client/src/main.py`'s
//! `GeminiWorker` (setup/run/shutdown phases) and on `abp-daemon/src/main.rs`
//! for the `tracing_subscriber` initialization shape.

use llm_broker_worker::{
    CredentialPool, CredentialPoolConfig, DelayQueue, DispatchLoop, LapinDelayQueue, Publisher,
    QueueConsumer, QueuePublisher, RetrySchedule, Settings, UpstreamCaller, UpstreamConfig,
    UpstreamGenerator,
};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::from_env()?;
    init_tracing(&settings);

    info!("llm-broker-worker starting");
    info!(request_queue = %settings.request_queue, response_queue = %settings.response_queue, "queue topology");
    info!(
        api_key_count = settings.openrouter_api_keys.len(),
        max_per_minute = settings.keys_max_per_minute,
        model = %settings.openrouter_model,
        "credential pool configured"
    );

    let credentials = Arc::new(CredentialPool::new(CredentialPoolConfig {
        api_keys: settings.openrouter_api_keys.clone(),
        max_per_minute: settings.keys_max_per_minute,
        cooldown_secs: settings.keys_cooldown_secs,
    }));

    let upstream: Arc<dyn UpstreamGenerator> = Arc::new(UpstreamCaller::new(
        UpstreamConfig {
            base_url: settings.openrouter_base_url.clone(),
            site_url: settings.openrouter_site_url.clone(),
            site_name: settings.openrouter_site_name.clone(),
            backoff: Default::default(),
        },
        settings.http_proxy.as_deref(),
    )?);

    let publisher: Arc<dyn Publisher> =
        Arc::new(QueuePublisher::connect(&settings.rabbitmq_url).await?);
    let delay_queue: Arc<dyn DelayQueue> =
        Arc::new(LapinDelayQueue::connect(&settings.rabbitmq_url, &settings.request_queue).await?);
    let retry_schedule = RetrySchedule::new(
        settings.queue_retry_delays.clone(),
        settings.queue_max_retries,
    );

    let dispatch = Arc::new(DispatchLoop::new(
        credentials,
        upstream,
        publisher,
        delay_queue,
        retry_schedule,
    ));

    let consumer = QueueConsumer::connect(
        &settings.rabbitmq_url,
        &settings.request_queue,
        settings.worker_prefetch_count,
    )
    .await?;

    let in_flight: Arc<AsyncMutex<JoinSet<()>>> = Arc::new(AsyncMutex::new(JoinSet::new()));

    let consume = {
        let dispatch = dispatch.clone();
        let in_flight = in_flight.clone();
        async move {
            consumer
                .run(move |envelope, delivery| {
                    let dispatch = dispatch.clone();
                    let in_flight = in_flight.clone();
                    async move {
                        let mut tasks = in_flight.lock().await;
                        tasks.spawn(async move {
                            dispatch.handle(envelope, delivery).await;
                        });
                    }
                })
                .await
        }
    };

    info!("worker ready, consuming requests");

    tokio::select! {
        result = consume => {
            if let Err(err) = result {
                error!(error = %err, "consumer loop terminated unexpectedly");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining in-flight deliveries");
        }
    }

    let drain = async {
        let mut tasks = in_flight.lock().await;
        while tasks.join_next().await.is_some() {}
    };

    if tokio::time::timeout(settings.shutdown_grace, drain)
        .await
        .is_err()
    {
        warn!(
            grace_secs = settings.shutdown_grace.as_secs(),
            "shutdown grace period elapsed with deliveries still in-flight; \
             they are left unacked and will be redelivered after reconnect"
        );
    }

    info!("llm-broker-worker shut down");
    Ok(())
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_new(settings.log_level.to_lowercase())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if settings.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
