mod alert;
mod config;
mod error;
mod ingest;
mod mqtt;
mod reading;
mod scoring;
mod stats;
mod store;

use crate::alert::AlertStateMachine;
use crate::config::{Config, EstimatorKind};
use crate::ingest::{HistoryLimits, IngestionPipeline, NodeLanes};
use crate::mqtt::MqttAlertPublisher;
use crate::scoring::{RemoteScorer, Scorer, ThresholdEstimator, WeightedEstimator};
use crate::stats::IngestStats;
use crate::store::{build_pool, PgReadingStore};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,fire_alert_sidecar=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "fire-alert-sidecar"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() || trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

fn build_scorer(config: &Config) -> Result<Scorer> {
    if let Some(url) = &config.scorer_url {
        let remote = RemoteScorer::new(
            url.clone(),
            config.scorer_token.clone(),
            config.scorer_timeout(),
        )?;
        return Ok(Scorer::Remote(remote));
    }
    let scorer = match config.estimator()? {
        EstimatorKind::Threshold => Scorer::Local(Arc::new(ThresholdEstimator::default())),
        EstimatorKind::Weighted => Scorer::Local(Arc::new(WeightedEstimator)),
    };
    Ok(scorer)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pool = build_pool(&config.database_url, config.db_pool_size).await?;
    let store = PgReadingStore::new(pool);
    store.ensure_schema().await?;

    let statuses = store.load_alert_statuses().await?;
    let firing = statuses.iter().filter(|(_, status)| status.is_fire()).count();
    tracing::info!(nodes = statuses.len(), firing, "restored alert statuses");
    let alerts = Arc::new(AlertStateMachine::with_statuses(
        config.alert_policy(),
        statuses,
    ));

    let scorer = build_scorer(&config)?;
    tracing::info!(
        scorer = scorer.describe(),
        threshold = alerts.policy().threshold,
        cooldown_secs = alerts.policy().cooldown.as_secs(),
        "fire scoring configured"
    );

    let stats = Arc::new(IngestStats::new());
    let (client, eventloop) = mqtt::connect(&config, stats.clone()).await?;
    let publisher = MqttAlertPublisher::new(client.clone(), config.alert_topic.clone(), PUBLISH_TIMEOUT);

    let pipeline = IngestionPipeline::new(
        Arc::new(store),
        Arc::new(publisher),
        scorer,
        alerts.clone(),
        HistoryLimits {
            max_age: config.history_window(),
            max_samples: config.history_max_samples,
        },
        stats.clone(),
    );
    let lanes = NodeLanes::new(pipeline, config.lane_capacity);

    let stats_handle = {
        let stats = stats.clone();
        let alerts = alerts.clone();
        let lanes = lanes.clone();
        let interval = config.stats_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                stats::log_snapshot(&stats, alerts.tracked_nodes());
                tracing::debug!(lanes = lanes.lane_count(), "active node lanes");
            }
        })
    };

    let listener = mqtt::run_listener(
        eventloop,
        config.sensor_topic.clone(),
        lanes.clone(),
        stats.clone(),
    );
    tokio::pin!(listener);

    let outcome = tokio::select! {
        res = &mut listener => {
            match res {
                Ok(()) => Ok(()),
                Err(err) => {
                    tracing::error!(error=%err, "mqtt listener exited");
                    Err(anyhow::Error::from(err))
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
    };

    stats_handle.abort();
    if outcome.is_ok() {
        // pending publishes need the event loop, which is still parked in `listener`
        let drain = async {
            lanes.flush().await;
            if let Err(err) = client.disconnect().await {
                tracing::debug!(error=%err, "mqtt disconnect request failed");
            }
        };
        tokio::select! {
            _ = tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, drain) => {}
            _ = &mut listener => {}
        }
    }
    stats::log_snapshot(&stats, alerts.tracked_nodes());

    outcome
}
