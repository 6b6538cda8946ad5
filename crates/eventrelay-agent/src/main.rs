// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::{env, io};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

use eventrelay::broker::{MemoryBroker, RetryingProducer};
use eventrelay::index::ElasticsearchClient;
use eventrelay::{Archiver, Collector, Indexer, RelayConfig, WatchEvent};

const DEFAULT_CONFIG_PATH: &str = "/etc/eventrelay/config.yaml";
const WATCH_QUEUE_CAPACITY: usize = 256;
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

pub fn main() -> ExitCode {
    let log_level = env::var("RELAY_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(run());
    // The stdin reader may still be parked in a blocking read
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    code
}

async fn run() -> ExitCode {
    let config_path = env::var("RELAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = match RelayConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration in {}: {e}", config_path.display());
            return ExitCode::FAILURE;
        }
    };
    config.log_summary();

    let broker = MemoryBroker::new();
    let producer = Arc::new(RetryingProducer::new(
        broker.clone(),
        &config.broker.producer,
    ));
    debug!(
        "Using the in-process broker with {} rebalancing",
        config.broker.rebalance_strategy
    );

    let client = match ElasticsearchClient::new(&config.index) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to create index client: {e}");
            return ExitCode::FAILURE;
        }
    };
    let indexer = match Indexer::new(&config, client, producer.clone(), info_span!("indexer")) {
        Ok(indexer) => indexer,
        Err(e) => {
            error!("Failed to create indexer: {e}");
            return ExitCode::FAILURE;
        }
    };
    let archiver = match Archiver::new(&config, info_span!("archiver")) {
        Ok(archiver) => archiver,
        Err(e) => {
            error!("Failed to create archiver: {e}");
            return ExitCode::FAILURE;
        }
    };
    let collector = Collector::new(
        producer,
        config.broker.topic.clone(),
        info_span!("collector"),
    );

    let subscriptions = tokio::try_join!(
        broker.subscribe(&config.broker.topic, &config.broker.indexer_group),
        broker.subscribe(
            &config.broker.dead_letter_topic,
            &config.broker.archiver_group
        ),
    );
    let (indexer_subscription, archiver_subscription) = match subscriptions {
        Ok(subscriptions) => subscriptions,
        Err(e) => {
            error!("Failed to subscribe: {e}");
            return ExitCode::FAILURE;
        }
    };

    let collector_cancel = CancellationToken::new();
    let indexer_cancel = CancellationToken::new();
    let archiver_cancel = CancellationToken::new();

    let (watch_tx, watch_rx) = mpsc::channel(WATCH_QUEUE_CAPACITY);
    tokio::spawn(read_watch_stream(watch_tx, collector_cancel.clone()));
    let collector_task = tokio::spawn(collector.run(watch_rx, collector_cancel.clone()));
    let indexer_task = tokio::spawn(indexer.run(indexer_subscription, indexer_cancel.clone()));
    let archiver_task =
        tokio::spawn(archiver.run(archiver_subscription, archiver_cancel.clone()));

    info!("Relay started");
    shutdown_signal().await;
    info!("Shutting down");

    // Upstream first, so every stage sees the final output of the one before it
    collector_cancel.cancel();
    if let Err(e) = collector_task.await {
        error!("Collector task failed: {e}");
    }

    indexer_cancel.cancel();
    match indexer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Indexer stopped with error: {e}"),
        Err(e) => error!("Indexer task failed: {e}"),
    }

    let drain_timeout = config
        .buffer
        .shutdown_timeout_secs
        .map_or(DEFAULT_DRAIN_TIMEOUT, Duration::from_secs);
    wait_for_dead_letters(&broker, &config, drain_timeout).await;

    archiver_cancel.cancel();
    match archiver_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Archiver stopped with error: {e}"),
        Err(e) => error!("Archiver task failed: {e}"),
    }

    broker.close().await;
    info!("Relay stopped");
    ExitCode::SUCCESS
}

/// Forwards one watch notification per stdin line to the collector.
async fn read_watch_stream(tx: mpsc::Sender<WatchEvent>, cancel: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match WatchEvent::from_watch_line(line.as_bytes()) {
                Ok(watch_event) => {
                    if tx.send(watch_event).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Skipping unreadable watch line: {e}"),
            },
            Ok(None) => {
                info!("Watch stream closed");
                break;
            }
            Err(e) => {
                error!("Failed to read watch stream: {e}");
                break;
            }
        }
    }
}

/// Gives the archiver a chance to pick up what the indexer's final flush redirected.
async fn wait_for_dead_letters(broker: &MemoryBroker, config: &RelayConfig, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let lag = broker
            .lag(
                &config.broker.dead_letter_topic,
                &config.broker.archiver_group,
            )
            .await;
        if lag == 0 {
            return;
        }
        if Instant::now() >= deadline {
            warn!("{lag} dead-letter events were not archived before shutdown");
            return;
        }
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => log_signal_error(result),
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
                log_signal_error(tokio::signal::ctrl_c().await);
            }
        }
    }

    #[cfg(not(unix))]
    log_signal_error(tokio::signal::ctrl_c().await);
}

fn log_signal_error(result: io::Result<()>) {
    if let Err(e) = result {
        error!("Failed to listen for shutdown signal: {e}");
    }
}
