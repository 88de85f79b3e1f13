// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Best-effort analytics sink.
//!
//! Request handlers hand events to [`AnalyticsSink::add_event`], which never
//! blocks and never fails from the caller's point of view. A single worker
//! task batches events per collection and posts them to a Keen-compatible
//! API once per flush interval. Lost events are logged and forgotten.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Default Keen API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.keen.io/3.0";

/// Default batch flush interval.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Collection download events are recorded in.
pub const DOWNLOADS_COLLECTION: &str = "downloads";

/// Events queued beyond this are dropped.
const QUEUE_CAPACITY: usize = 4096;

/// Timeout for one batch upload.
const UPLOAD_TIMEOUT_SECS: u64 = 10;

/// How long shutdown waits for the final flush.
const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Connection settings for the analytics API.
#[derive(Clone)]
pub struct AnalyticsConfig {
    pub project_id: String,
    pub write_key: String,
    pub api_url: String,
    pub flush_interval: Duration,
}

impl std::fmt::Debug for AnalyticsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsConfig")
            .field("project_id", &self.project_id)
            .field("write_key", &"***")
            .field("api_url", &self.api_url)
            .field("flush_interval", &self.flush_interval)
            .finish()
    }
}

/// Commands that can be sent to the batch worker.
#[derive(Debug)]
enum SinkCommand {
    /// Queue one event
    Event { collection: String, event: Value },
    /// Flush what is pending, then stop
    Shutdown { done: oneshot::Sender<()> },
}

/// Handle to the analytics worker. Cheap to clone, safe to share.
#[derive(Debug, Clone)]
pub struct AnalyticsSink {
    /// `None` when analytics are disabled.
    command_tx: Option<mpsc::Sender<SinkCommand>>,
}

impl AnalyticsSink {
    /// Start the batch worker. Must be called inside a tokio runtime.
    pub fn start(config: AnalyticsConfig, client: reqwest::Client) -> Self {
        let (command_tx, command_rx) = mpsc::channel(QUEUE_CAPACITY);

        tokio::spawn(async move {
            Self::worker_loop(command_rx, config, client).await;
        });

        Self {
            command_tx: Some(command_tx),
        }
    }

    /// A sink that accepts and discards everything.
    pub fn disabled() -> Self {
        Self { command_tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.command_tx.is_some()
    }

    /// Queue an event for the next batch.
    pub fn add_event<E: Serialize>(&self, collection: &str, event: &E) {
        let Some(ref tx) = self.command_tx else {
            return;
        };

        let event = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("analytics: failed to serialize event: {}", e);
                return;
            }
        };

        let command = SinkCommand::Event {
            collection: collection.to_string(),
            event,
        };
        if let Err(e) = tx.try_send(command) {
            tracing::warn!("analytics: dropping event for '{}': {}", collection, e);
        }
    }

    /// Flush pending events and stop the worker.
    pub async fn shutdown(&self) {
        let Some(ref tx) = self.command_tx else {
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(SinkCommand::Shutdown { done: done_tx }).await.is_err() {
            return;
        }

        match tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), done_rx).await {
            Ok(_) => tracing::info!("Analytics flushed"),
            Err(_) => tracing::warn!("analytics: final flush timed out"),
        }
    }

    /// Background worker loop that batches and uploads events.
    async fn worker_loop(
        mut command_rx: mpsc::Receiver<SinkCommand>,
        config: AnalyticsConfig,
        client: reqwest::Client,
    ) {
        let mut pending: HashMap<String, Vec<Value>> = HashMap::new();
        let mut ticker = tokio::time::interval(config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(SinkCommand::Event { collection, event }) => {
                        pending.entry(collection).or_default().push(stamp(event));
                    }
                    Some(SinkCommand::Shutdown { done }) => {
                        flush(&client, &config, &mut pending).await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        flush(&client, &config, &mut pending).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    flush(&client, &config, &mut pending).await;
                }
            }
        }

        tracing::debug!("Analytics worker stopped");
    }
}

/// Attach the client-side timestamp Keen uses for `keen.timestamp`.
fn stamp(mut event: Value) -> Value {
    if let Value::Object(ref mut fields) = event {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let keen = fields
            .entry("keen")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(keen) = keen.as_object_mut() {
            keen.insert("timestamp".to_string(), json!(timestamp));
        }
    }
    event
}

/// Upload and clear everything pending. Failed batches are dropped.
async fn flush(client: &reqwest::Client, config: &AnalyticsConfig, pending: &mut HashMap<String, Vec<Value>>) {
    if pending.values().all(Vec::is_empty) {
        return;
    }

    let batch: Map<String, Value> = pending
        .drain()
        .filter(|(_, events)| !events.is_empty())
        .map(|(collection, events)| (collection, Value::Array(events)))
        .collect();
    let count: usize = batch.values().filter_map(Value::as_array).map(Vec::len).sum();

    let url = format!(
        "{}/projects/{}/events",
        config.api_url.trim_end_matches('/'),
        config.project_id
    );

    let result = client
        .post(&url)
        .header("Authorization", &config.write_key)
        .json(&batch)
        .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
        .send()
        .await;

    match result {
        Ok(response) if response.status().is_success() => {
            tracing::debug!("analytics: uploaded {} events", count);
        }
        Ok(response) => {
            tracing::error!(
                "analytics: upload of {} events rejected: HTTP {}",
                count,
                response.status()
            );
        }
        Err(e) => {
            tracing::error!("analytics: upload of {} events failed: {}", count, e);
        }
    }
}
