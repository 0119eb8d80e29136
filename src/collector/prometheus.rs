use super::{
    ArtifactStatus, CollectorOutcome, CollectorState, Instrumentation, IterationContext, Lifecycle,
    MetricCollector,
};
use crate::{config::PrometheusConfig, target::Target};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

const NAME: &str = "prometheus";

/// A time-series backend answering instant queries.
#[async_trait]
pub trait MetricQuery: Send + Sync {
    async fn query(&self, expression: &str, at: DateTime<Utc>) -> anyhow::Result<Value>;
}

/// [`MetricQuery`] against the Prometheus HTTP API (`/api/v1/query`).
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    client: reqwest::Client,
    url: String,
}

impl PrometheusClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MetricQuery for PrometheusClient {
    async fn query(&self, expression: &str, at: DateTime<Utc>) -> anyhow::Result<Value> {
        debug!("executing prometheus query: {expression}");
        let resp = self
            .client
            .get(format!("{}/api/v1/query", self.url))
            .query(&[("query", expression.to_string()), ("time", at.timestamp().to_string())])
            .send()
            .await
            .context("Error sending prometheus query")?
            .error_for_status()?;

        resp.json().await.context("Error decoding prometheus response")
    }
}

/// Extracts the scalar at `result[0].value[1]`, looking under `data` first as the HTTP API nests
/// it there. Prometheus renders sample values as strings.
pub fn extract_value(response: &Value) -> Option<f64> {
    let result = response
        .get("data")
        .and_then(|data| data.get("result"))
        .or_else(|| response.get("result"))?;

    match result.get(0)?.get("value")?.get(1)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Queries a set of named expressions for every instrumented target at the end of each
/// iteration. It never runs anything on the targets themselves.
pub struct PrometheusSampler {
    config: PrometheusConfig,
    query: Arc<dyn MetricQuery>,
    instrumentation: Instrumentation,
    lifecycle: Lifecycle,
}

impl PrometheusSampler {
    pub fn new(config: PrometheusConfig, fleet: &[Target], query: Arc<dyn MetricQuery>) -> Self {
        let instrumentation = if config.enabled && !config.queries.is_empty() {
            Instrumentation::enabled_for(fleet)
        } else {
            Instrumentation::disabled_for(fleet)
        };
        Self {
            config,
            query,
            instrumentation,
            lifecycle: Lifecycle::new(NAME),
        }
    }

    /// Substitutes `{target}` and `{duration}` (a range selector such as `60s`).
    fn render(template: &str, target: &Target, ctx: &IterationContext) -> String {
        let duration = format!("{}s", ctx.observed_duration().as_secs().max(1));
        template
            .replace("{target}", target.address())
            .replace("{duration}", &duration)
    }

    async fn sample(&self, target: Target, ctx: &IterationContext) -> (Target, ArtifactStatus) {
        let at = ctx.ended_at.unwrap_or_else(Utc::now);
        let mut values = Map::new();

        for (name, template) in &self.config.queries {
            let expression = Self::render(template, &target, ctx);
            match self.query.query(&expression, at).await {
                Ok(response) => {
                    let value = extract_value(&response);
                    if value.is_none() {
                        debug!("{target}: no value for {name}");
                    }
                    values.insert(name.clone(), json!(value));
                }
                Err(err) => {
                    warn!(phase = "end_iteration", "{target}: prometheus query {name} failed: {err:#}");
                    return (
                        target,
                        ArtifactStatus::Absent {
                            reason: format!("query {name} failed: {err}"),
                        },
                    );
                }
            }
        }

        let path = ctx.output_dir.join(format!("prometheus_{target}.json"));
        let document = json!({
            "target": target,
            "iteration": ctx.index,
            "values": values,
        });
        let written = match serde_json::to_vec_pretty(&document) {
            Ok(bytes) => tokio::fs::write(&path, bytes).await.map_err(anyhow::Error::from),
            Err(err) => Err(err.into()),
        };

        match written {
            Ok(()) => (target, ArtifactStatus::Fetched { path }),
            Err(err) => {
                warn!(phase = "end_iteration", "{target}: unable to write {path:?}: {err}");
                (
                    target,
                    ArtifactStatus::Absent {
                        reason: err.to_string(),
                    },
                )
            }
        }
    }
}

#[async_trait]
impl MetricCollector for PrometheusSampler {
    fn name(&self) -> &str {
        NAME
    }

    fn state(&self) -> CollectorState {
        self.lifecycle.state()
    }

    fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }

    async fn init(&mut self) -> anyhow::Result<()> {
        if self.instrumentation.any_enabled() {
            info!(
                "prometheus sampler querying {} with {} expressions",
                self.config.url,
                self.config.queries.len()
            );
        } else {
            info!("prometheus sampler disabled");
        }
        self.lifecycle.initialized();
        Ok(())
    }

    async fn start_iteration(&mut self, _ctx: &IterationContext) -> anyhow::Result<()> {
        self.lifecycle.start()
    }

    async fn end_iteration(&mut self, ctx: &IterationContext) -> CollectorOutcome {
        let mut outcome = CollectorOutcome::skipped(NAME, self.instrumentation.targets().cloned());
        if !self.lifecycle.end() {
            return outcome;
        }

        let samples = self
            .instrumentation
            .enabled()
            .into_iter()
            .map(|target| self.sample(target, ctx));
        for (target, status) in join_all(samples).await {
            outcome.record(target, status);
        }
        outcome
    }

    async fn abort(&mut self) {
        self.lifecycle.abort();
    }
}
