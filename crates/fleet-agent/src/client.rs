use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use protocol::{
    ChunkRelay, CommandId, CommandResult, HeartbeatReport, HeartbeatResponse, ResultAck,
    StartedNotice,
};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::runner::CommandReporter;

pub const API_KEY_HEADER: &str = "X-API-Key";

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);
const STARTED_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RETRY_DELAYS: [Duration; 2] = [Duration::from_secs(5), Duration::from_secs(15)];

const HEARTBEAT_PATH: &str = "/api/agent/heartbeat";
const STARTED_PATH: &str = "/api/agent/command/started";
const STREAM_PATH: &str = "/api/agent/command/stream";
const RESULT_PATH: &str = "/api/agent/command/result";

/// HTTP side of the agent: heartbeats, relays and results.
#[derive(Debug, Clone)]
pub struct ServerClient {
    http: Client,
    base_url: String,
    api_key: String,
    relay_timeout: Duration,
    result_timeout: Duration,
    retry_delays: Vec<Duration>,
}

impl ServerClient {
    pub fn new(config: &AgentConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .user_agent(format!("fleet-agent/{}", crate::AGENT_VERSION))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            relay_timeout: Duration::from_secs(config.limits.relay_timeout_secs.max(1)),
            result_timeout: Duration::from_secs(config.limits.result_timeout_secs.max(1)),
            retry_delays: DEFAULT_RETRY_DELAYS.to_vec(),
        })
    }

    /// Delays between heartbeat attempts; one attempt more than delays.
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    pub async fn heartbeat(&self, report: &HeartbeatReport) -> anyhow::Result<HeartbeatResponse> {
        let response = self.post(HEARTBEAT_PATH, report, HEARTBEAT_TIMEOUT).await?;
        decode(response, HEARTBEAT_PATH).await
    }

    /// Retries the heartbeat with backoff. Returns `None` on shutdown.
    pub async fn heartbeat_with_retry(
        &self,
        report: &HeartbeatReport,
        shutdown: &CancellationToken,
    ) -> Option<anyhow::Result<HeartbeatResponse>> {
        let mut delays = self.retry_delays.iter();
        loop {
            let err = match self.heartbeat(report).await {
                Ok(response) => return Some(Ok(response)),
                Err(err) => err,
            };
            let Some(delay) = delays.next() else {
                return Some(Err(err));
            };
            tracing::warn!(
                event = "heartbeat.retry",
                error = %err,
                delay = %humantime::format_duration(*delay),
                "heartbeat failed, retrying"
            );
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(*delay) => {}
            }
        }
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        timeout: Duration,
    ) -> anyhow::Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("POST {path} returned {status}: {}", detail.trim());
        }
        Ok(response)
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response, path: &str) -> anyhow::Result<T> {
    response
        .json::<T>()
        .await
        .with_context(|| format!("decode response from {path}"))
}

#[async_trait]
impl CommandReporter for ServerClient {
    async fn command_started(&self, id: CommandId) -> anyhow::Result<()> {
        self.post(STARTED_PATH, &StartedNotice { command_id: id }, STARTED_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn relay_chunk(&self, id: CommandId, chunk: &str) -> anyhow::Result<()> {
        let relay = ChunkRelay {
            command_id: id,
            chunk: chunk.to_string(),
        };
        self.post(STREAM_PATH, &relay, self.relay_timeout).await?;
        Ok(())
    }

    async fn report_result(&self, result: &CommandResult) -> anyhow::Result<ResultAck> {
        let response = self.post(RESULT_PATH, result, self.result_timeout).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(ResultAck { applied: true });
        }
        decode(response, RESULT_PATH).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> AgentConfig {
        let mut config = AgentConfig::parse("api_key = \"agent-key\"").expect("parse");
        config.server_url = url.to_string();
        config
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = ServerClient::new(&config("http://127.0.0.1:8080/")).expect("client");
        assert_eq!(client.base_url, "http://127.0.0.1:8080");
        assert_eq!(client.retry_delays, DEFAULT_RETRY_DELAYS.to_vec());
    }

    #[tokio::test]
    async fn heartbeat_gives_up_after_retries() {
        // Nothing listens on port 9 on loopback.
        let client = ServerClient::new(&config("http://127.0.0.1:9"))
            .expect("client")
            .with_retry_delays(vec![Duration::from_millis(1), Duration::from_millis(1)]);
        let report = HeartbeatReport {
            agent_version: "test".to_string(),
            host: Default::default(),
            in_flight: Vec::new(),
        };
        let outcome = client
            .heartbeat_with_retry(&report, &CancellationToken::new())
            .await
            .expect("not cancelled");
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff() {
        let client = ServerClient::new(&config("http://127.0.0.1:9"))
            .expect("client")
            .with_retry_delays(vec![Duration::from_secs(60)]);
        let report = HeartbeatReport {
            agent_version: "test".to_string(),
            host: Default::default(),
            in_flight: Vec::new(),
        };
        let shutdown = CancellationToken::new();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            client.heartbeat_with_retry(&report, &shutdown),
        )
        .await
        .expect("returns promptly");
        assert!(outcome.is_none());
    }
}
