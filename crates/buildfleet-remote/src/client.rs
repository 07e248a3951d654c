use std::time::Duration;

use async_trait::async_trait;
use buildfleet_core::{
    EngineClient, EngineError, EngineResult, NodeConfig, ProgressWriter, RpcStatus,
    SolveRequest, SolveResponse, UsageFilter, UsageRecord,
};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::error::RemoteError;
use crate::wire::{EngineInfo, ErrorBody, SolveEvent};

const USER_AGENT: &str = concat!("buildfleet/", env!("CARGO_PKG_VERSION"));

/// Engine client for one HTTP node.
///
/// The node's `timeout_secs` bounds connecting and the short unary calls
/// (`info`, `usage`). A solve stream lasts as long as the build does.
#[derive(Debug, Clone)]
pub struct HttpEngineClient {
    node: String,
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct UsageQuery<'a> {
    filters: &'a UsageFilter,
}

impl HttpEngineClient {
    pub fn new(node: &NodeConfig) -> Result<Self, RemoteError> {
        let base_url = node.endpoint.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(RemoteError::InvalidEndpoint {
                endpoint: node.endpoint.clone(),
                reason: "expected an http:// or https:// URL".to_string(),
            });
        }
        let timeout = Duration::from_secs(node.timeout_secs());
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            node: node.name.clone(),
            base_url,
            timeout,
            http,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Fetch engine info.
    pub async fn info(&self) -> EngineResult<EngineInfo> {
        let resp = self
            .http
            .get(self.url("/v1/info"))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(RemoteError::from)?;
        let resp = check_status(resp).await?;
        Ok(resp.json().await.map_err(RemoteError::from)?)
    }
}

/// Map a non-2xx answer to its status.
async fn check_status(resp: reqwest::Response) -> EngineResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => Err(EngineError::Rpc(body.into())),
        Err(_) => Err(EngineError::Transport(format!(
            "unexpected status {status}: {}",
            text.trim()
        ))),
    }
}

/// Accumulates the solve stream into a response.
#[derive(Default)]
struct SolveStream {
    buf: Vec<u8>,
    response: SolveResponse,
    finished: bool,
}

impl SolveStream {
    fn feed(&mut self, chunk: &[u8], progress: &ProgressWriter) -> EngineResult<()> {
        self.buf.extend_from_slice(chunk);
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.line(&line, progress)?;
        }
        Ok(())
    }

    fn line(&mut self, raw: &[u8], progress: &ProgressWriter) -> EngineResult<()> {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let event: SolveEvent = serde_json::from_str(text)
            .map_err(|e| RemoteError::Protocol(format!("bad solve event: {e}")))?;
        match event {
            SolveEvent::Status { message } => progress.status(message),
            SolveEvent::Warning(w) => self.response.warnings.push(w),
            SolveEvent::Result {
                exporter_response,
                result,
            } => {
                self.response.exporter_response = exporter_response;
                self.response.result = result;
                self.finished = true;
            }
            SolveEvent::Error(body) => return Err(EngineError::Rpc(RpcStatus::from(body))),
        }
        Ok(())
    }

    fn finish(mut self, progress: &ProgressWriter) -> EngineResult<SolveResponse> {
        let rest = std::mem::take(&mut self.buf);
        self.line(&rest, progress)?;
        if !self.finished {
            return Err(RemoteError::Protocol("solve stream ended before a result".to_string()).into());
        }
        Ok(self.response)
    }
}

#[async_trait]
impl EngineClient for HttpEngineClient {
    #[instrument(skip(self, request, progress), fields(node = %self.node, target = %request.target))]
    async fn solve(
        &self,
        request: &SolveRequest,
        progress: ProgressWriter,
    ) -> EngineResult<SolveResponse> {
        let resp = self
            .http
            .post(self.url("/v1/solve"))
            .json(request)
            .send()
            .await
            .map_err(RemoteError::from)?;
        let mut resp = check_status(resp).await?;

        let mut stream = SolveStream::default();
        while let Some(chunk) = resp.chunk().await.map_err(RemoteError::from)? {
            stream.feed(&chunk, &progress)?;
        }
        let out = stream.finish(&progress)?;
        debug!(warnings = out.warnings.len(), has_result = out.result.is_some(), "solve finished");
        Ok(out)
    }

    async fn usage(&self, filter: &UsageFilter) -> EngineResult<Vec<UsageRecord>> {
        let resp = self
            .http
            .post(self.url("/v1/usage"))
            .timeout(self.timeout)
            .json(&UsageQuery { filters: filter })
            .send()
            .await
            .map_err(RemoteError::from)?;
        let resp = check_status(resp).await?;
        Ok(resp.json().await.map_err(RemoteError::from)?)
    }
}
