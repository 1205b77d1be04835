//! JSON-RPC client for the remote microsandbox execution server.
//!
//! Grounded on `original_source/.../resource_manager.py`'s raw JSON-RPC calls
//! (`_get_running_sandboxes`, `_stop_orphan_sandbox`) and the `reqwest`-based
//! client pattern in `other_examples/d3b6caca_..._mcp-client.rs.rs`: one
//! pooled `reqwest::Client`, a typed request/response envelope, bearer auth
//! added per request via `RequestBuilder::bearer_auth`. Stateless — no
//! internal retry, matching the teacher's `StdioPipeTransport`, which also
//! never retries a failed request.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::models::{Flavor, VolumeMapping};

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    message: String,
}

/// Outcome of `sandbox.repl.run`.
#[derive(Debug, Clone, Deserialize)]
pub struct CodeRunOutcome {
    pub stdout: String,
    pub stderr: String,
    pub status: String,
    #[allow(dead_code)]
    pub language: Option<String>,
}

impl CodeRunOutcome {
    /// Per spec.md §4.1: presence of any stderr lines or a non-success
    /// status means the execution "has error", independent of HTTP success.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.status != "success" || !self.stderr.is_empty()
    }
}

/// Outcome of `sandbox.command.run`.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRunOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[allow(dead_code)]
    pub success: bool,
}

/// One entry from `sandbox.metrics.get`.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxMetric {
    pub namespace: String,
    pub name: String,
    pub running: bool,
    #[allow(dead_code)]
    pub cpu_usage: Option<f64>,
    #[allow(dead_code)]
    pub memory_mb: Option<u64>,
    #[allow(dead_code)]
    pub disk_bytes: Option<u64>,
}

/// The set of operations the gateway needs against the remote server.
///
/// A trait so `SessionManager`/`ResourceManager` tests can run against an
/// in-process mock instead of a live server, following the teacher's
/// `MockBackend` pattern in `mcp.rs`'s test module.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn start_sandbox(
        &self,
        namespace: &str,
        name: &str,
        template: &str,
        flavor: Flavor,
        volumes: &[VolumeMapping],
        start_timeout: Duration,
    ) -> Result<(), GatewayError>;

    async fn stop_sandbox(&self, namespace: &str, name: &str) -> Result<(), GatewayError>;

    async fn run_code(
        &self,
        namespace: &str,
        name: &str,
        code: &str,
        exec_timeout: Duration,
    ) -> Result<CodeRunOutcome, GatewayError>;

    async fn run_command(
        &self,
        namespace: &str,
        name: &str,
        command: &str,
        args: &[String],
        exec_timeout: Duration,
    ) -> Result<CommandRunOutcome, GatewayError>;

    async fn list_sandbox_metrics(&self, namespace: &str) -> Result<Vec<SandboxMetric>, GatewayError>;
}

/// Stateless HTTP JSON-RPC client, one per gateway process.
pub struct RemoteClient {
    http: reqwest::Client,
    server_url: String,
    api_key: Option<String>,
    request_id: std::sync::atomic::AtomicU64,
}

impl RemoteClient {
    #[must_use]
    pub fn new(server_url: String, api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_default();
        Self {
            http,
            server_url,
            api_key,
            request_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.request_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, GatewayError> {
        let envelope = RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id(),
        };

        let mut request = self
            .http
            .post(format!("{}/api/v1/rpc", self.server_url))
            .timeout(timeout)
            .json(&envelope);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::connection(&self.server_url, e.into()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(GatewayError::connection(
                &self.server_url,
                anyhow::anyhow!("server returned HTTP {status}"),
            ));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::connection(&self.server_url, e.into()))?;

        if let Some(error) = body.error {
            return Err(GatewayError::connection(
                &self.server_url,
                anyhow::anyhow!("RPC error: {}", error.message),
            ));
        }

        body.result.ok_or_else(|| {
            GatewayError::connection(&self.server_url, anyhow::anyhow!("RPC response had no result"))
        })
    }
}

#[async_trait]
impl RemoteApi for RemoteClient {
    async fn start_sandbox(
        &self,
        namespace: &str,
        name: &str,
        template: &str,
        flavor: Flavor,
        volumes: &[VolumeMapping],
        start_timeout: Duration,
    ) -> Result<(), GatewayError> {
        let params = serde_json::json!({
            "namespace": namespace,
            "name": name,
            "template": template,
            "memory_mb": flavor.memory_mb(),
            "cpus": flavor.cpus(),
            "volumes": volumes.iter().map(ToString::to_string).collect::<Vec<_>>(),
        });
        self.call("sandbox.start", params, start_timeout).await?;
        Ok(())
    }

    async fn stop_sandbox(&self, namespace: &str, name: &str) -> Result<(), GatewayError> {
        let params = serde_json::json!({ "namespace": namespace, "name": name });
        self.call("sandbox.stop", params, Duration::from_secs(30)).await?;
        Ok(())
    }

    async fn run_code(
        &self,
        namespace: &str,
        name: &str,
        code: &str,
        exec_timeout: Duration,
    ) -> Result<CodeRunOutcome, GatewayError> {
        let params = serde_json::json!({ "namespace": namespace, "name": name, "code": code });
        // Allow the remote a little headroom past the caller's execution
        // timeout so it can report its own timeout rather than us synthesizing one.
        let rpc_deadline = exec_timeout + Duration::from_secs(5);
        let result = self.call("sandbox.repl.run", params, rpc_deadline).await?;
        serde_json::from_value(result).map_err(|e| {
            GatewayError::connection(&self.server_url, anyhow::anyhow!("malformed repl.run response: {e}"))
        })
    }

    async fn run_command(
        &self,
        namespace: &str,
        name: &str,
        command: &str,
        args: &[String],
        exec_timeout: Duration,
    ) -> Result<CommandRunOutcome, GatewayError> {
        let params = serde_json::json!({
            "namespace": namespace,
            "name": name,
            "command": command,
            "args": args,
        });
        let rpc_deadline = exec_timeout + Duration::from_secs(5);
        let result = self.call("sandbox.command.run", params, rpc_deadline).await?;
        serde_json::from_value(result).map_err(|e| {
            GatewayError::connection(&self.server_url, anyhow::anyhow!("malformed command.run response: {e}"))
        })
    }

    async fn list_sandbox_metrics(&self, namespace: &str) -> Result<Vec<SandboxMetric>, GatewayError> {
        let params = serde_json::json!({ "namespace": namespace, "sandbox": Value::Null });
        let result = self
            .call("sandbox.metrics.get", params, Duration::from_secs(30))
            .await?;
        serde_json::from_value(result).map_err(|e| {
            GatewayError::connection(&self.server_url, anyhow::anyhow!("malformed metrics.get response: {e}"))
        })
    }
}
