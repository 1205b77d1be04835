//! MCP server adapter over the `Gateway`.
//!
//! Follows the teacher's `mcp.rs` shape (`#[tool_router]`/`#[tool]`/
//! `#[tool_handler]`, stdio transport via `serve_stdio`) while exposing the
//! gateway's public API instead of a single `execute` tool. The tool surface
//! mirrors `original_source/mcp-server/mcp_server/server.py`'s dispatch:
//! `execute_code`, `execute_command`, `get_sessions`, `stop_session`,
//! `get_stats`, `cleanup_orphans` map 1:1 onto `Gateway` methods.

use std::time::Duration;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::info;

use crate::gateway::Gateway;
use crate::logging::log_error;
use crate::models::Flavor;

fn to_mcp_error(err: &crate::error::GatewayError) -> McpError {
    log_error(err);
    McpError::internal_error(err.to_string(), None)
}

fn parse_flavor(raw: Option<&str>) -> Result<Option<Flavor>, McpError> {
    raw.map(|s| s.parse::<Flavor>().map_err(|e| McpError::invalid_params(e, None)))
        .transpose()
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteCodeParams {
    #[schemars(description = "Source code to run")]
    pub code: String,
    #[schemars(description = "Sandbox template: python, node, nodejs, javascript")]
    pub template: Option<String>,
    #[schemars(description = "Existing session id to reuse, or omit to start a fresh session")]
    pub session_id: Option<String>,
    #[schemars(description = "Resource tier: small, medium, large")]
    pub flavor: Option<String>,
    #[schemars(description = "Execution timeout in seconds")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteCommandParams {
    #[schemars(description = "Command to run")]
    pub command: String,
    #[schemars(description = "Arguments for the command")]
    pub args: Option<Vec<String>>,
    pub template: Option<String>,
    pub session_id: Option<String>,
    pub flavor: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetSessionsParams {
    #[schemars(description = "Restrict to a single session id")]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StopSessionParams {
    pub session_id: String,
}

/// MCP server exposing the gateway's execute/session/stats surface.
#[derive(Clone)]
pub struct SandboxGatewayServer {
    gateway: std::sync::Arc<Gateway>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl SandboxGatewayServer {
    #[must_use]
    pub fn new(gateway: std::sync::Arc<Gateway>) -> Self {
        Self {
            gateway,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Run code in a reusable sandbox session, creating one if needed")]
    async fn execute_code(
        &self,
        Parameters(params): Parameters<ExecuteCodeParams>,
    ) -> Result<CallToolResult, McpError> {
        let flavor = parse_flavor(params.flavor.as_deref())?;
        info!(code_len = params.code.len(), "execute_code");
        match self
            .gateway
            .execute_code(
                &params.code,
                params.template.as_deref(),
                params.session_id,
                flavor,
                params.timeout_seconds.map(Duration::from_secs),
            )
            .await
        {
            Ok(result) => {
                let body = serde_json::to_string(&result).unwrap_or_else(|_| result.stdout.clone());
                if result.success {
                    Ok(CallToolResult::success(vec![Content::text(body)]))
                } else {
                    Ok(CallToolResult::error(vec![Content::text(body)]))
                }
            }
            Err(e) => Err(to_mcp_error(&e)),
        }
    }

    #[tool(description = "Run a shell command in a reusable sandbox session, creating one if needed")]
    async fn execute_command(
        &self,
        Parameters(params): Parameters<ExecuteCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        let flavor = parse_flavor(params.flavor.as_deref())?;
        let args = params.args.unwrap_or_default();
        match self
            .gateway
            .execute_command(
                &params.command,
                &args,
                params.template.as_deref(),
                params.session_id,
                flavor,
                params.timeout_seconds.map(Duration::from_secs),
            )
            .await
        {
            Ok(result) => {
                let body = serde_json::to_string(&result).unwrap_or_else(|_| result.stdout.clone());
                if result.success {
                    Ok(CallToolResult::success(vec![Content::text(body)]))
                } else {
                    Ok(CallToolResult::error(vec![Content::text(body)]))
                }
            }
            Err(e) => Err(to_mcp_error(&e)),
        }
    }

    #[tool(description = "List active sandbox sessions, optionally filtered by session id")]
    async fn get_sessions(
        &self,
        Parameters(params): Parameters<GetSessionsParams>,
    ) -> Result<CallToolResult, McpError> {
        let sessions = self.gateway.get_sessions(params.session_id.as_deref()).await;
        let body = serde_json::to_string(&sessions).unwrap_or_default();
        Ok(CallToolResult::success(vec![Content::text(body)]))
    }

    #[tool(description = "Stop a sandbox session by id")]
    async fn stop_session(
        &self,
        Parameters(params): Parameters<StopSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let found = self.gateway.stop_session(&params.session_id).await;
        Ok(CallToolResult::success(vec![Content::text(found.to_string())]))
    }

    #[tool(description = "Get current resource usage statistics for the gateway")]
    async fn get_stats(&self) -> Result<CallToolResult, McpError> {
        let stats = self.gateway.get_stats().await;
        let body = serde_json::to_string(&stats).unwrap_or_default();
        Ok(CallToolResult::success(vec![Content::text(body)]))
    }

    #[tool(description = "Stop sandboxes on the remote server that no longer have a local session")]
    async fn cleanup_orphans(&self) -> Result<CallToolResult, McpError> {
        match self.gateway.cleanup_orphans().await {
            Ok(count) => Ok(CallToolResult::success(vec![Content::text(count.to_string())])),
            Err(e) => Err(to_mcp_error(&e)),
        }
    }
}

#[tool_handler]
impl ServerHandler for SandboxGatewayServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "microsandbox-gateway".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Run code or shell commands against reusable remote sandbox sessions.\n\
                 Use execute_code/execute_command with an optional session_id to reuse \
                 interpreter state across calls."
                    .to_string(),
            ),
        }
    }
}

/// Serve the gateway over stdio.
pub async fn serve_stdio(gateway: std::sync::Arc<Gateway>) -> anyhow::Result<()> {
    let server = SandboxGatewayServer::new(gateway);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::error::GatewayError;
    use crate::models::VolumeMapping;
    use crate::remote::{CodeRunOutcome, CommandRunOutcome, RemoteApi, SandboxMetric};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct EchoRemote;

    #[async_trait]
    impl RemoteApi for EchoRemote {
        async fn start_sandbox(
            &self,
            _namespace: &str,
            _name: &str,
            _template: &str,
            _flavor: Flavor,
            _volumes: &[VolumeMapping],
            _start_timeout: Duration,
        ) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn stop_sandbox(&self, _namespace: &str, _name: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn run_code(
            &self,
            _namespace: &str,
            _name: &str,
            code: &str,
            _exec_timeout: Duration,
        ) -> Result<CodeRunOutcome, GatewayError> {
            Ok(CodeRunOutcome {
                stdout: code.to_string(),
                stderr: String::new(),
                status: "success".to_string(),
                language: None,
            })
        }

        async fn run_command(
            &self,
            _namespace: &str,
            _name: &str,
            _command: &str,
            _args: &[String],
            _exec_timeout: Duration,
        ) -> Result<CommandRunOutcome, GatewayError> {
            Ok(CommandRunOutcome {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                success: true,
            })
        }

        async fn list_sandbox_metrics(&self, _namespace: &str) -> Result<Vec<SandboxMetric>, GatewayError> {
            Ok(Vec::new())
        }
    }

    fn server() -> SandboxGatewayServer {
        let config = Arc::new(GatewayConfig::default());
        let remote: Arc<dyn RemoteApi> = Arc::new(EchoRemote);
        let gateway = Arc::new(Gateway::with_remote(config, remote));
        gateway.start();
        SandboxGatewayServer::new(gateway)
    }

    #[tokio::test]
    async fn execute_code_tool_round_trips() {
        let server = server();
        let params = Parameters(ExecuteCodeParams {
            code: "print(1)".to_string(),
            template: Some("python".to_string()),
            session_id: None,
            flavor: None,
            timeout_seconds: None,
        });
        let result = server.execute_code(params).await.unwrap();
        assert!(!result.is_error.unwrap_or(false));
    }

    #[tokio::test]
    async fn invalid_flavor_is_rejected() {
        let server = server();
        let params = Parameters(ExecuteCodeParams {
            code: "print(1)".to_string(),
            template: None,
            session_id: None,
            flavor: Some("huge".to_string()),
            timeout_seconds: None,
        });
        assert!(server.execute_code(params).await.is_err());
    }
}
