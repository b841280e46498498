//! Request scripts: one JSON request per line.
//!
//! ```text
//! {"action":"create","path":["users"],"payload":{"username":"fred"}}
//! {"as_user":"fred","action":"list","path":["notes"],"limit":10}
//! ```
//!
//! Each line may name its principal with `principal` (`{"kind":"user","id":…}`)
//! or `as_user` (a username); lines without either run as system. Blank
//! lines and lines starting with `#` are skipped.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use canopy_core::schema::TYPE_USER;
use canopy_core::{Context, Principal};

use crate::dispatch::ServiceManager;
use crate::request::{RequestState, ServiceRequest};

#[derive(Debug, Clone, Deserialize)]
pub struct RequestLine {
    #[serde(default)]
    pub principal: Option<Principal>,
    #[serde(default)]
    pub as_user: Option<String>,
    #[serde(flatten)]
    pub request: ServiceRequest,
}

/// What happened to one script line.
#[derive(Debug, Clone, Serialize)]
pub struct LineReport {
    pub line: usize,
    pub state: RequestState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LineReport {
    fn failed(line: usize, error: impl ToString) -> Self {
        Self {
            line,
            state: RequestState::Failed,
            results: None,
            error: Some(error.to_string()),
        }
    }
}

/// Run every request in `reader` against `services`.
///
/// `ctx` supplies the tenant, timeout and cancellation signal; each line
/// runs as its own principal. Stops early once `ctx.cancel` is set.
pub async fn run_script<R>(
    services: &ServiceManager,
    ctx: &Context,
    base_uri: &str,
    reader: R,
) -> std::io::Result<Vec<LineReport>>
where
    R: AsyncBufRead + Unpin,
{
    let mut reports = Vec::new();
    let mut lines = reader.lines();
    let mut number = 0;

    while let Some(raw) = lines.next_line().await? {
        number += 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if ctx.cancel.is_cancelled() {
            tracing::info!(line = number, "Script cancelled");
            break;
        }

        let parsed: RequestLine = match serde_json::from_str(trimmed) {
            Ok(parsed) => parsed,
            Err(e) => {
                reports.push(LineReport::failed(number, format!("invalid request: {e}")));
                continue;
            }
        };

        let principal = match (parsed.principal, parsed.as_user.as_deref()) {
            (Some(principal), _) => principal,
            (None, Some(username)) => match services
                .entities()
                .get_alias(ctx, TYPE_USER, username)
                .await
            {
                Ok(user) => Principal::User(user.id),
                Err(e) => {
                    reports.push(LineReport::failed(number, e));
                    continue;
                }
            },
            (None, None) => Principal::System,
        };

        let line_ctx = ctx.as_principal(principal);
        let report = match services.dispatch(&line_ctx, parsed.request).await {
            Ok(results) => LineReport {
                line: number,
                state: RequestState::Completed,
                results: Some(results.to_wire(base_uri, &ctx.tenant_id)),
                error: None,
            },
            Err(e) => LineReport {
                line: number,
                state: e.terminal_state(),
                results: None,
                error: Some(e.to_string()),
            },
        };
        reports.push(report);
    }

    Ok(reports)
}

/// [`run_script`] over a file.
pub async fn run_file(
    services: &ServiceManager,
    ctx: &Context,
    base_uri: &str,
    path: &Path,
) -> std::io::Result<Vec<LineReport>> {
    let file = tokio::fs::File::open(path).await?;
    run_script(services, ctx, base_uri, BufReader::new(file)).await
}
