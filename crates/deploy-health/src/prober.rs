//! Health probe collaborators.
//!
//! [`HttpProber`] issues a single HTTP/1 GET against the check endpoint and
//! compares the response with the expected [`SuccessCondition`].
//!
//! [`SuccessCondition`]: deploy_core::SuccessCondition

use std::time::Duration;

use async_trait::async_trait;
use http_body_util::BodyExt;
use tracing::debug;

use deploy_core::{CollaboratorError, DeployTarget, HealthCheckSpec};

/// Answer from a probe that reached the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// The response matched the success condition.
    Healthy,
    /// The endpoint answered, but not with the expected response.
    Unhealthy,
}

/// Queries a named endpoint and reports reachability and status.
///
/// Connection-level problems should be reported as retryable
/// [`CollaboratorError`]s; malformed endpoints as permanent ones.
#[async_trait]
pub trait HealthProber: Send + Sync {
    async fn probe(
        &self,
        target: &DeployTarget,
        check: &HealthCheckSpec,
    ) -> Result<ProbeStatus, CollaboratorError>;
}

/// Plain-HTTP prober built on a hyper HTTP/1 connection per probe.
#[derive(Debug, Clone, Default)]
pub struct HttpProber {
    user_agent: Option<String>,
}

/// Only the first `MAX_BODY_BYTES` of a response body are matched against.
const MAX_BODY_BYTES: usize = 64 * 1024;

impl HttpProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }
}

#[async_trait]
impl HealthProber for HttpProber {
    async fn probe(
        &self,
        target: &DeployTarget,
        check: &HealthCheckSpec,
    ) -> Result<ProbeStatus, CollaboratorError> {
        let uri: http::Uri = check.endpoint.parse().map_err(|e| {
            CollaboratorError::permanent(format!("invalid health endpoint `{}`: {e}", check.endpoint))
        })?;
        if uri.scheme_str() != Some("http") {
            return Err(CollaboratorError::permanent(format!(
                "health endpoint `{}` must use http://",
                check.endpoint
            )));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| {
                CollaboratorError::permanent(format!(
                    "health endpoint `{}` has no host",
                    check.endpoint
                ))
            })?
            .clone();
        let address = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));
        let agent = self
            .user_agent
            .clone()
            .unwrap_or_else(|| format!("deployctl/{}", env!("CARGO_PKG_VERSION")));

        let (status, body) = tokio::time::timeout(
            check.probe_timeout,
            fetch(&address, &uri, authority.as_str(), &agent),
        )
        .await
        .map_err(|_| {
            CollaboratorError::transient(format!(
                "health probe to {} timed out after {}",
                check.endpoint,
                human(check.probe_timeout)
            ))
        })??;

        if check.expect.matches(status, &body) {
            Ok(ProbeStatus::Healthy)
        } else {
            debug!(
                environment = %target.environment,
                endpoint = %check.endpoint,
                status,
                "health probe did not match expected response"
            );
            Ok(ProbeStatus::Unhealthy)
        }
    }
}

async fn fetch(
    address: &str,
    uri: &http::Uri,
    host: &str,
    agent: &str,
) -> Result<(u16, String), CollaboratorError> {
    let stream = tokio::net::TcpStream::connect(address)
        .await
        .map_err(|e| CollaboratorError::transient(format!("connect to {address} failed: {e}")))?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| CollaboratorError::transient(format!("handshake with {address} failed: {e}")))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let req = http::Request::builder()
        .method("GET")
        .uri(path)
        .header("host", host)
        .header("user-agent", agent)
        .body(http_body_util::Empty::<bytes::Bytes>::new())
        .map_err(|e| CollaboratorError::permanent(format!("invalid probe request: {e}")))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| CollaboratorError::transient(format!("request to {address} failed: {e}")))?;
    let status = resp.status().as_u16();

    let mut body = resp.into_body();
    let mut prefix: Vec<u8> = Vec::new();
    while prefix.len() < MAX_BODY_BYTES {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    let room = MAX_BODY_BYTES - prefix.len();
                    prefix.extend_from_slice(&data[..data.len().min(room)]);
                }
            }
            Some(Err(e)) => {
                return Err(CollaboratorError::transient(format!(
                    "reading response from {address} failed: {e}"
                )));
            }
            None => break,
        }
    }

    Ok((status, String::from_utf8_lossy(&prefix).into_owned()))
}

fn human(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}
