use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::server::TlsStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::external::{ClientInfo, ClientSnapshot, OutputSink, StreamOrigin};
use crate::protocol::{Message, TermiteCodec};
use crate::server::client::Identity;
use crate::server::TcpServer;

/// Lifecycle of one remote-executed process. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Started,
    Terminated,
}

/// Server-side tracking object for one remote process inside a termite
/// client. Created when a start request is issued; advanced only by inbound
/// protocol messages; removed on termination.
pub struct ProcessSession {
    pub key: String,
    pub pid: u32,
    state: ProcessState,
    sink: Option<Arc<dyn OutputSink>>,
}

impl ProcessSession {
    pub fn new(key: String, sink: Option<Arc<dyn OutputSink>>) -> Self {
        Self {
            key,
            pid: 0,
            state: ProcessState::Created,
            sink,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Record the confirmed launch. Refused once the session has advanced
    /// past `Created`.
    pub fn mark_started(&mut self, pid: u32) -> bool {
        if self.state != ProcessState::Created {
            return false;
        }
        self.pid = pid;
        self.state = ProcessState::Started;
        true
    }

    /// Record termination. Valid from `Created` or `Started`; never undone.
    pub fn mark_terminated(&mut self) -> bool {
        if self.state == ProcessState::Terminated {
            return false;
        }
        self.state = ProcessState::Terminated;
        true
    }
}

/// One authenticated, encrypted agent session.
///
/// The decode half is read by exactly one task (the dispatcher); the lock
/// around it covers the window where the handshake probe may still share
/// the codec. Writes come from several tasks and serialize on the encoder
/// lock independently.
pub struct TermiteClient {
    decoder: Mutex<FramedRead<ReadHalf<TlsStream<TcpStream>>, TermiteCodec>>,
    encoder: Mutex<FramedWrite<WriteHalf<TlsStream<TcpStream>>, TermiteCodec>>,
    remote_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    identity: RwLock<Identity>,
    processes: SyncMutex<HashMap<String, ProcessSession>>,
    /// Key of the process currently receiving local stdio; `None` when no
    /// interactive process is in the foreground.
    foreground: SyncMutex<Option<String>>,
}

impl TermiteClient {
    pub fn new(stream: TlsStream<TcpStream>, remote_addr: SocketAddr, group_dispatch: bool) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            decoder: Mutex::new(FramedRead::new(read_half, TermiteCodec::new())),
            encoder: Mutex::new(FramedWrite::new(write_half, TermiteCodec::new())),
            remote_addr,
            connected_at: Utc::now(),
            identity: RwLock::new(Identity {
                group_dispatch,
                ..Identity::default()
            }),
            processes: SyncMutex::new(HashMap::new()),
            foreground: SyncMutex::new(None),
        }
    }

    pub fn remote_addr(&self) -> &SocketAddr {
        &self.remote_addr
    }

    pub fn connected_at(&self) -> &DateTime<Utc> {
        &self.connected_at
    }

    pub fn fingerprint(&self) -> String {
        self.identity.read().fingerprint.clone()
    }

    pub fn set_identity(&self, info: ClientInfo, fingerprint: String) {
        let mut identity = self.identity.write();
        identity.info = info;
        identity.fingerprint = fingerprint;
    }

    pub fn set_alias(&self, alias: String) {
        self.identity.write().alias = alias;
    }

    /// Register a process session in `Created` state under a caller-chosen
    /// key, before the start request goes out to the agent.
    pub fn create_process(&self, key: String, sink: Option<Arc<dyn OutputSink>>) {
        self.processes
            .lock()
            .insert(key.clone(), ProcessSession::new(key, sink));
    }

    pub fn process_state(&self, key: &str) -> Option<ProcessState> {
        self.processes.lock().get(key).map(|p| p.state())
    }

    pub fn process_pid(&self, key: &str) -> Option<u32> {
        self.processes.lock().get(key).map(|p| p.pid)
    }

    pub fn process_count(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn foreground_key(&self) -> Option<String> {
        self.foreground.lock().clone()
    }

    /// Decode one envelope. The dispatcher is the sole caller once the
    /// client is registered.
    pub async fn read_message(&self) -> crate::Result<Message> {
        let mut decoder = self.decoder.lock().await;
        match decoder.next().await {
            Some(Ok(msg)) => Ok(msg),
            Some(Err(e)) => Err(e.into()),
            None => Err(crate::AnteaterError::Protocol("stream closed".to_string())),
        }
    }

    pub async fn write_message(&self, msg: &Message) -> crate::Result<()> {
        let mut encoder = self.encoder.lock().await;
        encoder.send(msg).await?;
        Ok(())
    }

    /// Close the secured connection. Errors are ignored; the peer may be gone.
    pub async fn close(&self) {
        // frames are flushed on every send, so shutting the transport down
        // directly loses nothing
        let mut encoder = self.encoder.lock().await;
        let _ = encoder.get_mut().shutdown().await;
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        let identity = self.identity.read();
        ClientSnapshot {
            fingerprint: identity.fingerprint.clone(),
            remote_addr: self.remote_addr.to_string(),
            os: identity.info.os.clone(),
            user: identity.info.user.clone(),
            python: !identity.info.python2.is_empty() || !identity.info.python3.is_empty(),
            alias: identity.alias.clone(),
            group_dispatch: identity.group_dispatch,
            connected_at: self.connected_at,
        }
    }

    pub fn oneline_desc(&self) -> String {
        let identity = self.identity.read();
        format!("[{}] {}", identity.fingerprint, self.remote_addr)
    }

    pub fn full_desc(&self) -> String {
        let identity = self.identity.read();
        format!(
            "[{}] {} (user: {}, os: {}, connected at: {})",
            identity.fingerprint,
            self.remote_addr,
            identity.info.user,
            identity.info.os,
            self.connected_at.to_rfc3339(),
        )
    }

    async fn handle_message(&self, msg: Message) {
        match msg {
            Message::Stdio { key, data } => {
                let sink = {
                    let processes = self.processes.lock();
                    match processes.get(&key) {
                        Some(process) => process.sink.clone(),
                        None => {
                            tracing::error!(%key, "Stdio for unknown process key");
                            return;
                        }
                    }
                };
                match sink {
                    Some(sink) => sink.write(StreamOrigin::Stdout, &data),
                    None => {
                        let mut stdout = tokio::io::stdout();
                        let _ = stdout.write_all(&data).await;
                        let _ = stdout.flush().await;
                    }
                }
            }
            Message::ProcessStarted { key, pid } => {
                let mut processes = self.processes.lock();
                match processes.get_mut(&key) {
                    Some(process) => {
                        if process.mark_started(pid) {
                            tracing::info!(pid, "Process started");
                            if !process.has_sink() {
                                *self.foreground.lock() = Some(key);
                            }
                        } else {
                            tracing::error!(%key, "Start notice for a non-created session");
                        }
                    }
                    None => tracing::error!(%key, "Start notice for unknown process key"),
                }
            }
            Message::ProcessStopped { key, code } => {
                let mut processes = self.processes.lock();
                match processes.remove(&key) {
                    Some(mut process) => {
                        process.mark_terminated();
                        tracing::info!(pid = process.pid, code, "Process stopped");
                        if !process.has_sink() {
                            *self.foreground.lock() = None;
                        }
                    }
                    None => tracing::error!(%key, "Stop notice for unknown process key"),
                }
            }
            Message::DuplicatedClient {} => {
                // server-to-agent only; an agent echoing it is desynced
                tracing::warn!("Unexpected DuplicatedClient envelope from agent");
            }
        }
    }
}

/// Dedicated per-client task: decode envelopes for the lifetime of the
/// connection and route them to process sessions. Any decode failure,
/// including end-of-stream, tears the client down; reconnection is the
/// agent's responsibility.
pub(crate) async fn run_dispatcher(server: Arc<TcpServer>, client: Arc<TermiteClient>) {
    loop {
        let msg = match client.read_message().await {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(client = %client.oneline_desc(), "Read from client failed: {}", e);
                server.delete_termite_client(&client).await;
                break;
            }
        };
        client.handle_message(msg).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_state_only_moves_forward() {
        let mut session = ProcessSession::new("k".to_string(), None);
        assert_eq!(session.state(), ProcessState::Created);
        assert_eq!(session.pid, 0);

        assert!(session.mark_started(42));
        assert_eq!(session.state(), ProcessState::Started);
        assert_eq!(session.pid, 42);

        // a second start confirmation is refused and changes nothing
        assert!(!session.mark_started(43));
        assert_eq!(session.pid, 42);

        assert!(session.mark_terminated());
        assert_eq!(session.state(), ProcessState::Terminated);
        assert!(!session.mark_terminated());
        assert!(!session.mark_started(44));
        assert_eq!(session.state(), ProcessState::Terminated);
    }

    #[test]
    fn process_may_terminate_before_start_confirmation() {
        let mut session = ProcessSession::new("k".to_string(), None);
        assert!(session.mark_terminated());
        assert_eq!(session.state(), ProcessState::Terminated);
    }
}
