use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::crypto;
use crate::server::client::Client;
use crate::server::termite::TermiteClient;
use crate::server::TcpServer;

/// Classify and register one accepted connection. Runs on its own task.
pub(crate) async fn handle_connection(
    server: Arc<TcpServer>,
    stream: TcpStream,
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
) {
    match acceptor {
        // every connection on an encrypted listener speaks the encrypted
        // protocol; no sniffing
        Some(acceptor) => handle_encrypted(server, stream, addr, acceptor).await,
        None => handle_plain(server, stream, addr).await,
    }
}

async fn handle_encrypted(
    server: Arc<TcpServer>,
    stream: TcpStream,
    addr: SocketAddr,
    acceptor: TlsAcceptor,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            tracing::warn!("TLS handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let client = Arc::new(TermiteClient::new(tls_stream, addr, server.group_dispatch()));

    tracing::info!("Gathering information from client...");
    let probed = tokio::time::timeout(
        server.probe_timeout(),
        server.ctx().probe.probe_termite(&client),
    )
    .await;

    match probed {
        Ok(Ok(info)) => {
            let fingerprint = crypto::client_fingerprint(
                server.hash_format(),
                &addr,
                &info,
                client.connected_at(),
            );
            client.set_identity(info, fingerprint);
            tracing::info!("A new encrypted income connection from {}", addr);
            server.add_termite_client(client).await;
        }
        _ => {
            tracing::info!("Failed to check encrypted income connection from {}", addr);
            client.close().await;
        }
    }
}

async fn handle_plain(server: Arc<TcpServer>, stream: TcpStream, addr: SocketAddr) {
    let client = Arc::new(Client::new(stream, addr, server.group_dispatch()));
    tracing::info!("A new income connection from {}", addr);

    // Reverse shell as a service: sniff up to 4 bytes for an HTTP request
    // signature. A timeout or read error falls through to the reverse-shell
    // path, which is the common case for a shell that sends nothing first.
    let prefix = match tokio::time::timeout(server.sniff_timeout(), client.read_some(4)).await {
        Err(_) => {
            tracing::debug!("Not requesting for service");
            Vec::new()
        }
        Ok(Err(_)) => Vec::new(),
        Ok(Ok(bytes)) => bytes,
    };

    if prefix.as_slice() == b"GET ".as_slice() {
        serve_raas(&server, &client).await;
        return;
    }

    // sniffed bytes are not replayed into the session's read path; a shell
    // that talked first loses its opening bytes
    server.add_client(client).await;
}

/// One-shot HTTP-style delivery request: answer with the staging command
/// for the requested path and close. Never registers a client.
async fn serve_raas(server: &Arc<TcpServer>, client: &Arc<Client>) {
    let request_uri = match client.read_token(b' ').await {
        Ok(uri) => uri,
        Err(e) => {
            tracing::warn!("Malformed RaaS request from {}: {}", client.remote_addr(), e);
            client.close().await;
            return;
        }
    };
    // discard the HTTP version
    let _ = client.read_line().await;

    let mut http_host = format!("{}:{}", server.host(), server.port());
    loop {
        let line = match client.read_line().await {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.is_empty() {
            tracing::debug!("All headers read");
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            if key == "Host" {
                http_host = value.trim().to_string();
            }
        }
    }

    let command = format!(
        "{}\n",
        server.ctx().stager.uri_to_command(&request_uri, &http_host)
    );
    let response = format!(
        "HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        command.len(),
        command
    );
    if let Err(e) = client.write_all(response.as_bytes()).await {
        tracing::warn!("Failed to answer RaaS request: {}", e);
    }
    client.close().await;
    tracing::info!("A RaaS request from {} served", client.remote_addr());
}
