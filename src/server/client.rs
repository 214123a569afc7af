use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::external::{ClientInfo, ClientSnapshot};

/// Identity fields shared by plain and termite clients, filled in once the
/// probe has run.
#[derive(Debug, Default)]
pub(crate) struct Identity {
    pub fingerprint: String,
    pub info: ClientInfo,
    pub alias: String,
    pub group_dispatch: bool,
}

/// One plaintext reverse-shell connection.
///
/// The read half is behind a lock because the connection classifier's sniff
/// and later interactive consumers share the same stream.
pub struct Client {
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    remote_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    identity: RwLock<Identity>,
}

impl Client {
    pub fn new(stream: TcpStream, remote_addr: SocketAddr, group_dispatch: bool) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
            remote_addr,
            connected_at: Utc::now(),
            identity: RwLock::new(Identity {
                group_dispatch,
                ..Identity::default()
            }),
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

    /// Read up to `max` bytes in a single read call. Returns whatever
    /// arrived, which may be shorter than `max`.
    pub async fn read_some(&self, max: usize) -> std::io::Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; max];
        let n = reader.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Read until `delim` and return the bytes before it, lossily decoded.
    pub async fn read_token(&self, delim: u8) -> std::io::Result<String> {
        let mut reader = self.reader.lock().await;
        let mut buf = Vec::new();
        reader.read_until(delim, &mut buf).await?;
        if buf.last() == Some(&delim) {
            buf.pop();
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Read one CRLF-terminated line, without the terminator.
    pub async fn read_line(&self) -> std::io::Result<String> {
        let mut line = self.read_token(b'\n').await?;
        if line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    pub async fn write_all(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await
    }

    /// Close the connection. Errors are ignored; the peer may be gone.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
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
}
