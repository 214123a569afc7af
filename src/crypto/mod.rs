pub mod tls;

use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;

use crate::external::ClientInfo;

/// Format template used when a server is created without one.
///
/// Directives: `%i` remote address, `%u` user, `%m` machine hostname,
/// `%o` operating system, `%t` connect timestamp.
pub const DEFAULT_HASH_FORMAT: &str = "%i %u %m %o %t";

/// Content hash used as a registry key. Truncated sha256, lowercase hex.
pub fn fingerprint(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Expand the format template against a client's probed attributes and
/// hash the result into its registry fingerprint.
pub fn client_fingerprint(
    format: &str,
    remote_addr: &SocketAddr,
    info: &ClientInfo,
    connected_at: &DateTime<Utc>,
) -> String {
    let expanded = format
        .replace("%i", &remote_addr.to_string())
        .replace("%u", &info.user)
        .replace("%m", &info.hostname)
        .replace("%o", &info.os)
        .replace("%t", &connected_at.to_rfc3339());
    fingerprint(&expanded)
}

/// Random lowercase alphanumeric token, used for distributor routes.
pub fn random_token(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        assert_eq!(fingerprint("127.0.0.1:8888"), fingerprint("127.0.0.1:8888"));
        assert_ne!(fingerprint("127.0.0.1:8888"), fingerprint("127.0.0.1:8889"));
        assert_eq!(fingerprint("x").len(), 32);
    }

    #[test]
    fn client_fingerprint_tracks_directives() {
        let addr: SocketAddr = "10.0.0.1:41234".parse().unwrap();
        let now = Utc::now();
        let mut info = ClientInfo {
            user: "root".to_string(),
            ..ClientInfo::default()
        };
        let a = client_fingerprint("%i %u", &addr, &info, &now);
        info.user = "nobody".to_string();
        let b = client_fingerprint("%i %u", &addr, &info, &now);
        assert_ne!(a, b);

        // a template with no directives collapses every client to one key
        let c = client_fingerprint("static", &addr, &info, &now);
        info.user = "root".to_string();
        let d = client_fingerprint("static", &addr, &info, &now);
        assert_eq!(c, d);
    }

    #[test]
    fn random_tokens_have_requested_length() {
        let token = random_token(8);
        assert_eq!(token.len(), 8);
        assert!(token.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
