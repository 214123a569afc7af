use dashmap::DashMap;
use std::sync::Arc;

use crate::external::{IdentityProbe, Notifier, Stager};
use crate::server::TcpServer;

/// Process-wide state: the set of live servers plus the collaborator
/// handles they share. Constructed once in `main` (or per test) and passed
/// explicitly; there is no ambient singleton.
pub struct Context {
    /// Server fingerprint -> server. One server per bound host:port.
    pub servers: DashMap<String, Arc<TcpServer>>,
    pub distributor: Distributor,
    pub notifier: Arc<dyn Notifier>,
    pub probe: Arc<dyn IdentityProbe>,
    pub stager: Arc<dyn Stager>,
}

/// Route table consumed by the staged-binary distributor subsystem.
/// Keys are `interface:port` endpoints, values are random routing tokens.
#[derive(Default)]
pub struct Distributor {
    pub routes: DashMap<String, String>,
}

impl Context {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        probe: Arc<dyn IdentityProbe>,
        stager: Arc<dyn Stager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            servers: DashMap::new(),
            distributor: Distributor::default(),
            notifier,
            probe,
            stager,
        })
    }

    pub fn delete_server(&self, fingerprint: &str) {
        self.servers.remove(fingerprint);
    }
}
