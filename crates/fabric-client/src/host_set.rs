use std::sync::Arc;

use fabric_common::protocol::error::Result;
use fabric_common::HostDescription;

use crate::host::Host;

/// Ordered collection of hosts, unique by description.
///
/// Cloning is cheap and yields a snapshot sharing the same `Arc<Host>`s.
#[derive(Debug, Clone, Default)]
pub struct HostSet {
    hosts: Vec<Arc<Host>>,
}

impl HostSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_hosts(hosts: impl IntoIterator<Item = Arc<Host>>) -> Self {
        let mut set = Self::new();
        for host in hosts {
            if set.get(host.description()).is_none() {
                set.hosts.push(host);
            }
        }
        set
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn get(&self, description: &HostDescription) -> Option<&Arc<Host>> {
        self.hosts.iter().find(|h| h.description() == description)
    }

    pub fn position(&self, description: &HostDescription) -> Option<usize> {
        self.hosts.iter().position(|h| h.description() == description)
    }

    pub fn descriptions(&self) -> Vec<HostDescription> {
        self.hosts.iter().map(|h| h.description().clone()).collect()
    }

    /// Unmarks the host with this description, or adds the one `create` builds.
    ///
    /// Returns the host now in the set.
    pub fn add_or_unmark(
        &mut self,
        description: &HostDescription,
        create: impl FnOnce() -> Arc<Host>,
    ) -> Arc<Host> {
        if let Some(host) = self.get(description) {
            host.set_marked_for_deletion(false);
            return host.clone();
        }
        let host = create();
        host.set_marked_for_deletion(false);
        tracing::info!(host = %description, "Adding host");
        self.hosts.push(host.clone());
        host
    }

    pub fn mark_all_for_deletion(&self) {
        for host in &self.hosts {
            host.set_marked_for_deletion(true);
        }
    }

    /// Removes marked hosts and returns them for the caller to retire.
    pub fn sweep(&mut self) -> Vec<Arc<Host>> {
        let (swept, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.hosts)
            .into_iter()
            .partition(|h| h.is_marked_for_deletion());
        self.hosts = kept;
        swept
    }

    /// Closes every host; reports the first failure after trying all of them.
    ///
    /// Hosts with connections still checked out are retired instead.
    pub fn close(&self) -> Result<()> {
        let mut first_err = None;
        for host in &self.hosts {
            if let Err(err) = host.close() {
                tracing::warn!(host = %host, error = %err, "Retiring host with busy connections");
                host.retire();
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
