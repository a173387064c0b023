//! Host directory resolution.
//!
//! A [`HostResolver`] owns the cluster's [`HostSet`]. The static variant
//! serves the configured seed hosts forever; the dynamic variant periodically
//! asks the cluster for its endpoint list and merges it into the set, keeping
//! the `Arc<Host>` (and so the pool) of every endpoint that is still reported.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use fabric_common::protocol::error::Result;
use fabric_common::HostDescription;
use tokio::time::Instant;

use crate::host::{Host, HostFactory};
use crate::host_set::HostSet;

/// Where a dynamic resolver gets the cluster's endpoint list from.
///
/// The executor implements this by sending the discovery request through
/// itself, pinned to `via`.
#[async_trait]
pub trait EndpointSource: Send + Sync {
    async fn fetch_endpoints(&self, via: &HostDescription) -> Result<Vec<HostDescription>>;
}

/// Owns the host set a handler selects from.
///
/// Hosts reached only through a hint or a redirect are kept aside: they get a
/// pool of their own but never join the set, so unpinned calls keep rotating
/// over the configured (or discovered) hosts only.
pub struct HostResolver {
    kind: ResolverKind,
    factory: HostFactory,
    detached: Mutex<HashMap<HostDescription, Arc<Host>>>,
}

enum ResolverKind {
    Static(StaticResolver),
    Dynamic(DynamicResolver),
}

impl HostResolver {
    pub fn new_static(seeds: Vec<HostDescription>, factory: HostFactory) -> Self {
        Self {
            kind: ResolverKind::Static(StaticResolver {
                hosts: seed_set(seeds, &factory),
            }),
            factory,
            detached: Mutex::new(HashMap::new()),
        }
    }

    pub fn new_dynamic(seeds: Vec<HostDescription>, factory: HostFactory, interval: Duration) -> Self {
        Self {
            kind: ResolverKind::Dynamic(DynamicResolver {
                state: Mutex::new(DynamicState {
                    hosts: seed_set(seeds, &factory),
                    last_refresh: None,
                    last_via: None,
                    refreshing: false,
                }),
                interval,
                source: OnceLock::new(),
            }),
            factory,
            detached: Mutex::new(HashMap::new()),
        }
    }

    /// Wires the endpoint source. Only the first call has an effect.
    pub fn init(&self, source: Weak<dyn EndpointSource>) {
        if let ResolverKind::Dynamic(resolver) = &self.kind {
            let _ = resolver.source.set(source);
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.kind, ResolverKind::Dynamic(_))
    }

    /// Returns the current host set, refreshing it first when one is due.
    ///
    /// `initial` requests the seed snapshot without contacting the cluster.
    /// With `close_connections`, idle connections of surviving hosts are
    /// closed after a refresh.
    ///
    /// # Errors
    ///
    /// Whatever the endpoint source failed with on every known host. The set
    /// is left untouched.
    pub async fn resolve(&self, initial: bool, close_connections: bool) -> Result<HostSet> {
        match &self.kind {
            ResolverKind::Static(resolver) => Ok(resolver.hosts.clone()),
            ResolverKind::Dynamic(resolver) => {
                if initial {
                    return Ok(resolver.snapshot());
                }
                resolver.refresh(self, close_connections).await
            }
        }
    }

    /// Current host set without refreshing.
    pub fn snapshot(&self) -> HostSet {
        match &self.kind {
            ResolverKind::Static(resolver) => resolver.hosts.clone(),
            ResolverKind::Dynamic(resolver) => resolver.snapshot(),
        }
    }

    /// The host for a hint or redirect target.
    ///
    /// A host of the set is returned as is; any other description gets a
    /// detached host that is reused for later hints but never selected
    /// otherwise.
    pub fn host_for(&self, description: &HostDescription) -> Arc<Host> {
        if let Some(host) = self.snapshot().get(description) {
            return host.clone();
        }
        lock(&self.detached)
            .entry(description.clone())
            .or_insert_with(|| {
                tracing::debug!(host = %description, "Using host outside the directory");
                self.factory.create(description.clone())
            })
            .clone()
    }

    /// Takes a detached host so a refresh can adopt it with its pool.
    fn adopt(&self, description: &HostDescription) -> Arc<Host> {
        lock(&self.detached)
            .remove(description)
            .unwrap_or_else(|| self.factory.create(description.clone()))
    }

    pub fn close(&self) -> Result<()> {
        let detached: Vec<_> = lock(&self.detached).drain().map(|(_, host)| host).collect();
        let mut result = self.snapshot().close();
        if let Err(err) = HostSet::from_hosts(detached).close() {
            result = result.and(Err(err));
        }
        result
    }
}

struct StaticResolver {
    hosts: HostSet,
}

struct DynamicState {
    hosts: HostSet,
    last_refresh: Option<Instant>,
    /// Host the last successful discovery went through
    last_via: Option<HostDescription>,
    /// Set while a discovery call is in flight so it can resolve hosts itself
    refreshing: bool,
}

struct DynamicResolver {
    state: Mutex<DynamicState>,
    interval: Duration,
    source: OnceLock<Weak<dyn EndpointSource>>,
}

impl DynamicResolver {
    fn snapshot(&self) -> HostSet {
        lock(&self.state).hosts.clone()
    }

    async fn refresh(&self, owner: &HostResolver, close_connections: bool) -> Result<HostSet> {
        let Some(source) = self.source.get().and_then(Weak::upgrade) else {
            return Ok(self.snapshot());
        };

        let candidates = {
            let mut state = lock(&self.state);
            let due = state
                .last_refresh
                .map_or(true, |last| last.elapsed() >= self.interval);
            if state.refreshing || !due || state.hosts.is_empty() {
                return Ok(state.hosts.clone());
            }
            state.refreshing = true;
            state.last_refresh = Some(Instant::now());

            // Start with the host that answered last time
            let mut candidates = state.hosts.descriptions();
            if let Some(index) = state.last_via.as_ref().and_then(|v| state.hosts.position(v)) {
                candidates.rotate_left(index);
            }
            candidates
        };
        let _guard = RefreshGuard { state: &self.state };

        let mut last_err = None;
        let mut discovered = None;
        for via in candidates {
            tracing::debug!(via = %via, "Refreshing host list");
            match source.fetch_endpoints(&via).await {
                Ok(endpoints) => {
                    discovered = Some((via, endpoints));
                    break;
                }
                Err(err) => {
                    tracing::warn!(via = %via, error = %err, "Host discovery failed, trying next host");
                    last_err = Some(err);
                }
            }
        }
        let (via, endpoints) = match (discovered, last_err) {
            (Some(found), _) => found,
            (None, Some(err)) => return Err(err),
            (None, None) => return Ok(self.snapshot()),
        };

        let (snapshot, swept) = {
            let mut state = lock(&self.state);
            state.last_via = Some(via);
            if endpoints.is_empty() {
                tracing::debug!("Cluster reported no endpoints, keeping current hosts");
                return Ok(state.hosts.clone());
            }

            state.hosts.mark_all_for_deletion();
            for endpoint in &endpoints {
                state.hosts.add_or_unmark(endpoint, || owner.adopt(endpoint));
            }
            let swept = state.hosts.sweep();
            if close_connections {
                for host in state.hosts.hosts() {
                    host.close_idle();
                }
            }
            (state.hosts.clone(), swept)
        };

        for host in swept {
            tracing::info!(host = %host, "Removing host no longer reported by the cluster");
            host.retire();
        }
        Ok(snapshot)
    }
}

/// Clears the refreshing flag even if the refresh future is dropped.
struct RefreshGuard<'a> {
    state: &'a Mutex<DynamicState>,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        lock(self.state).refreshing = false;
    }
}

fn seed_set(seeds: Vec<HostDescription>, factory: &HostFactory) -> HostSet {
    HostSet::from_hosts(seeds.into_iter().map(|seed| factory.create(seed)))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
