//! Host selection strategies.
//!
//! A [`HostHandler`] is consulted before every call to pick the host to talk
//! to, and told about the outcome so it can fail over. One handler is shared
//! by all concurrent calls of an executor.
//!
//! # Strategies
//!
//! - **Fallback**: stays on one host until it fails, then walks the host list;
//!   gives up after `max_iterations` full cycles without a success
//! - **Random**: starts each client on a random host and falls back from there
//! - **Round-robin**: rotates through the hosts on every call

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use fabric_common::{AccessType, HostDescription};
use rand::Rng;

use crate::host::Host;
use crate::host_set::HostSet;
use crate::resolver::HostResolver;

/// Default number of full cycles over the host list before giving up.
pub const DEFAULT_MAX_ITERATIONS: usize = 3;

pub enum HostHandler {
    Fallback(FallbackHandler),
    Random(RandomHandler),
    RoundRobin(RoundRobinHandler),
}

impl HostHandler {
    pub fn fallback(resolver: Arc<HostResolver>, max_iterations: usize) -> Self {
        HostHandler::Fallback(FallbackHandler::new(resolver, max_iterations))
    }

    pub fn random(resolver: Arc<HostResolver>, max_iterations: usize) -> Self {
        HostHandler::Random(RandomHandler::new(resolver, max_iterations))
    }

    pub fn round_robin(resolver: Arc<HostResolver>) -> Self {
        HostHandler::RoundRobin(RoundRobinHandler::new(resolver))
    }

    /// Picks the host for the next attempt.
    ///
    /// A hint pins the call to that host, even one outside the directory.
    /// `None` means every host has been exhausted.
    pub async fn get(
        &self,
        hint: Option<&HostDescription>,
        access: AccessType,
    ) -> Option<Arc<Host>> {
        let host = match self {
            HostHandler::Fallback(handler) => handler.get(hint).await,
            HostHandler::Random(handler) => handler.get(hint).await,
            HostHandler::RoundRobin(handler) => handler.get(hint).await,
        };
        if let Some(host) = &host {
            tracing::trace!(host = %host, ?access, "Selected host");
            self.core().remember(host);
        }
        host
    }

    /// The last call succeeded.
    pub fn success(&self) {
        match self {
            HostHandler::Fallback(handler) => handler.success(),
            HostHandler::Random(handler) => handler.success(),
            HostHandler::RoundRobin(handler) => handler.success(),
        }
    }

    /// The last call failed on its host; the next `get` picks another.
    pub fn fail(&self) {
        match self {
            HostHandler::Fallback(handler) => handler.fail(),
            HostHandler::Random(handler) => handler.fail(),
            HostHandler::RoundRobin(handler) => handler.fail(),
        }
    }

    pub fn reset(&self) {
        match self {
            HostHandler::Fallback(handler) => handler.reset(),
            HostHandler::Random(handler) => handler.reset(),
            HostHandler::RoundRobin(handler) => handler.reset(),
        }
    }

    /// Whether another attempt may find a host.
    pub fn has_next(&self) -> bool {
        match self {
            HostHandler::Fallback(handler) => handler.has_next(),
            HostHandler::Random(handler) => handler.fallback.has_next(),
            HostHandler::RoundRobin(handler) => handler.has_next(),
        }
    }

    /// Called after a successful call; the first time, starts host discovery.
    pub async fn confirm(&self) {
        self.core().confirm().await;
    }

    /// Closes the idle connections of the host used last.
    pub fn close_current_on_error(&self) {
        self.core().close_current_on_error();
    }

    /// Host picked by the most recent `get`.
    pub fn last_attempted(&self) -> Option<HostDescription> {
        self.core().last().map(|h| h.description().clone())
    }

    pub fn resolver(&self) -> &Arc<HostResolver> {
        &self.core().resolver
    }

    /// Current hosts without refreshing.
    pub fn hosts(&self) -> HostSet {
        self.core().resolver.snapshot()
    }

    pub fn close(&self) -> fabric_common::Result<()> {
        self.core().resolver.close()
    }

    fn core(&self) -> &HandlerCore {
        match self {
            HostHandler::Fallback(handler) => &handler.core,
            HostHandler::Random(handler) => &handler.fallback.core,
            HostHandler::RoundRobin(handler) => &handler.core,
        }
    }
}

/// State every strategy shares.
struct HandlerCore {
    resolver: Arc<HostResolver>,
    confirmed: AtomicBool,
    last: Mutex<Option<Arc<Host>>>,
}

impl HandlerCore {
    fn new(resolver: Arc<HostResolver>) -> Self {
        Self {
            resolver,
            confirmed: AtomicBool::new(false),
            last: Mutex::new(None),
        }
    }

    /// Re-resolves the host set, keeping the previous one if discovery fails.
    async fn hosts(&self) -> HostSet {
        let initial = !self.confirmed.load(Ordering::SeqCst);
        match self.resolver.resolve(initial, false).await {
            Ok(hosts) => hosts,
            Err(err) => {
                tracing::warn!(error = %err, "Host discovery failed, keeping current hosts");
                self.resolver.snapshot()
            }
        }
    }

    fn hinted(&self, hint: &HostDescription) -> Arc<Host> {
        self.resolver.host_for(hint)
    }

    async fn confirm(&self) {
        if self.confirmed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.resolver.is_dynamic() {
            tracing::debug!("First call confirmed, acquiring host list");
            if let Err(err) = self.resolver.resolve(false, false).await {
                tracing::warn!(error = %err, "Host discovery failed, keeping current hosts");
            }
        }
    }

    fn remember(&self, host: &Arc<Host>) {
        *lock(&self.last) = Some(host.clone());
    }

    fn last(&self) -> Option<Arc<Host>> {
        lock(&self.last).clone()
    }

    fn close_current_on_error(&self) {
        if let Some(host) = self.last() {
            let closed = host.close_idle();
            tracing::debug!(host = %host, closed, "Closed idle connections after error");
        }
    }
}

struct FallbackState {
    hosts: HostSet,
    current: Option<HostDescription>,
    last_success: Option<HostDescription>,
    iterations: usize,
}

/// Sticky host with ordered failover.
pub struct FallbackHandler {
    core: HandlerCore,
    state: Mutex<FallbackState>,
    max_iterations: usize,
}

impl FallbackHandler {
    fn new(resolver: Arc<HostResolver>, max_iterations: usize) -> Self {
        Self {
            core: HandlerCore::new(resolver),
            state: Mutex::new(FallbackState {
                hosts: HostSet::new(),
                current: None,
                last_success: None,
                iterations: 0,
            }),
            max_iterations,
        }
    }

    async fn get(&self, hint: Option<&HostDescription>) -> Option<Arc<Host>> {
        let hosts = self.core.hosts().await;
        match hint {
            Some(hint) => Some(self.core.hinted(hint)),
            None => self.select(hosts),
        }
    }

    fn select(&self, hosts: HostSet) -> Option<Arc<Host>> {
        let mut state = lock(&self.state);
        state.hosts = hosts;
        if state.iterations >= self.max_iterations {
            return None;
        }

        // The current host may have been swept by a refresh
        let index = state
            .current
            .as_ref()
            .and_then(|c| state.hosts.position(c))
            .or_else(|| state.last_success.as_ref().and_then(|s| state.hosts.position(s)))
            .unwrap_or(0);
        let host = state.hosts.hosts().get(index)?.clone();
        state.current = Some(host.description().clone());
        Some(host)
    }

    fn pin(&self, description: &HostDescription) {
        lock(&self.state).current = Some(description.clone());
    }

    fn success(&self) {
        let mut state = lock(&self.state);
        state.last_success = state.current.clone();
        state.iterations = 0;
    }

    fn fail(&self) {
        let mut state = lock(&self.state);
        let len = state.hosts.len();
        if len == 0 {
            state.iterations += 1;
            return;
        }
        let index = state
            .current
            .as_ref()
            .and_then(|c| state.hosts.position(c))
            .unwrap_or(0);
        let mut next = index + 1;
        if next >= len {
            next = 0;
            state.iterations += 1;
        }
        state.current = Some(state.hosts.hosts()[next].description().clone());
        tracing::debug!(
            next = ?state.current,
            iterations = state.iterations,
            "Falling back to next host"
        );
    }

    fn reset(&self) {
        lock(&self.state).iterations = 0;
    }

    fn has_next(&self) -> bool {
        lock(&self.state).iterations < self.max_iterations
    }
}

/// Random origin host with fallback from there.
pub struct RandomHandler {
    fallback: FallbackHandler,
    origin: Mutex<Option<HostDescription>>,
    failing: AtomicBool,
}

impl RandomHandler {
    fn new(resolver: Arc<HostResolver>, max_iterations: usize) -> Self {
        Self {
            fallback: FallbackHandler::new(resolver, max_iterations),
            origin: Mutex::new(None),
            failing: AtomicBool::new(false),
        }
    }

    async fn get(&self, hint: Option<&HostDescription>) -> Option<Arc<Host>> {
        let hosts = self.fallback.core.hosts().await;
        if let Some(hint) = hint {
            return Some(self.fallback.core.hinted(hint));
        }

        if !self.failing.load(Ordering::SeqCst) {
            let origin = {
                let mut origin = lock(&self.origin);
                let known = origin.as_ref().is_some_and(|o| hosts.get(o).is_some());
                if !known && !hosts.is_empty() {
                    let index = rand::thread_rng().gen_range(0..hosts.len());
                    *origin = Some(hosts.hosts()[index].description().clone());
                    tracing::debug!(origin = ?origin, "Picked random origin host");
                }
                origin.clone()
            };
            if let Some(origin) = origin {
                self.fallback.pin(&origin);
            }
        }
        self.fallback.select(hosts)
    }

    fn success(&self) {
        self.failing.store(false, Ordering::SeqCst);
        self.fallback.success();
    }

    fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
        self.fallback.fail();
    }

    fn reset(&self) {
        *lock(&self.origin) = None;
        self.failing.store(false, Ordering::SeqCst);
        self.fallback.reset();
    }
}

struct RoundRobinState {
    hosts: HostSet,
    current: usize,
    fails: usize,
}

/// Rotates through the hosts on every call.
pub struct RoundRobinHandler {
    core: HandlerCore,
    state: Mutex<RoundRobinState>,
}

impl RoundRobinHandler {
    fn new(resolver: Arc<HostResolver>) -> Self {
        Self {
            core: HandlerCore::new(resolver),
            state: Mutex::new(RoundRobinState {
                hosts: HostSet::new(),
                current: 0,
                fails: 0,
            }),
        }
    }

    async fn get(&self, hint: Option<&HostDescription>) -> Option<Arc<Host>> {
        let hosts = self.core.hosts().await;
        if let Some(hint) = hint {
            return Some(self.core.hinted(hint));
        }

        let mut state = lock(&self.state);
        state.hosts = hosts;
        let len = state.hosts.len();
        if len == 0 || state.fails > len {
            return None;
        }
        let host = state.hosts.hosts()[state.current % len].clone();
        state.current = state.current.wrapping_add(1);
        Some(host)
    }

    fn success(&self) {
        lock(&self.state).fails = 0;
    }

    fn fail(&self) {
        lock(&self.state).fails += 1;
    }

    fn reset(&self) {
        lock(&self.state).fails = 0;
    }

    fn has_next(&self) -> bool {
        let state = lock(&self.state);
        state.fails <= state.hosts.len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostFactory;
    use crate::pool::PoolConfig;
    use crate::resolver::EndpointSource;
    use crate::testing::{desc, MockFactory};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn static_resolver(ports: &[u16]) -> Arc<HostResolver> {
        let factory = HostFactory::new(PoolConfig::default(), MockFactory::new());
        Arc::new(HostResolver::new_static(
            ports.iter().map(|p| desc(*p)).collect(),
            factory,
        ))
    }

    async fn pick(handler: &HostHandler) -> Option<HostDescription> {
        handler
            .get(None, AccessType::Read)
            .await
            .map(|h| h.description().clone())
    }

    #[tokio::test]
    async fn test_fallback_is_sticky_until_failure() {
        let handler = HostHandler::fallback(static_resolver(&[1, 2, 3]), 3);

        assert_eq!(pick(&handler).await, Some(desc(1)));
        handler.success();
        assert_eq!(pick(&handler).await, Some(desc(1)));

        handler.fail();
        assert_eq!(pick(&handler).await, Some(desc(2)));
        handler.fail();
        assert_eq!(pick(&handler).await, Some(desc(3)));
        handler.fail();
        assert_eq!(pick(&handler).await, Some(desc(1)));
    }

    #[tokio::test]
    async fn test_fallback_gives_up_after_max_iterations() {
        let handler = HostHandler::fallback(static_resolver(&[1, 2]), 3);

        let mut attempts = 0;
        while pick(&handler).await.is_some() {
            attempts += 1;
            handler.fail();
            assert!(attempts <= 6, "handler never gave up");
        }
        assert_eq!(attempts, 6);
        assert!(!handler.has_next());

        handler.reset();
        assert!(handler.has_next());
        assert!(pick(&handler).await.is_some());
    }

    #[tokio::test]
    async fn test_fallback_success_resets_iterations() {
        let handler = HostHandler::fallback(static_resolver(&[1]), 2);

        handler.get(None, AccessType::Read).await.unwrap();
        handler.fail();
        handler.get(None, AccessType::Read).await.unwrap();
        handler.success();
        handler.fail();
        assert!(handler.has_next());
        assert_eq!(pick(&handler).await, Some(desc(1)));
    }

    #[tokio::test]
    async fn test_random_falls_back_and_reverts_to_origin() {
        let handler = HostHandler::random(static_resolver(&[1, 2, 3]), 3);

        let origin = pick(&handler).await.unwrap();
        for _ in 0..5 {
            assert_eq!(pick(&handler).await, Some(origin.clone()));
        }

        handler.fail();
        let fallback = pick(&handler).await.unwrap();
        assert_ne!(fallback, origin);

        handler.success();
        assert_eq!(pick(&handler).await, Some(origin));
    }

    #[tokio::test]
    async fn test_random_origin_is_spread() {
        let mut seen = HashMap::new();
        for _ in 0..60 {
            let handler = HostHandler::random(static_resolver(&[1, 2, 3]), 3);
            *seen.entry(pick(&handler).await.unwrap()).or_insert(0) += 1;
        }
        assert!(seen.len() > 1);
    }

    #[tokio::test]
    async fn test_round_robin_fairness() {
        let handler = HostHandler::round_robin(static_resolver(&[1, 2, 3]));

        let mut counts: HashMap<HostDescription, usize> = HashMap::new();
        for _ in 0..9 {
            let host = pick(&handler).await.unwrap();
            handler.success();
            *counts.entry(host).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|c| *c == 3));
    }

    #[tokio::test]
    async fn test_round_robin_gives_up_after_host_count_failures() {
        let handler = HostHandler::round_robin(static_resolver(&[1, 2]));

        let mut attempts = 0;
        while pick(&handler).await.is_some() {
            attempts += 1;
            handler.fail();
        }
        assert_eq!(attempts, 3);

        handler.success();
        assert!(pick(&handler).await.is_some());
    }

    #[tokio::test]
    async fn test_hint_pins_host() {
        for handler in [
            HostHandler::fallback(static_resolver(&[1, 2]), 3),
            HostHandler::random(static_resolver(&[1, 2]), 3),
            HostHandler::round_robin(static_resolver(&[1, 2])),
        ] {
            let pinned = handler.get(Some(&desc(2)), AccessType::Read).await.unwrap();
            assert_eq!(pinned.description(), &desc(2));

            let redirected = handler.get(Some(&desc(7)), AccessType::Write).await.unwrap();
            assert_eq!(redirected.description(), &desc(7));
            assert_eq!(handler.last_attempted(), Some(desc(7)));
            assert_eq!(handler.hosts().descriptions(), vec![desc(1), desc(2)]);
        }
    }

    #[tokio::test]
    async fn test_redirect_target_is_not_rotated_onto() {
        let handler = HostHandler::round_robin(static_resolver(&[1]));
        let target = handler.get(Some(&desc(9)), AccessType::Read).await.unwrap();
        handler.fail();

        let mut picks = Vec::new();
        for _ in 0..4 {
            let host = handler.get(None, AccessType::Read).await.unwrap();
            handler.success();
            picks.push(host.description().port());
        }
        assert_eq!(picks, vec![desc(1).port(); 4]);

        // Later hints reuse the same detached host
        let again = handler.get(Some(&desc(9)), AccessType::Read).await.unwrap();
        assert!(Arc::ptr_eq(&target, &again));
    }

    #[tokio::test]
    async fn test_close_current_on_error() {
        let handler = HostHandler::fallback(static_resolver(&[1]), 3);
        let host = handler.get(None, AccessType::Read).await.unwrap();
        host.acquire().await.unwrap().dispose().unwrap();
        assert_eq!(host.stats().idle, 1);

        handler.close_current_on_error();
        assert_eq!(host.stats().idle, 0);
    }

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EndpointSource for CountingSource {
        async fn fetch_endpoints(&self, _via: &HostDescription) -> fabric_common::Result<Vec<HostDescription>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![desc(1), desc(2)])
        }
    }

    #[tokio::test]
    async fn test_confirm_triggers_first_discovery_once() {
        let factory = HostFactory::new(PoolConfig::default(), MockFactory::new());
        let resolver = Arc::new(HostResolver::new_dynamic(
            vec![desc(1)],
            factory,
            std::time::Duration::from_secs(3600),
        ));
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let source_dyn: Arc<dyn EndpointSource> = source.clone();
        resolver.init(Arc::downgrade(&source_dyn));

        let handler = HostHandler::fallback(resolver, 3);
        handler.get(None, AccessType::Read).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);

        handler.success();
        handler.confirm().await;
        handler.confirm().await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.hosts().descriptions(), vec![desc(1), desc(2)]);
    }
}
