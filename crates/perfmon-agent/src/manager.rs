//! Process-wide profiling orchestrator
//!
//! Framework adapters hold one [`ProfilerManager`] and call
//! [`start_profiling`](ProfilerManager::start_profiling) when a request
//! arrives and [`stop_profiling`](ProfilerManager::stop_profiling) when it
//! completes, or use [`profile`](ProfilerManager::profile) for a scope guard
//! that stops on every exit path.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, ConfigUpdate, SharedConfig};
use crate::context::{ContextKey, RequestContext, ResponseContext};
use crate::error::{contain, PerfmonError, Result};
use crate::sampler::{SamplerFactory, ScopeSamplerFactory};
use crate::sampling::SamplingPolicy;
use crate::session::ProfilingSession;
use crate::transmitter::{HttpTransport, Transmitter, Transport};

/// Builder for [`ProfilerManager`]
pub struct ProfilerManagerBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    sampler_factory: Option<Arc<dyn SamplerFactory>>,
}

impl ProfilerManagerBuilder {
    /// Deliver records through a custom transport instead of HTTP
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a custom stack sampler (defaults to [`ScopeSamplerFactory`])
    pub fn sampler_factory(mut self, factory: Arc<dyn SamplerFactory>) -> Self {
        self.sampler_factory = Some(factory);
        self
    }

    /// Validate the configuration and start the transmitter
    pub fn build(self) -> Result<ProfilerManager> {
        self.config.validate()?;

        let enabled = self.config.enabled;
        tracing::info!(config = %self.config, "Initializing profiler");

        let shared = SharedConfig::new(self.config);
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&shared.snapshot())?),
        };
        let transmitter = Transmitter::with_transport(shared.clone(), transport)?;

        Ok(ProfilerManager {
            config: shared,
            enabled: AtomicBool::new(enabled),
            policy: SamplingPolicy::new(),
            sessions: DashMap::new(),
            sampler_factory: self
                .sampler_factory
                .unwrap_or_else(|| Arc::new(ScopeSamplerFactory)),
            transmitter,
        })
    }
}

/// Owns the active sessions, the live configuration and the transmitter
pub struct ProfilerManager {
    config: SharedConfig,
    enabled: AtomicBool,
    policy: SamplingPolicy,
    /// At most one session per execution context
    sessions: DashMap<ContextKey, ProfilingSession>,
    sampler_factory: Arc<dyn SamplerFactory>,
    transmitter: Transmitter,
}

impl ProfilerManager {
    /// Create a manager with the default HTTP transport and sampler
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> ProfilerManagerBuilder {
        ProfilerManagerBuilder {
            config,
            transport: None,
            sampler_factory: None,
        }
    }

    /// Start profiling the request handled by the calling thread.
    ///
    /// Returns the trace id, or `None` if the request was not sampled or a
    /// session could not be started.
    pub fn start_profiling(&self, request: &RequestContext) -> Option<String> {
        self.start_profiling_for(ContextKey::current(), request)
    }

    /// Start profiling under an explicit execution context key
    pub fn start_profiling_for(&self, key: ContextKey, request: &RequestContext) -> Option<String> {
        contain("start_profiling", None, || self.try_start(key, request))
    }

    fn try_start(&self, key: ContextKey, request: &RequestContext) -> Option<String> {
        let config = self.config.snapshot();
        if !self.policy.should_sample(&config, self.is_enabled(), request) {
            return None;
        }

        if let Some(existing) = self.sessions.get(&key) {
            if existing.age() < config.max_session_age {
                tracing::warn!(
                    context = %key,
                    trace_id = %existing.trace_id(),
                    path = %request.path,
                    "Session already active on this context, not starting another"
                );
                return None;
            }
        }

        let max_age = config.max_session_age;
        if let Some((_, stale)) = self.sessions.remove_if(&key, |_, s| s.age() >= max_age) {
            tracing::warn!(
                context = %key,
                trace_id = %stale.trace_id(),
                age_secs = stale.age().as_secs_f64(),
                "Discarding abandoned session"
            );
            stale.discard();
        }

        let session = match ProfilingSession::start(request, self.sampler_factory.as_ref()) {
            Ok(session) => session,
            Err(PerfmonError::SessionConflict(message)) => {
                tracing::warn!(context = %key, "{}", message);
                return None;
            }
            Err(e) => {
                tracing::error!(context = %key, error = %e, "Failed to start profiling");
                return None;
            }
        };

        let trace_id = session.trace_id().to_string();
        self.sessions.insert(key, session);
        Some(trace_id)
    }

    /// Stop the calling thread's session and hand its record to the
    /// transmitter. Returns whether a record was produced.
    pub fn stop_profiling(&self, response: &ResponseContext) -> bool {
        self.stop_profiling_for(ContextKey::current(), response)
    }

    /// Stop the session registered under `key`
    pub fn stop_profiling_for(&self, key: ContextKey, response: &ResponseContext) -> bool {
        contain("stop_profiling", false, || {
            let Some((_, session)) = self.sessions.remove(&key) else {
                return false;
            };

            let config = self.config.snapshot();
            let Some(record) = session.stop(response, &config) else {
                return false;
            };

            if config.async_send {
                self.transmitter.send_async(record);
            } else {
                self.transmitter.send_sync(&record);
            }
            true
        })
    }

    /// Profile a request for as long as the returned guard lives
    pub fn profile(&self, request: &RequestContext) -> ProfileGuard<'_> {
        let key = ContextKey::current();
        ProfileGuard {
            manager: self,
            key,
            trace_id: self.start_profiling_for(key, request),
            response: None,
        }
    }

    /// Remove every session older than `max_session_age`; returns how many
    pub fn reap_abandoned(&self) -> usize {
        let max_age = self.config.snapshot().max_session_age;
        let stale: Vec<ContextKey> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().age() >= max_age)
            .map(|entry| *entry.key())
            .collect();

        let mut removed = 0;
        for key in stale {
            if let Some((_, session)) = self.sessions.remove_if(&key, |_, s| s.age() >= max_age) {
                tracing::warn!(
                    context = %key,
                    trace_id = %session.trace_id(),
                    "Reaping abandoned session"
                );
                session.discard();
                removed += 1;
            }
        }
        removed
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
        tracing::info!("Profiling enabled");
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        tracing::info!("Profiling disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Apply a runtime configuration update.
    ///
    /// Invalid updates are rejected and logged; the previous configuration
    /// stays live.
    pub fn update_config(&self, update: &ConfigUpdate) -> bool {
        match self.config.update(update) {
            Ok((config, changed)) => {
                if update.enabled.is_some() {
                    self.enabled.store(config.enabled, Ordering::Release);
                }
                self.policy.retain_patterns(&config);
                tracing::info!(changed = ?changed, "Configuration updated");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Rejected configuration update");
                false
            }
        }
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<Config> {
        self.config.snapshot()
    }

    /// Number of sessions currently in flight
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn transmitter(&self) -> &Transmitter {
        &self.transmitter
    }

    /// Wait for queued records to be delivered
    pub fn flush(&self, timeout: Duration) -> bool {
        self.transmitter.flush(timeout)
    }

    /// Drop in-flight sessions and shut the transmitter down. Idempotent.
    pub fn close(&self) {
        let keys: Vec<ContextKey> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, session)) = self.sessions.remove(&key) {
                tracing::debug!(trace_id = %session.trace_id(), "Dropping in-flight session at shutdown");
                session.discard();
            }
        }
        self.transmitter.close();
    }
}

impl std::fmt::Debug for ProfilerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfilerManager")
            .field("enabled", &self.is_enabled())
            .field("active_sessions", &self.active_sessions())
            .field("transmitter", &self.transmitter)
            .finish()
    }
}

/// Scoped profiling of one request; stops the session when dropped
#[must_use = "profiling stops when the guard is dropped"]
pub struct ProfileGuard<'a> {
    manager: &'a ProfilerManager,
    key: ContextKey,
    trace_id: Option<String>,
    response: Option<ResponseContext>,
}

impl ProfileGuard<'_> {
    /// Trace id of the session, if the request is being profiled
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.trace_id.is_some()
    }

    /// Response details to report when the guard stops
    pub fn set_response(&mut self, response: ResponseContext) {
        self.response = Some(response);
    }

    /// Stop now; returns whether a record was produced
    pub fn finish(mut self) -> bool {
        self.stop()
    }

    fn stop(&mut self) -> bool {
        if self.trace_id.take().is_none() {
            return false;
        }
        let response = self.response.take().unwrap_or_default();
        self.manager.stop_profiling_for(self.key, &response)
    }
}

impl Drop for ProfileGuard<'_> {
    fn drop(&mut self) {
        self.stop();
    }
}
