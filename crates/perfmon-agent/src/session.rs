//! Per-request profiling session

use std::time::{Duration, Instant};

use crate::config::Config;
use crate::context::{RequestContext, ResponseContext};
use crate::error::{contain, PerfmonError, Result, SamplerError};
use crate::record::{
    self, EnvironmentInfo, MemoryUsage, PerformanceMetrics, PerformanceRecord, RequestInfo,
    ResponseInfo, VersionInfo,
};
use crate::sampler::{SamplerFactory, StackSampler};
use crate::system;
use crate::tree::{ExecutionTreeBuilder, FrameFilter};

/// One in-flight profiled request.
///
/// Owned by the execution context that started it; the sampler it holds is
/// bound to that context.
pub struct ProfilingSession {
    trace_id: String,
    started_at: Instant,
    baseline_rss: u64,
    request: RequestInfo,
    sampler: Box<dyn StackSampler>,
}

impl std::fmt::Debug for ProfilingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfilingSession")
            .field("trace_id", &self.trace_id)
            .field("age", &self.started_at.elapsed())
            .field("path", &self.request.path)
            .finish()
    }
}

impl ProfilingSession {
    /// Start a session, starting one sampler on the current context.
    ///
    /// Fails with [`PerfmonError::SessionConflict`] if a sampler is already
    /// live here; the live sampler is left untouched.
    pub fn start(request: &RequestContext, factory: &dyn SamplerFactory) -> Result<Self> {
        let trace_id = record::new_trace_id();
        let baseline_rss = system::rss_bytes().unwrap_or(0);

        let mut sampler = factory.create();
        sampler.start().map_err(|e| match e {
            SamplerError::AlreadyActive => PerfmonError::SessionConflict(format!(
                "cannot start {} for {} {}: {}",
                trace_id, request.method, request.path, e
            )),
            other => PerfmonError::Sampler(other),
        })?;

        tracing::debug!(trace_id = %trace_id, path = %request.path, "Profiling started");

        Ok(Self {
            trace_id,
            started_at: Instant::now(),
            baseline_rss,
            request: RequestInfo::capture(request),
            sampler,
        })
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Time since the session started
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Stop the session and assemble its record.
    ///
    /// Fails closed: any error is logged and yields `None`.
    pub fn stop(self, response: &ResponseContext, config: &Config) -> Option<PerformanceRecord> {
        let trace_id = self.trace_id.clone();
        match self.finish(response, config) {
            Ok(record) => {
                tracing::debug!(
                    trace_id = %record.trace_id,
                    total_duration = record.performance_metrics.total_duration,
                    frames = record.function_calls.len(),
                    "Profiling finished"
                );
                Some(record)
            }
            Err(e) => {
                tracing::error!(trace_id = %trace_id, error = %e, "Failed to assemble performance record");
                None
            }
        }
    }

    /// Stop the sampler without producing a record. Never panics.
    pub fn discard(mut self) {
        contain("discard_session", (), || {
            if let Err(e) = self.sampler.stop() {
                tracing::debug!(trace_id = %self.trace_id, error = %e, "Discarded session sampler did not stop cleanly");
            }
        });
    }

    fn finish(mut self, response: &ResponseContext, config: &Config) -> Result<PerformanceRecord> {
        let samples = self.sampler.stop()?;
        let total_duration = self.started_at.elapsed();

        let end_rss = system::rss_bytes().unwrap_or(0);
        let peak_rss = system::peak_rss_bytes().unwrap_or(end_rss).max(end_rss);

        let builder = ExecutionTreeBuilder::new(FrameFilter::from(config));
        let function_calls = builder.build(&self.trace_id, &samples.roots);

        Ok(PerformanceRecord {
            trace_id: self.trace_id,
            request_info: self.request,
            response_info: ResponseInfo::from(response),
            performance_metrics: PerformanceMetrics {
                total_duration: total_duration.as_secs_f64(),
                cpu_time: samples.cpu_time.as_secs_f64(),
                memory_usage: MemoryUsage {
                    peak_memory: system::megabytes(peak_rss),
                    memory_delta: system::delta_megabytes(self.baseline_rss, end_rss),
                },
                ..Default::default()
            },
            function_calls,
            version_info: VersionInfo::from(config),
            environment: EnvironmentInfo::from(config),
        })
    }
}
