//! Per-request sampling decision

use dashmap::DashMap;
use regex::Regex;

use crate::config::Config;
use crate::context::RequestContext;

/// Outcome of a sampling decision. Skips are policy, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleDecision {
    Sampled,
    /// Profiling is globally disabled
    Disabled,
    /// The path matched an exclude pattern
    Excluded,
    /// Include patterns are configured and none matched
    NotIncluded,
    /// The random draw fell outside the sampling rate
    RateSkipped,
}

impl SampleDecision {
    pub fn is_sampled(&self) -> bool {
        matches!(self, SampleDecision::Sampled)
    }
}

/// Decides whether a request is profiled.
///
/// The decision depends only on its inputs; the only internal state is a
/// cache of compiled glob patterns, which is safe to share across threads.
#[derive(Debug, Default)]
pub struct SamplingPolicy {
    pattern_cache: DashMap<String, Option<Regex>>,
}

impl SamplingPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Should this request be profiled?
    pub fn should_sample(&self, config: &Config, enabled: bool, request: &RequestContext) -> bool {
        self.decide(config, enabled, request).is_sampled()
    }

    /// Full decision, in precedence order: disabled, exclude, include, rate
    pub fn decide(&self, config: &Config, enabled: bool, request: &RequestContext) -> SampleDecision {
        if !enabled {
            return SampleDecision::Disabled;
        }

        let path = request.path.as_str();
        if self.matches_any(&config.exclude_patterns, path) {
            return SampleDecision::Excluded;
        }

        if !config.include_patterns.is_empty() && !self.matches_any(&config.include_patterns, path)
        {
            return SampleDecision::NotIncluded;
        }

        if rand::random::<f64>() < config.sampling_rate {
            SampleDecision::Sampled
        } else {
            SampleDecision::RateSkipped
        }
    }

    /// Forget compiled patterns that `config` no longer uses
    pub fn retain_patterns(&self, config: &Config) {
        self.pattern_cache.retain(|pattern, _| {
            config.exclude_patterns.contains(pattern) || config.include_patterns.contains(pattern)
        });
    }

    /// Number of compiled patterns held
    pub fn cached_patterns(&self) -> usize {
        self.pattern_cache.len()
    }

    fn matches_any(&self, patterns: &[String], path: &str) -> bool {
        patterns.iter().any(|pattern| self.glob_match(pattern, path))
    }

    /// Glob pattern matching: `*` matches any sequence, `?` a single char
    fn glob_match(&self, pattern: &str, path: &str) -> bool {
        if let Some(compiled) = self.pattern_cache.get(pattern) {
            return compiled.as_ref().is_some_and(|re| re.is_match(path));
        }

        let compiled = glob_to_regex(pattern);
        let matches = compiled.as_ref().is_some_and(|re| re.is_match(path));
        self.pattern_cache.insert(pattern.to_string(), compiled);
        matches
    }
}

fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");

    match Regex::new(&format!("^{}$", escaped)) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "Ignoring invalid path pattern");
            None
        }
    }
}
