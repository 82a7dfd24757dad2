//! Call tree flattening
//!
//! Turns whatever frame tree a sampler produced into the flat, self-contained
//! list of [`CallFrame`]s carried by a record. Frames are visited pre-order;
//! a filtered frame disappears but its children are lifted onto the nearest
//! surviving ancestor, so no descendant is lost.

use std::time::Duration;

use crate::config::Config;
use crate::record::CallFrame;
use crate::sampler::FrameNode;

/// Which frames are dropped from the output
#[derive(Debug, Clone, PartialEq)]
pub struct FrameFilter {
    /// Substrings of file paths that mark a frame as noise
    pub noise_patterns: Vec<String>,
    /// Frames shorter than this are dropped
    pub min_duration: Duration,
}

impl Default for FrameFilter {
    fn default() -> Self {
        Self {
            noise_patterns: Vec::new(),
            min_duration: Duration::from_millis(1),
        }
    }
}

impl From<&Config> for FrameFilter {
    fn from(config: &Config) -> Self {
        Self {
            noise_patterns: config.noise_patterns.clone(),
            min_duration: config.min_frame_duration,
        }
    }
}

impl FrameFilter {
    /// Should this frame be dropped?
    pub fn drops<F: FrameNode>(&self, frame: &F) -> bool {
        let path = frame.file_path();
        if path.is_empty() {
            return true;
        }
        if self
            .noise_patterns
            .iter()
            .any(|pattern| path.contains(pattern.as_str()))
        {
            return true;
        }
        frame.duration() < self.min_duration
    }
}

/// Flattens frame trees into call frame lists
#[derive(Debug, Clone, Default)]
pub struct ExecutionTreeBuilder {
    filter: FrameFilter,
}

impl ExecutionTreeBuilder {
    pub fn new(filter: FrameFilter) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> &FrameFilter {
        &self.filter
    }

    /// Flatten `roots` (children of the sampler's synthetic root)
    pub fn build<F: FrameNode>(&self, trace_id: &str, roots: &[F]) -> Vec<CallFrame> {
        struct Pending<'a, F> {
            frame: &'a F,
            parent: Option<usize>,
            depth: u32,
        }

        let mut out: Vec<CallFrame> = Vec::new();
        let mut stack: Vec<Pending<'_, F>> = roots
            .iter()
            .rev()
            .map(|frame| Pending {
                frame,
                parent: None,
                depth: 0,
            })
            .collect();

        while let Some(Pending {
            frame,
            parent,
            depth,
        }) = stack.pop()
        {
            let (child_parent, child_depth) = if self.filter.drops(frame) {
                (parent, depth)
            } else {
                let index = out.len();
                let parent_call_id = parent.map(|p| out[p].call_id.clone());
                out.push(CallFrame {
                    call_id: format!("{}_call_{}", trace_id, index),
                    parent_call_id,
                    function_name: frame.function_name().to_string(),
                    file_path: frame.file_path().to_string(),
                    line_number: frame.line_number(),
                    duration: frame.duration().as_secs_f64(),
                    depth,
                    call_order: index as u64 + 1,
                });
                (Some(index), depth + 1)
            };

            stack.extend(frame.children().iter().rev().map(|child| Pending {
                frame: child,
                parent: child_parent,
                depth: child_depth,
            }));
        }

        out
    }
}
