//! Stack sampler abstraction
//!
//! A session owns exactly one [`StackSampler`], created by the configured
//! [`SamplerFactory`]. Whatever the sampler observes is handed back as a
//! tree of frames implementing [`FrameNode`], which is all the call tree
//! builder needs to know about the host's instrumentation.

mod scope;

pub use scope::{ScopeGuard, ScopeSampler, ScopeSamplerFactory};

use std::time::Duration;

use crate::error::SamplerError;

/// Read-only view over one node of a sampled frame tree
pub trait FrameNode {
    fn function_name(&self) -> &str;

    /// Source file or module location; empty when unknown
    fn file_path(&self) -> &str;

    fn line_number(&self) -> u32;

    /// Time attributed to this frame, as reported by the sampler
    fn duration(&self) -> Duration;

    fn children(&self) -> &[Self]
    where
        Self: Sized;
}

/// Owned frame tree node
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub function_name: String,
    pub file_path: String,
    pub line_number: u32,
    pub duration: Duration,
    pub children: Vec<RawFrame>,
}

impl RawFrame {
    pub fn new(
        function_name: impl Into<String>,
        file_path: impl Into<String>,
        line_number: u32,
        duration: Duration,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            file_path: file_path.into(),
            line_number,
            duration,
            children: Vec::new(),
        }
    }

    /// Append a child frame
    pub fn with_child(mut self, child: RawFrame) -> Self {
        self.children.push(child);
        self
    }

    /// Number of frames in this subtree, including self
    pub fn subtree_len(&self) -> usize {
        1 + self.children.iter().map(RawFrame::subtree_len).sum::<usize>()
    }
}

impl FrameNode for RawFrame {
    fn function_name(&self) -> &str {
        &self.function_name
    }

    fn file_path(&self) -> &str {
        &self.file_path
    }

    fn line_number(&self) -> u32 {
        self.line_number
    }

    fn duration(&self) -> Duration {
        self.duration
    }

    fn children(&self) -> &[Self] {
        &self.children
    }
}

/// Everything a sampler reports when stopped
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleTree {
    /// Top-level frames; the synthetic root is not included
    pub roots: Vec<RawFrame>,
    /// CPU time consumed by the sampled context while the sampler ran
    pub cpu_time: Duration,
}

/// A per-session stack sampler.
///
/// Samplers are not reentrant: at most one may be active per execution
/// context, and `start` must fail with [`SamplerError::AlreadyActive`]
/// rather than disturb a live one.
pub trait StackSampler: Send + Sync {
    fn start(&mut self) -> Result<(), SamplerError>;

    fn stop(&mut self) -> Result<SampleTree, SamplerError>;
}

/// Creates one sampler per profiling session
pub trait SamplerFactory: Send + Sync {
    fn create(&self) -> Box<dyn StackSampler>;
}

impl<F> SamplerFactory for F
where
    F: Fn() -> Box<dyn StackSampler> + Send + Sync,
{
    fn create(&self) -> Box<dyn StackSampler> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_frame_tree() {
        let tree = RawFrame::new("handler", "src/api.rs", 10, Duration::from_millis(30))
            .with_child(RawFrame::new("load", "src/db.rs", 4, Duration::from_millis(20)))
            .with_child(RawFrame::new("render", "src/view.rs", 8, Duration::from_millis(5)));

        assert_eq!(tree.subtree_len(), 3);
        assert_eq!(FrameNode::children(&tree).len(), 2);
        assert_eq!(tree.children[0].function_name(), "load");
    }

    #[test]
    fn test_closure_factory() {
        let factory = || Box::new(ScopeSampler::new()) as Box<dyn StackSampler>;
        let mut sampler = SamplerFactory::create(&factory);
        sampler.start().unwrap();
        assert!(sampler.stop().unwrap().roots.is_empty());
    }
}
