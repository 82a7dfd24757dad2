//! perfmon-agent: in-process request profiling agent
//!
//! Profiles a sampled subset of requests inside a host server and ships the
//! resulting performance records to a remote collection service.
//!
//! # Architecture
//!
//! - `SamplingPolicy`: should this request be profiled (rate + path globs)
//! - `ProfilingSession`: one profiled request, owning one stack sampler
//! - `ExecutionTreeBuilder`: sampler frame tree to flat, filtered call list
//! - `Transmitter`: bounded queue, batching loop and retrying worker pool
//! - `ProfilerManager`: the two entry points adapters call
//!
//! # Example
//!
//! ```ignore
//! use perfmon_agent::{profile_scope, Config, ProfilerManager, RequestContext, ResponseContext};
//!
//! let manager = ProfilerManager::new(Config::from_env()?)?;
//!
//! // In the request handler
//! let mut guard = manager.profile(&RequestContext::new("GET", "/api/orders"));
//! {
//!     profile_scope!("load_orders");
//!     // ...
//! }
//! guard.set_response(ResponseContext::new(200).response_size(512));
//! drop(guard);
//!
//! // At shutdown
//! manager.close();
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod manager;
pub mod record;
pub mod sampler;
pub mod sampling;
pub mod session;
pub mod system;
pub mod transmitter;
pub mod tree;

pub use config::{Config, ConfigUpdate, SharedConfig};
pub use context::{ContextKey, RequestContext, ResponseContext};
pub use error::{PerfmonError, Result, SamplerError};
pub use manager::{ProfileGuard, ProfilerManager, ProfilerManagerBuilder};
pub use record::{CallFrame, PerformanceRecord};
pub use sampler::{FrameNode, RawFrame, SampleTree, SamplerFactory, ScopeSampler, StackSampler};
pub use sampling::{SampleDecision, SamplingPolicy};
pub use session::ProfilingSession;
pub use transmitter::{HttpTransport, StatsSnapshot, Transmitter, Transport};
pub use tree::{ExecutionTreeBuilder, FrameFilter};
