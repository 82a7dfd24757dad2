//! Span-instrumentation sampler.
//!
//! Code under observation marks interesting regions with
//! [`profile_scope!`](crate::profile_scope). While a [`ScopeSampler`] is
//! recording on the current thread, every scope becomes a frame in the
//! recorded tree; otherwise entering a scope is a thread-local lookup and
//! nothing more.

use std::borrow::Cow;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use super::{RawFrame, SampleTree, SamplerFactory, StackSampler};
use crate::error::SamplerError;
use crate::system;

thread_local! {
    static RECORDING: RefCell<Option<Recording>> = const { RefCell::new(None) };
}

static NEXT_RECORDING_ID: AtomicU64 = AtomicU64::new(1);

/// The live recording of one thread
struct Recording {
    id: u64,
    /// Set once the owning sampler is dropped; a released recording may be
    /// reclaimed by the next `start` on this thread
    released: Arc<AtomicBool>,
    open: Vec<OpenFrame>,
    roots: Vec<RawFrame>,
}

struct OpenFrame {
    name: Cow<'static, str>,
    file: &'static str,
    line: u32,
    started: Instant,
    children: Vec<RawFrame>,
}

impl Recording {
    /// Close open frames until only `depth` remain
    fn close_to(&mut self, depth: usize, now: Instant) {
        while self.open.len() > depth {
            let Some(frame) = self.open.pop() else {
                break;
            };
            let raw = RawFrame {
                function_name: frame.name.into_owned(),
                file_path: frame.file.to_string(),
                line_number: frame.line,
                duration: now.saturating_duration_since(frame.started),
                children: frame.children,
            };
            match self.open.last_mut() {
                Some(parent) => parent.children.push(raw),
                None => self.roots.push(raw),
            }
        }
    }
}

/// RAII guard for one instrumented scope; closes its frame on drop
#[must_use = "the scope ends when the guard is dropped"]
pub struct ScopeGuard {
    /// Recording this guard belongs to; 0 when nothing was recording
    recording: u64,
    depth: usize,
}

impl ScopeGuard {
    /// Enter a scope on the current thread
    #[inline]
    pub fn enter(name: impl Into<Cow<'static, str>>, file: &'static str, line: u32) -> Self {
        let entered = RECORDING.try_with(|cell| {
            let mut slot = cell.try_borrow_mut().ok()?;
            let recording = slot.as_mut()?;
            if recording.released.load(Ordering::Acquire) {
                return None;
            }
            recording.open.push(OpenFrame {
                name: name.into(),
                file,
                line,
                started: Instant::now(),
                children: Vec::new(),
            });
            Some(ScopeGuard {
                recording: recording.id,
                depth: recording.open.len(),
            })
        });

        entered.ok().flatten().unwrap_or(ScopeGuard {
            recording: 0,
            depth: 0,
        })
    }

    /// Whether this scope is being recorded
    pub fn is_recording(&self) -> bool {
        self.recording != 0
    }
}

impl Drop for ScopeGuard {
    #[inline]
    fn drop(&mut self) {
        if self.recording == 0 {
            return;
        }
        let now = Instant::now();
        let _ = RECORDING.try_with(|cell| {
            if let Ok(mut slot) = cell.try_borrow_mut() {
                if let Some(recording) = slot.as_mut() {
                    if recording.id == self.recording {
                        recording.close_to(self.depth.saturating_sub(1), now);
                    }
                }
            }
        });
    }
}

/// Profile the enclosing scope as one frame of the call tree.
///
/// ```ignore
/// use perfmon_agent::profile_scope;
///
/// fn load_orders(user: u64) -> Vec<Order> {
///     profile_scope!("load_orders");
///     // ...
/// }
/// ```
#[macro_export]
macro_rules! profile_scope {
    ($name:expr) => {
        let _perfmon_scope = $crate::sampler::ScopeGuard::enter($name, file!(), line!());
    };
}

enum SamplerState {
    Idle,
    Running {
        thread: ThreadId,
        recording: u64,
        released: Arc<AtomicBool>,
        cpu_start: Option<Duration>,
    },
    Stopped,
}

/// Thread-bound sampler backed by explicit scope instrumentation
pub struct ScopeSampler {
    state: SamplerState,
}

impl Default for ScopeSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeSampler {
    pub fn new() -> Self {
        Self {
            state: SamplerState::Idle,
        }
    }

    /// Whether a live recording exists on the calling thread
    pub fn is_recording_on_current_thread() -> bool {
        RECORDING
            .try_with(|cell| {
                cell.try_borrow()
                    .ok()
                    .and_then(|slot| {
                        slot.as_ref()
                            .map(|r| !r.released.load(Ordering::Acquire))
                    })
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

impl StackSampler for ScopeSampler {
    fn start(&mut self) -> Result<(), SamplerError> {
        if matches!(self.state, SamplerState::Running { .. }) {
            return Err(SamplerError::AlreadyActive);
        }

        let released = Arc::new(AtomicBool::new(false));
        let id = NEXT_RECORDING_ID.fetch_add(1, Ordering::Relaxed);

        RECORDING
            .try_with(|cell| {
                let mut slot = cell
                    .try_borrow_mut()
                    .map_err(|_| SamplerError::AlreadyActive)?;
                if let Some(existing) = slot.as_ref() {
                    if !existing.released.load(Ordering::Acquire) {
                        return Err(SamplerError::AlreadyActive);
                    }
                    tracing::debug!(recording = existing.id, "Reclaiming released recording");
                }
                *slot = Some(Recording {
                    id,
                    released: released.clone(),
                    open: Vec::new(),
                    roots: Vec::new(),
                });
                Ok(())
            })
            .map_err(|_| SamplerError::NotActive)??;

        self.state = SamplerState::Running {
            thread: std::thread::current().id(),
            recording: id,
            released,
            cpu_start: system::thread_cpu_time(),
        };
        Ok(())
    }

    fn stop(&mut self) -> Result<SampleTree, SamplerError> {
        let SamplerState::Running {
            thread,
            recording,
            released,
            cpu_start,
        } = &self.state
        else {
            return Err(SamplerError::NotActive);
        };

        if *thread != std::thread::current().id() {
            return Err(SamplerError::WrongThread);
        }

        let now = Instant::now();
        let recording_id = *recording;
        let taken = RECORDING
            .try_with(|cell| {
                let mut slot = cell.try_borrow_mut().ok()?;
                match slot.as_ref() {
                    Some(r) if r.id == recording_id => slot.take(),
                    _ => None,
                }
            })
            .ok()
            .flatten();

        released.store(true, Ordering::Release);
        let cpu_time = match (cpu_start, system::thread_cpu_time()) {
            (Some(start), Some(end)) => end.saturating_sub(*start),
            _ => Duration::ZERO,
        };
        self.state = SamplerState::Stopped;

        let mut recording = taken.ok_or(SamplerError::NotActive)?;
        recording.close_to(0, now);

        Ok(SampleTree {
            roots: recording.roots,
            cpu_time,
        })
    }
}

impl Drop for ScopeSampler {
    fn drop(&mut self) {
        if let SamplerState::Running {
            thread,
            recording,
            released,
            ..
        } = &self.state
        {
            released.store(true, Ordering::Release);
            if *thread == std::thread::current().id() {
                let recording_id = *recording;
                let _ = RECORDING.try_with(|cell| {
                    if let Ok(mut slot) = cell.try_borrow_mut() {
                        if slot.as_ref().map(|r| r.id) == Some(recording_id) {
                            *slot = None;
                        }
                    }
                });
            }
        }
    }
}

/// Factory producing [`ScopeSampler`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeSamplerFactory;

impl SamplerFactory for ScopeSamplerFactory {
    fn create(&self) -> Box<dyn StackSampler> {
        Box::new(ScopeSampler::new())
    }
}
