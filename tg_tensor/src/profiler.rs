//! Kernel timing and memory profiling.

use std::time::Instant;

use crate::engine::Engine;
use crate::error::Result;
use crate::scope::TensorContainer;
use crate::shape::Shape;

/// One kernel execution observed while profiling.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelProfile {
    pub name: String,
    pub ms: f64,
    pub output_shape: Shape,
    pub output_bytes: usize,
    pub has_nan: bool,
}

/// Result of [`Engine::time`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimingInfo {
    /// Time spent inside backend kernels.
    pub kernel_ms: f64,
    pub wall_ms: f64,
}

/// Result of [`Engine::profile`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProfileInfo {
    /// Change in live tensor count (negative if `f` disposed more than it made).
    pub new_tensors: isize,
    pub new_bytes: isize,
    pub peak_bytes: usize,
    pub kernels: Vec<KernelProfile>,
}

/// Open timers and profiling sessions. Nested calls each see every kernel
/// run while they are open.
#[derive(Debug, Default)]
pub(crate) struct Profiler {
    timers: Vec<f64>,
    sessions: Vec<ProfileInfo>,
}

impl Profiler {
    pub fn is_active(&self) -> bool {
        !self.timers.is_empty() || !self.sessions.is_empty()
    }

    pub fn has_session(&self) -> bool {
        !self.sessions.is_empty()
    }

    pub fn record_kernel(&mut self, kernel: KernelProfile) {
        for timer in &mut self.timers {
            *timer += kernel.ms;
        }
        for session in &mut self.sessions {
            session.kernels.push(kernel.clone());
        }
    }

    pub fn observe_bytes(&mut self, num_bytes: usize) {
        for session in &mut self.sessions {
            session.peak_bytes = session.peak_bytes.max(num_bytes);
        }
    }
}

impl Engine {
    /// Run `f` in a scope and report how long it took. Everything `f`
    /// creates, its return value included, is disposed.
    pub fn time<T, F>(&self, f: F) -> Result<TimingInfo>
    where
        T: TensorContainer,
        F: FnOnce() -> Result<T>,
    {
        let start = Instant::now();
        self.state_mut().profiler.timers.push(0.0);
        let result = self.tidy_named("time", || f().map(|_| ()));
        let kernel_ms = self.state_mut().profiler.timers.pop().unwrap_or(0.0);
        result?;
        Ok(TimingInfo {
            kernel_ms,
            wall_ms: start.elapsed().as_secs_f64() * 1e3,
        })
    }

    /// Run `f` and report the kernels it ran and its memory footprint.
    pub fn profile<T, F>(&self, f: F) -> Result<(T, ProfileInfo)>
    where
        F: FnOnce() -> Result<T>,
    {
        let before = self.memory();
        self.state_mut().profiler.sessions.push(ProfileInfo {
            peak_bytes: before.num_bytes,
            ..ProfileInfo::default()
        });
        let result = f();
        let mut info = self.state_mut().profiler.sessions.pop().unwrap_or_default();
        let after = self.memory();
        info.new_tensors = after.num_tensors as isize - before.num_tensors as isize;
        info.new_bytes = after.num_bytes as isize - before.num_bytes as isize;
        log::debug!(
            "profile: {} kernels, {} new tensors, peak {} bytes",
            info.kernels.len(),
            info.new_tensors,
            info.peak_bytes
        );
        Ok((result?, info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel(ms: f64) -> KernelProfile {
        KernelProfile {
            name: "Add".to_string(),
            ms,
            output_shape: Shape::new(vec![2]),
            output_bytes: 8,
            has_nan: false,
        }
    }

    #[test]
    fn test_nested_timers_accumulate() {
        let mut profiler = Profiler::default();
        assert!(!profiler.is_active());
        profiler.timers.push(0.0);
        profiler.record_kernel(kernel(1.5));
        profiler.timers.push(0.0);
        profiler.record_kernel(kernel(2.0));
        assert_eq!(profiler.timers, vec![3.5, 2.0]);
    }

    #[test]
    fn test_sessions_track_peak() {
        let mut profiler = Profiler::default();
        profiler.sessions.push(ProfileInfo::default());
        assert!(profiler.has_session());
        profiler.observe_bytes(64);
        profiler.observe_bytes(16);
        profiler.record_kernel(kernel(0.1));
        assert_eq!(profiler.sessions[0].peak_bytes, 64);
        assert_eq!(profiler.sessions[0].kernels.len(), 1);
    }
}
