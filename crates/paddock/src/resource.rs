use std::{
    fmt,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::exception::{BuiltinClass, RunError, ScriptError};

/// Error returned when a resource limit is exceeded during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Maximum number of heap allocations exceeded.
    Allocation { limit: usize, count: usize },
    /// Maximum instruction count exceeded.
    Operation { limit: usize, count: usize },
    /// Maximum execution time exceeded.
    Time { limit: Duration, elapsed: Duration },
    /// Maximum memory usage exceeded.
    Memory { limit: usize, used: usize },
    /// Maximum function call depth exceeded.
    Recursion { limit: usize, depth: usize },
    /// Maximum number of value stack slots exceeded.
    StackSlots { limit: usize, requested: usize },
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocation { limit, count } => {
                write!(f, "allocation limit exceeded: {count} > {limit}")
            }
            Self::Operation { limit, count } => {
                write!(f, "operation limit exceeded: {count} > {limit}")
            }
            Self::Time { limit, elapsed } => {
                write!(f, "time limit exceeded: {elapsed:?} > {limit:?}")
            }
            Self::Memory { limit, used } => {
                write!(f, "memory limit exceeded: {used} bytes > {limit} bytes")
            }
            Self::Recursion { .. } => {
                write!(f, "maximum recursion depth exceeded")
            }
            Self::StackSlots { limit, requested } => {
                write!(f, "stack slot limit exceeded: {requested} > {limit}")
            }
        }
    }
}

impl std::error::Error for ResourceError {}

impl ResourceError {
    /// Maps the limit to the script error class it surfaces as.
    ///
    /// - `Allocation`, `Memory`, `StackSlots` → `OutOfMemoryError`
    /// - `Recursion` → `RecursionError`
    /// - `Operation`, `Time` → `AbortedError`
    #[must_use]
    pub fn into_script_error(self) -> ScriptError {
        let class = match self {
            Self::Allocation { .. } | Self::Memory { .. } | Self::StackSlots { .. } => BuiltinClass::OutOfMemoryError,
            Self::Recursion { .. } => BuiltinClass::RecursionError,
            Self::Operation { .. } | Self::Time { .. } => BuiltinClass::AbortedError,
        };
        ScriptError::builtin(class, self.to_string())
    }
}

impl From<ResourceError> for RunError {
    fn from(err: ResourceError) -> Self {
        Self::UncatchableExc(Box::new(err.into_script_error()))
    }
}

/// Trait for tracking resource usage of one VM thread.
///
/// Every VM thread owns its own tracker, cloned from the prototype the executor was configured with.
pub trait ResourceTracker: fmt::Debug + Clone + Send + 'static {
    /// Called before each heap allocation.
    ///
    /// # Arguments
    /// * `get_size` - Approximate size in bytes of the allocation
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError>;

    /// Called when a heap entry is reclaimed.
    fn on_free(&mut self, get_size: impl FnOnce() -> usize);

    /// Called once per executed instruction to enforce operation and time limits.
    fn check_time(&mut self) -> Result<(), ResourceError>;

    /// Called before pushing a new function frame.
    ///
    /// # Arguments
    /// * `current_depth` - Current call stack depth (before the new frame is pushed)
    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError>;

    /// Called before the value stack grows to `total` slots.
    fn check_stack_slots(&self, total: usize) -> Result<(), ResourceError> {
        let _ = total;
        Ok(())
    }

    /// Returns the total number of allocations tracked, if this tracker records them.
    fn allocation_count(&self) -> Option<usize> {
        None
    }

    /// Returns the current approximate memory usage in bytes, if tracked.
    fn current_memory_bytes(&self) -> Option<usize> {
        None
    }
}

/// Tracker that only enforces the default recursion limit.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NoLimitTracker;

impl ResourceTracker for NoLimitTracker {
    #[inline]
    fn on_allocate(&mut self, _: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn on_free(&mut self, _: impl FnOnce() -> usize) {}

    #[inline]
    fn check_time(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError> {
        if current_depth >= DEFAULT_MAX_RECURSION_DEPTH {
            Err(ResourceError::Recursion {
                limit: DEFAULT_MAX_RECURSION_DEPTH,
                depth: current_depth + 1,
            })
        } else {
            Ok(())
        }
    }
}

/// Configuration for resource limits.
///
/// All limits are optional - set to `None` to disable a specific limit.
/// Use `ResourceLimits::default()` for no limits, or build custom limits
/// with the builder pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum number of executed instructions.
    pub max_operations: Option<usize>,
    /// Maximum number of heap allocations allowed.
    pub max_allocations: Option<usize>,
    /// Maximum execution time.
    pub max_duration: Option<Duration>,
    /// Maximum heap memory in bytes (approximate).
    pub max_memory: Option<usize>,
    /// Maximum function call depth.
    pub max_recursion_depth: Option<usize>,
    /// Maximum number of value stack slots across all live frames.
    pub max_stack_slots: Option<usize>,
}

/// Recommended maximum recursion depth if not otherwise specified.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 1000;

/// Maximum nesting depth when copying values between thread heaps.
///
/// Separate from the function call stack limit. This protects against stack overflow
/// when copying deeply nested or self-referencing containers.
pub const MAX_DATA_RECURSION_DEPTH: usize = 256;

impl ResourceLimits {
    /// Creates a new ResourceLimits with all limits disabled, except max recursion which is set to 1000.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_recursion_depth: Some(DEFAULT_MAX_RECURSION_DEPTH),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn max_allocations(mut self, limit: usize) -> Self {
        self.max_allocations = Some(limit);
        self
    }

    #[must_use]
    pub fn max_operations(mut self, limit: usize) -> Self {
        self.max_operations = Some(limit);
        self
    }

    #[must_use]
    pub fn max_duration(mut self, limit: Duration) -> Self {
        self.max_duration = Some(limit);
        self
    }

    #[must_use]
    pub fn max_memory(mut self, limit: usize) -> Self {
        self.max_memory = Some(limit);
        self
    }

    #[must_use]
    pub fn max_recursion_depth(mut self, limit: Option<usize>) -> Self {
        self.max_recursion_depth = limit;
        self
    }

    #[must_use]
    pub fn max_stack_slots(mut self, limit: usize) -> Self {
        self.max_stack_slots = Some(limit);
        self
    }
}

/// A resource tracker that enforces configurable limits.
///
/// The start time is recorded when the tracker is created; clones share it, so a time limit
/// covers every thread of an execution together.
#[derive(Debug, Clone)]
pub struct LimitedTracker {
    limits: ResourceLimits,
    start_time: Instant,
    allocation_count: usize,
    operation_count: usize,
    current_memory: usize,
}

impl LimitedTracker {
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            start_time: Instant::now(),
            allocation_count: 0,
            operation_count: 0,
            current_memory: 0,
        }
    }

    #[must_use]
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl ResourceTracker for LimitedTracker {
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        if let Some(max) = self.limits.max_allocations
            && self.allocation_count >= max
        {
            return Err(ResourceError::Allocation {
                limit: max,
                count: self.allocation_count + 1,
            });
        }

        let size = get_size();
        if let Some(max) = self.limits.max_memory {
            let new_memory = self.current_memory + size;
            if new_memory > max {
                return Err(ResourceError::Memory {
                    limit: max,
                    used: new_memory,
                });
            }
        }

        self.allocation_count += 1;
        self.current_memory += size;
        Ok(())
    }

    fn on_free(&mut self, get_size: impl FnOnce() -> usize) {
        self.current_memory = self.current_memory.saturating_sub(get_size());
    }

    fn check_time(&mut self) -> Result<(), ResourceError> {
        if let Some(max) = self.limits.max_operations {
            self.operation_count += 1;
            if self.operation_count > max {
                return Err(ResourceError::Operation {
                    limit: max,
                    count: self.operation_count,
                });
            }
        }

        if let Some(max) = self.limits.max_duration {
            let elapsed = self.start_time.elapsed();
            if elapsed > max {
                return Err(ResourceError::Time { limit: max, elapsed });
            }
        }
        Ok(())
    }

    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError> {
        if let Some(max) = self.limits.max_recursion_depth {
            // current_depth is before push, so new depth would be current_depth + 1
            if current_depth >= max {
                return Err(ResourceError::Recursion {
                    limit: max,
                    depth: current_depth + 1,
                });
            }
        }
        Ok(())
    }

    fn check_stack_slots(&self, total: usize) -> Result<(), ResourceError> {
        match self.limits.max_stack_slots {
            Some(limit) if total > limit => Err(ResourceError::StackSlots { limit, requested: total }),
            _ => Ok(()),
        }
    }

    fn allocation_count(&self) -> Option<usize> {
        Some(self.allocation_count)
    }

    fn current_memory_bytes(&self) -> Option<usize> {
        Some(self.current_memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_limit_trips_on_the_next_allocation() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().max_allocations(2));
        assert!(tracker.on_allocate(|| 8).is_ok());
        assert!(tracker.on_allocate(|| 8).is_ok());
        assert_eq!(
            tracker.on_allocate(|| 8),
            Err(ResourceError::Allocation { limit: 2, count: 3 })
        );
        assert_eq!(tracker.allocation_count(), Some(2));
    }

    #[test]
    fn memory_is_released_on_free() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().max_memory(100));
        tracker.on_allocate(|| 80).unwrap();
        assert!(tracker.on_allocate(|| 40).is_err());
        tracker.on_free(|| 80);
        assert!(tracker.on_allocate(|| 40).is_ok());
        assert_eq!(tracker.current_memory_bytes(), Some(40));
    }

    #[test]
    fn default_recursion_limit_applies_without_limits() {
        assert!(NoLimitTracker.check_recursion_depth(999).is_ok());
        assert!(NoLimitTracker.check_recursion_depth(1000).is_err());
    }

    #[test]
    fn resource_errors_are_uncatchable() {
        let err: RunError = ResourceError::Recursion { limit: 3, depth: 4 }.into();
        let RunError::UncatchableExc(exc) = err else {
            panic!("expected an uncatchable error");
        };
        assert!(exc.is(BuiltinClass::RecursionError));
    }
}
