use crate::{ErrString, TesselResult};

/// A result whose value is itself a result, as produced by waiting on a fallible task that ran
/// on another thread.
pub trait NestedResult<T> {
    /// The outer error if waiting failed, otherwise the task's own result.
    fn settle(self) -> TesselResult<T>;
}

impl<T> NestedResult<T> for TesselResult<TesselResult<T>> {
    fn settle(self) -> TesselResult<T> {
        self.and_then(|inner| inner)
    }
}

/// Attach context to the error of a failed result.
pub trait ResultContext<T> {
    /// Wrap an error in the message `msg` produces; `msg` only runs on failure.
    fn context<M: Into<ErrString>>(self, msg: impl FnOnce() -> M) -> TesselResult<T>;
}

impl<T> ResultContext<T> for TesselResult<T> {
    fn context<M: Into<ErrString>>(self, msg: impl FnOnce() -> M) -> TesselResult<T> {
        self.map_err(|e| e.with_context(msg()))
    }
}
