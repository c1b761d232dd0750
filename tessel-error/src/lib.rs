#![deny(missing_docs)]

//! This crate defines error & result types for Tessel.
//! It also contains a variety of useful macros for error handling.

mod ext;

use std::backtrace::Backtrace;
// Aliased so thiserror does not treat these fields as nightly-only `provide` backtraces.
use std::backtrace::Backtrace as StdBacktrace;
use std::borrow::Cow;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;
use std::{env, fmt, io};

pub use ext::*;

/// A string that can be used as an error message.
#[derive(Debug)]
pub struct ErrString(Cow<'static, str>);

#[allow(clippy::fallible_impl_from)]
impl<T> From<T> for ErrString
where
    T: Into<Cow<'static, str>>,
{
    #[allow(clippy::panic)]
    fn from(msg: T) -> Self {
        if env::var("TESSEL_PANIC_ON_ERR").as_deref().unwrap_or("") == "1" {
            panic!("{}\nBacktrace:\n{}", msg.into(), Backtrace::capture());
        } else {
            Self(msg.into())
        }
    }
}

impl AsRef<str> for ErrString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for ErrString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ErrString {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The top-level error type for Tessel.
#[derive(thiserror::Error)]
#[non_exhaustive]
pub enum TesselError {
    /// A row or local index outside the addressable range.
    #[error("index {0} out of bounds from {1} to {2}\nBacktrace:\n{3}")]
    OutOfBounds(u64, u64, u64, StdBacktrace),
    /// An integer read of a cell that holds the missing marker.
    #[error("missing value: {0}\nBacktrace:\n{1}")]
    MissingValue(ErrString, StdBacktrace),
    /// An invalid argument was provided, or bytes failed to decode.
    #[error("{0}\nBacktrace:\n{1}")]
    InvalidArgument(ErrString, StdBacktrace),
    /// A key, run or node could not be found.
    #[error("not found: {0}\nBacktrace:\n{1}")]
    NotFound(ErrString, StdBacktrace),
    /// The owning job was cancelled.
    #[error("cancelled: {0}\nBacktrace:\n{1}")]
    Cancelled(ErrString, StdBacktrace),
    /// A catch-all for faults without a more specific kind.
    #[error("{0}\nBacktrace:\n{1}")]
    Generic(ErrString, StdBacktrace),
    /// A wrapper for other errors, carrying additional context.
    #[error("{0}: {1}")]
    Context(ErrString, #[source] Box<TesselError>),
    /// A wrapper for IO errors.
    #[error(transparent)]
    IOError(#[from] io::Error),
}

impl TesselError {
    /// Adds additional context to an error.
    pub fn with_context<T: Into<ErrString>>(self, msg: T) -> Self {
        TesselError::Context(msg.into(), Box::new(self))
    }

    /// True if this error, or the error it wraps, is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            TesselError::Cancelled(..) => true,
            TesselError::Context(_, inner) => inner.is_cancelled(),
            _ => false,
        }
    }
}

impl Debug for TesselError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// A type alias for Results that return TesselErrors as their error type.
pub type TesselResult<T> = Result<T, TesselError>;

/// A trait for expect-ing a TesselResult or an Option.
pub trait TesselExpect {
    /// The type of the value being expected.
    type Output;

    /// Returns the value of the result if it is Ok, otherwise panics with the error.
    /// Should be called only in contexts where the error condition represents a bug (programmer error).
    fn tessel_expect(self, msg: &str) -> Self::Output;
}

impl<T, E> TesselExpect for Result<T, E>
where
    E: Into<TesselError>,
{
    type Output = T;

    #[inline(always)]
    fn tessel_expect(self, msg: &str) -> Self::Output {
        self.map_err(|err| err.into())
            .unwrap_or_else(|e| tessel_panic!(e.with_context(msg.to_string())))
    }
}

impl<T> TesselExpect for Option<T> {
    type Output = T;

    #[inline(always)]
    fn tessel_expect(self, msg: &str) -> Self::Output {
        self.unwrap_or_else(|| {
            let err = TesselError::InvalidArgument(msg.to_string().into(), Backtrace::capture());
            tessel_panic!(err)
        })
    }
}

/// A convenient macro for creating a TesselError.
#[macro_export]
macro_rules! tessel_err {
    (OutOfBounds: $idx:expr, $start:expr, $stop:expr) => {{
        use std::backtrace::Backtrace;
        $crate::__private::must_use(
            $crate::TesselError::OutOfBounds($idx, $start, $stop, Backtrace::capture())
        )
    }};
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {{
        use std::backtrace::Backtrace;
        $crate::__private::must_use(
            $crate::TesselError::$variant(format!($fmt, $($arg),*).into(), Backtrace::capture())
        )
    }};
    ($variant:ident: $err:expr $(,)?) => {
        $crate::__private::must_use(
            $crate::TesselError::$variant($err)
        )
    };
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::tessel_err!(InvalidArgument: $fmt, $($arg),*)
    };
}

/// A convenient macro for returning a TesselError.
#[macro_export]
macro_rules! tessel_bail {
    ($($tt:tt)+) => {
        return Err($crate::tessel_err!($($tt)+))
    };
}

/// A convenient macro for panicking with a TesselError in the presence of a programmer error
/// (e.g., an invariant has been violated).
#[macro_export]
macro_rules! tessel_panic {
    (OutOfBounds: $idx:expr, $start:expr, $stop:expr) => {{
        $crate::tessel_panic!($crate::tessel_err!(OutOfBounds: $idx, $start, $stop))
    }};
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::tessel_panic!($crate::tessel_err!($variant: $fmt, $($arg),*))
    };
    ($err:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        let err: $crate::TesselError = $err;
        panic!("{}", err.with_context(format!($fmt, $($arg),*)))
    }};
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::tessel_panic!($crate::tessel_err!($fmt, $($arg),*))
    };
    ($err:expr) => {{
        let err: $crate::TesselError = $err;
        panic!("{}", err)
    }};
}

#[doc(hidden)]
pub mod __private {
    #[doc(hidden)]
    #[inline]
    #[cold]
    #[must_use]
    pub const fn must_use(error: crate::TesselError) -> crate::TesselError {
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounded(idx: u64) -> TesselResult<u64> {
        if idx >= 4 {
            tessel_bail!(OutOfBounds: idx, 0, 4);
        }
        Ok(idx)
    }

    #[test]
    fn bail_out_of_bounds() {
        assert_eq!(bounded(3).ok(), Some(3));
        let err = bounded(9).err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err.starts_with("index 9 out of bounds from 0 to 4"));
    }

    #[test]
    fn context_preserves_cancellation() {
        let err = tessel_err!(Cancelled: "job {} cancelled", 3).with_context("epoch");
        assert!(err.is_cancelled());
        assert!(!tessel_err!("plain").is_cancelled());
    }
}
