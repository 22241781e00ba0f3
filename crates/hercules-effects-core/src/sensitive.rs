//! Opaque container for values that must not reach logs or error output.
//!
//! A [`Sensitive<T>`] can only give up its contents through [`reveal`] or
//! [`expose`], both of which are named loudly enough to stand out in review.
//! Formatting one yields a fixed placeholder regardless of the payload, and
//! the wrapper deliberately implements neither `Serialize` nor
//! `Deserialize`: serializing secret material is a type error, not a
//! runtime check.
//!
//! [`reveal`]: Sensitive::reveal
//! [`expose`]: Sensitive::expose

use std::fmt;

/// Placeholder emitted by the `Debug` and `Display` implementations.
const PLACEHOLDER: &str = "<sensitive>";

/// A value whose contents must not appear in logs, error messages, or
/// serialized events.
///
/// Construction requires explicit marking via [`Sensitive::new`]; extraction
/// requires an equally explicit [`Sensitive::reveal`] (by value) or
/// [`Sensitive::expose`] (by reference, for the single sanctioned write
/// site in the secret provisioner).
#[derive(Clone, PartialEq, Eq)]
pub struct Sensitive<T>(T);

impl<T> Sensitive<T> {
    /// Mark a value as sensitive.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self(value)
    }

    /// Consume the wrapper and return the inner value.
    ///
    /// The caller takes responsibility for keeping the revealed value out
    /// of logs and error payloads.
    #[must_use]
    pub fn reveal(self) -> T {
        self.0
    }

    /// Borrow the inner value.
    #[must_use]
    pub const fn expose(&self) -> &T {
        &self.0
    }

    /// Apply a transformation without leaving the sensitive boundary.
    #[must_use]
    pub fn map<U, F>(self, f: F) -> Sensitive<U>
    where
        F: FnOnce(T) -> U,
    {
        Sensitive(f(self.0))
    }
}

impl<T> Sensitive<Option<T>> {
    /// Pivot a sensitive optional into an optional sensitive.
    ///
    /// `None` carries no secret material, so it is safe to surface the
    /// presence bit while keeping the payload wrapped.
    #[must_use]
    pub fn transpose(self) -> Option<Sensitive<T>> {
        self.0.map(Sensitive)
    }
}

impl<T: Default> Default for Sensitive<T> {
    fn default() -> Self {
        Self(T::default())
    }
}

impl<T> fmt::Debug for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(PLACEHOLDER)
    }
}

impl<T> fmt::Display for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(PLACEHOLDER)
    }
}

impl<T> From<T> for Sensitive<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}
