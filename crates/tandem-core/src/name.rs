//! Display names.

use std::fmt;

/// Name shown for participants who did not pick one.
pub const DEFAULT_DISPLAY_NAME: &str = "Stranger";

/// Default maximum display name length, in characters.
pub const DEFAULT_MAX_NAME_CHARS: usize = 32;

/// A participant's display name.
///
/// Built once when the participant record is created: trimmed, truncated
/// to a maximum number of characters, and replaced by
/// [`DEFAULT_DISPLAY_NAME`] when nothing is left.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DisplayName(String);

impl DisplayName {
    /// Build a display name using [`DEFAULT_MAX_NAME_CHARS`].
    #[must_use]
    pub fn new(raw: Option<&str>) -> Self {
        Self::with_limit(raw, DEFAULT_MAX_NAME_CHARS)
    }

    /// Build a display name truncated to `max_chars` characters.
    #[must_use]
    pub fn with_limit(raw: Option<&str>, max_chars: usize) -> Self {
        let trimmed = raw.map(str::trim).unwrap_or_default();
        let name: String = trimmed.chars().take(max_chars).collect();
        // Truncation may leave trailing whitespace from the middle of the name
        let name = name.trim_end();

        if name.is_empty() {
            Self::stranger()
        } else {
            Self(name.to_string())
        }
    }

    /// The default name.
    #[must_use]
    pub fn stranger() -> Self {
        Self(DEFAULT_DISPLAY_NAME.to_string())
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DisplayName {
    fn default() -> Self {
        Self::stranger()
    }
}

impl fmt::Display for DisplayName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
