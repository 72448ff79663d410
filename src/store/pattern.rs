//! Glob key patterns for bulk lookup and invalidation

use regex::Regex;

use crate::error::{Error, Result};

/// Compiled glob pattern over cache keys
///
/// `*` matches any run of characters (including `:`), `?` matches exactly one
/// character; everything else is literal.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    glob: String,
    /// `None` for the match-all pattern `*`
    regex: Option<Regex>,
}

impl KeyPattern {
    /// Compile a glob pattern
    pub fn new(glob: &str) -> Result<Self> {
        if glob.is_empty() {
            return Err(Error::InvalidPattern {
                pattern: glob.to_string(),
                reason: "pattern is empty".to_string(),
            });
        }
        if glob == "*" {
            return Ok(Self::any());
        }

        let mut source = String::with_capacity(glob.len() + 8);
        source.push('^');
        let mut literal = String::new();
        for ch in glob.chars() {
            match ch {
                '*' | '?' => {
                    source.push_str(&regex::escape(&literal));
                    literal.clear();
                    source.push_str(if ch == '*' { ".*" } else { "." });
                }
                _ => literal.push(ch),
            }
        }
        source.push_str(&regex::escape(&literal));
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| Error::InvalidPattern {
            pattern: glob.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            glob: glob.to_string(),
            regex: Some(regex),
        })
    }

    /// Pattern matching every key
    pub fn any() -> Self {
        Self {
            glob: "*".to_string(),
            regex: None,
        }
    }

    /// Check whether a key matches
    #[inline]
    pub fn matches(&self, key: &str) -> bool {
        self.regex.as_ref().map_or(true, |regex| regex.is_match(key))
    }

    /// The original glob text
    pub fn as_str(&self) -> &str {
        &self.glob
    }

    /// Same pattern applied below a key prefix
    pub fn prefixed(&self, prefix: &str) -> Result<Self> {
        Self::new(&format!("{}{}", prefix, self.glob))
    }
}

impl std::fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.glob)
    }
}
