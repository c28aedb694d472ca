use generate_controller_core::{ClientError, InvalidGeneration};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("invalid generate rule {rule}: {error}")]
    InvalidRule {
        rule: String,
        #[source]
        error: InvalidGeneration,
    },

    #[error("rule {rule} failed: {error}")]
    Rule {
        rule: String,
        #[source]
        error: Box<Error>,
    },

    #[error("failed to get source {source_spec}: {error}")]
    Source {
        source_spec: String,
        #[source]
        error: ClientError,
    },

    #[error("failed to fetch trigger {trigger}: {reason}")]
    Trigger { trigger: String, reason: String },

    #[error("failed to list {kind} in {namespace:?}: {error}")]
    List {
        kind: String,
        namespace: String,
        #[source]
        error: ClientError,
    },

    #[error(transparent)]
    Multiple(Errors),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Accumulates errors from independent units of work.
///
/// Displays as the messages of all errors joined by `; `.
#[derive(Debug, Default)]
pub struct Errors(Vec<Error>);

// === impl Error ===

impl Error {
    pub fn in_rule(self, rule: impl Into<String>) -> Self {
        Self::Rule {
            rule: rule.into(),
            error: Box::new(self),
        }
    }
}

// === impl Errors ===

impl Errors {
    pub fn push(&mut self, error: Error) {
        self.0.push(error);
    }

    pub fn extend(&mut self, other: Errors) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Error> {
        self.0.iter()
    }

    /// Returns `Ok` if no errors were collected. A single error is returned
    /// as is.
    pub fn into_error(mut self) -> Result<(), Error> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(Error::Multiple(self)),
        }
    }

    /// Returns `Ok` if no errors were collected.
    pub fn into_result(self) -> Result<(), Self> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            fmt::Display::fmt(e, f)?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {}

impl From<Error> for Errors {
    fn from(error: Error) -> Self {
        Self(vec![error])
    }
}

impl FromIterator<Error> for Errors {
    fn from_iter<T: IntoIterator<Item = Error>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
