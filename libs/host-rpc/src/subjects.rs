//! Subject naming.
//!
//! Every host listens on `<prefix>.<topic>.<host>` for requests from its
//! peers; notifications go out on `<prefix>.notifications.<priority>`. The
//! resolver is a pure translator, nothing else in the crate builds subjects.

use config::wire::DEFAULT_SUBJECT_PREFIX;
use floating_ips::notify::Priority;

use crate::error::{TransportError, TransportResult};

const DEFAULT_TOPIC: &str = "network";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectResolver {
    prefix: String,
    topic: String,
}

impl SubjectResolver {
    /// Returns an error if either part is empty or not a plain subject token
    /// sequence.
    pub fn new(prefix: impl Into<String>, topic: impl Into<String>) -> TransportResult<Self> {
        let resolver = Self {
            prefix: prefix.into(),
            topic: topic.into(),
        };
        validate("subject_prefix", &resolver.prefix, true)?;
        validate("topic", &resolver.topic, false)?;
        Ok(resolver)
    }

    pub fn with_defaults() -> Self {
        Self {
            prefix: DEFAULT_SUBJECT_PREFIX.to_owned(),
            topic: DEFAULT_TOPIC.to_owned(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// subject `host` serves requests on
    pub fn host_subject(&self, host: &str) -> TransportResult<String> {
        validate("host", host, false)?;
        Ok(format!("{}.{}.{host}", self.prefix, self.topic))
    }

    pub fn notification_subject(&self, priority: Priority) -> String {
        format!("{}.notifications.{}", self.prefix, priority.as_str())
    }
}

impl Default for SubjectResolver {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Non-empty, no `{..}` placeholders, no wildcards or whitespace. Dots are
/// only allowed where the part may span several tokens.
fn validate(what: &str, part: &str, dotted: bool) -> TransportResult<()> {
    if part.trim().is_empty() {
        return Err(TransportError::Config(format!("{what} is empty")));
    }
    if part.contains('{') || part.contains('}') {
        return Err(TransportError::Config(format!(
            "{what} contains unresolved placeholder: {part}"
        )));
    }
    let bad = |c: char| c == '*' || c == '>' || c.is_whitespace() || (!dotted && c == '.');
    if part.contains(bad) || part.starts_with('.') || part.ends_with('.') {
        return Err(TransportError::Config(format!(
            "{what} is not a valid subject token: {part}"
        )));
    }
    Ok(())
}
