// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Type-erased error carried by [`WriteError`] and [`EmitError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A configuration problem detected while configuring an output or buffer.
///
/// Configuration errors are fatal for the plugin that reports them: the plugin must not be
/// started.
#[derive(Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// A parameter has a value outside its allowed range.
    InvalidParameter {
        /// Name of the parameter.
        name: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// No buffer or output factory is registered under this type name.
    UnknownPluginType(String),
    /// `@label` names a routing scope the root agent does not know about.
    UnknownLabel(String),
    /// The `timezone` parameter is neither a known zone name nor a `±HH:MM` offset.
    InvalidTimezone(String),
    /// `time_slice_format` cannot format a timestamp.
    InvalidTimeFormat {
        /// The rejected format string.
        format: String,
        /// The formatter's complaint.
        reason: String,
    },
    /// A parameter could not be deserialized into its typed view.
    Deserialize(serde_json::Error),
    /// The plugin was already configured or started and can no longer be reconfigured.
    AlreadyConfigured,
}

impl ConfigError {
    /// Shorthand for [`ConfigError::InvalidParameter`].
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter { name, reason } => {
                write!(f, "invalid parameter '{name}': {reason}")
            }
            Self::UnknownPluginType(ty) => write!(f, "unknown plugin type '{ty}'"),
            Self::UnknownLabel(label) => write!(f, "unknown label '{label}'"),
            Self::InvalidTimezone(tz) => write!(f, "invalid timezone '{tz}'"),
            Self::InvalidTimeFormat { format, reason } => {
                write!(f, "invalid time format '{format}': {reason}")
            }
            Self::Deserialize(err) => write!(f, "invalid configuration: {err}"),
            Self::AlreadyConfigured => f.write_str("output is already configured or running"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Deserialize(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Deserialize(value)
    }
}

/// The error cases for handing an event stream to an output.
#[derive(Debug)]
#[non_exhaustive]
pub enum EmitError {
    /// The buffer already holds as many sealed chunks as it may.
    QueueLimitExceeded {
        /// The configured queue limit.
        limit: usize,
    },
    /// The output could not serialize the stream.
    Format(BoxError),
    /// A later output in the chain failed.
    Downstream(BoxError),
}

impl EmitError {
    /// Wrap a formatting failure.
    pub fn format(err: impl Into<BoxError>) -> Self {
        Self::Format(err.into())
    }
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueLimitExceeded { limit } => {
                write!(f, "buffer queue size exceeds limit ({limit})")
            }
            Self::Format(err) => write!(f, "couldn't format event stream: {err}"),
            Self::Downstream(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl std::error::Error for EmitError {}

/// A failure while writing a chunk to a sink.
///
/// Write errors are always caught by the flush engine and drive its retry state machine.
pub struct WriteError {
    class: &'static str,
    inner: BoxError,
}

impl WriteError {
    /// Wrap a sink failure, remembering its type name for log output.
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self {
            class: std::any::type_name::<E>(),
            inner: Box::new(err),
        }
    }

    /// Create a write error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            class: "WriteError",
            inner: message.into().into(),
        }
    }

    /// The type name of the wrapped error.
    pub fn error_class(&self) -> &'static str {
        self.class
    }

    /// Unwrap into the underlying error.
    pub fn into_inner(self) -> BoxError {
        self.inner
    }
}

impl fmt::Debug for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteError")
            .field("class", &self.class)
            .field("inner", &self.inner)
            .finish()
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.inner)
    }
}

impl From<std::io::Error> for WriteError {
    fn from(value: std::io::Error) -> Self {
        Self::new(value)
    }
}

impl From<serde_json::Error> for WriteError {
    fn from(value: serde_json::Error) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_error_keeps_class_name() {
        let err = WriteError::from(std::io::Error::other("connection reset"));
        assert!(err.error_class().contains("io"));
        assert_eq!(err.to_string(), "connection reset");

        let err = WriteError::msg("endpoint unavailable");
        assert_eq!(err.error_class(), "WriteError");
        assert_eq!(err.to_string(), "endpoint unavailable");
    }

    #[test]
    fn config_error_messages() {
        assert_eq!(
            ConfigError::invalid("secondary_limit", "must not be negative (-1)").to_string(),
            "invalid parameter 'secondary_limit': must not be negative (-1)"
        );
        assert_eq!(
            ConfigError::UnknownLabel("@ERROR".into()).to_string(),
            "unknown label '@ERROR'"
        );
    }
}
