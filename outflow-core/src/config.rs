// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The configuration tree handed to [`Output::configure`](crate::Output::configure) and
//! [`Buffer::configure`](crate::Buffer::configure).
//!
//! A [`PluginConfig`] is a named element holding a JSON object of parameters and a list of
//! nested elements (for example `<secondary>`). Plugins read their parameters by
//! deserializing the parameter map into a typed view with [`PluginConfig::parse`]. Unknown
//! parameters are ignored so that several views can be parsed from the same element.

use std::fmt;

use serde::{
    Deserialize, Deserializer,
    de::{self, DeserializeOwned, Unexpected, Visitor},
};
use serde_json::{Map, Value};

use crate::ConfigError;

/// One element of the configuration tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginConfig {
    name: String,
    params: Map<String, Value>,
    elements: Vec<PluginConfig>,
}

impl PluginConfig {
    /// Create an empty element.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set a parameter.
    ///
    /// ```
    /// use outflow_core::PluginConfig;
    ///
    /// let conf = PluginConfig::new("match")
    ///     .with_param("@type", "forward")
    ///     .with_param("retry_limit", 5);
    /// assert_eq!(conf.plugin_type(), Some("forward"));
    /// ```
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Replace all parameters with the members of a JSON object.
    ///
    /// Values that are not JSON objects are ignored.
    pub fn with_params(mut self, params: Value) -> Self {
        if let Value::Object(map) = params {
            self.params = map;
        }
        self
    }

    /// Append a nested element.
    pub fn with_element(mut self, element: PluginConfig) -> Self {
        self.elements.push(element);
        self
    }

    /// The element name, e.g. `match` or `secondary`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All parameters.
    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// A single parameter.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// A single string parameter.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Returns `true` if the parameter was set explicitly.
    pub fn has(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    /// All nested elements.
    pub fn elements(&self) -> &[PluginConfig] {
        &self.elements
    }

    /// The first nested element with the given name.
    pub fn element(&self, name: &str) -> Option<&PluginConfig> {
        self.elements.iter().find(|e| e.name == name)
    }

    /// The plugin type, from `@type` or the older `type` parameter.
    pub fn plugin_type(&self) -> Option<&str> {
        self.get_str("@type").or_else(|| self.get_str("type"))
    }

    /// Deserialize the parameters into a typed view.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        Ok(T::deserialize(&Value::Object(self.params.clone()))?)
    }
}

/// A time parameter in seconds.
///
/// Deserializes from a number of seconds, or from a string with an optional `s`, `m`, `h`
/// or `d` suffix such as `"30s"` or `"1.5h"`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Seconds(pub f64);

impl Seconds {
    /// The value in seconds.
    pub fn as_secs_f64(self) -> f64 {
        self.0
    }
}

impl<'de> Deserialize<'de> for Seconds {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SecondsVisitor;

        impl Visitor<'_> for SecondsVisitor {
            type Value = Seconds;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a number of seconds or a string such as \"30s\", \"5m\" or \"1h\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Seconds, E> {
                Ok(Seconds(v as f64))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Seconds, E> {
                Ok(Seconds(v as f64))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Seconds, E> {
                Ok(Seconds(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Seconds, E> {
                parse_time(v)
                    .map(Seconds)
                    .ok_or_else(|| E::invalid_value(Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_any(SecondsVisitor)
    }
}

/// A size parameter in bytes.
///
/// Deserializes from a number of bytes, or from a string with an optional `k`, `m`, `g` or
/// `t` suffix (powers of 1024) such as `"8m"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ByteSize(pub u64);

impl ByteSize {
    /// The value in bytes.
    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ByteSizeVisitor;

        impl Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a number of bytes or a string such as \"512k\" or \"8m\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ByteSize, E> {
                Ok(ByteSize(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ByteSize, E> {
                u64::try_from(v)
                    .map(ByteSize)
                    .map_err(|_| E::invalid_value(Unexpected::Signed(v), &self))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ByteSize, E> {
                parse_size(v)
                    .map(ByteSize)
                    .ok_or_else(|| E::invalid_value(Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

/// Parse a time value such as `"10"`, `"30s"`, `"5m"`, `"1.5h"` or `"1d"` into seconds.
pub fn parse_time(value: &str) -> Option<f64> {
    let value = value.trim();
    let (number, scale) = match value.char_indices().last()? {
        (i, 's') => (&value[..i], 1.0),
        (i, 'm') => (&value[..i], 60.0),
        (i, 'h') => (&value[..i], 3600.0),
        (i, 'd') => (&value[..i], 86400.0),
        _ => (value, 1.0),
    };
    let number: f64 = number.trim().parse().ok()?;
    number.is_finite().then_some(number * scale)
}

/// Parse a size value such as `"1024"`, `"512k"` or `"8m"` into bytes.
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let (number, shift) = match value.char_indices().last()? {
        (i, 'k' | 'K') => (&value[..i], 10),
        (i, 'm' | 'M') => (&value[..i], 20),
        (i, 'g' | 'G') => (&value[..i], 30),
        (i, 't' | 'T') => (&value[..i], 40),
        _ => (value, 0),
    };
    let number = number.trim();
    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(1u64 << shift);
    }
    let fractional: f64 = number.parse().ok()?;
    let bytes = fractional * (1u64 << shift) as f64;
    (bytes.is_finite() && bytes >= 0.0 && bytes < u64::MAX as f64).then_some(bytes as u64)
}
