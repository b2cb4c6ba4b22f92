//! Request descriptors handed to the cache.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PreloadError, Result};

/// HTTP method supported by the preload transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  #[default]
  Get,
  Post,
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Method::Get => f.write_str("GET"),
      Method::Post => f.write_str("POST"),
    }
  }
}

/// How the response body is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
  /// Parse the body as JSON; a parse failure is a hard error
  #[default]
  Json,
  /// Hand the body through as text
  Text,
}

/// A scalar request parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
  Str(String),
  Int(i64),
  Float(f64),
  Bool(bool),
  /// Present without a value; serialized as an empty string
  Missing,
}

impl fmt::Display for ParamValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ParamValue::Str(s) => f.write_str(s),
      ParamValue::Int(i) => write!(f, "{}", i),
      ParamValue::Float(x) => write!(f, "{}", x),
      ParamValue::Bool(b) => write!(f, "{}", b),
      ParamValue::Missing => Ok(()),
    }
  }
}

impl From<&str> for ParamValue {
  fn from(s: &str) -> Self {
    ParamValue::Str(s.to_string())
  }
}

impl From<String> for ParamValue {
  fn from(s: String) -> Self {
    ParamValue::Str(s)
  }
}

impl From<i64> for ParamValue {
  fn from(i: i64) -> Self {
    ParamValue::Int(i)
  }
}

impl From<i32> for ParamValue {
  fn from(i: i32) -> Self {
    ParamValue::Int(i64::from(i))
  }
}

impl From<u32> for ParamValue {
  fn from(i: u32) -> Self {
    ParamValue::Int(i64::from(i))
  }
}

impl From<f64> for ParamValue {
  fn from(x: f64) -> Self {
    ParamValue::Float(x)
  }
}

impl From<bool> for ParamValue {
  fn from(b: bool) -> Self {
    ParamValue::Bool(b)
  }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
  fn from(v: Option<T>) -> Self {
    v.map(Into::into).unwrap_or(ParamValue::Missing)
  }
}

/// Flat parameter bag. Later inserts overwrite earlier ones.
pub type Params = BTreeMap<String, ParamValue>;

/// Describes one request: where it goes and with which parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
  pub url: String,
  #[serde(default)]
  pub method: Method,
  #[serde(default)]
  pub data: Params,
  #[serde(default)]
  pub content_type: Option<String>,
  #[serde(default)]
  pub timeout_ms: Option<u64>,
  #[serde(default)]
  pub data_type: DataType,
}

impl RequestDescriptor {
  /// A GET request for `url` with no parameters.
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      method: Method::Get,
      data: Params::new(),
      content_type: None,
      timeout_ms: None,
      data_type: DataType::Json,
    }
  }

  /// A POST request for `url` with no parameters.
  pub fn post(url: impl Into<String>) -> Self {
    Self {
      method: Method::Post,
      ..Self::get(url)
    }
  }

  /// Add (or overwrite) a body parameter.
  pub fn param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
    self.data.insert(name.into(), value.into());
    self
  }

  pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
    self.content_type = Some(content_type.into());
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout_ms = Some(timeout.as_millis() as u64);
    self
  }

  pub fn with_data_type(mut self, data_type: DataType) -> Self {
    self.data_type = data_type;
    self
  }

  /// Reject descriptors that cannot name a request.
  pub fn validate(&self) -> Result<()> {
    if self.url.trim().is_empty() {
      return Err(PreloadError::MalformedDescriptor(
        "url must not be empty".to_string(),
      ));
    }
    Ok(())
  }
}
