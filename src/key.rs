//! Canonical cache keys for request descriptors.
//!
//! Two descriptors that name the same logical request must map to the same
//! key, regardless of:
//! - the order of their parameters
//! - whether a parameter sits in the URL query or in the body
//! - `http:` vs `https:` and absolute-path vs full URL on the current origin
//! - volatile parameters (`_*` nonces, the `bkn` token, the `t` timestamp)

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::descriptor::{ParamValue, Params, RequestDescriptor};
use crate::error::Result;
use crate::session::{decode_component, PageContext};

/// Characters escaped by `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
  .remove(b'-')
  .remove(b'_')
  .remove(b'.')
  .remove(b'!')
  .remove(b'~')
  .remove(b'*')
  .remove(b'\'')
  .remove(b'(')
  .remove(b')');

/// Percent-encode one URI component the way browsers do.
pub fn encode_component(s: &str) -> String {
  utf8_percent_encode(s, COMPONENT).to_string()
}

/// Serialize parameters as sorted `k=v` pairs joined with `&`.
///
/// Pairs are sorted by their encoded form, so insertion order never matters.
pub fn serialize_params(params: &Params) -> String {
  let mut pairs = encoded_pairs(params);
  pairs.sort();
  pairs.join("&")
}

fn encoded_pairs(params: &Params) -> Vec<String> {
  params
    .iter()
    .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(&v.to_string())))
    .collect()
}

/// Append serialized parameters to `url`, respecting an existing query.
pub fn append_query(url: &str, params: &Params) -> String {
  if params.is_empty() {
    return url.to_string();
  }
  let sep = if url.contains('?') { '&' } else { '?' };
  format!("{}{}{}", url, sep, serialize_params(params))
}

/// Derive the canonical key for `descriptor` on `page`.
pub fn canonical_key(descriptor: &RequestDescriptor, page: &PageContext) -> Result<String> {
  descriptor.validate()?;

  let (path, params) = fold_url_query(descriptor);
  let path = normalize_path(path, page);

  let mut pairs: Vec<String> = encoded_pairs(&params)
    .into_iter()
    .filter(|pair| !is_volatile(pair.split('=').next().unwrap_or("")))
    .collect();
  pairs.sort();

  if pairs.is_empty() {
    Ok(path)
  } else {
    Ok(format!("{}?{}", path, pairs.join("&")))
  }
}

/// Split the URL at `?` and merge its query pairs into the body parameters.
fn fold_url_query(descriptor: &RequestDescriptor) -> (&str, Params) {
  let (path, query) = descriptor
    .url
    .split_once('?')
    .unwrap_or((descriptor.url.as_str(), ""));
  // Anything after a second `?` is ignored
  let query = query.split('?').next().unwrap_or("");

  let mut params = descriptor.data.clone();
  for pair in query.split('&') {
    // Only the text between the first and second `=` is the value
    let mut parts = pair.split('=');
    let name = parts.next().unwrap_or("");
    let value = parts.next().unwrap_or("");
    if name.is_empty() {
      continue;
    }
    params.insert(
      decode_component(name),
      ParamValue::Str(decode_component(value)),
    );
  }

  (path, params)
}

/// Resolve origin-absolute paths against the page, then drop the scheme.
fn normalize_path(path: &str, page: &PageContext) -> String {
  let path = if path.starts_with('/') && !path.starts_with("//") {
    format!("{}{}", page.origin(), path)
  } else {
    path.to_string()
  };

  let stripped = path
    .strip_prefix("https:")
    .or_else(|| path.strip_prefix("http:"))
    .map(String::from);
  stripped.unwrap_or(path)
}

/// Parameters that change per request without changing its identity.
fn is_volatile(encoded_name: &str) -> bool {
  match encoded_name {
    "bkn" | "t" => true,
    name => name
      .strip_prefix('_')
      .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')),
  }
}
