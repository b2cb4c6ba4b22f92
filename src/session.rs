//! Page context: current URL, cookies and the values derived from them.

use percent_encoding::percent_decode_str;
use url::Url;

/// Everything the cache needs to know about the page it runs in.
///
/// One instance per page/session; the cache holds it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct PageContext {
  page_url: Url,
  cookies: String,
}

impl PageContext {
  /// `cookies` uses the `document.cookie` format: `a=1; b=2`.
  pub fn new(page_url: Url, cookies: impl Into<String>) -> Self {
    Self {
      page_url,
      cookies: cookies.into(),
    }
  }

  pub fn page_url(&self) -> &Url {
    &self.page_url
  }

  /// `scheme://host[:port]` of the current page.
  pub fn origin(&self) -> String {
    self.page_url.origin().ascii_serialization()
  }

  /// Read a cookie by name, percent-decoded. Empty string if absent.
  pub fn cookie(&self, name: &str) -> String {
    self
      .cookies
      .split(';')
      .map(str::trim_start)
      .filter_map(|pair| pair.split_once('='))
      .find(|(k, _)| *k == name)
      .map(|(_, v)| decode_component(v))
      .unwrap_or_default()
  }

  /// Numeric user id from the `uin` cookie (`o0012345` → `12345`).
  ///
  /// The first character is a prefix and is skipped. Leading digits are
  /// parsed as base 10; a missing, unparseable or zero value yields `None`.
  pub fn uin(&self) -> Option<u64> {
    let raw = self.cookie("uin");
    let mut chars = raw.chars();
    chars.next()?;
    let digits: String = chars
      .as_str()
      .trim_start()
      .chars()
      .take_while(char::is_ascii_digit)
      .collect();
    digits.parse::<u64>().ok().filter(|&n| n != 0)
  }

  /// Read a query parameter of the page URL, percent-decoded. Empty if absent.
  pub fn query(&self, name: &str) -> String {
    self
      .page_url
      .query()
      .unwrap_or("")
      .split('&')
      .filter_map(|pair| pair.split_once('='))
      .find(|(k, _)| *k == name)
      .map(|(_, v)| decode_component(v))
      .unwrap_or_default()
  }
}

/// Percent-decode one URI component; invalid UTF-8 is replaced lossily.
pub(crate) fn decode_component(s: &str) -> String {
  percent_decode_str(s).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn page(url: &str, cookies: &str) -> PageContext {
    PageContext::new(Url::parse(url).unwrap(), cookies)
  }

  #[test]
  fn test_origin_includes_port() {
    assert_eq!(page("https://a.example.com/x?y=1", "").origin(), "https://a.example.com");
    assert_eq!(page("http://localhost:8080/", "").origin(), "http://localhost:8080");
  }

  #[test]
  fn test_cookie_lookup() {
    let p = page("https://e.com/", "uin=o0012345; skey=%40AbC; other=1");
    assert_eq!(p.cookie("skey"), "@AbC");
    assert_eq!(p.cookie("other"), "1");
    assert_eq!(p.cookie("missing"), "");
  }

  #[test]
  fn test_cookie_name_must_match_exactly() {
    let p = page("https://e.com/", "xskey=1; skey=2");
    assert_eq!(p.cookie("skey"), "2");
  }

  #[test]
  fn test_uin_parsing() {
    assert_eq!(page("https://e.com/", "uin=o0012345").uin(), Some(12345));
    assert_eq!(page("https://e.com/", "uin=o12ab").uin(), Some(12));
    assert_eq!(page("https://e.com/", "uin=oabc").uin(), None);
    assert_eq!(page("https://e.com/", "uin=o0").uin(), None);
    assert_eq!(page("https://e.com/", "").uin(), None);
  }

  #[test]
  fn test_query_reader() {
    let p = page("https://e.com/p?id=42&name=a%20b", "");
    assert_eq!(p.query("id"), "42");
    assert_eq!(p.query("name"), "a b");
    assert_eq!(p.query("nope"), "");
  }
}
