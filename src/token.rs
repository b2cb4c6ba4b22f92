//! Session-derived request token (`bkn`).
//!
//! **This is a checksum, not a security mechanism.** The algorithm is a
//! 5381-seeded polynomial rolling hash (djb2 with JavaScript integer
//! semantics) masked to 31 bits. Anyone holding the session cookie can compute
//! it, and collisions are trivial to find. It exists only so that a paired
//! server expecting this exact value keeps accepting requests; it provides no
//! integrity or authenticity guarantee.

/// Compute the 31-bit token for a session value.
///
/// Returns `None` for an empty session value; the caller then sends an empty
/// token. The arithmetic reproduces the browser version bit for bit: the
/// accumulator is unbounded, the shift operates on its int32 truncation, and
/// characters are UTF-16 code units.
pub fn session_token(session: &str) -> Option<u32> {
  if session.is_empty() {
    return None;
  }

  let mut hash: i64 = 5381;
  for unit in session.encode_utf16() {
    let shifted = (hash as u32 as i32).wrapping_shl(5);
    hash += i64::from(shifted) + i64::from(unit);
  }

  Some((hash as u32) & 0x7fff_ffff)
}

/// Token rendered as a request parameter value (empty when no session).
pub fn session_token_param(session: &str) -> String {
  session_token(session)
    .map(|t| t.to_string())
    .unwrap_or_default()
}
