//! Speculative-fetch request cache.
//!
//! A page starts a request ("preload") before the component that needs the
//! data exists; that component later claims the in-flight or completed result
//! exactly once, or gets a miss and issues its own request.
//!
//! ```ignore
//! let page = PageContext::new(Url::parse("https://example.com/")?, cookies);
//! let cache = PreloadCache::new(HttpTransport::new(page.page_url().clone()), page);
//!
//! cache.preload(RequestDescriptor::get("/api/info").param("id", 7))?;
//!
//! // Later, in the component
//! match cache.claim(&RequestDescriptor::get("/api/info?id=7")).await? {
//!     Some(completion) => render(completion.response),
//!     None => fetch_normally().await,
//! }
//! ```

pub mod cache;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod key;
pub mod session;
pub mod token;
pub mod transport;

pub use cache::{Completion, LoadHandle, Outcome, PreloadCache, Response};
pub use descriptor::{DataType, Method, ParamValue, RequestDescriptor};
pub use error::PreloadError;
pub use session::PageContext;
pub use transport::{HttpTransport, Transport};
