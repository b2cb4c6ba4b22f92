//! Producer/consumer hand-off between `load` and `get`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::entry::{CacheEntry, Callback, Completion, Delivery, EntryStatus, Outcome, Response};
use super::store::EntryStore;
use crate::descriptor::{DataType, ParamValue, RequestDescriptor};
use crate::error::{PreloadError, Result};
use crate::key;
use crate::session::PageContext;
use crate::token::session_token_param;
use crate::transport::{Transport, TransportReply, TransportRequest, DEFAULT_TIMEOUT};

/// Name of the injected cache-busting parameter.
pub const NONCE_PARAM: &str = "_";
/// Name of the injected session token parameter.
pub const TOKEN_PARAM: &str = "bkn";

/// Tunables for a `PreloadCache`.
#[derive(Debug, Clone)]
pub struct CacheOptions {
  /// Cookie whose value feeds the `bkn` token
  pub session_cookie: String,
  /// Timeout for descriptors that do not set one
  pub default_timeout: Duration,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      session_cookie: "skey".to_string(),
      default_timeout: DEFAULT_TIMEOUT,
    }
  }
}

/// Speculative request cache.
///
/// A page calls [`load`](Self::load) (or [`preload`](Self::preload)) as early
/// as possible; the component that needs the data later calls
/// [`get`](Self::get) (or [`claim`](Self::claim)) with an equivalent
/// descriptor. Each preload is handed to at most one consumer. Any other
/// consumer gets a miss and should issue its own request.
///
/// The store lock is never held while the transport or a callback runs, so
/// callbacks may call back into the cache.
pub struct PreloadCache<T: Transport> {
  inner: Arc<Inner<T>>,
}

struct Inner<T> {
  store: Mutex<EntryStore>,
  transport: T,
  page: PageContext,
  options: CacheOptions,
  next_generation: AtomicU64,
}

impl<T: Transport> PreloadCache<T> {
  pub fn new(transport: T, page: PageContext) -> Self {
    Self::with_options(transport, page, CacheOptions::default())
  }

  pub fn with_options(transport: T, page: PageContext, options: CacheOptions) -> Self {
    Self {
      inner: Arc::new(Inner {
        store: Mutex::new(EntryStore::new()),
        transport,
        page,
        options,
        next_generation: AtomicU64::new(1),
      }),
    }
  }

  pub fn page(&self) -> &PageContext {
    &self.inner.page
  }

  /// Canonical key this cache would use for `descriptor`.
  pub fn canonical_key(&self, descriptor: &RequestDescriptor) -> Result<String> {
    key::canonical_key(descriptor, &self.inner.page)
  }

  /// Number of outstanding (unclaimed or undelivered) entries.
  pub fn len(&self) -> usize {
    self.lock_store().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock_store().is_empty()
  }

  /// Start a preload and register `callback` for its completion.
  ///
  /// Returns as soon as the request is issued. An earlier entry for the same
  /// key is replaced: its callbacks are dropped and its completion is
  /// ignored. Outside a tokio runtime this fails with `NoRuntime` and
  /// leaves the cache untouched.
  pub fn load<F>(&self, descriptor: RequestDescriptor, callback: F) -> Result<LoadHandle>
  where
    F: FnOnce(Option<Outcome>) + Send + 'static,
  {
    self.start(descriptor, Some(Box::new(callback)))
  }

  /// Start a preload with nobody listening yet.
  pub fn preload(&self, descriptor: RequestDescriptor) -> Result<LoadHandle> {
    self.start(descriptor, None)
  }

  /// Claim the preload matching `descriptor`.
  ///
  /// `callback(None)` runs synchronously when there is no preload or it was
  /// already claimed. A completed preload is delivered synchronously; an
  /// in-flight one is delivered when its request finishes.
  pub fn get<F>(&self, descriptor: &RequestDescriptor, callback: F) -> Result<()>
  where
    F: FnOnce(Option<Outcome>) + Send + 'static,
  {
    let key = self.canonical_key(descriptor)?;
    let callback: Callback = Box::new(callback);

    let claimed = {
      let mut store = self.lock_store();
      match store.get_mut(&key) {
        None => Err(callback),
        Some(entry) => match entry.claim(callback) {
          Err(callback) => Err(callback),
          Ok(()) if entry.status == EntryStatus::Done => {
            Ok(Self::finish_locked(&mut store, &key, None, None))
          }
          Ok(()) => Ok(None),
        },
      }
    };

    match claimed {
      Err(callback) => {
        debug!(key = %key, "Preload miss");
        callback(None);
      }
      Ok(Some(delivery)) => {
        debug!(key = %key, "Preload hit");
        delivery.deliver();
      }
      Ok(None) => debug!(key = %key, "Preload claimed while in flight"),
    }

    Ok(())
  }

  /// Async form of [`get`](Self::get).
  ///
  /// `Ok(None)` is a miss. A preload replaced before it completed also
  /// reads as a miss.
  pub async fn claim(&self, descriptor: &RequestDescriptor) -> Result<Option<Completion>> {
    let (tx, rx) = oneshot::channel();
    self.get(descriptor, move |outcome| {
      // Receiver may have been dropped
      let _ = tx.send(outcome);
    })?;

    match rx.await {
      Ok(Some(outcome)) => outcome.map(Some),
      Ok(None) | Err(_) => Ok(None),
    }
  }

  fn start(&self, descriptor: RequestDescriptor, callback: Option<Callback>) -> Result<LoadHandle> {
    let key = self.canonical_key(&descriptor)?;
    let runtime =
      Handle::try_current().map_err(|_| PreloadError::NoRuntime(key.clone()))?;
    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

    if let Some(replaced) = self
      .lock_store()
      .insert(&key, CacheEntry::fetching(generation, callback))
    {
      warn!(
        key = %key,
        status = ?replaced.status(),
        orphaned = replaced.pending.len(),
        "Replacing existing preload"
      );
    }

    let data_type = descriptor.data_type;
    let request = self.decorate(descriptor);
    debug!(key = %key, generation, "Preloading");

    let reply = self.inner.transport.send(request);
    let this = self.clone();
    let task_key = key.clone();
    let handle = runtime.spawn(async move {
      let outcome = decode(reply.await, data_type, &task_key);
      let result = match &outcome {
        Err(e) => Err(e.clone()),
        Ok(_) => Ok(()),
      };
      this.complete(&task_key, generation, outcome);
      result
    });

    Ok(LoadHandle { key, handle })
  }

  /// Add the nonce and session token, resolve the timeout.
  fn decorate(&self, descriptor: RequestDescriptor) -> TransportRequest {
    let session = self.inner.page.cookie(&self.inner.options.session_cookie);
    let mut params = descriptor.data;
    params.insert(
      NONCE_PARAM.to_string(),
      ParamValue::Float(rand::random::<f64>()),
    );
    params.insert(
      TOKEN_PARAM.to_string(),
      ParamValue::Str(session_token_param(&session)),
    );

    TransportRequest {
      url: descriptor.url,
      method: descriptor.method,
      params,
      content_type: descriptor.content_type,
      timeout: descriptor
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(self.inner.options.default_timeout),
    }
  }

  /// Transport completion hook for the load identified by `generation`.
  fn complete(&self, key: &str, generation: u64, outcome: Outcome) {
    let delivery = {
      let mut store = self.lock_store();
      Self::finish_locked(&mut store, key, Some(generation), Some(outcome))
    };

    match delivery {
      Some(delivery) => delivery.deliver(),
      None => debug!(key = %key, generation, "Dropping completion of replaced preload"),
    }
  }

  /// Mark the entry done, drop it from the store if claimed, and hand back
  /// its callbacks. The entry leaves the store before any callback runs.
  fn finish_locked(
    store: &mut EntryStore,
    key: &str,
    generation: Option<u64>,
    outcome: Option<Outcome>,
  ) -> Option<Delivery> {
    let entry = store.get_mut(key)?;
    if generation.is_some_and(|g| g != entry.generation) {
      return None;
    }

    let delivery = entry.finish(outcome);
    if entry.is_used() {
      store.remove(key);
    }
    Some(delivery)
  }

  fn lock_store(&self) -> MutexGuard<'_, EntryStore> {
    // Callbacks never run under the lock, so a poisoned store is still consistent
    self
      .inner
      .store
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }
}

impl<T: Transport> Clone for PreloadCache<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// Turn a transport reply into the value callbacks receive.
fn decode(reply: TransportReply, data_type: DataType, key: &str) -> Outcome {
  match reply {
    TransportReply::Ok { body, meta } => {
      let response = match data_type {
        DataType::Text => Response::Text(body),
        DataType::Json => match serde_json::from_str(&body) {
          Ok(value) => Response::Json(value),
          Err(e) => {
            error!(key = %key, error = %e, "Preload response is not valid JSON");
            return Err(PreloadError::Decode {
              key: key.to_string(),
              message: e.to_string(),
            });
          }
        },
      };
      Ok(Completion {
        response,
        meta: Some(meta),
      })
    }
    TransportReply::Failed { meta } => {
      warn!(key = %key, status = meta.status, "Preload request failed");
      Ok(Completion {
        response: Response::network_error(meta.status),
        meta: Some(meta),
      })
    }
  }
}

/// Handle to the background task completing one preload.
#[derive(Debug)]
pub struct LoadHandle {
  key: String,
  handle: JoinHandle<Result<()>>,
}

impl LoadHandle {
  pub fn key(&self) -> &str {
    &self.key
  }

  /// Wait until the preload has completed and its callbacks have run.
  ///
  /// Decode failures surface here as well as in the callbacks.
  pub async fn wait(self) -> Result<()> {
    self.handle.await.map_err(|e| PreloadError::TaskFailed {
      key: self.key,
      message: e.to_string(),
    })?
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::TransportMeta;
  use futures::future::BoxFuture;
  use url::Url;

  type Recorded = Arc<Mutex<Vec<Option<Outcome>>>>;

  /// Transport whose replies are released by the test.
  #[derive(Clone, Default)]
  struct ScriptedTransport {
    calls: Arc<Mutex<Vec<(TransportRequest, Option<oneshot::Sender<TransportReply>>)>>>,
  }

  impl ScriptedTransport {
    fn requests(&self) -> Vec<TransportRequest> {
      self.calls.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
    }

    fn reply(&self, index: usize, reply: TransportReply) {
      let tx = self.calls.lock().unwrap()[index].1.take().unwrap();
      tx.send(reply).unwrap();
    }

    fn ok(&self, index: usize, body: &str) {
      self.reply(
        index,
        TransportReply::Ok {
          body: body.to_string(),
          meta: meta(200),
        },
      );
    }
  }

  impl Transport for ScriptedTransport {
    fn send(&self, request: TransportRequest) -> BoxFuture<'static, TransportReply> {
      let (tx, rx) = oneshot::channel();
      self.calls.lock().unwrap().push((request, Some(tx)));
      Box::pin(async move {
        rx.await.unwrap_or(TransportReply::Failed { meta: meta(0) })
      })
    }
  }

  fn meta(status: u16) -> TransportMeta {
    TransportMeta {
      status,
      url: "https://example.com/api/info".to_string(),
    }
  }

  fn setup() -> (PreloadCache<ScriptedTransport>, ScriptedTransport) {
    let transport = ScriptedTransport::default();
    let page = PageContext::new(
      Url::parse("https://example.com/page").unwrap(),
      "uin=o0012345; skey=abc",
    );
    (PreloadCache::new(transport.clone(), page), transport)
  }

  fn recorder() -> (Recorded, impl Fn() -> Callback) {
    let seen: Recorded = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let make = move || -> Callback {
      let seen = seen_clone.clone();
      Box::new(move |o| seen.lock().unwrap().push(o))
    };
    (seen, make)
  }

  fn json_outcome(value: serde_json::Value) -> Option<Outcome> {
    Some(Ok(Completion {
      response: Response::Json(value),
      meta: Some(meta(200)),
    }))
  }

  fn info() -> RequestDescriptor {
    RequestDescriptor::get("/api/info").param("a", 1).param("b", 2)
  }

  #[tokio::test]
  async fn test_miss_before_any_load() {
    let (cache, _) = setup();
    let (seen, make) = recorder();

    cache.get(&info(), make()).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![None]);
    assert!(cache.is_empty());
  }

  #[tokio::test]
  async fn test_deferred_hit_delivered_once() {
    let (cache, transport) = setup();
    let (load_seen, make_load) = recorder();
    let (get_seen, make_get) = recorder();

    let handle = cache
      .load(RequestDescriptor::get("/api/info?b=2&a=1"), make_load())
      .unwrap();
    cache.get(&info(), make_get()).unwrap();
    assert!(get_seen.lock().unwrap().is_empty());

    transport.ok(0, r#"{"retcode":0,"data":[1]}"#);
    handle.wait().await.unwrap();

    let expected = json_outcome(serde_json::json!({"retcode": 0, "data": [1]}));
    assert_eq!(*get_seen.lock().unwrap(), vec![expected.clone()]);
    assert_eq!(*load_seen.lock().unwrap(), vec![expected]);
    assert!(cache.is_empty());
  }

  #[tokio::test]
  async fn test_second_getter_misses_immediately() {
    let (cache, transport) = setup();
    let (first, make_first) = recorder();
    let (second, make_second) = recorder();

    let handle = cache.preload(info()).unwrap();
    cache.get(&info(), make_first()).unwrap();
    cache.get(&info(), make_second()).unwrap();

    assert_eq!(*second.lock().unwrap(), vec![None]);
    assert!(first.lock().unwrap().is_empty());

    transport.ok(0, "1");
    handle.wait().await.unwrap();

    assert_eq!(*first.lock().unwrap(), vec![json_outcome(serde_json::json!(1))]);
    assert_eq!(second.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_done_entry_is_delivered_synchronously() {
    let (cache, transport) = setup();
    let (seen, make) = recorder();

    let handle = cache.preload(info()).unwrap();
    transport.ok(0, "true");
    handle.wait().await.unwrap();
    assert_eq!(cache.len(), 1);

    cache.get(&info(), make()).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![json_outcome(serde_json::json!(true))]);
    assert!(cache.is_empty());

    // Consumed: the next getter falls back
    let (again, make_again) = recorder();
    cache.get(&info(), make_again()).unwrap();
    assert_eq!(*again.lock().unwrap(), vec![None]);
  }

  #[tokio::test]
  async fn test_unclaimed_entry_stays_after_completion() {
    let (cache, transport) = setup();
    let (seen, make) = recorder();

    let handle = cache.load(info(), make()).unwrap();
    transport.ok(0, "{}");
    handle.wait().await.unwrap();

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(cache.len(), 1);
  }

  #[tokio::test]
  async fn test_request_is_decorated_but_key_is_not() {
    let (cache, transport) = setup();
    let descriptor = info().param("t", 123);

    let handle = cache.preload(descriptor.clone()).unwrap();
    assert_eq!(handle.key(), "//example.com/api/info?a=1&b=2");

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    let params = &requests[0].params;
    assert_eq!(
      params.get(TOKEN_PARAM),
      Some(&ParamValue::Str("193485963".to_string()))
    );
    assert!(matches!(params.get(NONCE_PARAM), Some(ParamValue::Float(x)) if (0.0..1.0).contains(x)));
    assert_eq!(params.get("t"), Some(&ParamValue::Int(123)));
    assert_eq!(requests[0].timeout, DEFAULT_TIMEOUT);
    assert!(!descriptor.data.contains_key(NONCE_PARAM));
  }

  #[tokio::test]
  async fn test_descriptor_timeout_overrides_default() {
    let (cache, transport) = setup();
    cache
      .preload(info().with_timeout(Duration::from_millis(500)))
      .unwrap();
    assert_eq!(transport.requests()[0].timeout, Duration::from_millis(500));
  }

  #[tokio::test]
  async fn test_missing_session_sends_empty_token() {
    let transport = ScriptedTransport::default();
    let page = PageContext::new(Url::parse("https://example.com/").unwrap(), "");
    let cache = PreloadCache::new(transport.clone(), page);

    cache.preload(info()).unwrap();
    assert_eq!(
      transport.requests()[0].params.get(TOKEN_PARAM),
      Some(&ParamValue::Str(String::new()))
    );
  }

  #[tokio::test]
  async fn test_transport_failure_is_a_normal_completion() {
    let (cache, transport) = setup();
    let (seen, make) = recorder();

    let handle = cache.preload(info()).unwrap();
    cache.get(&info(), make()).unwrap();
    transport.reply(0, TransportReply::Failed { meta: meta(0) });
    handle.wait().await.unwrap();

    assert_eq!(
      *seen.lock().unwrap(),
      vec![Some(Ok(Completion {
        response: Response::network_error(404),
        meta: Some(meta(0)),
      }))]
    );
  }

  #[tokio::test]
  async fn test_failure_keeps_received_status() {
    let (cache, transport) = setup();

    let handle = cache.preload(info()).unwrap();
    transport.reply(0, TransportReply::Failed { meta: meta(502) });
    handle.wait().await.unwrap();

    let completion = cache.claim(&info()).await.unwrap().unwrap();
    assert_eq!(completion.response, Response::network_error(502));
  }

  #[tokio::test]
  async fn test_decode_failure_propagates() {
    let (cache, transport) = setup();
    let (seen, make) = recorder();

    let handle = cache.preload(info()).unwrap();
    cache.get(&info(), make()).unwrap();
    transport.ok(0, "<html>");

    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, PreloadError::Decode { .. }));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(matches!(seen[0], Some(Err(PreloadError::Decode { .. }))));
  }

  #[tokio::test]
  async fn test_text_data_type_skips_json() {
    let (cache, transport) = setup();
    let handle = cache
      .preload(info().with_data_type(DataType::Text))
      .unwrap();
    transport.ok(0, "<html>");
    handle.wait().await.unwrap();

    let completion = cache.claim(&info()).await.unwrap().unwrap();
    assert_eq!(completion.response, Response::Text("<html>".to_string()));
  }

  #[tokio::test]
  async fn test_claim_waits_for_in_flight_load() {
    let (cache, transport) = setup();
    let handle = cache.preload(info()).unwrap();
    let descriptor = info();

    let (claimed, _) = tokio::join!(cache.claim(&descriptor), async {
      transport.ok(0, r#"{"ok":1}"#);
    });

    let completion = claimed.unwrap().unwrap();
    assert_eq!(completion.response, Response::Json(serde_json::json!({"ok": 1})));
    handle.wait().await.unwrap();
    assert!(cache.is_empty());
  }

  #[tokio::test]
  async fn test_claim_without_preload_is_none() {
    let (cache, _) = setup();
    assert!(cache.claim(&info()).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_repeated_load_replaces_entry() {
    let (cache, transport) = setup();
    let (first, make_first) = recorder();
    let (consumer, make_consumer) = recorder();

    let first_handle = cache.load(info(), make_first()).unwrap();
    let second_handle = cache.preload(info()).unwrap();
    assert_eq!(cache.len(), 1);
    assert_eq!(transport.requests().len(), 2);

    cache.get(&info(), make_consumer()).unwrap();

    // The replaced request finishing must not complete the new entry
    transport.ok(0, r#""stale""#);
    first_handle.wait().await.unwrap();
    assert!(consumer.lock().unwrap().is_empty());
    assert!(first.lock().unwrap().is_empty());
    assert_eq!(cache.len(), 1);

    transport.ok(1, r#""fresh""#);
    second_handle.wait().await.unwrap();
    assert_eq!(
      *consumer.lock().unwrap(),
      vec![json_outcome(serde_json::json!("fresh"))]
    );
    assert!(first.lock().unwrap().is_empty());
    assert!(cache.is_empty());
  }

  #[tokio::test]
  async fn test_callback_reentry_sees_clean_miss() {
    let (cache, transport) = setup();
    let nested: Recorded = Arc::new(Mutex::new(Vec::new()));

    let handle = cache.preload(info()).unwrap();
    let reentrant = cache.clone();
    let nested_clone = nested.clone();
    cache
      .get(&info(), move |outcome| {
        assert!(outcome.is_some());
        let nested = nested_clone.clone();
        reentrant
          .get(&info(), move |o| nested.lock().unwrap().push(o))
          .unwrap();
      })
      .unwrap();

    transport.ok(0, "null");
    handle.wait().await.unwrap();

    assert_eq!(*nested.lock().unwrap(), vec![None]);
    assert!(cache.is_empty());
  }

  #[tokio::test]
  async fn test_malformed_descriptor_fails_fast() {
    let (cache, transport) = setup();
    let (seen, make) = recorder();

    assert!(matches!(
      cache.preload(RequestDescriptor::get("")),
      Err(PreloadError::MalformedDescriptor(_))
    ));
    assert!(matches!(
      cache.get(&RequestDescriptor::get(""), make()),
      Err(PreloadError::MalformedDescriptor(_))
    ));
    assert!(seen.lock().unwrap().is_empty());
    assert!(transport.requests().is_empty());
    assert!(cache.is_empty());
  }

  #[test]
  fn test_load_outside_runtime_is_an_error() {
    let (cache, transport) = setup();
    let (seen, make) = recorder();

    assert!(matches!(
      cache.load(info(), make()),
      Err(PreloadError::NoRuntime(_))
    ));
    assert!(matches!(
      cache.preload(info()),
      Err(PreloadError::NoRuntime(_))
    ));
    assert!(cache.is_empty());
    assert!(transport.requests().is_empty());
    assert!(seen.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_instances_are_isolated() {
    let (a, transport) = setup();
    let (b, _) = setup();

    a.preload(info()).unwrap();
    assert!(b.claim(&info()).await.unwrap().is_none());
    assert_eq!(a.len(), 1);
    assert_eq!(transport.requests().len(), 1);
  }
}
