//! Fetch Router: classifies each request and resolves it against the current
//! generation.
//!
//! | Policy | Network ok | Network down |
//! |--------|------------|--------------|
//! | network-first | cache 2xx, return | cached entry, else error |
//! | cache-first-refresh (hit) | return cached, refresh in background | return cached |
//! | cache-first-refresh (miss) | cache 2xx, return | offline document |
//! | bypass | return, no caching | error |

use std::sync::Arc;

use ronin_net::{Fetcher, NetError, Request, Response, UrlPattern};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::store::{CacheEntry, CacheHandle, CacheStorage, RequestKey};

/// Placeholder served for uncached same-origin requests while offline.
pub const OFFLINE_DOCUMENT: &str = "<html><body style=\"background:#080d1a;color:#64748b;font-family:sans-serif;display:flex;align-items:center;justify-content:center;height:100vh;margin:0;flex-direction:column\"><h2 style=\"color:#a5b4fc\">\u{1F4F6} You're offline</h2><p>Open the app once online to cache it for offline use.</p></body></html>";

/// The offline placeholder as a `200 OK` HTML response.
pub fn offline_response(url: Url) -> Response {
    Response::html(url, OFFLINE_DOCUMENT)
}

/// How a request is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingPolicy {
    /// Try the network, fall back to the last cached copy.
    NetworkFirst,
    /// Serve the cached copy and refresh it in the background.
    CacheFirstRefresh,
    /// Forward untouched, no caching.
    Bypass,
}

/// Static classification rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRules {
    /// Never intercepted.
    #[serde(default)]
    pub bypass: Vec<UrlPattern>,

    /// Remote, frequently changing resources.
    #[serde(default)]
    pub network_first: Vec<UrlPattern>,
}

impl Default for RoutingRules {
    fn default() -> Self {
        Self {
            bypass: vec![
                UrlPattern::scheme("chrome-extension"),
                UrlPattern::scheme("moz-extension"),
                UrlPattern::scheme("safari-web-extension"),
            ],
            network_first: vec![
                UrlPattern::host("fonts.googleapis.com"),
                UrlPattern::host("fonts.gstatic.com"),
            ],
        }
    }
}

impl RoutingRules {
    /// Classify a request. Pure: depends only on method and URL.
    pub fn classify(&self, request: &Request) -> RoutingPolicy {
        if !request.is_get() || UrlPattern::any_matches(&self.bypass, &request.url) {
            RoutingPolicy::Bypass
        } else if UrlPattern::any_matches(&self.network_first, &request.url) {
            RoutingPolicy::NetworkFirst
        } else {
            RoutingPolicy::CacheFirstRefresh
        }
    }
}

/// Where a routed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// The synthesized offline document.
    Offline,
}

/// A resolved request.
#[derive(Debug, Clone)]
pub struct Routed {
    pub response: Response,
    pub source: ResponseSource,
    pub policy: RoutingPolicy,
}

/// Applies [`RoutingRules`] to requests against one generation at a time.
pub struct FetchRouter {
    rules: RoutingRules,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
}

impl FetchRouter {
    pub fn new(rules: RoutingRules, storage: Arc<dyn CacheStorage>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            rules,
            storage,
            fetcher,
        }
    }

    pub fn rules(&self) -> &RoutingRules {
        &self.rules
    }

    /// Resolve `request` against `generation`.
    ///
    /// With no generation nothing is intercepted and the request passes
    /// straight through. Cache failures never surface here; only network
    /// errors the policy cannot recover from do.
    pub async fn route(
        &self,
        generation: Option<&CacheHandle>,
        request: Request,
    ) -> Result<Routed, NetError> {
        let policy = self.rules.classify(&request);
        let key = RequestKey::from_request(&request);
        trace!(url = %request.url, ?policy, "Routing request");

        match (policy, generation, key) {
            (RoutingPolicy::NetworkFirst, Some(handle), Some(key)) => {
                self.network_first(handle, key, request).await
            }
            (RoutingPolicy::CacheFirstRefresh, Some(handle), Some(key)) => {
                self.cache_first_refresh(handle, key, request).await
            }
            _ => self.pass_through(request).await,
        }
    }

    async fn pass_through(&self, request: Request) -> Result<Routed, NetError> {
        let response = self.fetcher.fetch(request).await?;
        Ok(Routed {
            response,
            source: ResponseSource::Network,
            policy: RoutingPolicy::Bypass,
        })
    }

    async fn network_first(
        &self,
        handle: &CacheHandle,
        key: RequestKey,
        request: Request,
    ) -> Result<Routed, NetError> {
        let url = request.url.clone();
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                store(self.storage.as_ref(), handle, key, &response).await;
                Ok(Routed {
                    response,
                    source: ResponseSource::Network,
                    policy: RoutingPolicy::NetworkFirst,
                })
            }
            Err(err) => match self.lookup(handle, &key).await {
                Some(entry) => {
                    debug!(url = %url, error = %err, "Network failed, serving cached copy");
                    Ok(Routed {
                        response: entry.to_response(url),
                        source: ResponseSource::Cache,
                        policy: RoutingPolicy::NetworkFirst,
                    })
                }
                None => {
                    warn!(url = %url, error = %err, "Network failed with nothing cached");
                    Err(err)
                }
            },
        }
    }

    async fn cache_first_refresh(
        &self,
        handle: &CacheHandle,
        key: RequestKey,
        request: Request,
    ) -> Result<Routed, NetError> {
        let url = request.url.clone();

        if let Some(entry) = self.lookup(handle, &key).await {
            let response = entry.to_response(url);
            self.spawn_refresh(handle.clone(), key, request);
            return Ok(Routed {
                response,
                source: ResponseSource::Cache,
                policy: RoutingPolicy::CacheFirstRefresh,
            });
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                store(self.storage.as_ref(), handle, key, &response).await;
                Ok(Routed {
                    response,
                    source: ResponseSource::Network,
                    policy: RoutingPolicy::CacheFirstRefresh,
                })
            }
            Err(err) => {
                info!(url = %url, error = %err, "Offline and not cached, serving offline document");
                Ok(Routed {
                    response: offline_response(url),
                    source: ResponseSource::Offline,
                    policy: RoutingPolicy::CacheFirstRefresh,
                })
            }
        }
    }

    /// Detached refresh of one entry. Its only effect is a later cache write
    /// into `handle`'s generation; nobody awaits it and it cannot be
    /// cancelled. If the generation is reaped first, the write is dropped.
    fn spawn_refresh(&self, handle: CacheHandle, key: RequestKey, request: Request) {
        let storage = Arc::clone(&self.storage);
        let fetcher = Arc::clone(&self.fetcher);

        tokio::spawn(async move {
            let url = request.url.clone();
            match fetcher.fetch(request).await {
                Ok(response) => store(storage.as_ref(), &handle, key, &response).await,
                Err(err) => debug!(url = %url, error = %err, "Background refresh failed"),
            }
        });
    }

    async fn lookup(&self, handle: &CacheHandle, key: &RequestKey) -> Option<CacheEntry> {
        match self.storage.get(handle, key).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key = %key, error = %err, "Cache read failed, treating as miss");
                None
            }
        }
    }
}

/// Write a successful response into `handle`'s generation. Anything else is
/// left uncached; write failures are logged and swallowed.
async fn store(storage: &dyn CacheStorage, handle: &CacheHandle, key: RequestKey, response: &Response) {
    if !response.ok() {
        trace!(key = %key, status = %response.status, "Not caching unsuccessful response");
        return;
    }
    if let Err(err) = storage.put(handle, key, CacheEntry::capture(response)).await {
        warn!(generation = %handle.generation(), error = %err, "Cache write failed");
    }
}
