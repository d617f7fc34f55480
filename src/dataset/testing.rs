//! In-memory transport used by the unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::dataset::fetcher::{FetchError, FetchResult, Transport};

type Handler = Box<dyn Fn(&str, &[(String, String)]) -> Option<FetchResult<Vec<u8>>> + Send + Sync>;

#[derive(Clone)]
enum Canned {
    Body(Vec<u8>),
    Status(u16),
}

/// Serves canned responses keyed by URL. Unknown URLs fail like an unresolvable host.
#[derive(Default)]
pub struct FakeTransport {
    responses: HashMap<String, Canned>,
    handler: Option<Handler>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, url: &str, body: &[u8]) -> Self {
        self.responses.insert(url.to_string(), Canned::Body(body.to_vec()));
        self
    }

    pub fn with_status(mut self, url: &str, status: u16) -> Self {
        self.responses.insert(url.to_string(), Canned::Status(status));
        self
    }

    /// Consulted before the canned map; `None` falls through to it
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &[(String, String)]) -> Option<FetchResult<Vec<u8>>> + Send + Sync + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Look up a query parameter by name
pub fn query_param<'a>(query: &'a [(String, String)], name: &str) -> Option<&'a str> {
    query.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get(&self, url: &str, query: &[(String, String)]) -> FetchResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(handler) = &self.handler {
            if let Some(result) = handler(url, query) {
                return result;
            }
        }

        match self.responses.get(url) {
            Some(Canned::Body(body)) => Ok(body.clone()),
            Some(Canned::Status(status)) => Err(FetchError::Status {
                status: *status,
                url: url.to_string(),
            }),
            None => Err(FetchError::Transport(format!("could not resolve {url}"))),
        }
    }
}
