//! Shared doubles for integration tests: a scripted transport, a recording
//! listener and queue wiring helpers.

#![allow(dead_code)]

pub mod socket_guard;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fetchq_core::cache::CacheChain;
use fetchq_core::network::{HttpRequest, Network, RawResponse};
use fetchq_core::{Delivery, Listener, QueueOptions, RequestError, RequestQueue};
use futures_util::StreamExt;
use futures_util::stream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::{Notify, Semaphore};

/// One scripted transport outcome.
#[derive(Clone)]
pub enum Reply {
    /// Answers with `status`, `headers` and the body split into `chunks`.
    Ok {
        status: u16,
        headers: Vec<(&'static str, String)>,
        chunks: Vec<Vec<u8>>,
    },
    /// Sends `first`, then waits for `gate` before sending `rest`.
    Gated {
        headers: Vec<(&'static str, String)>,
        first: Vec<u8>,
        rest: Vec<u8>,
        gate: Arc<Notify>,
    },
    /// Answers 200, sends `chunk`, then times out mid-body.
    Broken {
        headers: Vec<(&'static str, String)>,
        chunk: Vec<u8>,
    },
    /// Waits for a permit, then answers 200 with `body`. A closed semaphore fails.
    Hold { permits: Arc<Semaphore>, body: Vec<u8> },
    /// The attempt timed out.
    Timeout,
    /// The connection failed.
    Fail,
    /// The transport panics.
    Panic,
}

impl Reply {
    pub fn text(body: &str) -> Self {
        Self::Ok {
            status: 200,
            headers: vec![("content-type", "text/plain; charset=utf-8".to_string())],
            chunks: vec![body.as_bytes().to_vec()],
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self::Ok {
            status,
            headers: Vec::new(),
            chunks: vec![body.as_bytes().to_vec()],
        }
    }
}

/// In-process [`Network`] answering from per-URL scripts.
///
/// Each URL has a queue of replies consumed in order; once it is empty the
/// URL's standing reply (if any) answers every further attempt.
#[derive(Default)]
pub struct ScriptedNetwork {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    standing: Mutex<HashMap<String, Reply>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a one-shot reply for `url`.
    pub fn script(&self, url: &str, reply: Reply) {
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Answers every unscripted attempt on `url` with `reply`.
    pub fn always(&self, url: &str, reply: Reply) {
        self.standing
            .lock()
            .unwrap()
            .insert(url.to_string(), reply);
    }

    /// Every request performed so far, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// URLs requested so far, in order.
    pub fn urls(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.url).collect()
    }

    pub fn calls(&self, url: &str) -> usize {
        self.requests().iter().filter(|r| r.url == url).count()
    }

    fn next_reply(&self, url: &str) -> Option<Reply> {
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front);
        scripted.or_else(|| self.standing.lock().unwrap().get(url).cloned())
    }
}

fn header_map(headers: &[(&'static str, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(
            HeaderName::from_static(*name),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    map
}

#[async_trait]
impl Network for ScriptedNetwork {
    async fn perform(&self, request: &HttpRequest) -> Result<RawResponse, RequestError> {
        self.requests.lock().unwrap().push(request.clone());
        let url = request.url.clone();
        match self.next_reply(&url) {
            Some(Reply::Ok {
                status,
                headers,
                chunks,
            }) => {
                let body = stream::iter(
                    chunks
                        .into_iter()
                        .map(|c| Ok::<_, RequestError>(Bytes::from(c))),
                );
                Ok(RawResponse::new(status, header_map(&headers), body.boxed()))
            }
            Some(Reply::Gated {
                headers,
                first,
                rest,
                gate,
            }) => {
                let tail = async move {
                    gate.notified().await;
                    Ok::<_, RequestError>(Bytes::from(rest))
                };
                let body = stream::once(async move { Ok::<_, RequestError>(Bytes::from(first)) })
                    .chain(stream::once(tail));
                Ok(RawResponse::new(200, header_map(&headers), body.boxed()))
            }
            Some(Reply::Broken { headers, chunk }) => {
                let timeout = RequestError::timeout(url);
                let body = stream::iter(vec![Ok(Bytes::from(chunk)), Err(timeout)]);
                Ok(RawResponse::new(200, header_map(&headers), body.boxed()))
            }
            Some(Reply::Hold { permits, body }) => match permits.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    Ok(RawResponse::from_bytes(200, HeaderMap::new(), body))
                }
                Err(_) => Err(RequestError::network(url, "transport closed")),
            },
            Some(Reply::Timeout) => Err(RequestError::timeout(url)),
            Some(Reply::Fail) => Err(RequestError::network(url, "connection refused")),
            Some(Reply::Panic) => panic!("transport exploded"),
            None => Err(RequestError::network(url, "no scripted reply")),
        }
    }
}

/// A recorded listener callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<T> {
    PreExecute,
    Networking,
    UsedCache,
    Retry,
    Success(T),
    Error(String),
    Cancel,
    Finish,
    Progress(u64, u64),
}

/// Listener that records every callback in order.
pub struct Recorder<T> {
    events: Mutex<Vec<Event<T>>>,
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<Event<T>> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Event<T>) -> bool) -> usize {
        self.events().iter().filter(|e| matches(e)).count()
    }

    pub fn finished(&self) -> bool {
        self.count(|e| matches!(e, Event::Finish)) > 0
    }

    pub fn successes(&self) -> Vec<T> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Success(value) => Some(value),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Error(kind) => Some(kind),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event<T>) {
        self.events.lock().unwrap().push(event);
    }
}

impl<T: Clone + Send + Sync + 'static> Listener<T> for Recorder<T> {
    fn on_pre_execute(&self) {
        self.push(Event::PreExecute);
    }
    fn on_networking(&self) {
        self.push(Event::Networking);
    }
    fn on_used_cache(&self) {
        self.push(Event::UsedCache);
    }
    fn on_retry(&self) {
        self.push(Event::Retry);
    }
    fn on_success(&self, response: T) {
        self.push(Event::Success(response));
    }
    fn on_error(&self, error: RequestError) {
        self.push(Event::Error(error.kind().to_string()));
    }
    fn on_cancel(&self) {
        self.push(Event::Cancel);
    }
    fn on_finish(&self) {
        self.push(Event::Finish);
    }
    fn on_progress_change(&self, file_size: u64, downloaded: u64) {
        self.push(Event::Progress(file_size, downloaded));
    }
}

/// Builds a queue over `network` with a channel delivery context, not yet started.
pub fn queue(
    network: Arc<ScriptedNetwork>,
    cache: Option<CacheChain>,
    pool_size: usize,
) -> RequestQueue {
    let (delivery, delivery_loop) = Delivery::channel();
    let queue = RequestQueue::new(
        network,
        cache,
        delivery,
        QueueOptions {
            pool_size,
            ..QueueOptions::default()
        },
    );
    tokio::spawn(delivery_loop.run_until(queue.shutdown_token()));
    queue
}

/// Polls `condition` every 10ms for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}
