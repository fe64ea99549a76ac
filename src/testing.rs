//! Deterministic fakes for the capability traits
use crate::error::{AuthError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::pkce::RandomSource;
use crate::session::Navigator;
use crate::token_store::Clock;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
enum Scripted {
    Respond(HttpResponse),
    Timeout,
}

#[derive(Debug, Default)]
struct Route {
    queue: VecDeque<Scripted>,
    last: Option<Scripted>,
}

/// Scripted HTTP transport keyed by exact URL
///
/// Each scripted outcome is used once in order; the final one keeps
/// answering. Unscripted URLs answer 404. Every request is recorded.
#[derive(Debug, Default)]
pub struct FakeHttp {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl FakeHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, status: u16, body: &str) {
        self.script(url, Scripted::Respond(HttpResponse::new(status, body)));
    }

    pub fn time_out(&self, url: &str) {
        self.script(url, Scripted::Timeout);
    }

    fn script(&self, url: &str, outcome: Scripted) {
        self.routes
            .lock()
            .entry(url.to_string())
            .or_default()
            .queue
            .push_back(outcome);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests_to(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.url == url).count()
    }

    pub fn last_request(&self) -> Option<HttpRequest> {
        self.requests.lock().last().cloned()
    }
}

impl HttpClient for FakeHttp {
    fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = request.url.clone();
        self.requests.lock().push(request);

        let outcome = {
            let mut routes = self.routes.lock();
            match routes.get_mut(&url) {
                Some(route) => {
                    if let Some(next) = route.queue.pop_front() {
                        route.last = Some(next);
                    }
                    route.last.clone()
                }
                None => None,
            }
        };

        match outcome {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Timeout) => Err(AuthError::NetworkTimeout { url }),
            None => Ok(HttpResponse::new(404, "no route")),
        }
    }
}

/// Random source cycling over fixed bytes
#[derive(Debug, Clone)]
pub struct FixedRandom {
    bytes: Vec<u8>,
}

impl FixedRandom {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl RandomSource for FixedRandom {
    fn fill_bytes(&self, dest: &mut [u8]) -> Result<()> {
        for (slot, byte) in dest.iter_mut().zip(self.bytes.iter().cycle()) {
            *slot = *byte;
        }
        Ok(())
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(now_millis),
        }
    }

    pub fn advance_millis(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Navigator remembering where it was sent
#[derive(Debug, Default)]
pub struct RecordingNavigator {
    visited: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visited(&self) -> Vec<String> {
        self.visited.lock().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, url: &str) -> Result<()> {
        self.visited.lock().push(url.to_string());
        Ok(())
    }
}
