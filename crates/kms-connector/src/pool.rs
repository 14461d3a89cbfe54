//! Ranked pool of KMS endpoints.
//!
//! The pool is a min-heap keyed on failure history, so the healthiest
//! endpoint is always examined first. Counters only ever grow; a repeatedly
//! failing endpoint sinks toward the back of the pool but is never evicted.
//!
//! Endpoints are never mutated while inside the heap: callers `pop`, update
//! counters, and `restore`. The request engine's staging buffer formalises
//! this discipline.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// One KMS endpoint with its lifetime request accounting.
#[derive(Debug, Clone)]
pub struct KmsEndpoint {
    /// Canonical URL, no trailing `/`.
    pub url: String,
    /// Requests that reached the transport successfully.
    pub requests: u64,
    /// Transport failures and non-200 statuses.
    pub failed_responses: u64,
    /// Responses that arrived but failed validation.
    pub parse_failures: u64,
}

impl KmsEndpoint {
    /// Create an endpoint with zeroed counters.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            requests: 0,
            failed_responses: 0,
            parse_failures: 0,
        }
    }
}

/// Endpoint order: fewer failed responses first, parse failures as the
/// tie-break. URLs and request counts do not participate, so two endpoints
/// with identical failure history compare equal.
impl Ord for KmsEndpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.failed_responses
            .cmp(&other.failed_responses)
            .then(self.parse_failures.cmp(&other.parse_failures))
    }
}

impl PartialOrd for KmsEndpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for KmsEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KmsEndpoint {}

/// Min-heap of endpoints under the [`KmsEndpoint`] order.
///
/// The generation counter advances on every wholesale replacement
/// ([`UrlPool::drain`]); holders of popped endpoints compare generations to
/// detect that their entries went stale while out of the pool.
#[derive(Debug, Default)]
pub struct UrlPool {
    heap: BinaryHeap<Reverse<KmsEndpoint>>,
    generation: u64,
}

impl UrlPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one endpoint.
    pub fn push(&mut self, endpoint: KmsEndpoint) {
        self.heap.push(Reverse(endpoint));
    }

    /// Remove and return the healthiest endpoint.
    pub fn pop(&mut self) -> Option<KmsEndpoint> {
        self.heap.pop().map(|Reverse(ep)| ep)
    }

    /// Bulk re-insert endpoints previously taken out with [`UrlPool::pop`].
    pub fn restore(&mut self, endpoints: Vec<KmsEndpoint>) {
        for ep in endpoints {
            self.push(ep);
        }
    }

    /// Number of endpoints currently in the pool.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the pool holds no endpoints.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove every endpoint, returning them, and advance the generation.
    ///
    /// Callers replacing the pool wholesale (discovery refresh, side-band URL
    /// refresh) drain first so stale entries held elsewhere can be detected.
    pub fn drain(&mut self) -> Vec<KmsEndpoint> {
        self.generation += 1;
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(Reverse(ep)) = self.heap.pop() {
            out.push(ep);
        }
        out
    }

    /// Current replacement generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Snapshot of the URLs currently pooled, in no particular order.
    pub fn urls(&self) -> Vec<String> {
        self.heap.iter().map(|Reverse(ep)| ep.url.clone()).collect()
    }
}
