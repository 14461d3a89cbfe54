//! Shared test fixtures: a scripted in-memory HTTP client and context
//! builders.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::ConnectorError;

use crate::config::Config;
use crate::context::ConnectorContext;
use crate::http::{HttpResponse, RestClient};

type ScriptResult = Result<HttpResponse, ConnectorError>;

#[derive(Default)]
struct UrlScript {
    queue: VecDeque<ScriptResult>,
    fallback: Option<ScriptResult>,
}

/// [`RestClient`] that replays scripted results per full request URL and
/// records every call it sees.
#[derive(Default)]
pub(crate) struct ScriptedClient {
    scripts: Mutex<HashMap<String, UrlScript>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enqueue one result for `url`; consumed in FIFO order.
    pub(crate) fn enqueue(&self, url: &str, result: ScriptResult) {
        let mut scripts = self.scripts.lock().unwrap();
        scripts.entry(url.to_owned()).or_default().queue.push_back(result);
    }

    /// Result returned for `url` whenever its queue is empty.
    pub(crate) fn set_fallback(&self, url: &str, result: ScriptResult) {
        let mut scripts = self.scripts.lock().unwrap();
        scripts.entry(url.to_owned()).or_default().fallback = Some(result);
    }

    /// URLs hit so far, in call order.
    pub(crate) fn hits(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(url, _)| url.clone()).collect()
    }

    /// Request bodies sent so far, in call order.
    pub(crate) fn bodies(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(_, body)| body.clone()).collect()
    }
}

#[async_trait]
impl RestClient for ScriptedClient {
    async fn post(
        &self,
        url: &str,
        body: &str,
        _headers: &[(String, String)],
    ) -> Result<HttpResponse, ConnectorError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_owned(), body.to_owned()));
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(url.to_owned()).or_default();
        if let Some(result) = script.queue.pop_front() {
            return result;
        }
        script
            .fallback
            .clone()
            .unwrap_or_else(|| Err(ConnectorError::ConnectionFailed(format!("no script for {url}"))))
    }
}

/// Shorthand for a 200 response with the given body.
pub(crate) fn ok_response(body: &str) -> ScriptResult {
    Ok(HttpResponse {
        status: 200,
        body: body.to_owned(),
    })
}

/// Shorthand for a non-200 response with an empty body.
pub(crate) fn status_response(status: u16) -> ScriptResult {
    Ok(HttpResponse {
        status,
        body: String::new(),
    })
}

/// A context wired to a fresh [`ScriptedClient`].
pub(crate) fn scripted_context(config: Config) -> ConnectorContext {
    ConnectorContext::new(config, Arc::new(ScriptedClient::new()))
}

/// A context plus a handle on its [`ScriptedClient`] for scripting and
/// inspection.
pub(crate) fn scripted_context_with_client(config: Config) -> (ConnectorContext, Arc<ScriptedClient>) {
    let client = Arc::new(ScriptedClient::new());
    let ctx = ConnectorContext::new(config, client.clone());
    (ctx, client)
}
