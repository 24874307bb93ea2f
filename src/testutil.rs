//! In-memory doubles for fetch and compile, shared by the unit tests.

use crate::compile::{CompileError, CompileGateway};
use crate::fetch::{FetchError, SourceFetcher};
use async_trait::async_trait;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use url::Url;

/// Serves sources by URL path and counts every request.
#[derive(Default)]
pub struct MemoryFetcher {
    sources: RefCell<HashMap<String, String>>,
    hits: RefCell<HashMap<String, usize>>,
    last_headers: RefCell<BTreeMap<String, String>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, path: &str, source: &str) -> Self {
        self.insert(path, source);
        self
    }

    pub fn insert(&self, path: &str, source: &str) {
        self.sources
            .borrow_mut()
            .insert(path.to_string(), source.to_string());
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.borrow().get(path).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits.borrow().values().sum()
    }

    pub fn last_headers(&self) -> BTreeMap<String, String> {
        self.last_headers.borrow().clone()
    }
}

#[async_trait(?Send)]
impl SourceFetcher for MemoryFetcher {
    async fn fetch_text(
        &self,
        url: &Url,
        headers: &BTreeMap<String, String>,
    ) -> Result<String, FetchError> {
        *self.hits.borrow_mut().entry(url.path().to_string()).or_default() += 1;
        *self.last_headers.borrow_mut() = headers.clone();
        // Behave like the network: always suspend once.
        tokio::task::yield_now().await;
        self.sources
            .borrow()
            .get(url.path())
            .cloned()
            .ok_or_else(|| FetchError::Status {
                status: 404,
                reason: "Not Found".into(),
            })
    }
}

/// Rejects everything with a fixed diagnostic.
pub struct FailingCompiler(pub String);

#[async_trait(?Send)]
impl CompileGateway for FailingCompiler {
    async fn compile(&self, _source: &str, _filename: &str) -> Result<String, CompileError> {
        Err(CompileError::Diagnostic(self.0.clone()))
    }
}
