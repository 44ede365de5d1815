//! Latency logging around directory calls.
//!
//! Selected at construction when `latencyLogging` is on. Every session
//! operation is timed and reported on the `latency` target.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::directory::{
    AttributeChange, DirectoryConnector, DirectorySession, SearchPage, SearchRequest,
    TransportOptions,
};
use crate::errors::Result;
use crate::secure_types::SecureString;

/// Wraps a connector so each session it opens is timed.
pub struct LatencyLoggingConnector {
    inner: Arc<dyn DirectoryConnector>,
}

impl LatencyLoggingConnector {
    pub fn new(inner: Arc<dyn DirectoryConnector>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl DirectoryConnector for LatencyLoggingConnector {
    async fn connect(
        &self,
        url: &str,
        options: &TransportOptions,
    ) -> Result<Box<dyn DirectorySession>> {
        let started = Instant::now();
        let result = self.inner.connect(url, options).await;
        log_latency("connect", url, started, result.is_ok());
        let session = result?;
        Ok(Box::new(LatencyLoggingSession { inner: session }))
    }
}

pub struct LatencyLoggingSession {
    inner: Box<dyn DirectorySession>,
}

fn log_latency(operation: &str, target: &str, started: Instant, ok: bool) {
    info!(
        target: "latency",
        operation,
        target_name = target,
        elapsed_ms = started.elapsed().as_millis() as u64,
        ok,
        "directory call completed"
    );
}

#[async_trait]
impl DirectorySession for LatencyLoggingSession {
    async fn bind(&mut self, dn: &str, secret: &SecureString) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.bind(dn, secret).await;
        log_latency("bind", dn, started, result.is_ok());
        result
    }

    async fn search(&mut self, request: &SearchRequest) -> Result<SearchPage> {
        let started = Instant::now();
        let result = self.inner.search(request).await;
        log_latency("search", &request.base, started, result.is_ok());
        result
    }

    async fn add(&mut self, dn: &str, attributes: Vec<(String, Vec<Vec<u8>>)>) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.add(dn, attributes).await;
        log_latency("add", dn, started, result.is_ok());
        result
    }

    async fn modify(&mut self, dn: &str, changes: Vec<AttributeChange>) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.modify(dn, changes).await;
        log_latency("modify", dn, started, result.is_ok());
        result
    }

    async fn rename(&mut self, dn: &str, new_rdn: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.rename(dn, new_rdn).await;
        log_latency("rename", dn, started, result.is_ok());
        result
    }

    async fn delete(&mut self, dn: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.delete(dn).await;
        log_latency("delete", dn, started, result.is_ok());
        result
    }

    async fn unbind(&mut self) -> Result<()> {
        self.inner.unbind().await
    }
}
