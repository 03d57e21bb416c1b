//! Latency-observing backend decorator.
//!
//! Wraps any [`Backend`] and records one histogram sample per call, labeled
//! by backend event type. The store always talks to its backend through this
//! wrapper.

use std::sync::Arc;
use std::time::Instant;

use topograph_backend::{
    Backend, BackendOp, BackendResult, ChildWatch, CreateMode, DataWatch, MultiError, NodeStat,
    OpOutcome,
};
use topograph_core::{BackendEvent, StoreMetrics};

pub struct MeteredBackend<B> {
    inner: B,
    metrics: Arc<StoreMetrics>,
}

impl<B: Backend> MeteredBackend<B> {
    pub fn new(inner: B, metrics: Arc<StoreMetrics>) -> Self {
        MeteredBackend { inner, metrics }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

impl<B: Backend> Backend for MeteredBackend<B> {
    async fn get(&self, path: &str) -> BackendResult<(Vec<u8>, NodeStat)> {
        let start = Instant::now();
        let result = self.inner.get(path).await;
        self.metrics.observe_backend(BackendEvent::Get, start.elapsed());
        result
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> BackendResult<(String, NodeStat)> {
        let start = Instant::now();
        let result = self.inner.create(path, data, mode).await;
        self.metrics
            .observe_backend(BackendEvent::Create, start.elapsed());
        result
    }

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: Option<u64>,
    ) -> BackendResult<NodeStat> {
        let start = Instant::now();
        let result = self.inner.set_data(path, data, expected).await;
        self.metrics
            .observe_backend(BackendEvent::SetData, start.elapsed());
        result
    }

    async fn delete(&self, path: &str, expected: Option<u64>) -> BackendResult<()> {
        let start = Instant::now();
        let result = self.inner.delete(path, expected).await;
        self.metrics
            .observe_backend(BackendEvent::Delete, start.elapsed());
        result
    }

    async fn children(&self, path: &str) -> BackendResult<Vec<String>> {
        let start = Instant::now();
        let result = self.inner.children(path).await;
        self.metrics
            .observe_backend(BackendEvent::Children, start.elapsed());
        result
    }

    async fn exists(&self, path: &str) -> BackendResult<Option<NodeStat>> {
        let start = Instant::now();
        let result = self.inner.exists(path).await;
        self.metrics
            .observe_backend(BackendEvent::Exists, start.elapsed());
        result
    }

    async fn multi(&self, ops: Vec<BackendOp>) -> Result<Vec<OpOutcome>, MultiError> {
        let start = Instant::now();
        let result = self.inner.multi(ops).await;
        self.metrics
            .observe_backend(BackendEvent::Multi, start.elapsed());
        result
    }

    async fn watch_data(&self, path: &str) -> BackendResult<DataWatch> {
        let start = Instant::now();
        let result = self.inner.watch_data(path).await;
        self.metrics
            .observe_backend(BackendEvent::Watch, start.elapsed());
        result
    }

    async fn watch_children(&self, path: &str) -> BackendResult<ChildWatch> {
        let start = Instant::now();
        let result = self.inner.watch_children(path).await;
        self.metrics
            .observe_backend(BackendEvent::Watch, start.elapsed());
        result
    }
}
