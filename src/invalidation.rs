//! Server-push cache invalidation.
//!
//! [`InvalidationReceiver`] keeps one connection to the backend's updates
//! channel and marks the `news` namespace stale whenever the backend reports
//! that its article cache changed. The connection is re-established after a
//! fixed delay whenever it fails or ends.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{NewsBackend, UpdateMessage};
use crate::query::{QueryEngine, NEWS_NAMESPACE};

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Something holding cached data that can be marked stale by namespace.
pub trait InvalidationTarget: Send + Sync + 'static {
    fn invalidate(&self, namespace: &str);
}

impl InvalidationTarget for QueryEngine {
    fn invalidate(&self, namespace: &str) {
        let refetches = QueryEngine::invalidate(self, namespace);
        tracing::debug!(
            namespace,
            refetches = refetches.len(),
            "Invalidated cached queries"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverConfig {
    pub reconnect_delay: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Handle to the background connection task. Dropping it stops the task.
pub struct InvalidationReceiver {
    enabled: watch::Sender<bool>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl InvalidationReceiver {
    /// Spawn the connection task, enabled. Must be called within a Tokio runtime.
    pub fn spawn(
        backend: Arc<dyn NewsBackend>,
        target: Arc<dyn InvalidationTarget>,
        config: ReceiverConfig,
    ) -> Self {
        let (enabled, enabled_rx) = watch::channel(true);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(
            backend,
            target,
            config,
            enabled_rx,
            shutdown.clone(),
        ));
        Self {
            enabled,
            shutdown,
            task: Some(task),
        }
    }

    /// Disabling closes the live connection at once; enabling reconnects.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.send_replace(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Invalidation task ended abnormally");
            }
        }
    }
}

impl Drop for InvalidationReceiver {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Resolve once the flag equals `wanted`. Pends forever if the sender is gone.
async fn wait_until(rx: &mut watch::Receiver<bool>, wanted: bool) {
    loop {
        if *rx.borrow_and_update() == wanted {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

async fn run(
    backend: Arc<dyn NewsBackend>,
    target: Arc<dyn InvalidationTarget>,
    config: ReceiverConfig,
    mut enabled: watch::Receiver<bool>,
    shutdown: CancellationToken,
) {
    'connect: loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = wait_until(&mut enabled, true) => {}
        }

        let opened = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = wait_until(&mut enabled, false) => continue,
            opened = backend.open_updates() => opened,
        };

        match opened {
            Ok(mut events) => {
                tracing::info!("Connected to updates channel");
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break 'connect,
                        _ = wait_until(&mut enabled, false) => {
                            tracing::info!("Updates channel disabled, closing connection");
                            continue 'connect;
                        }
                        next = events.next() => next,
                    };
                    match next {
                        Some(Ok(payload)) => handle_message(&payload, target.as_ref()),
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Updates channel failed");
                            break;
                        }
                        None => {
                            tracing::info!("Updates channel closed by server");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to connect to updates channel");
            }
        }

        tracing::debug!(
            delay_secs = config.reconnect_delay.as_secs(),
            "Reconnecting to updates channel after delay"
        );
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = wait_until(&mut enabled, false) => {}
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }
    tracing::debug!("Invalidation receiver stopped");
}

fn handle_message(payload: &str, target: &dyn InvalidationTarget) {
    let message: UpdateMessage = match serde_json::from_str(payload) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed update message");
            return;
        }
    };

    match message.kind.as_str() {
        "invalidate" => match (message.id, message.timestamp.as_deref()) {
            (Some(id), Some(timestamp)) => {
                tracing::info!(
                    id,
                    timestamp,
                    reason = message.reason.as_deref().unwrap_or("unspecified"),
                    "Backend cache updated, invalidating news queries"
                );
                target.invalidate(NEWS_NAMESPACE);
            }
            _ => tracing::warn!("Ignoring invalidate message without id or timestamp"),
        },
        other => tracing::debug!(kind = other, "Update message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::testing::{FakeBackend, Script};
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    struct ChannelTarget(mpsc::UnboundedSender<String>);

    impl InvalidationTarget for ChannelTarget {
        fn invalidate(&self, namespace: &str) {
            let _ = self.0.send(namespace.to_string());
        }
    }

    fn invalidate(id: u64) -> Result<String, ApiError> {
        Ok(format!(
            r#"{{"type":"invalidate","id":{id},"timestamp":"2024-05-01T10:00:00Z","reason":"refresh_complete"}}"#
        ))
    }

    fn spawn(backend: &Arc<FakeBackend>) -> (InvalidationReceiver, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend: Arc<dyn NewsBackend> = backend.clone();
        let receiver = InvalidationReceiver::spawn(
            backend,
            Arc::new(ChannelTarget(tx)),
            ReceiverConfig::default(),
        );
        (receiver, rx)
    }

    async fn wait_for_opens(backend: &FakeBackend, n: usize) {
        while backend.update_opens() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_message_marks_news_stale() {
        let backend = FakeBackend::new();
        backend.push_updates(Script::ItemsThenHang(vec![invalidate(1)]));
        let (_receiver, mut rx) = spawn(&backend);

        assert_eq!(rx.recv().await.as_deref(), Some("news"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_and_malformed_messages_ignored() {
        let backend = FakeBackend::new();
        backend.push_updates(Script::ItemsThenHang(vec![
            Ok("not json".to_string()),
            Ok(r#"{"type":"connected"}"#.to_string()),
            Ok(r#"{"type":"refresh_started","id":3}"#.to_string()),
            Ok(r#"{"type":"invalidate","id":4}"#.to_string()),
            invalidate(5),
        ]));
        let (_receiver, mut rx) = spawn(&backend);

        assert_eq!(rx.recv().await.as_deref(), Some("news"));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(backend.update_opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_delay() {
        let backend = FakeBackend::new();
        backend.push_updates(Script::Items(vec![]));
        backend.push_updates(Script::Refuse(ApiError::HttpStatus(502)));
        backend.push_updates(Script::ItemsThenHang(vec![invalidate(2)]));

        let started = tokio::time::Instant::now();
        let (_receiver, mut rx) = spawn(&backend);

        assert_eq!(rx.recv().await.as_deref(), Some("news"));
        assert_eq!(backend.update_opens(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_and_reenable() {
        let backend = FakeBackend::new();
        let (receiver, _rx) = spawn(&backend);
        wait_for_opens(&backend, 1).await;

        receiver.set_enabled(false);
        assert!(!receiver.is_enabled());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.update_opens(), 1);

        receiver.set_enabled(true);
        wait_for_opens(&backend, 2).await;
        assert_eq!(backend.update_opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_reconnecting() {
        let backend = FakeBackend::new();
        backend.push_updates(Script::Items(vec![]));
        let (receiver, _rx) = spawn(&backend);
        wait_for_opens(&backend, 1).await;

        receiver.shutdown().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.update_opens(), 1);
    }

    #[tokio::test]
    async fn test_query_engine_is_a_target() {
        use crate::api::PageFilter;
        use crate::query::{PageMode, QueryConfig, QueryKey};
        use crate::testing::page;

        let backend = FakeBackend::new();
        backend.on_page(|_| Ok(page(0..1, 1, None)));
        let dyn_backend: Arc<dyn NewsBackend> = backend.clone();
        let engine = QueryEngine::new(dyn_backend, QueryConfig::default());
        let key = QueryKey::news(PageMode::Offset, &PageFilter::default(), 50);
        {
            let query = engine.query(key.clone());
            query.fetch().await;
        }

        let target: &dyn InvalidationTarget = &engine;
        target.invalidate(NEWS_NAMESPACE);

        let query = engine.query(key);
        assert!(query.state().is_stale);
    }
}
