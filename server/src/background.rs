//! BackgroundExecutor (spec.md §4.I): the single per-adapter scheduling
//! loop that drives every transport's `background_execute`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::adapter::Adapter;
use crate::transport::Transport;

struct Scheduled {
    transport: Arc<dyn Transport>,
    min_period: Duration,
    last_run: Option<Instant>,
}

impl Scheduled {
    fn next_eligible(&self) -> Instant {
        match self.last_run {
            Some(last) => last + self.min_period,
            None => Instant::now(),
        }
    }
}

pub struct BackgroundExecutor {
    scheduled: Vec<Scheduled>,
    timeout: Duration,
}

impl BackgroundExecutor {
    pub fn new(adapter: &Adapter, timeout: Duration) -> Self {
        let mut scheduled = Vec::new();
        for endpoint in adapter.endpoints() {
            for (_, transport) in endpoint.router.transports() {
                scheduled.push(Scheduled {
                    transport: transport.clone(),
                    min_period: transport.min_period(),
                    last_run: None,
                });
            }
        }
        Self { scheduled, timeout }
    }

    /// Runs until `shutdown` fires, draining any in-flight `background_execute`
    /// call before returning (spec.md §4.I "Shutdown").
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if self.scheduled.is_empty() {
            let _ = shutdown.changed().await;
            return;
        }

        loop {
            if *shutdown.borrow() {
                return;
            }

            let next_index = self
                .scheduled
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.next_eligible())
                .map(|(i, _)| i)
                .expect("scheduled is non-empty");

            let wait = self.scheduled[next_index].next_eligible().saturating_duration_since(Instant::now());

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    self.scheduled[next_index].last_run = Some(Instant::now());
                    let transport = self.scheduled[next_index].transport.clone();
                    let timeout = self.timeout;
                    let name = transport.name().to_string();

                    match tokio::time::timeout(timeout, transport.background_execute()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            metrics::counter!("ea_background_execute_errors_total", 1, "transport" => name.clone());
                            tracing::warn!(transport = %name, error = %err, "background_execute failed");
                        }
                        Err(_) => {
                            metrics::counter!("ea_background_execute_errors_total", 1, "transport" => name.clone());
                            tracing::warn!(transport = %name, timeout_ms = timeout.as_millis() as u64, "background_execute timed out");
                        }
                    }
                }
            }
        }
    }
}

/// Convenience for tests: run every scheduled transport exactly once,
/// ignoring period gating, then return. Mirrors what advancing the
/// scheduler by `BACKGROUND_EXECUTE_MS_HTTP` does in the spec's test
/// scenarios (S1, S3, S6).
pub async fn tick_once(adapter: &Adapter) {
    let by_transport: HashMap<String, Arc<dyn Transport>> = adapter
        .endpoints()
        .flat_map(|e| e.router.transports().map(|(name, t)| (name.to_string(), t.clone())))
        .collect();
    for transport in by_transport.values() {
        if let Err(err) = transport.background_execute().await {
            tracing::warn!(error = %err, "background_execute failed during test tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTransport(Arc<AtomicUsize>);

    #[async_trait]
    impl Transport for CountingTransport {
        fn name(&self) -> &str {
            "default"
        }
        async fn background_execute(&self) -> Result<(), AdapterError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn min_period(&self) -> Duration {
            Duration::from_millis(10)
        }
    }

    #[tokio::test]
    async fn shuts_down_immediately_when_no_transports_are_scheduled() {
        let (tx, rx) = watch::channel(false);
        let executor = BackgroundExecutor { scheduled: vec![], timeout: Duration::from_secs(1) };
        let handle = tokio::spawn(executor.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn runs_scheduled_transport_at_least_once_before_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let transport: Arc<dyn Transport> = Arc::new(CountingTransport(counter.clone()));
        let scheduled = Scheduled { transport, min_period: Duration::from_millis(5), last_run: None };
        let (tx, rx) = watch::channel(false);
        let executor = BackgroundExecutor { scheduled: vec![scheduled], timeout: Duration::from_secs(1) };
        let handle = tokio::spawn(executor.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(counter.load(Ordering::SeqCst) >= 1);
    }
}
