use std::sync::Arc;

use tokio::sync::mpsc;

use super::recommender::RecommendationEngine;

/// Which signal caused a refresh to be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshKind {
    RatingChanged,
    GenresChanged,
}

/// A unit of work for the refresh worker: one user, one cause.
/// Rapid repeated signals for the same user are not coalesced; each
/// re-runs the full pipeline.
#[derive(Debug, Clone, Copy)]
pub struct RefreshTask {
    pub user_id: i64,
    pub kind: RefreshKind,
}

/// Where write paths report that a user's recommendation inputs
/// changed. Implementations must only be invoked after the triggering
/// write has committed.
#[cfg_attr(test, mockall::automock)]
pub trait RefreshSink: Send + Sync {
    fn rating_changed(&self, user_id: i64);
    fn genres_changed(&self, user_id: i64);
}

/// Cloneable producer side of the refresh queue. Enqueueing is
/// fire-and-forget: a dead worker is logged, never surfaced to the
/// originating request.
#[derive(Clone)]
pub struct RefreshHandle {
    tx: mpsc::UnboundedSender<RefreshTask>,
}

impl RefreshHandle {
    fn enqueue(&self, task: RefreshTask) {
        if self.tx.send(task).is_err() {
            tracing::error!(
                user_id = task.user_id,
                kind = ?task.kind,
                "refresh worker is gone, dropping refresh task"
            );
        }
    }
}

impl RefreshSink for RefreshHandle {
    fn rating_changed(&self, user_id: i64) {
        self.enqueue(RefreshTask {
            user_id,
            kind: RefreshKind::RatingChanged,
        });
    }

    fn genres_changed(&self, user_id: i64) {
        self.enqueue(RefreshTask {
            user_id,
            kind: RefreshKind::GenresChanged,
        });
    }
}

/// Handle for gracefully shutting down the refresh worker
pub struct RefreshWorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl RefreshWorkerHandle {
    /// Signals the worker to drain queued tasks and stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        tracing::info!("refresh worker shutdown signal sent");
    }
}

/// Spawns the background task that consumes refresh signals and runs
/// the pipeline per user. A failed refresh is logged and the worker
/// keeps consuming; the user sees fallback results until the next
/// trigger or sweep repairs the set.
pub fn spawn_refresh_worker(
    engine: Arc<RecommendationEngine>,
) -> (RefreshHandle, RefreshWorkerHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

    tokio::spawn(worker_loop(engine, rx, shutdown_rx));

    (RefreshHandle { tx }, RefreshWorkerHandle { shutdown_tx })
}

async fn worker_loop(
    engine: Arc<RecommendationEngine>,
    mut rx: mpsc::UnboundedReceiver<RefreshTask>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    tracing::info!("refresh worker started");
    loop {
        tokio::select! {
            Some(task) = rx.recv() => {
                run_task(&engine, task).await;
            }
            _ = shutdown_rx.recv() => {
                // Drain whatever was enqueued before the signal.
                while let Ok(task) = rx.try_recv() {
                    run_task(&engine, task).await;
                }
                tracing::info!("refresh worker stopped");
                break;
            }
        }
    }
}

async fn run_task(engine: &RecommendationEngine, task: RefreshTask) {
    tracing::info!(user_id = task.user_id, kind = ?task.kind, "recalculating recommendations");
    match engine.refresh_recommendations_for_user(task.user_id).await {
        Ok(()) => {
            tracing::info!(user_id = task.user_id, "recommendations recalculated");
        }
        Err(e) => {
            tracing::error!(
                user_id = task.user_id,
                error = %e,
                "recommendation refresh failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecommenderParams;
    use crate::error::{AppError, AppResult};
    use crate::models::{Book, Page, PageRequest, Recommendation, Sort};
    use crate::store::memory::MemoryStore;
    use crate::store::{RatingStore, RecommendationStore, Stores};
    use std::time::Duration;

    /// Recommendation store that errors for one user and delegates for
    /// everyone else.
    struct FailingRecStore {
        inner: Arc<MemoryStore>,
        fail_user: i64,
    }

    impl FailingRecStore {
        fn check(&self, user_id: i64) -> AppResult<()> {
            if user_id == self.fail_user {
                return Err(AppError::Internal("injected storage failure".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl RecommendationStore for FailingRecStore {
        async fn delete_for_user(&self, user_id: i64) -> AppResult<()> {
            self.check(user_id)?;
            self.inner.delete_for_user(user_id).await
        }

        async fn replace_for_user(
            &self,
            user_id: i64,
            recommendations: &[Recommendation],
        ) -> AppResult<()> {
            self.check(user_id)?;
            self.inner.replace_for_user(user_id, recommendations).await
        }

        async fn recommended_books(
            &self,
            user_id: i64,
            genre_id: Option<i64>,
            sort: Option<Sort>,
            request: PageRequest,
        ) -> AppResult<Page<Book>> {
            self.inner
                .recommended_books(user_id, genre_id, sort, request)
                .await
        }
    }

    fn test_params() -> RecommenderParams {
        RecommenderParams {
            min_common: 1,
            ..RecommenderParams::default()
        }
    }

    async fn seeded_stores() -> (Stores, Arc<crate::store::memory::MemoryStore>) {
        let (stores, store) = Stores::in_memory();
        store.add_book(1, "A", None, [10]).await;
        store.add_book(2, "B", None, [10]).await;
        store.add_book(3, "C", None, [10]).await;
        stores.ratings.upsert(1, 1, 5).await.unwrap();
        stores.ratings.upsert(1, 2, 3).await.unwrap();
        stores.ratings.upsert(2, 1, 4).await.unwrap();
        stores.ratings.upsert(2, 2, 5).await.unwrap();
        stores.ratings.upsert(2, 3, 5).await.unwrap();
        stores.ratings.upsert(3, 2, 2).await.unwrap();
        stores.ratings.upsert(3, 3, 4).await.unwrap();
        (stores, store)
    }

    #[tokio::test]
    async fn test_worker_processes_enqueued_task() {
        let (stores, store) = seeded_stores().await;
        let engine = Arc::new(RecommendationEngine::new(stores, test_params()));
        let (handle, worker) = spawn_refresh_worker(engine);

        handle.rating_changed(1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!store.recommendations_for_user(1).await.is_empty());
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_survives_failed_refresh() {
        let (mut stores, store) = seeded_stores().await;
        stores.recommendations = Arc::new(FailingRecStore {
            inner: store.clone(),
            fail_user: 3,
        });
        let engine = Arc::new(RecommendationEngine::new(stores, test_params()));
        let (handle, worker) = spawn_refresh_worker(engine);

        // User 3's refresh hits the injected storage failure; the
        // worker logs it and must still process the next task.
        handle.rating_changed(3);
        handle.rating_changed(1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(store.recommendations_for_user(3).await.is_empty());
        assert!(!store.recommendations_for_user(1).await.is_empty());
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_tasks() {
        let (stores, store) = seeded_stores().await;
        let engine = Arc::new(RecommendationEngine::new(stores, test_params()));
        let (handle, worker) = spawn_refresh_worker(engine);

        handle.rating_changed(1);
        worker.shutdown().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!store.recommendations_for_user(1).await.is_empty());
    }
}
