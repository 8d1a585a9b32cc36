use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::store::RatingStore;

use super::refresh::RefreshSink;

const MIN_SCORE: i32 = 1;
const MAX_SCORE: i32 = 5;

/// Write path for explicit book ratings. Emits a refresh signal only
/// when the stored state actually changed, and only after the write
/// committed.
pub struct RatingService {
    ratings: Arc<dyn RatingStore>,
    sink: Arc<dyn RefreshSink>,
}

impl RatingService {
    pub fn new(ratings: Arc<dyn RatingStore>, sink: Arc<dyn RefreshSink>) -> Self {
        Self { ratings, sink }
    }

    pub async fn my_rating(&self, user_id: i64, book_id: i64) -> AppResult<Option<i32>> {
        self.ratings.find_score(user_id, book_id).await
    }

    /// Creates or overwrites the user's rating for a book. Setting the
    /// same score again is a no-op and emits no signal.
    pub async fn set_rating(&self, user_id: i64, book_id: i64, score: i32) -> AppResult<()> {
        if !(MIN_SCORE..=MAX_SCORE).contains(&score) {
            return Err(AppError::InvalidInput(format!(
                "Rating score must be between {} and {}, got {}",
                MIN_SCORE, MAX_SCORE, score
            )));
        }

        let current = self.ratings.find_score(user_id, book_id).await?;
        if current == Some(score) {
            tracing::debug!(user_id, book_id, score, "rating unchanged, no refresh");
            return Ok(());
        }

        self.ratings.upsert(user_id, book_id, score).await?;
        self.sink.rating_changed(user_id);
        Ok(())
    }

    /// Removes the user's rating if present. Deleting a nonexistent
    /// rating is a quiet no-op.
    pub async fn delete_rating(&self, user_id: i64, book_id: i64) -> AppResult<()> {
        if self.ratings.delete(user_id, book_id).await? {
            self.sink.rating_changed(user_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::refresh::MockRefreshSink;
    use crate::store::Stores;
    use mockall::predicate::eq;

    fn service_with_sink(sink: MockRefreshSink) -> RatingService {
        let (stores, _) = Stores::in_memory();
        RatingService::new(stores.ratings, Arc::new(sink))
    }

    #[tokio::test]
    async fn test_new_rating_emits_signal() {
        let mut sink = MockRefreshSink::new();
        sink.expect_rating_changed()
            .with(eq(7))
            .times(1)
            .return_const(());

        let service = service_with_sink(sink);
        service.set_rating(7, 1, 4).await.unwrap();
    }

    #[tokio::test]
    async fn test_same_score_again_emits_nothing() {
        let mut sink = MockRefreshSink::new();
        sink.expect_rating_changed().times(1).return_const(());

        let service = service_with_sink(sink);
        service.set_rating(7, 1, 4).await.unwrap();
        // Second write with the identical score must not signal.
        service.set_rating(7, 1, 4).await.unwrap();
    }

    #[tokio::test]
    async fn test_changed_score_emits_again() {
        let mut sink = MockRefreshSink::new();
        sink.expect_rating_changed().times(2).return_const(());

        let service = service_with_sink(sink);
        service.set_rating(7, 1, 4).await.unwrap();
        service.set_rating(7, 1, 5).await.unwrap();

        assert_eq!(service.my_rating(7, 1).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_out_of_range_score_rejected_without_signal() {
        let mut sink = MockRefreshSink::new();
        sink.expect_rating_changed().times(0);

        let service = service_with_sink(sink);
        let result = service.set_rating(7, 1, 6).await;
        assert!(matches!(result, Err(AppError::InvalidInput(_))));
        let result = service.set_rating(7, 1, 0).await;
        assert!(matches!(result, Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_delete_existing_emits_signal() {
        let mut sink = MockRefreshSink::new();
        sink.expect_rating_changed().times(2).return_const(());

        let service = service_with_sink(sink);
        service.set_rating(7, 1, 4).await.unwrap();
        service.delete_rating(7, 1).await.unwrap();

        assert_eq!(service.my_rating(7, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_missing_is_silent() {
        let mut sink = MockRefreshSink::new();
        sink.expect_rating_changed().times(0);

        let service = service_with_sink(sink);
        service.delete_rating(7, 1).await.unwrap();
    }
}
