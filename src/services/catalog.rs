use std::collections::HashSet;
use std::sync::Arc;

use crate::error::AppResult;
use crate::models::{Book, Page, PageRequest, Sort};
use crate::store::{BookStore, RatingStore, RecommendationStore, UserStore};

/// Books qualify for the global fallback above this average rating.
const GLOBAL_TOP_MIN_AVERAGE: f64 = 4.4;

/// Serving path for recommendations: reads the stored set and, when it
/// comes back empty, substitutes genre-matched or globally top-rated
/// books. Always queries live; nothing on this path is cached.
pub struct CatalogService {
    ratings: Arc<dyn RatingStore>,
    users: Arc<dyn UserStore>,
    books: Arc<dyn BookStore>,
    recommendations: Arc<dyn RecommendationStore>,
}

impl CatalogService {
    pub fn new(
        ratings: Arc<dyn RatingStore>,
        users: Arc<dyn UserStore>,
        books: Arc<dyn BookStore>,
        recommendations: Arc<dyn RecommendationStore>,
    ) -> Self {
        Self {
            ratings,
            users,
            books,
            recommendations,
        }
    }

    /// Returns a page of recommended books for the user. Stored
    /// recommendations win outright when present; the fallback never
    /// blends with them.
    pub async fn recommended_books_for_user(
        &self,
        user_id: i64,
        genre_id: Option<i64>,
        sort: Option<Sort>,
        request: PageRequest,
    ) -> AppResult<Page<Book>> {
        let stored = self
            .recommendations
            .recommended_books(user_id, genre_id, sort, request)
            .await?;
        if !stored.is_empty() {
            return Ok(stored);
        }

        self.fallback_books(user_id, request).await
    }

    /// Favourite-genre fallback, then the global top shelf for users
    /// without favourites.
    async fn fallback_books(&self, user_id: i64, request: PageRequest) -> AppResult<Page<Book>> {
        let favourite_genre_ids = self.users.favourite_genre_ids(user_id).await?;
        if favourite_genre_ids.is_empty() {
            return self.books.global_top(GLOBAL_TOP_MIN_AVERAGE, request).await;
        }

        let rated_book_ids: HashSet<i64> = self
            .ratings
            .load_for_user(user_id)
            .await?
            .iter()
            .map(|r| r.book_id)
            .collect();

        self.books
            .by_genres_excluding(&favourite_genre_ids, &rated_book_ids, request)
            .await
    }
}
