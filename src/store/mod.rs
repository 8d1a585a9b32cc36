use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::models::{Book, BookGenres, Page, PageRequest, Rating, Recommendation, Sort};

pub mod memory;
pub mod postgres;

/// Durable store of (user, book, score) ratings. Read-only to the
/// recommender; written by the rating endpoints.
#[async_trait]
pub trait RatingStore: Send + Sync {
    /// Full scan of every rating in the system.
    async fn load_all(&self) -> AppResult<Vec<Rating>>;

    /// Batch load of all ratings belonging to the given users.
    async fn load_for_users(&self, user_ids: &HashSet<i64>) -> AppResult<Vec<Rating>>;

    async fn load_for_user(&self, user_id: i64) -> AppResult<Vec<Rating>>;

    async fn find_score(&self, user_id: i64, book_id: i64) -> AppResult<Option<i32>>;

    /// Creates or overwrites the rating, maintaining the book's
    /// aggregate columns in the same transaction.
    async fn upsert(&self, user_id: i64, book_id: i64, score: i32) -> AppResult<()>;

    /// Removes the rating if present; returns whether one existed.
    async fn delete(&self, user_id: i64, book_id: i64) -> AppResult<bool>;

    /// The distinct set of users with at least one rating.
    async fn distinct_rated_user_ids(&self) -> AppResult<HashSet<i64>>;
}

/// User-profile data the recommender reads: the favourite-genre set.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn favourite_genre_ids(&self, user_id: i64) -> AppResult<HashSet<i64>>;

    async fn set_favourite_genre_ids(
        &self,
        user_id: i64,
        genre_ids: &HashSet<i64>,
    ) -> AppResult<()>;
}

/// Catalog queries: genre associations and the fallback selections.
#[async_trait]
pub trait BookStore: Send + Sync {
    /// Batch load of books joined with their genre-id sets. Unknown
    /// ids are simply absent from the result.
    async fn books_with_genres(&self, book_ids: &HashSet<i64>) -> AppResult<Vec<BookGenres>>;

    /// Books carrying any of the given genres, excluding the given book
    /// ids, ordered by average rating descending then rating count
    /// descending.
    async fn by_genres_excluding(
        &self,
        genre_ids: &HashSet<i64>,
        exclude_book_ids: &HashSet<i64>,
        request: PageRequest,
    ) -> AppResult<Page<Book>>;

    /// Books whose average rating exceeds the threshold, ordered by
    /// rating count descending.
    async fn global_top(
        &self,
        min_average_rating: f64,
        request: PageRequest,
    ) -> AppResult<Page<Book>>;
}

/// Persisted per-user recommendation sets. Written only by the refresh
/// pipeline, read only by the serving path.
#[async_trait]
pub trait RecommendationStore: Send + Sync {
    async fn delete_for_user(&self, user_id: i64) -> AppResult<()>;

    /// Atomically replaces the user's stored set with the given rows.
    /// A failure must leave either the previous set or the new one,
    /// never a partially deleted state.
    async fn replace_for_user(
        &self,
        user_id: i64,
        recommendations: &[Recommendation],
    ) -> AppResult<()>;

    /// Stored recommendations joined to book rows, optionally filtered
    /// to a single genre and custom-sorted; default order is predicted
    /// score descending.
    async fn recommended_books(
        &self,
        user_id: i64,
        genre_id: Option<i64>,
        sort: Option<Sort>,
        request: PageRequest,
    ) -> AppResult<Page<Book>>;
}

/// Bundle of the four collaborator stores handed to services.
#[derive(Clone)]
pub struct Stores {
    pub ratings: Arc<dyn RatingStore>,
    pub users: Arc<dyn UserStore>,
    pub books: Arc<dyn BookStore>,
    pub recommendations: Arc<dyn RecommendationStore>,
}

impl Stores {
    /// All four contracts backed by the shared Postgres pool.
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        let store = Arc::new(postgres::PgStore::new(pool));
        Self {
            ratings: store.clone(),
            users: store.clone(),
            books: store.clone(),
            recommendations: store,
        }
    }

    /// All four contracts backed by one shared in-memory store.
    pub fn in_memory() -> (Self, Arc<memory::MemoryStore>) {
        let store = Arc::new(memory::MemoryStore::new());
        let stores = Self {
            ratings: store.clone(),
            users: store.clone(),
            books: store.clone(),
            recommendations: store.clone(),
        };
        (stores, store)
    }
}
