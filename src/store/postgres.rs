use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::AppResult;
use crate::models::{Book, BookGenres, Page, PageRequest, Rating, Recommendation, Sort, SortKey};

use super::{BookStore, RatingStore, RecommendationStore, UserStore};

/// Creates a PostgreSQL connection pool
///
/// Establishes a pool of database connections for efficient reuse.
/// The pool automatically manages connection lifecycle and limits.
pub async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Postgres-backed implementation of all four collaborator stores.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Recomputes a book's denormalized aggregates from its ratings.
    /// Runs inside the caller's transaction so the aggregates commit
    /// together with the rating change.
    async fn refresh_book_aggregates(
        tx: &mut Transaction<'_, Postgres>,
        book_id: i64,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE books b
               SET average_rating = agg.avg_score,
                   rating_count = agg.cnt
              FROM (SELECT AVG(score)::float8 AS avg_score, COUNT(*) AS cnt
                      FROM ratings
                     WHERE book_id = $1) agg
             WHERE b.id = $1
            "#,
        )
        .bind(book_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RatingStore for PgStore {
    async fn load_all(&self) -> AppResult<Vec<Rating>> {
        let ratings = sqlx::query_as::<_, Rating>(
            "SELECT user_id, book_id, score, added_at FROM ratings",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ratings)
    }

    async fn load_for_users(&self, user_ids: &HashSet<i64>) -> AppResult<Vec<Rating>> {
        let ids: Vec<i64> = user_ids.iter().copied().collect();
        let ratings = sqlx::query_as::<_, Rating>(
            "SELECT user_id, book_id, score, added_at FROM ratings WHERE user_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(ratings)
    }

    async fn load_for_user(&self, user_id: i64) -> AppResult<Vec<Rating>> {
        let ratings = sqlx::query_as::<_, Rating>(
            "SELECT user_id, book_id, score, added_at FROM ratings WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ratings)
    }

    async fn find_score(&self, user_id: i64, book_id: i64) -> AppResult<Option<i32>> {
        let score = sqlx::query_scalar::<_, i32>(
            "SELECT score FROM ratings WHERE user_id = $1 AND book_id = $2",
        )
        .bind(user_id)
        .bind(book_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(score)
    }

    async fn upsert(&self, user_id: i64, book_id: i64, score: i32) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO ratings (user_id, book_id, score, added_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (user_id, book_id)
            DO UPDATE SET score = EXCLUDED.score, added_at = EXCLUDED.added_at
            "#,
        )
        .bind(user_id)
        .bind(book_id)
        .bind(score)
        .execute(&mut *tx)
        .await?;
        Self::refresh_book_aggregates(&mut tx, book_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, user_id: i64, book_id: i64) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM ratings WHERE user_id = $1 AND book_id = $2")
            .bind(user_id)
            .bind(book_id)
            .execute(&mut *tx)
            .await?;
        let existed = result.rows_affected() > 0;
        if existed {
            Self::refresh_book_aggregates(&mut tx, book_id).await?;
        }
        tx.commit().await?;
        Ok(existed)
    }

    async fn distinct_rated_user_ids(&self) -> AppResult<HashSet<i64>> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT DISTINCT user_id FROM ratings")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn favourite_genre_ids(&self, user_id: i64) -> AppResult<HashSet<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT genre_id FROM user_favourite_genres WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    async fn set_favourite_genre_ids(
        &self,
        user_id: i64,
        genre_ids: &HashSet<i64>,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM user_favourite_genres WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        for genre_id in genre_ids {
            sqlx::query("INSERT INTO user_favourite_genres (user_id, genre_id) VALUES ($1, $2)")
                .bind(user_id)
                .bind(genre_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

const BOOK_COLUMNS: &str = "b.id, b.title, b.publication_year, b.average_rating, b.rating_count";

#[async_trait]
impl BookStore for PgStore {
    async fn books_with_genres(&self, book_ids: &HashSet<i64>) -> AppResult<Vec<BookGenres>> {
        let ids: Vec<i64> = book_ids.iter().copied().collect();
        let rows = sqlx::query_as::<_, (i64, Option<i64>)>(
            r#"
            SELECT b.id, bg.genre_id
              FROM books b
              LEFT JOIN book_genres bg ON bg.book_id = b.id
             WHERE b.id = ANY($1)
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_book: HashMap<i64, HashSet<i64>> = HashMap::new();
        for (book_id, genre_id) in rows {
            let genres = by_book.entry(book_id).or_default();
            if let Some(genre_id) = genre_id {
                genres.insert(genre_id);
            }
        }
        Ok(by_book
            .into_iter()
            .map(|(book_id, genre_ids)| BookGenres { book_id, genre_ids })
            .collect())
    }

    async fn by_genres_excluding(
        &self,
        genre_ids: &HashSet<i64>,
        exclude_book_ids: &HashSet<i64>,
        request: PageRequest,
    ) -> AppResult<Page<Book>> {
        let genres: Vec<i64> = genre_ids.iter().copied().collect();
        let excluded: Vec<i64> = exclude_book_ids.iter().copied().collect();

        let filter = r#"
             WHERE EXISTS (SELECT 1 FROM book_genres bg
                            WHERE bg.book_id = b.id AND bg.genre_id = ANY($1))
               AND NOT (b.id = ANY($2))
        "#;

        let books = sqlx::query_as::<_, Book>(&format!(
            r#"
            SELECT {BOOK_COLUMNS}
              FROM books b
            {filter}
             ORDER BY b.average_rating DESC NULLS LAST, b.rating_count DESC
             LIMIT $3 OFFSET $4
            "#,
        ))
        .bind(&genres)
        .bind(&excluded)
        .bind(request.limit())
        .bind(request.offset())
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM books b {filter}"
        ))
        .bind(&genres)
        .bind(&excluded)
        .fetch_one(&self.pool)
        .await?;

        Ok(Page::new(books, request, total as u64))
    }

    async fn global_top(
        &self,
        min_average_rating: f64,
        request: PageRequest,
    ) -> AppResult<Page<Book>> {
        let books = sqlx::query_as::<_, Book>(&format!(
            r#"
            SELECT {BOOK_COLUMNS}
              FROM books b
             WHERE b.average_rating > $1
             ORDER BY b.rating_count DESC
             LIMIT $2 OFFSET $3
            "#,
        ))
        .bind(min_average_rating)
        .bind(request.limit())
        .bind(request.offset())
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM books b WHERE b.average_rating > $1",
        )
        .bind(min_average_rating)
        .fetch_one(&self.pool)
        .await?;

        Ok(Page::new(books, request, total as u64))
    }
}

impl PgStore {
    fn order_clause(sort: Option<Sort>) -> String {
        match sort {
            // Column and direction come from closed enums, not caller text.
            Some(sort) => {
                let nulls = match sort.key {
                    SortKey::AverageRating => " NULLS LAST",
                    _ => "",
                };
                format!("b.{} {}{}", sort.key.column(), sort.dir.keyword(), nulls)
            }
            None => "r.predicted_score DESC".to_string(),
        }
    }
}

#[async_trait]
impl RecommendationStore for PgStore {
    async fn delete_for_user(&self, user_id: i64) -> AppResult<()> {
        sqlx::query("DELETE FROM recommendations WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn replace_for_user(
        &self,
        user_id: i64,
        recommendations: &[Recommendation],
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM recommendations WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        for rec in recommendations {
            sqlx::query(
                r#"
                INSERT INTO recommendations (user_id, book_id, predicted_score, created_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(rec.user_id)
            .bind(rec.book_id)
            .bind(rec.predicted_score)
            .bind(rec.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn recommended_books(
        &self,
        user_id: i64,
        genre_id: Option<i64>,
        sort: Option<Sort>,
        request: PageRequest,
    ) -> AppResult<Page<Book>> {
        let order = Self::order_clause(sort);

        let (books, total) = match genre_id {
            Some(genre_id) => {
                let genre_filter = r#"
                   AND EXISTS (SELECT 1 FROM book_genres bg
                                WHERE bg.book_id = b.id AND bg.genre_id = $2)
                "#;
                let books = sqlx::query_as::<_, Book>(&format!(
                    r#"
                    SELECT {BOOK_COLUMNS}
                      FROM books b
                      JOIN recommendations r ON r.book_id = b.id
                     WHERE r.user_id = $1
                    {genre_filter}
                     ORDER BY {order}
                     LIMIT $3 OFFSET $4
                    "#,
                ))
                .bind(user_id)
                .bind(genre_id)
                .bind(request.limit())
                .bind(request.offset())
                .fetch_all(&self.pool)
                .await?;

                let total = sqlx::query_scalar::<_, i64>(&format!(
                    r#"
                    SELECT COUNT(*)
                      FROM books b
                      JOIN recommendations r ON r.book_id = b.id
                     WHERE r.user_id = $1
                    {genre_filter}
                    "#,
                ))
                .bind(user_id)
                .bind(genre_id)
                .fetch_one(&self.pool)
                .await?;

                (books, total)
            }
            None => {
                let books = sqlx::query_as::<_, Book>(&format!(
                    r#"
                    SELECT {BOOK_COLUMNS}
                      FROM books b
                      JOIN recommendations r ON r.book_id = b.id
                     WHERE r.user_id = $1
                     ORDER BY {order}
                     LIMIT $2 OFFSET $3
                    "#,
                ))
                .bind(user_id)
                .bind(request.limit())
                .bind(request.offset())
                .fetch_all(&self.pool)
                .await?;

                let total = sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM recommendations r WHERE r.user_id = $1",
                )
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

                (books, total)
            }
        };

        Ok(Page::new(books, request, total as u64))
    }
}
