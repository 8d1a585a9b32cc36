use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::AppResult;
use crate::models::{
    Book, BookGenres, Page, PageRequest, Rating, Recommendation, Sort, SortDir, SortKey,
};

use super::{BookStore, RatingStore, RecommendationStore, UserStore};

#[derive(Default)]
struct Inner {
    books: HashMap<i64, Book>,
    book_genres: HashMap<i64, HashSet<i64>>,
    ratings: HashMap<(i64, i64), Rating>,
    favourite_genres: HashMap<i64, HashSet<i64>>,
    recommendations: HashMap<i64, Vec<Recommendation>>,
}

/// In-memory implementation of all four collaborator stores, used by
/// the test suites in place of Postgres. Matches the Postgres
/// implementation's ordering semantics (descending sorts place books
/// without ratings last).
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a catalog book with its genre associations.
    pub async fn add_book(
        &self,
        id: i64,
        title: &str,
        publication_year: Option<i32>,
        genre_ids: impl IntoIterator<Item = i64>,
    ) {
        let mut inner = self.inner.write().await;
        inner.books.insert(
            id,
            Book {
                id,
                title: title.to_string(),
                publication_year,
                average_rating: None,
                rating_count: 0,
            },
        );
        inner.book_genres.insert(id, genre_ids.into_iter().collect());
    }

    /// Test inspection helper: the stored set for a user, score-descending.
    pub async fn recommendations_for_user(&self, user_id: i64) -> Vec<Recommendation> {
        let inner = self.inner.read().await;
        let mut recs = inner
            .recommendations
            .get(&user_id)
            .cloned()
            .unwrap_or_default();
        recs.sort_by(|a, b| {
            b.predicted_score
                .partial_cmp(&a.predicted_score)
                .unwrap_or(Ordering::Equal)
        });
        recs
    }
}

impl Inner {
    fn refresh_book_aggregates(&mut self, book_id: i64) {
        let scores: Vec<i32> = self
            .ratings
            .values()
            .filter(|r| r.book_id == book_id)
            .map(|r| r.score)
            .collect();
        if let Some(book) = self.books.get_mut(&book_id) {
            book.rating_count = scores.len() as i64;
            book.average_rating = if scores.is_empty() {
                None
            } else {
                Some(f64::from(scores.iter().sum::<i32>()) / scores.len() as f64)
            };
        }
    }
}

/// Orders by the given nullable score descending, placing books
/// without a value last, then by rating count descending.
fn by_rating_then_count(a: &Book, b: &Book) -> Ordering {
    match (a.average_rating, b.average_rating) {
        (Some(x), Some(y)) => y
            .partial_cmp(&x)
            .unwrap_or(Ordering::Equal)
            .then(b.rating_count.cmp(&a.rating_count)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.rating_count.cmp(&a.rating_count),
    }
}

fn by_sort(a: &Book, b: &Book, sort: Sort) -> Ordering {
    let ordering = match sort.key {
        SortKey::Title => a.title.cmp(&b.title),
        SortKey::PublicationYear => a.publication_year.cmp(&b.publication_year),
        SortKey::RatingCount => a.rating_count.cmp(&b.rating_count),
        SortKey::AverageRating => match (a.average_rating, b.average_rating) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            // Missing averages always sort last, as in the SQL NULLS LAST.
            (Some(_), None) => return Ordering::Less,
            (None, Some(_)) => return Ordering::Greater,
            (None, None) => Ordering::Equal,
        },
    };
    match sort.dir {
        SortDir::Asc => ordering,
        SortDir::Desc => ordering.reverse(),
    }
}

fn paginate(mut books: Vec<Book>, request: PageRequest) -> Page<Book> {
    let total = books.len() as u64;
    let start = (request.offset() as usize).min(books.len());
    let end = (start + request.limit() as usize).min(books.len());
    let items = books.drain(start..end).collect();
    Page::new(items, request, total)
}

#[async_trait]
impl RatingStore for MemoryStore {
    async fn load_all(&self) -> AppResult<Vec<Rating>> {
        let inner = self.inner.read().await;
        Ok(inner.ratings.values().cloned().collect())
    }

    async fn load_for_users(&self, user_ids: &HashSet<i64>) -> AppResult<Vec<Rating>> {
        let inner = self.inner.read().await;
        Ok(inner
            .ratings
            .values()
            .filter(|r| user_ids.contains(&r.user_id))
            .cloned()
            .collect())
    }

    async fn load_for_user(&self, user_id: i64) -> AppResult<Vec<Rating>> {
        let inner = self.inner.read().await;
        Ok(inner
            .ratings
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_score(&self, user_id: i64, book_id: i64) -> AppResult<Option<i32>> {
        let inner = self.inner.read().await;
        Ok(inner.ratings.get(&(user_id, book_id)).map(|r| r.score))
    }

    async fn upsert(&self, user_id: i64, book_id: i64, score: i32) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        inner.ratings.insert(
            (user_id, book_id),
            Rating {
                user_id,
                book_id,
                score,
                added_at: Utc::now(),
            },
        );
        inner.refresh_book_aggregates(book_id);
        Ok(())
    }

    async fn delete(&self, user_id: i64, book_id: i64) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        let existed = inner.ratings.remove(&(user_id, book_id)).is_some();
        if existed {
            inner.refresh_book_aggregates(book_id);
        }
        Ok(existed)
    }

    async fn distinct_rated_user_ids(&self) -> AppResult<HashSet<i64>> {
        let inner = self.inner.read().await;
        Ok(inner.ratings.values().map(|r| r.user_id).collect())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn favourite_genre_ids(&self, user_id: i64) -> AppResult<HashSet<i64>> {
        let inner = self.inner.read().await;
        Ok(inner
            .favourite_genres
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_favourite_genre_ids(
        &self,
        user_id: i64,
        genre_ids: &HashSet<i64>,
    ) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        inner.favourite_genres.insert(user_id, genre_ids.clone());
        Ok(())
    }
}

#[async_trait]
impl BookStore for MemoryStore {
    async fn books_with_genres(&self, book_ids: &HashSet<i64>) -> AppResult<Vec<BookGenres>> {
        let inner = self.inner.read().await;
        Ok(book_ids
            .iter()
            .filter(|id| inner.books.contains_key(id))
            .map(|id| BookGenres {
                book_id: *id,
                genre_ids: inner.book_genres.get(id).cloned().unwrap_or_default(),
            })
            .collect())
    }

    async fn by_genres_excluding(
        &self,
        genre_ids: &HashSet<i64>,
        exclude_book_ids: &HashSet<i64>,
        request: PageRequest,
    ) -> AppResult<Page<Book>> {
        let inner = self.inner.read().await;
        let mut books: Vec<Book> = inner
            .books
            .values()
            .filter(|b| !exclude_book_ids.contains(&b.id))
            .filter(|b| {
                inner
                    .book_genres
                    .get(&b.id)
                    .is_some_and(|genres| !genres.is_disjoint(genre_ids))
            })
            .cloned()
            .collect();
        books.sort_by(by_rating_then_count);
        Ok(paginate(books, request))
    }

    async fn global_top(
        &self,
        min_average_rating: f64,
        request: PageRequest,
    ) -> AppResult<Page<Book>> {
        let inner = self.inner.read().await;
        let mut books: Vec<Book> = inner
            .books
            .values()
            .filter(|b| b.average_rating.is_some_and(|avg| avg > min_average_rating))
            .cloned()
            .collect();
        books.sort_by(|a, b| b.rating_count.cmp(&a.rating_count));
        Ok(paginate(books, request))
    }
}

#[async_trait]
impl RecommendationStore for MemoryStore {
    async fn delete_for_user(&self, user_id: i64) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        inner.recommendations.remove(&user_id);
        Ok(())
    }

    async fn replace_for_user(
        &self,
        user_id: i64,
        recommendations: &[Recommendation],
    ) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .recommendations
            .insert(user_id, recommendations.to_vec());
        Ok(())
    }

    async fn recommended_books(
        &self,
        user_id: i64,
        genre_id: Option<i64>,
        sort: Option<Sort>,
        request: PageRequest,
    ) -> AppResult<Page<Book>> {
        let inner = self.inner.read().await;
        let recs = match inner.recommendations.get(&user_id) {
            Some(recs) => recs,
            None => return Ok(Page::empty(request)),
        };

        let mut scored: Vec<(f64, Book)> = recs
            .iter()
            .filter(|rec| match genre_id {
                Some(genre_id) => inner
                    .book_genres
                    .get(&rec.book_id)
                    .is_some_and(|genres| genres.contains(&genre_id)),
                None => true,
            })
            .filter_map(|rec| {
                inner
                    .books
                    .get(&rec.book_id)
                    .map(|book| (rec.predicted_score, book.clone()))
            })
            .collect();

        match sort {
            Some(sort) => scored.sort_by(|a, b| by_sort(&a.1, &b.1, sort)),
            None => scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal)),
        }

        let books: Vec<Book> = scored.into_iter().map(|(_, book)| book).collect();
        Ok(paginate(books, request))
    }
}
