use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// An explicit 1..=5 rating a user gave a book.
/// Unique per (user_id, book_id); overwritten in place on re-rating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Rating {
    pub user_id: i64,
    pub book_id: i64,
    pub score: i32,
    pub added_at: DateTime<Utc>,
}

/// A catalog book row as served to clients.
///
/// `average_rating` and `rating_count` are denormalized aggregates
/// maintained by the rating write path; the fallback selector orders
/// by them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Book {
    pub id: i64,
    pub title: String,
    pub publication_year: Option<i32>,
    pub average_rating: Option<f64>,
    pub rating_count: i64,
}

/// A book joined with its genre-id set, batch-loaded for content scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct BookGenres {
    pub book_id: i64,
    pub genre_ids: HashSet<i64>,
}

/// A stored recommendation produced by the refresh pipeline.
/// Composite key (user_id, book_id); fully replaced per user on refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Recommendation {
    pub user_id: i64,
    pub book_id: i64,
    pub predicted_score: f64,
    pub created_at: DateTime<Utc>,
}

/// Zero-based pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl PageRequest {
    pub fn new(page: u32, size: u32) -> Self {
        Self { page, size }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page) * i64::from(self.size)
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.size)
    }
}

/// One page of results together with the total row count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub size: u32,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, request: PageRequest, total: u64) -> Self {
        Self {
            items,
            page: request.page,
            size: request.size,
            total,
        }
    }

    pub fn empty(request: PageRequest) -> Self {
        Self::new(Vec::new(), request, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            page: self.page,
            size: self.size,
            total: self.total,
        }
    }
}

/// Book columns a caller may sort by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Title,
    PublicationYear,
    AverageRating,
    RatingCount,
}

impl SortKey {
    /// The backing column name; sort keys are a closed set, so this is
    /// safe to splice into SQL.
    pub fn column(&self) -> &'static str {
        match self {
            SortKey::Title => "title",
            SortKey::PublicationYear => "publication_year",
            SortKey::AverageRating => "average_rating",
            SortKey::RatingCount => "rating_count",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    pub fn keyword(&self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

/// A caller-supplied sort, parsed from `"field"` or `"field,dir"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sort {
    pub key: SortKey,
    pub dir: SortDir,
}

impl Sort {
    /// Parses a sort expression against the whitelist of sortable
    /// columns. Unknown fields or directions are an invalid-input error.
    pub fn parse(expr: &str) -> AppResult<Self> {
        let mut parts = expr.splitn(2, ',');
        let field = parts.next().unwrap_or("").trim();
        let dir = parts.next().map(str::trim);

        let key = match field {
            "title" => SortKey::Title,
            "publication_year" => SortKey::PublicationYear,
            "average_rating" => SortKey::AverageRating,
            "rating_count" => SortKey::RatingCount,
            other => {
                return Err(AppError::InvalidInput(format!(
                    "Unsupported sort field: {}",
                    other
                )))
            }
        };

        let dir = match dir {
            None | Some("asc") => SortDir::Asc,
            Some("desc") => SortDir::Desc,
            Some(other) => {
                return Err(AppError::InvalidInput(format!(
                    "Unsupported sort direction: {}",
                    other
                )))
            }
        };

        Ok(Sort { key, dir })
    }
}
