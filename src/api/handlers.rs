use std::collections::HashSet;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::models::{Book, Page, PageRequest, Sort};

use super::AppState;

// Request/Response types

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct SetRatingRequest {
    pub user_id: i64,
    pub score: i32,
}

#[derive(Debug, Deserialize)]
pub struct FavouriteGenresRequest {
    pub genre_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RecommendationsQuery {
    pub user_id: i64,
    pub genre_id: Option<i64>,
    pub sort: Option<String>,
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub size: u32,
}

fn default_page_size() -> u32 {
    10
}

#[derive(Debug, Serialize)]
pub struct BookResponse {
    pub id: i64,
    pub title: String,
    pub publication_year: Option<i32>,
    pub average_rating: Option<f64>,
    pub rating_count: i64,
}

impl From<Book> for BookResponse {
    fn from(book: Book) -> Self {
        Self {
            id: book.id,
            title: book.title,
            publication_year: book.publication_year,
            average_rating: book.average_rating,
            rating_count: book.rating_count,
        }
    }
}

// Handlers

/// Health check endpoint
pub async fn health_check() -> StatusCode {
    StatusCode::OK
}

/// Returns the user's own rating for a book, or 204 if they have none.
pub async fn get_my_rating(
    State(state): State<AppState>,
    Path(book_id): Path<i64>,
    Query(query): Query<UserQuery>,
) -> AppResult<Response> {
    match state.ratings.my_rating(query.user_id, book_id).await? {
        Some(score) => Ok(Json(score).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// Sets or overwrites the user's rating for a book.
pub async fn set_rating(
    State(state): State<AppState>,
    Path(book_id): Path<i64>,
    Json(request): Json<SetRatingRequest>,
) -> AppResult<StatusCode> {
    state
        .ratings
        .set_rating(request.user_id, book_id, request.score)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Removes the user's rating for a book.
pub async fn delete_rating(
    State(state): State<AppState>,
    Path(book_id): Path<i64>,
    Query(query): Query<UserQuery>,
) -> AppResult<StatusCode> {
    state.ratings.delete_rating(query.user_id, book_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Replaces the user's favourite-genre set.
pub async fn update_favourite_genres(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Json(request): Json<FavouriteGenresRequest>,
) -> AppResult<StatusCode> {
    let genre_ids: HashSet<i64> = request.genre_ids.into_iter().collect();
    state
        .profile
        .update_favourite_genres(user_id, genre_ids)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Paginated recommendations for a user, with the serving-time
/// fallback when the stored set is empty.
pub async fn get_recommendations(
    State(state): State<AppState>,
    Query(query): Query<RecommendationsQuery>,
) -> AppResult<Json<Page<BookResponse>>> {
    let sort = query.sort.as_deref().map(Sort::parse).transpose()?;
    let request = PageRequest::new(query.page, query.size);

    let books = state
        .catalog
        .recommended_books_for_user(query.user_id, query.genre_id, sort, request)
        .await?;
    Ok(Json(books.map(BookResponse::from)))
}
