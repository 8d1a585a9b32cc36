use axum::{
    routing::{get, put},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;
use super::AppState;

/// Creates the main API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        // Ratings
        .route(
            "/books/:book_id/rating",
            get(handlers::get_my_rating)
                .post(handlers::set_rating)
                .delete(handlers::delete_rating),
        )
        // User profile
        .route(
            "/users/:user_id/favourite-genres",
            put(handlers::update_favourite_genres),
        )
        // Recommendations (serving path)
        .route("/recommendations", get(handlers::get_recommendations))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
