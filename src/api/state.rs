use std::sync::Arc;

use crate::services::{CatalogService, ProfileService, RatingService, RefreshHandle};
use crate::store::Stores;

/// Shared application state: the services behind the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub ratings: Arc<RatingService>,
    pub profile: Arc<ProfileService>,
    pub catalog: Arc<CatalogService>,
}

impl AppState {
    /// Wires the services over the given stores, with the refresh
    /// queue as the sink for change signals.
    pub fn new(stores: Stores, refresh: RefreshHandle) -> Self {
        let sink = Arc::new(refresh);
        Self {
            ratings: Arc::new(RatingService::new(stores.ratings.clone(), sink.clone())),
            profile: Arc::new(ProfileService::new(stores.users.clone(), sink)),
            catalog: Arc::new(CatalogService::new(
                stores.ratings,
                stores.users,
                stores.books,
                stores.recommendations,
            )),
        }
    }
}
