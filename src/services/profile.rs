use std::collections::HashSet;
use std::sync::Arc;

use crate::error::AppResult;
use crate::store::UserStore;

use super::refresh::RefreshSink;

/// Write path for a user's favourite-genre set. The refresh signal
/// fires only when the resulting set differs from the stored one;
/// reordering the same ids is not a change.
pub struct ProfileService {
    users: Arc<dyn UserStore>,
    sink: Arc<dyn RefreshSink>,
}

impl ProfileService {
    pub fn new(users: Arc<dyn UserStore>, sink: Arc<dyn RefreshSink>) -> Self {
        Self { users, sink }
    }

    pub async fn favourite_genres(&self, user_id: i64) -> AppResult<HashSet<i64>> {
        self.users.favourite_genre_ids(user_id).await
    }

    pub async fn update_favourite_genres(
        &self,
        user_id: i64,
        genre_ids: HashSet<i64>,
    ) -> AppResult<()> {
        let current = self.users.favourite_genre_ids(user_id).await?;
        let changed = current != genre_ids;

        self.users.set_favourite_genre_ids(user_id, &genre_ids).await?;

        if changed {
            self.sink.genres_changed(user_id);
        }
        Ok(())
    }
}
