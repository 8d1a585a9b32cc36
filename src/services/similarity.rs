use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RecommenderParams;
use crate::error::AppResult;
use crate::models::Rating;
use crate::store::RatingStore;

/// Finds the users most similar to a target user by mean-centered
/// cosine similarity over co-rated books.
///
/// Works from a full scan of the rating table; the dataset is assumed
/// small enough for batch scheduling, so no incremental index is kept.
pub struct SimilarityEngine {
    ratings: Arc<dyn RatingStore>,
    params: RecommenderParams,
}

impl SimilarityEngine {
    pub fn new(ratings: Arc<dyn RatingStore>, params: RecommenderParams) -> Self {
        Self { ratings, params }
    }

    /// Returns the top-K users most similar to `target_user_id`,
    /// ordered by descending similarity. Never includes the target
    /// user; only includes neighbors sharing at least `min_common`
    /// rated books.
    pub async fn compute_similarities(&self, target_user_id: i64) -> AppResult<Vec<(i64, f64)>> {
        let all_ratings = self.ratings.load_all().await?;
        if all_ratings.is_empty() {
            tracing::info!("no ratings in the system");
            return Ok(Vec::new());
        }

        let by_user = group_by_user(all_ratings);
        let target_ratings = by_user.get(&target_user_id).cloned().unwrap_or_default();
        let target_mean = mean_rating(&target_ratings);

        let raw = raw_similarities(
            target_user_id,
            &target_ratings,
            target_mean,
            &by_user,
            self.params.min_common,
        );
        Ok(top_k(raw, self.params.k_neighbors))
    }
}

/// Groups a flat rating list into per-user (book -> score) maps.
fn group_by_user(ratings: Vec<Rating>) -> HashMap<i64, HashMap<i64, i32>> {
    let mut by_user: HashMap<i64, HashMap<i64, i32>> = HashMap::new();
    for rating in ratings {
        by_user
            .entry(rating.user_id)
            .or_default()
            .insert(rating.book_id, rating.score);
    }
    by_user
}

/// Average score over a user's ratings, 0.0 if they have none.
fn mean_rating(ratings: &HashMap<i64, i32>) -> f64 {
    if ratings.is_empty() {
        return 0.0;
    }
    f64::from(ratings.values().sum::<i32>()) / ratings.len() as f64
}

/// Mean-centered cosine similarity between the target user and every
/// other user sharing at least `min_common` rated books. Both users'
/// scores are centered on their own overall mean before the cosine.
fn raw_similarities(
    target_user_id: i64,
    target_ratings: &HashMap<i64, i32>,
    target_mean: f64,
    all_user_ratings: &HashMap<i64, HashMap<i64, i32>>,
    min_common: usize,
) -> HashMap<i64, f64> {
    let mut similarities = HashMap::new();

    for (&other_user_id, other_ratings) in all_user_ratings {
        if other_user_id == target_user_id {
            continue;
        }

        let common_book_ids: Vec<i64> = target_ratings
            .keys()
            .filter(|book_id| other_ratings.contains_key(book_id))
            .copied()
            .collect();
        if common_book_ids.len() < min_common {
            continue;
        }

        let other_mean = mean_rating(other_ratings);

        let mut numerator = 0.0;
        let mut sum_square_diff_target = 0.0;
        let mut sum_square_diff_other = 0.0;

        for book_id in common_book_ids {
            let diff_target = f64::from(target_ratings[&book_id]) - target_mean;
            let diff_other = f64::from(other_ratings[&book_id]) - other_mean;

            numerator += diff_target * diff_other;
            sum_square_diff_target += diff_target * diff_target;
            sum_square_diff_other += diff_other * diff_other;
        }

        // Zero variance on either side means no direction to compare;
        // defined as similarity 0.0 rather than dividing by zero.
        let similarity = if sum_square_diff_target == 0.0 || sum_square_diff_other == 0.0 {
            0.0
        } else {
            numerator / (sum_square_diff_target.sqrt() * sum_square_diff_other.sqrt())
        };

        if !similarity.is_nan() {
            similarities.insert(other_user_id, similarity);
        }
    }

    similarities
}

/// Sorts descending by similarity and keeps the top K entries. Ties
/// fall in arbitrary stable order.
fn top_k(raw: HashMap<i64, f64>, k: usize) -> Vec<(i64, f64)> {
    let mut ranked: Vec<(i64, f64)> = raw.into_iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    ranked.truncate(k);
    ranked
}
