use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime};
use tokio::task::JoinHandle;

use super::recommender::RecommendationEngine;

/// Spawns the daily background sweep: once per day at the given local
/// hour, recomputes recommendations for every user with at least one
/// rating.
pub fn spawn_daily_sweep(engine: Arc<RecommendationEngine>, hour: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let delay = delay_until_next(Local::now().naive_local(), hour);
            tracing::info!(delay_secs = delay.as_secs(), "next recommendation sweep scheduled");
            tokio::time::sleep(delay).await;
            run_sweep(&engine).await;
        }
    })
}

/// One full sweep pass, sequential per user. A single user's failure
/// is logged and the sweep continues with the remaining users.
pub async fn run_sweep(engine: &RecommendationEngine) {
    tracing::info!("starting scheduled recommendations sweep");

    let user_ids = match engine.rated_user_ids().await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(error = %e, "sweep could not enumerate rated users");
            return;
        }
    };

    let total = user_ids.len();
    let mut failed = 0usize;
    for user_id in user_ids {
        if let Err(e) = engine.refresh_recommendations_for_user(user_id).await {
            failed += 1;
            tracing::error!(user_id, error = %e, "sweep refresh failed for user");
        }
    }

    tracing::info!(total, failed, "completed scheduled recommendations sweep");
}

/// Time left until the next occurrence of `hour:00:00` local time.
fn delay_until_next(now: NaiveDateTime, hour: u32) -> Duration {
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date().and_time(at);
    let next = if now < today {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    (next - now).to_std().unwrap_or_default()
}
