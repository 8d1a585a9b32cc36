pub mod catalog;
pub mod profile;
pub mod ratings;
pub mod recommender;
pub mod refresh;
pub mod similarity;
pub mod sweep;

pub use catalog::CatalogService;
pub use profile::ProfileService;
pub use ratings::RatingService;
pub use recommender::RecommendationEngine;
pub use refresh::{spawn_refresh_worker, RefreshHandle, RefreshSink, RefreshWorkerHandle};
pub use similarity::SimilarityEngine;
pub use sweep::{run_sweep, spawn_daily_sweep};
