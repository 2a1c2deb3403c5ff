use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::database::CoachDatabase;
use crate::reports::ReviewGenerator;

/// Run the automatic review for every known user. Returns how many
/// reviews were freshly generated; per-user failures are logged and skipped.
pub async fn run_review_sweep(
    reviews: &ReviewGenerator,
    db: &CoachDatabase,
    now: DateTime<Utc>,
) -> usize {
    let user_ids = match db.conversation_user_ids() {
        Ok(ids) => ids,
        Err(e) => {
            tracing::warn!("Review sweep could not list users: {:#}", e);
            return 0;
        }
    };

    let mut generated = 0;
    for user_id in &user_ids {
        match reviews.run_automatic_review(user_id, now).await {
            Ok(review) if review.inhalt.is_some() => generated += 1,
            Ok(_) => {}
            Err(e) => tracing::warn!("Automatic review for {} failed: {:#}", user_id, e),
        }
    }
    if generated > 0 {
        tracing::info!(
            "Review sweep generated {} report(s) for {} user(s)",
            generated,
            user_ids.len()
        );
    }
    generated
}

/// Periodic review tick. `interval_mins == 0` disables it.
pub fn spawn_review_scheduler(
    reviews: Arc<ReviewGenerator>,
    db: Arc<CoachDatabase>,
    interval_mins: u64,
) -> Option<JoinHandle<()>> {
    if interval_mins == 0 {
        tracing::info!("Review scheduler disabled");
        return None;
    }

    tracing::info!("Review scheduler running every {} minute(s)", interval_mins);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_mins * 60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            run_review_sweep(&reviews, &db, Utc::now()).await;
        }
    }))
}
