//! Score normalization.
//!
//! Records carry a `normalizedProbability` derived from their own probability
//! only. Bucket `anomalyScore`s are scaled against the job's ceiling (the
//! largest unnormalized bucket score seen so far), so a growing ceiling
//! rescales earlier buckets inside the renormalization window.

use crate::error::Result;
use crate::store::ResultStore;

/// Lowest ceiling a job ever scores against.
pub const CEILING_FLOOR: f64 = 5.0;

const SECONDS_PER_DAY: i64 = 86_400;

/// Surprise beyond what a 1-in-20 event carries; zero for unremarkable values.
pub fn excess_surprise(probability: f64) -> f64 {
    let p = probability.clamp(f64::MIN_POSITIVE, 1.0);
    (-p.ln() - 20f64.ln()).max(0.0)
}

pub fn normalized_probability(probability: f64) -> f64 {
    let excess = excess_surprise(probability);
    100.0 * excess / (excess + 5.0)
}

pub fn anomaly_score(unnormalized: f64, ceiling: f64) -> f64 {
    let ceiling = ceiling.max(CEILING_FLOOR);
    (100.0 * unnormalized / ceiling).clamp(0.0, 100.0)
}

/// Rescales stored final buckets against `ceiling`.
///
/// Only buckets within `window_days` of the newest stored bucket are touched;
/// `Some(0)` disables rescaling and `None` covers every bucket.
pub async fn renormalize(
    store: &dyn ResultStore,
    job_id: &str,
    ceiling: f64,
    window_days: Option<i64>,
) -> Result<usize> {
    if window_days == Some(0) {
        return Ok(0);
    }
    let buckets = store.get_buckets_by_range(job_id, None, None).await?;
    let Some(newest) = buckets.last().map(|b| b.epoch()) else {
        return Ok(0);
    };
    let start = window_days.map_or(i64::MIN, |days| {
        newest.saturating_sub(days.saturating_mul(SECONDS_PER_DAY))
    });

    let mut rescaled = 0;
    for mut bucket in buckets {
        if bucket.is_interim || bucket.epoch() < start {
            continue;
        }
        let score = anomaly_score(bucket.unnormalized_score, ceiling);
        if score == bucket.anomaly_score {
            continue;
        }
        bucket.set_anomaly_score(score);
        store.put_bucket(job_id, bucket).await?;
        rescaled += 1;
    }
    if rescaled > 0 {
        tracing::debug!(job_id, rescaled, ceiling, "renormalized bucket scores");
    }
    Ok(rescaled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::fixtures::{bucket, record};
    use crate::store::InMemoryResultStore;

    #[test]
    fn unremarkable_probabilities_normalize_to_zero() {
        assert_eq!(normalized_probability(1.0), 0.0);
        assert_eq!(normalized_probability(0.06), 0.0);
        assert!(normalized_probability(1e-6) > 60.0);
        assert!(normalized_probability(1e-300) < 100.0);
        assert!(normalized_probability(0.0) < 100.0);
    }

    #[test]
    fn anomaly_score_is_bounded() {
        assert_eq!(anomaly_score(0.0, 10.0), 0.0);
        assert_eq!(anomaly_score(10.0, 10.0), 100.0);
        assert_eq!(anomaly_score(50.0, 10.0), 100.0);
        assert_eq!(anomaly_score(1.0, 0.0), 20.0);
    }

    #[tokio::test]
    async fn renormalize_rescales_window_and_keeps_records_consistent() -> anyhow::Result<()> {
        let store = InMemoryResultStore::new();
        let day = SECONDS_PER_DAY;
        for (epoch, raw) in [(0, 10.0), (3 * day, 5.0), (4 * day, 10.0)] {
            let mut b = bucket("farm", epoch, vec![record("farm", epoch, "aal", 40.0)], raw);
            b.set_anomaly_score(anomaly_score(raw, 10.0));
            store.put_bucket("farm", b).await?;
        }

        assert_eq!(renormalize(&store, "farm", 20.0, Some(0)).await?, 0);
        assert_eq!(renormalize(&store, "farm", 20.0, Some(2)).await?, 2);

        let buckets = store.get_buckets_by_range("farm", None, None).await?;
        assert_eq!(buckets[0].anomaly_score, 100.0);
        assert_eq!(buckets[1].anomaly_score, 25.0);
        assert_eq!(buckets[2].anomaly_score, 50.0);
        assert!(buckets.iter().all(|b| b.is_consistent()));
        assert_eq!(buckets[2].records[0].normalized_probability, 40.0);

        assert_eq!(renormalize(&store, "farm", 20.0, None).await?, 1);
        assert_eq!(renormalize(&store, "farm", 20.0, None).await?, 0);
        Ok(())
    }
}
