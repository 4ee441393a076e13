use super::{AnomalyRecord, Bucket, Influencer};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const DEFAULT_TAKE: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRef {
    pub skip: usize,
    pub take: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPage<T> {
    pub hit_count: u64,
    pub skip: usize,
    pub take: usize,
    pub documents: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page: Option<PageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_page: Option<PageRef>,
}

impl<T> QueryPage<T> {
    /// Slices one page out of the full, already ordered hit list.
    pub fn paginate(hits: Vec<T>, skip: usize, take: usize) -> Self {
        let hit_count = hits.len();
        let documents: Vec<T> = hits.into_iter().skip(skip).take(take).collect();
        let next_page = (take > 0 && skip + take < hit_count).then(|| PageRef {
            skip: skip + take,
            take,
        });
        let previous_page = (skip > 0).then(|| PageRef {
            skip: skip.saturating_sub(take),
            take,
        });
        Self {
            hit_count: hit_count as u64,
            skip,
            take,
            documents,
            next_page,
            previous_page,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketQuery {
    pub skip: usize,
    pub take: usize,
    /// Inclusive lower bound, epoch seconds.
    pub start: Option<i64>,
    /// Exclusive upper bound, epoch seconds.
    pub end: Option<i64>,
    pub anomaly_score_filter: Option<f64>,
    pub normalized_probability_filter: Option<f64>,
    pub include_interim: bool,
    pub expand: bool,
}

impl Default for BucketQuery {
    fn default() -> Self {
        Self {
            skip: 0,
            take: DEFAULT_TAKE,
            start: None,
            end: None,
            anomaly_score_filter: None,
            normalized_probability_filter: None,
            include_interim: false,
            expand: false,
        }
    }
}

impl BucketQuery {
    pub fn page(skip: usize, take: usize) -> Self {
        Self {
            skip,
            take,
            ..Default::default()
        }
    }

    pub fn apply(&self, buckets: Vec<Bucket>) -> QueryPage<Bucket> {
        let hits: Vec<Bucket> = buckets
            .into_iter()
            .filter(|b| self.include_interim || !b.is_interim)
            .filter(|b| {
                self.anomaly_score_filter
                    .map_or(true, |min| b.anomaly_score >= min)
            })
            .filter(|b| {
                self.normalized_probability_filter
                    .map_or(true, |min| b.max_normalized_probability >= min)
            })
            .map(|b| if self.expand { b } else { b.without_records() })
            .collect();
        QueryPage::paginate(hits, self.skip, self.take)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordSortField {
    #[default]
    NormalizedProbability,
    AnomalyScore,
    ByFieldValue,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordQuery {
    pub skip: usize,
    pub take: usize,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub include_interim: bool,
    pub sort: RecordSortField,
    pub descending: bool,
    pub anomaly_score_filter: Option<f64>,
    pub normalized_probability_filter: Option<f64>,
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            skip: 0,
            take: DEFAULT_TAKE,
            start: None,
            end: None,
            include_interim: false,
            sort: RecordSortField::NormalizedProbability,
            descending: true,
            anomaly_score_filter: None,
            normalized_probability_filter: None,
        }
    }
}

impl RecordQuery {
    pub fn page(skip: usize, take: usize, sort: RecordSortField, descending: bool) -> Self {
        Self {
            skip,
            take,
            sort,
            descending,
            ..Default::default()
        }
    }

    pub fn apply(&self, buckets: Vec<Bucket>) -> QueryPage<AnomalyRecord> {
        let mut hits: Vec<AnomalyRecord> = buckets
            .into_iter()
            .filter(|b| self.include_interim || !b.is_interim)
            .flat_map(|b| b.records)
            .filter(|r| {
                self.anomaly_score_filter
                    .map_or(true, |min| r.anomaly_score >= min)
            })
            .filter(|r| {
                self.normalized_probability_filter
                    .map_or(true, |min| r.normalized_probability >= min)
            })
            .collect();
        hits.sort_by(|a, b| {
            let primary = compare_records(a, b, self.sort);
            let primary = if self.descending {
                primary.reverse()
            } else {
                primary
            };
            primary
                .then_with(|| a.timestamp.cmp(&b.timestamp))
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        QueryPage::paginate(hits, self.skip, self.take)
    }
}

fn compare_records(a: &AnomalyRecord, b: &AnomalyRecord, field: RecordSortField) -> Ordering {
    match field {
        RecordSortField::NormalizedProbability => a
            .normalized_probability
            .total_cmp(&b.normalized_probability),
        RecordSortField::AnomalyScore => a.anomaly_score.total_cmp(&b.anomaly_score),
        RecordSortField::ByFieldValue => a.by_field_value.cmp(&b.by_field_value),
        RecordSortField::Timestamp => a.timestamp.cmp(&b.timestamp),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfluencerQuery {
    pub skip: usize,
    pub take: usize,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub include_interim: bool,
    pub anomaly_score_filter: Option<f64>,
}

impl Default for InfluencerQuery {
    fn default() -> Self {
        Self {
            skip: 0,
            take: DEFAULT_TAKE,
            start: None,
            end: None,
            include_interim: false,
            anomaly_score_filter: None,
        }
    }
}

impl InfluencerQuery {
    /// Influencers sorted by descending score, then time.
    pub fn apply(&self, buckets: Vec<Bucket>) -> QueryPage<Influencer> {
        let mut hits: Vec<Influencer> = buckets
            .into_iter()
            .filter(|b| self.include_interim || !b.is_interim)
            .flat_map(|b| b.influencers)
            .filter(|i| {
                self.anomaly_score_filter
                    .map_or(true, |min| i.anomaly_score >= min)
            })
            .collect();
        hits.sort_by(|a, b| {
            b.anomaly_score
                .total_cmp(&a.anomaly_score)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
                .then_with(|| a.influencer_field_value.cmp(&b.influencer_field_value))
        });
        QueryPage::paginate(hits, self.skip, self.take)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::fixtures::{bucket, record};

    fn dataset() -> Vec<Bucket> {
        (0..7)
            .map(|i| {
                let epoch = i * 300;
                let records = vec![
                    record("j", epoch, "aal", (i * 7 % 10) as f64),
                    record("j", epoch, "ual", 50.0),
                    record("j", epoch, "dal", (i * 3 % 5) as f64),
                ];
                bucket("j", epoch, records, i as f64)
            })
            .collect()
    }

    fn with_sequences(mut buckets: Vec<Bucket>) -> Vec<Bucket> {
        let mut seq = 0;
        for b in &mut buckets {
            for r in &mut b.records {
                seq += 1;
                r.sequence = seq;
            }
        }
        buckets
    }

    #[test]
    fn paging_reports_links() {
        let page = QueryPage::paginate((0..10).collect::<Vec<_>>(), 4, 3);
        assert_eq!(page.documents, vec![4, 5, 6]);
        assert_eq!(page.hit_count, 10);
        assert_eq!(page.next_page, Some(PageRef { skip: 7, take: 3 }));
        assert_eq!(page.previous_page, Some(PageRef { skip: 1, take: 3 }));

        let last = QueryPage::paginate((0..10).collect::<Vec<_>>(), 9, 3);
        assert_eq!(last.documents, vec![9]);
        assert!(last.next_page.is_none());
    }

    #[test]
    fn record_pages_concatenate_to_single_page() {
        let buckets = with_sequences(dataset());
        for sort in [
            RecordSortField::NormalizedProbability,
            RecordSortField::AnomalyScore,
            RecordSortField::ByFieldValue,
            RecordSortField::Timestamp,
        ] {
            let all = RecordQuery::page(0, 1000, sort, true).apply(buckets.clone());
            let mut paged = Vec::new();
            let mut skip = 0;
            for take in [1, 4, 2, 5, 3].iter().cycle() {
                let page = RecordQuery::page(skip, *take, sort, true).apply(buckets.clone());
                skip += page.documents.len();
                paged.extend(page.documents);
                if page.next_page.is_none() {
                    break;
                }
            }
            assert_eq!(all.documents, paged, "sort {sort:?}");
        }
    }

    #[test]
    fn bucket_query_filters_interim_and_scores() {
        let mut buckets = dataset();
        buckets[6].is_interim = true;
        let page = BucketQuery::default().apply(buckets.clone());
        assert_eq!(page.hit_count, 6);
        assert!(page.documents.iter().all(|b| b.records.is_empty()));

        let query = BucketQuery {
            include_interim: true,
            anomaly_score_filter: Some(4.0),
            expand: true,
            ..Default::default()
        };
        let page = query.apply(buckets);
        assert_eq!(page.hit_count, 3);
        assert!(page.documents.iter().all(|b| b.record_count == b.records.len()));
    }
}
