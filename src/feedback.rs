//! Append-only log of accept/reject decisions on suggestions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::candidate::LinkCandidate;
use crate::features::FeatureVector;
use crate::item_id::ItemId;
use crate::vocabulary::LinkType;

/// A user decision as reported by the surrounding layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    #[serde(alias = "candidateFromId")]
    pub from_id: ItemId,
    #[serde(alias = "candidateToId")]
    pub to_id: ItemId,
    pub accepted: bool,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub from_id: ItemId,
    pub to_id: ItemId,
    pub link_type: LinkType,
    /// Features of the candidate as it was shown.
    pub features: FeatureVector,
    pub accepted: bool,
    pub timestamp: DateTime<Utc>,
}

/// Selects records from [`FeedbackTracker::history`]. Unset fields match
/// everything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeedbackFilter {
    pub accepted: Option<bool>,
    pub link_type: Option<LinkType>,
    /// Inclusive lower bound on the timestamp.
    pub since: Option<DateTime<Utc>>,
}

impl FeedbackFilter {
    pub fn matches(&self, record: &FeedbackRecord) -> bool {
        self.accepted.map_or(true, |a| a == record.accepted)
            && self.link_type.map_or(true, |t| t == record.link_type)
            && self.since.map_or(true, |s| record.timestamp >= s)
    }
}

#[derive(Default)]
pub struct FeedbackTracker {
    records: RwLock<Vec<FeedbackRecord>>,
    /// Number of records the current model was trained on.
    trained_on: AtomicUsize,
}

impl FeedbackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a decision about `candidate`.
    pub fn record(
        &self,
        candidate: &LinkCandidate,
        features: FeatureVector,
        accepted: bool,
        timestamp: DateTime<Utc>,
    ) -> FeedbackRecord {
        let record = FeedbackRecord {
            from_id: candidate.from_id.clone(),
            to_id: candidate.to_id.clone(),
            link_type: candidate.link_type,
            features,
            accepted,
            timestamp,
        };
        self.append(record.clone());
        record
    }

    /// Append a record restored from the external feedback log.
    pub fn append(&self, record: FeedbackRecord) {
        log::debug!(
            "feedback {} {}->{} accepted={}",
            record.link_type,
            record.from_id,
            record.to_id,
            record.accepted
        );
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    /// Records in insertion order, optionally filtered.
    pub fn history(&self, filter: Option<&FeedbackFilter>) -> Vec<FeedbackRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        match filter {
            Some(filter) => records.iter().filter(|r| filter.matches(r)).cloned().collect(),
            None => records.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mark_trained(&self, records: usize) {
        self.trained_on.store(records, Ordering::Relaxed);
    }

    /// Records appended since the last successful training.
    pub fn since_training(&self) -> usize {
        self.len()
            .saturating_sub(self.trained_on.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::Explanation;
    use crate::features::FEATURE_VERSION;
    use crate::semantic::Method;
    use crate::vocabulary::Category;
    use chrono::TimeZone;

    fn candidate(from: &str, to: &str, link_type: LinkType) -> LinkCandidate {
        LinkCandidate {
            from_id: ItemId::from(from),
            to_id: ItemId::from(to),
            link_type,
            similarity_score: 0.5,
            method: Method::Keyword,
            connection_multiplicity: 1,
            confidence_score: 0.5,
            explanation: Explanation::default(),
        }
    }

    fn features() -> FeatureVector {
        FeatureVector {
            version: FEATURE_VERSION,
            values: [0.0; crate::features::FEATURE_COUNT],
        }
    }

    #[test]
    fn test_history_keeps_insertion_order() {
        let tracker = FeedbackTracker::new();
        let ap = LinkType::new(Category::Activity, Category::Pressure);
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        tracker.record(&candidate("A1", "P1", ap), features(), true, t);
        tracker.record(&candidate("A2", "P1", ap), features(), false, t);

        let history = tracker.history(None);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from_id.as_str(), "A1");
        assert_eq!(history[1].from_id.as_str(), "A2");
        assert!(history[0].accepted);
    }

    #[test]
    fn test_filter() {
        let tracker = FeedbackTracker::new();
        let ap = LinkType::new(Category::Activity, Category::Pressure);
        let pc = LinkType::new(Category::Pressure, Category::Consequence);
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        tracker.record(&candidate("A1", "P1", ap), features(), true, early);
        tracker.record(&candidate("P1", "C1", pc), features(), true, late);
        tracker.record(&candidate("A2", "P2", ap), features(), false, late);

        let accepted = FeedbackFilter {
            accepted: Some(true),
            ..Default::default()
        };
        assert_eq!(tracker.history(Some(&accepted)).len(), 2);

        let ap_only = FeedbackFilter {
            link_type: Some(ap),
            ..Default::default()
        };
        assert_eq!(tracker.history(Some(&ap_only)).len(), 2);

        let recent_ap = FeedbackFilter {
            link_type: Some(ap),
            since: Some(late),
            ..Default::default()
        };
        let recent = tracker.history(Some(&recent_ap));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].from_id.as_str(), "A2");
    }

    #[test]
    fn test_since_training() {
        let tracker = FeedbackTracker::new();
        let ap = LinkType::new(Category::Activity, Category::Pressure);
        for _ in 0..3 {
            tracker.record(&candidate("A1", "P1", ap), features(), true, Utc::now());
        }
        assert_eq!(tracker.since_training(), 3);
        tracker.mark_trained(3);
        assert_eq!(tracker.since_training(), 0);
        tracker.record(&candidate("A1", "P1", ap), features(), false, Utc::now());
        assert_eq!(tracker.since_training(), 1);
    }

    #[test]
    fn test_event_timestamp_defaults() {
        let event: FeedbackEvent =
            serde_json::from_str(r#"{"candidateFromId":"A1","candidateToId":"P1","accepted":true}"#)
                .unwrap();
        assert_eq!(event.from_id.as_str(), "A1");
        assert!(event.accepted);
    }
}
