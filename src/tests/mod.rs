mod retraining;

use crate::config::Config;
use crate::feedback::FeedbackEvent;
use crate::item_id::ItemId;
use crate::vocabulary::{Category, VocabularyItem};

const ACTIVITIES: [&str; 8] = [
    "chemical discharge",
    "oil spill from tankers",
    "bottom trawling",
    "coastal construction",
    "wastewater discharge",
    "shipping traffic",
    "aquaculture farming",
    "sand dredging",
];

const PRESSURES: [&str; 8] = [
    "water pollution",
    "oil contamination of water",
    "seabed disturbance",
    "habitat loss",
    "nutrient enrichment",
    "underwater noise",
    "organic pollution",
    "sediment resuspension",
];

const CONSEQUENCES: [&str; 8] = [
    "ecosystem damage",
    "seabird mortality",
    "loss of benthic habitat",
    "fish stock decline",
    "harmful algal blooms",
    "marine mammal disturbance",
    "oxygen depletion",
    "reduced water clarity",
];

const CONTROLS: [&str; 8] = [
    "discharge permits",
    "double hull tankers",
    "trawling restrictions",
    "environmental impact assessment",
    "wastewater treatment",
    "speed limits for ships",
    "farm siting rules",
    "dredging seasons",
];

/// A bowtie vocabulary with a header item and eight linkable items per
/// category: 256 eligible pairs under the documented rules.
pub(crate) fn bowtie_items() -> Vec<VocabularyItem> {
    let mut items = Vec::new();
    for (prefix, category, header, labels) in [
        ("A", Category::Activity, "Activities", ACTIVITIES),
        ("P", Category::Pressure, "Pressures", PRESSURES),
        ("C", Category::Consequence, "Consequences", CONSEQUENCES),
        ("K", Category::Control, "Controls", CONTROLS),
    ] {
        let header_id = format!("{prefix}00");
        items.push(VocabularyItem::new(&header_id, header, category, 1));
        for (i, label) in labels.iter().enumerate() {
            let id = format!("{prefix}{:02}", i + 1);
            items.push(VocabularyItem::new(&id, label, category, 2).with_parent(&header_id));
        }
    }
    items
}

/// Accept every activity->pressure pair, reject every
/// pressure->consequence pair.
pub(crate) fn link_type_feedback() -> Vec<FeedbackEvent> {
    let mut events = Vec::new();
    for a in 1..=8 {
        for p in 1..=8 {
            events.push(event(&format!("A{a:02}"), &format!("P{p:02}"), true));
        }
    }
    for p in 1..=8 {
        for c in 1..=8 {
            events.push(event(&format!("P{p:02}"), &format!("C{c:02}"), false));
        }
    }
    events
}

pub(crate) fn event(from: &str, to: &str, accepted: bool) -> FeedbackEvent {
    FeedbackEvent {
        from_id: ItemId::from(from),
        to_id: ItemId::from(to),
        accepted,
        timestamp: chrono::Utc::now(),
    }
}

/// Small training settings so scenario tests stay fast.
pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    config.training.trees = 10;
    config.training.boosting_rounds = 10;
    config
}
