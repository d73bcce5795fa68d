//! Pipeline stages and their ordering.
//!
//! The stage set is closed: funnel ordering, latency pairing, and validation
//! all go through this enum rather than comparing free-form strings. Adding a
//! stage means adding a variant and a position here, nowhere else.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Number of pipeline stages.
pub const STAGE_COUNT: usize = 5;

/// One discrete, ordered step of the content pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Content has been fetched by the crawler.
    Crawled,
    /// Content has been stored in the search index.
    Indexed,
    /// Content has been classified (quality, topics).
    Classified,
    /// Content has been matched to publishing routes.
    Routed,
    /// Content has been published to subscribers.
    Published,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; STAGE_COUNT] = [
        Stage::Crawled,
        Stage::Indexed,
        Stage::Classified,
        Stage::Routed,
        Stage::Published,
    ];

    /// 1-based position of the stage in the pipeline.
    pub fn position(self) -> u8 {
        match self {
            Stage::Crawled => 1,
            Stage::Indexed => 2,
            Stage::Classified => 3,
            Stage::Routed => 4,
            Stage::Published => 5,
        }
    }

    /// Stable wire name of the stage.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Crawled => "crawled",
            Stage::Indexed => "indexed",
            Stage::Classified => "classified",
            Stage::Routed => "routed",
            Stage::Published => "published",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crawled" => Ok(Stage::Crawled),
            "indexed" => Ok(Stage::Indexed),
            "classified" => Ok(Stage::Classified),
            "routed" => Ok(Stage::Routed),
            "published" => Ok(Stage::Published),
            other => Err(Error::UnknownStage(other.to_string())),
        }
    }
}

/// Inter-stage latency segments reported by the throughput query.
///
/// Each entry is `(label, from, to)`. The end-to-end segment spans the whole
/// pipeline.
pub const LATENCY_SEGMENTS: [(&str, Stage, Stage); 3] = [
    ("crawl_to_classify", Stage::Crawled, Stage::Classified),
    ("classify_to_publish", Stage::Classified, Stage::Published),
    ("end_to_end", Stage::Crawled, Stage::Published),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions_are_contiguous_and_ordered() {
        let mut last = 0;
        for stage in Stage::ALL {
            assert_eq!(stage.position(), last + 1);
            last = stage.position();
        }
        assert_eq!(last as usize, STAGE_COUNT);
    }

    #[test]
    fn test_roundtrip_parse_display() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
    }

    #[test]
    fn test_unknown_stage_rejected() {
        assert!("deployed".parse::<Stage>().is_err());
        assert!("".parse::<Stage>().is_err());
        // Case sensitive by design: the wire format is lowercase.
        assert!("Crawled".parse::<Stage>().is_err());
    }

    #[test]
    fn test_serde_wire_form() {
        let json = serde_json::to_string(&Stage::Classified).unwrap();
        assert_eq!(json, "\"classified\"");
        let back: Stage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Stage::Classified);
    }

    #[test]
    fn test_latency_segments_are_forward() {
        for (_, from, to) in LATENCY_SEGMENTS {
            assert!(from.position() < to.position());
        }
    }
}
