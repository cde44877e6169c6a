//! Fixed PPE vocabulary.
//!
//! The detector reports "negative" classes (`no-hardhat`, `no-vest`, ...).
//! Only those map onto a [`PpeKind`]; positive classes such as `hardhat` or
//! `person` are not violations and never produce an alert.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A piece of protective equipment that can be reported as missing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PpeKind {
    Hardhat,
    Gloves,
    Vest,
    Mask,
    Goggles,
    Earplugs,
}

impl PpeKind {
    pub const ALL: [PpeKind; 6] = [
        PpeKind::Hardhat,
        PpeKind::Gloves,
        PpeKind::Vest,
        PpeKind::Mask,
        PpeKind::Goggles,
        PpeKind::Earplugs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PpeKind::Hardhat => "hardhat",
            PpeKind::Gloves => "gloves",
            PpeKind::Vest => "vest",
            PpeKind::Mask => "mask",
            PpeKind::Goggles => "goggles",
            PpeKind::Earplugs => "earplugs",
        }
    }

    /// Detector label announcing that this kind is absent.
    pub fn negative_label(self) -> &'static str {
        match self {
            PpeKind::Hardhat => "no-hardhat",
            PpeKind::Gloves => "no-gloves",
            PpeKind::Vest => "no-vest",
            PpeKind::Mask => "no-mask",
            PpeKind::Goggles => "no-goggles",
            PpeKind::Earplugs => "no-earplugs",
        }
    }

    /// Map a raw detector class label to the PPE kind it reports as missing.
    ///
    /// Case is ignored and `_` or spaces are accepted in place of `-`, so
    /// `NO-Hardhat` and `no_hardhat` both resolve to [`PpeKind::Hardhat`].
    pub fn from_negative_label(label: &str) -> Option<Self> {
        let normalized: String = label
            .trim()
            .chars()
            .map(|c| match c {
                '_' | ' ' => '-',
                other => other.to_ascii_lowercase(),
            })
            .collect();
        Self::ALL
            .into_iter()
            .find(|kind| kind.negative_label() == normalized)
    }

    /// Annotation color (RGB).
    pub fn color(self) -> [u8; 3] {
        match self {
            PpeKind::Hardhat => [255, 0, 0],
            PpeKind::Gloves => [0, 255, 0],
            PpeKind::Vest => [0, 0, 255],
            PpeKind::Mask => [255, 255, 0],
            PpeKind::Goggles => [255, 0, 255],
            PpeKind::Earplugs => [255, 165, 0],
        }
    }
}

impl fmt::Display for PpeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_negative_labels() {
        assert_eq!(PpeKind::from_negative_label("no-hardhat"), Some(PpeKind::Hardhat));
        assert_eq!(PpeKind::from_negative_label("no-earplugs"), Some(PpeKind::Earplugs));
        assert_eq!(PpeKind::from_negative_label("NO-Mask"), Some(PpeKind::Mask));
        assert_eq!(PpeKind::from_negative_label("no_goggles"), Some(PpeKind::Goggles));
    }

    #[test]
    fn ignores_positive_and_unknown_labels() {
        assert_eq!(PpeKind::from_negative_label("hardhat"), None);
        assert_eq!(PpeKind::from_negative_label("person"), None);
        assert_eq!(PpeKind::from_negative_label("no-helmet"), None);
        assert_eq!(PpeKind::from_negative_label(""), None);
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&PpeKind::Vest).unwrap();
        assert_eq!(json, "\"vest\"");
        for kind in PpeKind::ALL {
            assert_eq!(kind.to_string(), kind.as_str());
        }
    }

    #[test]
    fn palette_is_distinct() {
        let mut colors: Vec<[u8; 3]> = PpeKind::ALL.iter().map(|k| k.color()).collect();
        colors.sort();
        colors.dedup();
        assert_eq!(colors.len(), PpeKind::ALL.len());
    }
}
