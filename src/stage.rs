//! The V-Model stage ladder.
//!
//! This module provides:
//! - `Stage` enum representing one phase of the delivery pipeline
//! - The total progression order (`Stage::ALL`, `next`, `is_last`)
//! - String conversions used by the CLI and the persisted state file

use serde::{Deserialize, Serialize};

/// One phase of the V-Model delivery pipeline.
///
/// The declaration order *is* the progression order: `Requirements` runs
/// first, `Integration` last. `Ord` follows declaration order, so
/// `history[i].stage <= history[i + 1].stage` holds for any run that never
/// re-entered a blocked stage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Requirements,
    Architecture,
    Development,
    Qa,
    Integration,
}

impl Stage {
    /// All stages in progression order.
    pub const ALL: [Stage; 5] = [
        Stage::Requirements,
        Stage::Architecture,
        Stage::Development,
        Stage::Qa,
        Stage::Integration,
    ];

    /// The stage a fresh run starts at.
    pub fn first() -> Stage {
        Stage::Requirements
    }

    /// The stage that follows this one, or `None` after `Integration`.
    pub fn next(&self) -> Option<Stage> {
        let idx = Stage::ALL.iter().position(|s| s == self)?;
        Stage::ALL.get(idx + 1).copied()
    }

    /// Whether this is the final stage of the pipeline.
    pub fn is_last(&self) -> bool {
        *self == Stage::Integration
    }

    /// Zero-based position in the progression order.
    pub fn index(&self) -> usize {
        Stage::ALL
            .iter()
            .position(|s| s == self)
            .expect("every Stage variant appears in Stage::ALL")
    }

    /// The kebab/snake name used on the CLI and in config keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Requirements => "requirements",
            Stage::Architecture => "architecture",
            Stage::Development => "development",
            Stage::Qa => "qa",
            Stage::Integration => "integration",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "requirements" => Ok(Stage::Requirements),
            "architecture" => Ok(Stage::Architecture),
            "development" => Ok(Stage::Development),
            "qa" => Ok(Stage::Qa),
            "integration" => Ok(Stage::Integration),
            _ => anyhow::bail!(
                "Invalid stage '{}'. Valid values: requirements, architecture, development, qa, integration",
                s
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progression_order() {
        assert_eq!(Stage::first(), Stage::Requirements);
        assert_eq!(Stage::Requirements.next(), Some(Stage::Architecture));
        assert_eq!(Stage::Architecture.next(), Some(Stage::Development));
        assert_eq!(Stage::Development.next(), Some(Stage::Qa));
        assert_eq!(Stage::Qa.next(), Some(Stage::Integration));
        assert_eq!(Stage::Integration.next(), None);
    }

    #[test]
    fn test_is_last() {
        assert!(Stage::Integration.is_last());
        assert!(!Stage::Qa.is_last());
    }

    #[test]
    fn test_ord_matches_progression() {
        for pair in Stage::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_from_str_roundtrip() {
        for stage in Stage::ALL {
            let parsed: Stage = stage.as_str().parse().unwrap();
            assert_eq!(parsed, stage);
        }
    }

    #[test]
    fn test_from_str_case_insensitive() {
        assert_eq!("QA".parse::<Stage>().unwrap(), Stage::Qa);
        assert_eq!("Requirements".parse::<Stage>().unwrap(), Stage::Requirements);
    }

    #[test]
    fn test_from_str_invalid() {
        let err = "deployment".parse::<Stage>().unwrap_err();
        assert!(err.to_string().contains("Invalid stage"));
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&Stage::Qa).unwrap();
        assert_eq!(json, "\"qa\"");
        let parsed: Stage = serde_json::from_str("\"development\"").unwrap();
        assert_eq!(parsed, Stage::Development);
    }
}
