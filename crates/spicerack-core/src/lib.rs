//! Core domain model for Spicerack: formats, card lines, decks, archetypes.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "spicerack-core";

/// Sentinel archetype for decks no classification tier could label.
/// Stored as a real archetype row, never as a null reference.
pub const UNKNOWN_ARCHETYPE: &str = "Unknown";

/// Rank sentinel for untiered-but-qualifying results (historically "league 5-0").
/// Ranks 1..N mean standing in a bracketed elimination event.
pub const RANK_UNTIERED: u32 = 0;

/// The fixed set of constructed formats the pipeline tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Format {
    Standard,
    Pioneer,
    Modern,
    Legacy,
    Pauper,
    Vintage,
    Premodern,
}

impl Format {
    pub const ALL: [Format; 7] = [
        Format::Standard,
        Format::Pioneer,
        Format::Modern,
        Format::Legacy,
        Format::Pauper,
        Format::Vintage,
        Format::Premodern,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Standard => "Standard",
            Format::Pioneer => "Pioneer",
            Format::Modern => "Modern",
            Format::Legacy => "Legacy",
            Format::Pauper => "Pauper",
            Format::Vintage => "Vintage",
            Format::Premodern => "Premodern",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized format {0:?}")]
pub struct FormatParseError(pub String);

impl FromStr for Format {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Format::ALL
            .iter()
            .copied()
            .find(|f| f.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| FormatParseError(s.to_string()))
    }
}

/// One parsed `<count> <card name>` decklist line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardLine {
    pub count: u32,
    pub name: String,
}

impl CardLine {
    pub fn new(count: u32, name: impl Into<String>) -> Self {
        Self {
            count,
            name: name.into(),
        }
    }
}

impl fmt::Display for CardLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.count, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CardLineError {
    #[error("malformed card line {0:?}")]
    Malformed(String),
    #[error("zero-count card line {0:?}")]
    ZeroCount(String),
}

/// Parse newline-delimited `<count> <card name>` decklist text into typed lines.
///
/// Blank lines are skipped. Anything else that does not lead with a positive
/// integer count followed by a card name is rejected outright rather than
/// silently dropped.
pub fn parse_card_lines(text: &str) -> Result<Vec<CardLine>, CardLineError> {
    let mut lines = Vec::new();
    for raw in text.lines() {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((count_part, name_part)) = trimmed.split_once(char::is_whitespace) else {
            return Err(CardLineError::Malformed(trimmed.to_string()));
        };
        let count: u32 = count_part
            .parse()
            .map_err(|_| CardLineError::Malformed(trimmed.to_string()))?;
        if count == 0 {
            return Err(CardLineError::ZeroCount(trimmed.to_string()));
        }
        let name = name_part.trim();
        if name.is_empty() {
            return Err(CardLineError::Malformed(trimmed.to_string()));
        }
        lines.push(CardLine::new(count, name));
    }
    Ok(lines)
}

/// An archetype row: a named deck-strategy category, unique on (name, format).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archetype {
    pub id: i64,
    pub name: String,
    pub format: Format,
}

impl Archetype {
    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN_ARCHETYPE
    }
}

/// A persisted tournament deck record. Owned exclusively by storage; created
/// once per admitted scrape and mutated in place by classification and spice
/// recompute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeckRecord {
    pub id: i64,
    pub player_name: String,
    pub format: Format,
    pub event_name_raw: String,
    pub event_name: String,
    pub event_date: NaiveDate,
    pub rank: u32,
    pub archetype_id: i64,
    pub mainboard: Vec<CardLine>,
    pub sideboard: Vec<CardLine>,
    pub source_url: String,
    pub spice_count: u32,
    pub spice_cards: Vec<String>,
    /// sha256 hex of the raw decklist text as scraped; drives content identity.
    pub decklist_digest: String,
}

impl DeckRecord {
    /// Every card name in the deck, mainboard first, in list order.
    pub fn card_names(&self) -> impl Iterator<Item = &str> {
        self.mainboard
            .iter()
            .chain(self.sideboard.iter())
            .map(|line| line.name.as_str())
    }

    /// The deck rebuilt as `<count> <name>` text, mainboard then sideboard.
    /// This is the haystack the classifier tiers match card names against.
    pub fn decklist_text(&self) -> String {
        let mut out = String::new();
        for line in self.mainboard.iter().chain(self.sideboard.iter()) {
            out.push_str(&line.to_string());
            out.push('\n');
        }
        out
    }
}

/// Insert shape for a deck that has passed admission but not yet been stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeck {
    pub player_name: String,
    pub format: Format,
    pub event_name_raw: String,
    pub event_name: String,
    pub event_date: NaiveDate,
    pub rank: u32,
    pub archetype_id: i64,
    pub mainboard: Vec<CardLine>,
    pub sideboard: Vec<CardLine>,
    pub source_url: String,
    pub spice_count: u32,
    pub spice_cards: Vec<String>,
    pub decklist_digest: String,
}

/// Which classification tier produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassificationMethod {
    ExternalHint,
    HighConfidence,
    ManualRule,
    Aggressive,
    AiFallback,
    Default,
}

impl ClassificationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationMethod::ExternalHint => "ExternalHint",
            ClassificationMethod::HighConfidence => "HighConfidence",
            ClassificationMethod::ManualRule => "ManualRule",
            ClassificationMethod::Aggressive => "Aggressive",
            ClassificationMethod::AiFallback => "AiFallback",
            ClassificationMethod::Default => "Default",
        }
    }
}

impl fmt::Display for ClassificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one classification call. Ephemeral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub archetype: String,
    /// 0..1. Zero on the trusted tiers means "trusted but unverified",
    /// distinct from "no match".
    pub confidence: f64,
    pub method: ClassificationMethod,
}

impl ClassificationResult {
    pub fn unknown() -> Self {
        Self {
            archetype: UNKNOWN_ARCHETYPE.to_string(),
            confidence: 0.0,
            method: ClassificationMethod::Default,
        }
    }

    /// A Default-tier result is a shrug, not evidence; every other tier
    /// carries enough conviction to justify migrating a stored deck.
    pub fn is_confident(&self) -> bool {
        self.method != ClassificationMethod::Default
    }
}
