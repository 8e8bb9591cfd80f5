//! Narrow CRUD boundary between the pipeline and whatever holds the decks.
//!
//! The pipeline only ever talks to a [`DeckStore`]; any backend offering these
//! operations with read-your-writes consistency will do. [`MemoryStore`] is the
//! reference implementation used by tests and the CLI.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use spicerack_core::{Archetype, DeckRecord, Format, NewDeck};

pub const CRATE_NAME: &str = "spicerack-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("archetype {id} not found")]
    ArchetypeNotFound { id: i64 },
    #[error("deck {id} not found")]
    DeckNotFound { id: i64 },
    #[error("archetype {name:?} already exists for {format}")]
    DuplicateArchetype { name: String, format: Format },
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Inclusive date range used for peer-population and identity queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// `date` plus/minus `days` calendar days on each side.
    pub fn around(date: NaiveDate, days: u64) -> Self {
        Self {
            start: date.checked_sub_days(Days::new(days)).unwrap_or(date),
            end: date.checked_add_days(Days::new(days)).unwrap_or(date),
        }
    }

    /// The `days`-day window ending at `end`.
    pub fn trailing(end: NaiveDate, days: u64) -> Self {
        Self {
            start: end.checked_sub_days(Days::new(days)).unwrap_or(end),
            end,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// A stored event as seen by the identity resolver: the normalized name plus
/// the date it was recorded under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub event_name: String,
    pub event_date: NaiveDate,
}

/// The complete set of operations the pipeline requires from storage.
#[async_trait]
pub trait DeckStore: Send + Sync {
    async fn find_archetype(
        &self,
        name: &str,
        format: Format,
    ) -> Result<Option<Archetype>, StorageError>;

    /// Insert a new (name, format) archetype row. Uniqueness on the pair is
    /// load-bearing; a duplicate insert is an error, not an upsert.
    async fn insert_archetype(&self, name: &str, format: Format) -> Result<i64, StorageError>;

    async fn find_all_archetypes(
        &self,
        format: Option<Format>,
    ) -> Result<Vec<Archetype>, StorageError>;

    async fn count_decks_by_archetype(&self, archetype_id: i64) -> Result<u64, StorageError>;

    async fn delete_archetype(&self, archetype_id: i64) -> Result<(), StorageError>;

    async fn insert_deck(&self, deck: NewDeck) -> Result<i64, StorageError>;

    async fn find_deck(&self, deck_id: i64) -> Result<Option<DeckRecord>, StorageError>;

    async fn delete_deck(&self, deck_id: i64) -> Result<(), StorageError>;

    async fn find_decks_by_archetype(
        &self,
        archetype_id: i64,
        window: Option<DateWindow>,
    ) -> Result<Vec<DeckRecord>, StorageError>;

    /// Check-then-write: implementations must not record a mutation when the
    /// deck already carries exactly these values. Overlapping passes rely on
    /// this instead of locking.
    async fn update_deck_classification(
        &self,
        deck_id: i64,
        archetype_id: i64,
        spice_count: u32,
        spice_cards: Vec<String>,
    ) -> Result<(), StorageError>;

    /// Move every deck referencing `from_archetype` onto `to_archetype`.
    /// Returns the number of decks moved.
    async fn reassign_decks(
        &self,
        from_archetype: i64,
        to_archetype: i64,
    ) -> Result<u64, StorageError>;

    async fn find_event_names(
        &self,
        format: Format,
        window: DateWindow,
    ) -> Result<Vec<StoredEvent>, StorageError>;

    async fn find_decks_by_player(
        &self,
        player_name: &str,
        format: Format,
        window: DateWindow,
    ) -> Result<Vec<DeckRecord>, StorageError>;

    /// Stable id-ordered page of all decks, for sequential batch passes.
    async fn list_decks_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DeckRecord>, StorageError>;
}

/// Find the (name, format) archetype row, creating it lazily on first use.
pub async fn ensure_archetype(
    store: &dyn DeckStore,
    name: &str,
    format: Format,
) -> Result<Archetype, StorageError> {
    if let Some(existing) = store.find_archetype(name, format).await? {
        return Ok(existing);
    }
    let id = store.insert_archetype(name, format).await?;
    Ok(Archetype {
        id,
        name: name.to_string(),
        format,
    })
}

#[derive(Debug, Default)]
struct Tables {
    archetypes: BTreeMap<i64, Archetype>,
    decks: BTreeMap<i64, DeckRecord>,
    next_archetype_id: i64,
    next_deck_id: i64,
    mutations: u64,
}

/// In-memory [`DeckStore`] with a mutation counter, so tests can assert that
/// a repeated pass touched nothing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of state-changing writes applied so far.
    pub async fn mutation_count(&self) -> u64 {
        self.tables.lock().await.mutations
    }

    /// All decks in id order. Test/CLI convenience, not part of the contract.
    pub async fn snapshot_decks(&self) -> Vec<DeckRecord> {
        self.tables.lock().await.decks.values().cloned().collect()
    }
}

#[async_trait]
impl DeckStore for MemoryStore {
    async fn find_archetype(
        &self,
        name: &str,
        format: Format,
    ) -> Result<Option<Archetype>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .archetypes
            .values()
            .find(|a| a.format == format && a.name == name)
            .cloned())
    }

    async fn insert_archetype(&self, name: &str, format: Format) -> Result<i64, StorageError> {
        let mut tables = self.tables.lock().await;
        if tables
            .archetypes
            .values()
            .any(|a| a.format == format && a.name == name)
        {
            return Err(StorageError::DuplicateArchetype {
                name: name.to_string(),
                format,
            });
        }
        tables.next_archetype_id += 1;
        let id = tables.next_archetype_id;
        tables.archetypes.insert(
            id,
            Archetype {
                id,
                name: name.to_string(),
                format,
            },
        );
        tables.mutations += 1;
        debug!(archetype = name, %format, id, "inserted archetype");
        Ok(id)
    }

    async fn find_all_archetypes(
        &self,
        format: Option<Format>,
    ) -> Result<Vec<Archetype>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .archetypes
            .values()
            .filter(|a| format.is_none_or(|f| a.format == f))
            .cloned()
            .collect())
    }

    async fn count_decks_by_archetype(&self, archetype_id: i64) -> Result<u64, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .decks
            .values()
            .filter(|d| d.archetype_id == archetype_id)
            .count() as u64)
    }

    async fn delete_archetype(&self, archetype_id: i64) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        if tables.archetypes.remove(&archetype_id).is_none() {
            return Err(StorageError::ArchetypeNotFound { id: archetype_id });
        }
        tables.mutations += 1;
        debug!(archetype_id, "deleted archetype");
        Ok(())
    }

    async fn insert_deck(&self, deck: NewDeck) -> Result<i64, StorageError> {
        let mut tables = self.tables.lock().await;
        if !tables.archetypes.contains_key(&deck.archetype_id) {
            return Err(StorageError::ArchetypeNotFound {
                id: deck.archetype_id,
            });
        }
        tables.next_deck_id += 1;
        let id = tables.next_deck_id;
        tables.decks.insert(
            id,
            DeckRecord {
                id,
                player_name: deck.player_name,
                format: deck.format,
                event_name_raw: deck.event_name_raw,
                event_name: deck.event_name,
                event_date: deck.event_date,
                rank: deck.rank,
                archetype_id: deck.archetype_id,
                mainboard: deck.mainboard,
                sideboard: deck.sideboard,
                source_url: deck.source_url,
                spice_count: deck.spice_count,
                spice_cards: deck.spice_cards,
                decklist_digest: deck.decklist_digest,
            },
        );
        tables.mutations += 1;
        debug!(deck_id = id, "inserted deck");
        Ok(id)
    }

    async fn find_deck(&self, deck_id: i64) -> Result<Option<DeckRecord>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables.decks.get(&deck_id).cloned())
    }

    async fn delete_deck(&self, deck_id: i64) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        if tables.decks.remove(&deck_id).is_none() {
            return Err(StorageError::DeckNotFound { id: deck_id });
        }
        tables.mutations += 1;
        debug!(deck_id, "deleted deck");
        Ok(())
    }

    async fn find_decks_by_archetype(
        &self,
        archetype_id: i64,
        window: Option<DateWindow>,
    ) -> Result<Vec<DeckRecord>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .decks
            .values()
            .filter(|d| d.archetype_id == archetype_id)
            .filter(|d| window.is_none_or(|w| w.contains(d.event_date)))
            .cloned()
            .collect())
    }

    async fn update_deck_classification(
        &self,
        deck_id: i64,
        archetype_id: i64,
        spice_count: u32,
        spice_cards: Vec<String>,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        if !tables.archetypes.contains_key(&archetype_id) {
            return Err(StorageError::ArchetypeNotFound { id: archetype_id });
        }
        let deck = tables
            .decks
            .get_mut(&deck_id)
            .ok_or(StorageError::DeckNotFound { id: deck_id })?;
        if deck.archetype_id == archetype_id
            && deck.spice_count == spice_count
            && deck.spice_cards == spice_cards
        {
            return Ok(());
        }
        deck.archetype_id = archetype_id;
        deck.spice_count = spice_count;
        deck.spice_cards = spice_cards;
        tables.mutations += 1;
        debug!(deck_id, archetype_id, spice_count, "updated deck classification");
        Ok(())
    }

    async fn reassign_decks(
        &self,
        from_archetype: i64,
        to_archetype: i64,
    ) -> Result<u64, StorageError> {
        let mut tables = self.tables.lock().await;
        if !tables.archetypes.contains_key(&to_archetype) {
            return Err(StorageError::ArchetypeNotFound { id: to_archetype });
        }
        let mut moved = 0u64;
        for deck in tables.decks.values_mut() {
            if deck.archetype_id == from_archetype {
                deck.archetype_id = to_archetype;
                moved += 1;
            }
        }
        if moved > 0 {
            tables.mutations += 1;
            debug!(from_archetype, to_archetype, moved, "reassigned decks");
        }
        Ok(moved)
    }

    async fn find_event_names(
        &self,
        format: Format,
        window: DateWindow,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        let tables = self.tables.lock().await;
        let mut events: Vec<StoredEvent> = tables
            .decks
            .values()
            .filter(|d| d.format == format && window.contains(d.event_date))
            .map(|d| StoredEvent {
                event_name: d.event_name.clone(),
                event_date: d.event_date,
            })
            .collect();
        events.sort_by(|a, b| (&a.event_name, a.event_date).cmp(&(&b.event_name, b.event_date)));
        events.dedup();
        Ok(events)
    }

    async fn find_decks_by_player(
        &self,
        player_name: &str,
        format: Format,
        window: DateWindow,
    ) -> Result<Vec<DeckRecord>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .decks
            .values()
            .filter(|d| {
                d.format == format
                    && d.player_name == player_name
                    && window.contains(d.event_date)
            })
            .cloned()
            .collect())
    }

    async fn list_decks_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DeckRecord>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .decks
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}
