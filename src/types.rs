//! WIREDKV - Core Type Definitions
//! Defines the entity, table and segment values exchanged with the engine.

use std::collections::BTreeMap;

use crate::error::{Result, WiredError};

/// Key type for entities.
/// Using Vec<u8> allows arbitrary binary keys.
pub type Key = Vec<u8>;

/// Value type for entities.
pub type Value = Vec<u8>;

/// Longest accepted segment key (it doubles as a file name).
pub const MAX_SEGMENT_KEY_LEN: usize = 200;
/// Longest accepted table name.
pub const MAX_TABLE_NAME_LEN: usize = 64 * 1024;
/// Longest accepted entity key.
pub const MAX_KEY_LEN: usize = 64 * 1024;
/// Largest accepted entity value.
pub const MAX_VALUE_LEN: usize = 16 * 1024 * 1024;
/// Largest accepted metadata blob.
pub const MAX_METADATA_LEN: usize = 64 * 1024;

/// A single key/value record stored within a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub key: Key,
    pub value: Value,
    pub metadata: Option<Vec<u8>>,
}

impl Entity {
    /// Create an entity without metadata.
    pub fn new(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            metadata: None,
        }
    }

    /// Attach opaque metadata to the entity.
    pub fn with_metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }
}

/// A named, key-unique collection of entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    pub entities: BTreeMap<Key, Entity>,
}

impl Table {
    /// Create an empty table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entities: BTreeMap::new(),
        }
    }

    /// Insert an entity, replacing any entity with the same key.
    pub fn insert(&mut self, entity: Entity) {
        self.entities.insert(entity.key.clone(), entity);
    }

    /// Builder-style insert.
    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.insert(entity);
        self
    }

    /// Look up an entity by key.
    pub fn get(&self, key: &[u8]) -> Option<&Entity> {
        self.entities.get(key)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// The set of tables held by one segment, keyed by table name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tables {
    tables: BTreeMap<String, Table>,
}

impl Tables {
    /// Create an empty table set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a whole table, replacing any table with the same name.
    pub fn insert_table(&mut self, table: Table) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Builder-style table insert.
    pub fn with_table(mut self, table: Table) -> Self {
        self.insert_table(table);
        self
    }

    /// Insert one entity into `table`, creating the table if needed.
    pub fn insert_entity(&mut self, table: &str, entity: Entity) {
        self.tables
            .entry(table.to_string())
            .or_insert_with(|| Table::new(table))
            .insert(entity);
    }

    /// Look up a table by name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Iterate over tables in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Total number of entities across all tables.
    pub fn entity_count(&self) -> usize {
        self.tables.values().map(Table::len).sum()
    }

    /// Parse the `{"table": {"key": "value"}}` document shape used by
    /// the HTTP layer.
    pub fn from_json(input: &str) -> Result<Self> {
        let doc: BTreeMap<String, BTreeMap<String, String>> = serde_json::from_str(input)
            .map_err(|e| WiredError::MalformedRequest(format!("invalid tables document: {}", e)))?;

        let mut tables = Tables::new();
        for (name, entities) in doc {
            let mut table = Table::new(name);
            for (key, value) in entities {
                table.insert(Entity::new(key.into_bytes(), value.into_bytes()));
            }
            tables.insert_table(table);
        }
        Ok(tables)
    }

    /// Render the tables in the same document shape as [`Tables::from_json`].
    /// Non UTF-8 bytes are replaced lossily.
    pub fn to_json(&self) -> Result<String> {
        let doc: BTreeMap<&str, BTreeMap<String, String>> = self
            .tables
            .iter()
            .map(|(name, table)| {
                let entities = table
                    .entities
                    .values()
                    .map(|e| {
                        (
                            String::from_utf8_lossy(&e.key).into_owned(),
                            String::from_utf8_lossy(&e.value).into_owned(),
                        )
                    })
                    .collect();
                (name.as_str(), entities)
            })
            .collect();
        serde_json::to_string(&doc).map_err(|e| WiredError::Encode(e.to_string()))
    }
}

/// A segment value: the tables to persist under (or fetched from) a key.
///
/// Building a `Segment` performs no I/O; it is handed to
/// `SegmentStore::put_segment` to be appended to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    key: String,
    tables: Tables,
    initial_offset: u64,
}

impl Segment {
    /// Validate and build a segment.
    ///
    /// `initial_offset` is the committed length the caller expects the
    /// segment file to have when the segment is put. `0` appends
    /// unconditionally.
    pub fn new(key: impl Into<String>, tables: Tables, initial_offset: u64) -> Result<Self> {
        let key = key.into();
        validate_segment_key(&key)?;
        validate_tables(&tables)?;
        Ok(Self {
            key,
            tables,
            initial_offset,
        })
    }

    /// Build a segment from data read back from disk (already validated).
    pub(crate) fn from_parts(key: String, tables: Tables, initial_offset: u64) -> Self {
        Self {
            key,
            tables,
            initial_offset,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn initial_offset(&self) -> u64 {
        self.initial_offset
    }

    /// Consume the segment, keeping only its tables.
    pub fn into_tables(self) -> Tables {
        self.tables
    }
}

/// Check that a segment key is usable as a file name.
pub fn validate_segment_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(WiredError::MalformedRequest("segment key is empty".into()));
    }
    if key.len() > MAX_SEGMENT_KEY_LEN {
        return Err(WiredError::MalformedRequest(format!(
            "segment key longer than {} bytes",
            MAX_SEGMENT_KEY_LEN
        )));
    }
    if key == "." || key == ".." || key.contains(&['/', '\\', '\0'][..]) {
        return Err(WiredError::MalformedRequest(format!(
            "segment key '{}' is not a valid file name",
            key
        )));
    }
    Ok(())
}

fn validate_tables(tables: &Tables) -> Result<()> {
    for table in tables.iter() {
        if table.name.is_empty() {
            return Err(WiredError::MalformedRequest("table name is empty".into()));
        }
        if table.name.len() > MAX_TABLE_NAME_LEN {
            return Err(WiredError::MalformedRequest(format!(
                "table name longer than {} bytes",
                MAX_TABLE_NAME_LEN
            )));
        }
        for (key, entity) in &table.entities {
            if *key != entity.key {
                return Err(WiredError::MalformedRequest(format!(
                    "table '{}' holds an entity under a foreign key",
                    table.name
                )));
            }
            if key.len() > MAX_KEY_LEN {
                return Err(WiredError::MalformedRequest(format!(
                    "entity key in table '{}' longer than {} bytes",
                    table.name, MAX_KEY_LEN
                )));
            }
            if entity.value.len() > MAX_VALUE_LEN {
                return Err(WiredError::MalformedRequest(format!(
                    "entity value in table '{}' larger than {} bytes",
                    table.name, MAX_VALUE_LEN
                )));
            }
            if entity.metadata.as_ref().map_or(0, Vec::len) > MAX_METADATA_LEN {
                return Err(WiredError::MalformedRequest(format!(
                    "entity metadata in table '{}' larger than {} bytes",
                    table.name, MAX_METADATA_LEN
                )));
            }
        }
    }
    Ok(())
}
