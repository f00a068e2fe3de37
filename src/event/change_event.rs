use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Summary of the table/bean mutations from one committed transaction, broadcast to peers so
/// they can invalidate their local bean cache, query cache, and search index.
///
/// Immutable after `build()`. A transaction that produced no observable changes must not
/// produce an event at all; the builder enforces this.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    server_name: String,
    full_invalidate: bool,
    table_mods: HashMap<String, TableMod>,
    bean_deltas: Vec<BeanDelta>,
}

/// Per-table insert/update/delete counts for one transaction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TableMod {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

/// Optional fine-grained delta naming a specific bean, for caches that can invalidate
/// per-entry instead of per-table.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BeanDelta {
    pub entity_type: String,
    pub id: String,
    pub kind: ChangeKind,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ChangeKind {
    Inserted,
    Updated,
    Deleted,
}

#[derive(Debug, thiserror::Error)]
#[error("change event has no table mods, no bean deltas and is not a full invalidate")]
pub struct EmptyChangeEvent;

impl ChangeEvent {
    /// Fallback event instructing a peer to discard all cached state for `server_name`
    /// rather than apply incremental deltas.
    pub fn full_invalidate(server_name: impl Into<String>) -> Self {
        ChangeEvent {
            server_name: server_name.into(),
            full_invalidate: true,
            table_mods: HashMap::new(),
            bean_deltas: Vec::new(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn is_full_invalidate(&self) -> bool {
        self.full_invalidate
    }

    pub fn table_mods(&self) -> &HashMap<String, TableMod> {
        &self.table_mods
    }

    pub fn bean_deltas(&self) -> &[BeanDelta] {
        &self.bean_deltas
    }
}

/// Accumulates mutations over the course of a transaction. Repeated touches of the same
/// table sum into one `TableMod`.
pub struct ChangeEventBuilder {
    server_name: String,
    full_invalidate: bool,
    table_mods: HashMap<String, TableMod>,
    bean_deltas: Vec<BeanDelta>,
}

impl ChangeEventBuilder {
    pub fn new(server_name: impl Into<String>) -> Self {
        ChangeEventBuilder {
            server_name: server_name.into(),
            full_invalidate: false,
            table_mods: HashMap::new(),
            bean_deltas: Vec::new(),
        }
    }

    pub fn table(mut self, table: impl Into<String>, inserted: u64, updated: u64, deleted: u64) -> Self {
        let entry = self.table_mods.entry(table.into()).or_default();
        entry.inserted += inserted;
        entry.updated += updated;
        entry.deleted += deleted;
        self
    }

    pub fn bean(mut self, entity_type: impl Into<String>, id: impl Into<String>, kind: ChangeKind) -> Self {
        self.bean_deltas.push(BeanDelta {
            entity_type: entity_type.into(),
            id: id.into(),
            kind,
        });
        self
    }

    pub fn full_invalidate(mut self) -> Self {
        self.full_invalidate = true;
        self
    }

    pub fn build(self) -> Result<ChangeEvent, EmptyChangeEvent> {
        if !self.full_invalidate && self.table_mods.is_empty() && self.bean_deltas.is_empty() {
            return Err(EmptyChangeEvent);
        }

        Ok(ChangeEvent {
            server_name: self.server_name,
            full_invalidate: self.full_invalidate,
            table_mods: self.table_mods,
            bean_deltas: self.bean_deltas,
        })
    }
}
