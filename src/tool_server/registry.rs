//! Tool catalog: aggregates the tools of every ready instance for one turn.
//!
//! Provides:
//! - Qualified names (`{instance_id}___{tool}`) so instances never collide
//! - Lookup from qualified name to the owning instance's facade address
//! - Splitting a qualified name back into instance id and bare tool name

use std::collections::HashMap;

use crate::store::{CatalogRow, Store, StoreError};

/// Separator between instance id and bare tool name.
pub const NAME_SEPARATOR: &str = "___";

/// Qualify a bare tool name with its owning instance.
pub fn qualify(instance_id: &str, tool: &str) -> String {
    format!("{instance_id}{NAME_SEPARATOR}{tool}")
}

/// Split `{instance_id}___{tool}` into its two halves.
///
/// Instance ids never contain the separator, so the first occurrence wins.
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    match name.split_once(NAME_SEPARATOR) {
        Some((instance, tool)) if !instance.is_empty() && !tool.is_empty() => {
            Some((instance, tool))
        }
        _ => None,
    }
}

// ─── ToolCatalog ─────────────────────────────────────────────────────────────

/// One invocable tool.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub qualified_name: String,
    pub instance_id: String,
    pub tool_name: String,
    /// Facade base URL of the owning instance.
    pub address: String,
    /// OAuth provider of the owning instance's image.
    pub provider: Option<String>,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Per-turn tool catalog. Transient: rebuilt from the store every turn.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    entries: Vec<CatalogEntry>,
    by_name: HashMap<String, usize>,
}

impl ToolCatalog {
    /// Build the catalog from every instance currently in state `ready`.
    ///
    /// Store failures propagate unchanged.
    pub fn build(store: &Store) -> Result<Self, StoreError> {
        let catalog = Self::from_rows(store.ready_catalog_rows()?);
        tracing::debug!(tools = catalog.len(), "built tool catalog");
        Ok(catalog)
    }

    pub fn from_rows(rows: Vec<CatalogRow>) -> Self {
        let mut catalog = Self::default();
        for row in rows {
            let qualified_name = qualify(&row.instance_id, &row.tool.name);
            catalog
                .by_name
                .insert(qualified_name.clone(), catalog.entries.len());
            catalog.entries.push(CatalogEntry {
                qualified_name,
                instance_id: row.instance_id,
                tool_name: row.tool.name,
                address: row.address,
                provider: row.oauth_provider,
                description: row.tool.description,
                input_schema: row.tool.input_schema,
            });
        }
        catalog
    }

    /// Look up a tool by its qualified name.
    pub fn get(&self, qualified_name: &str) -> Option<&CatalogEntry> {
        self.by_name.get(qualified_name).map(|&i| &self.entries[i])
    }

    /// All entries in catalog order.
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
