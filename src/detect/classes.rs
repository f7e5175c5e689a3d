//! Class metadata table.
//!
//! Loaded from a JSON array; the array index is the network class id, the
//! record carries the upstream server id, display name, superclass and the
//! RGB annotation color.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassRecord {
    #[serde(rename = "serverId")]
    pub server_id: u32,
    pub name: String,
    pub superclass: String,
    /// RGB annotation color.
    pub color: [u8; 3],
}

/// Ordered class metadata; index equals network class id.
#[derive(Clone, Debug, Default)]
pub struct ClassTable {
    records: Vec<ClassRecord>,
}

impl ClassTable {
    pub fn new(records: Vec<ClassRecord>) -> Self {
        Self { records }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading class table {}", path.display()))?;
        let records: Vec<ClassRecord> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing class table {}", path.display()))?;
        Ok(Self { records })
    }

    pub fn get(&self, class_id: usize) -> Option<&ClassRecord> {
        self.records.get(class_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
