//! Gene id → symbol / Entrez id lookup

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Annotation attached to a single gene id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneAnnotation {
    pub symbol: Option<String>,
    pub entrez_id: Option<u64>,
}

/// Lookup table from gene id to [`GeneAnnotation`].
///
/// Several gene ids may share a symbol. Ids without an entry resolve to an
/// empty annotation.
#[derive(Debug, Clone, Default)]
pub struct AnnotationTable {
    entries: HashMap<String, GeneAnnotation>,
}

impl AnnotationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry; a repeated gene id keeps its first annotation
    pub fn insert(&mut self, gene_id: impl Into<String>, annotation: GeneAnnotation) {
        let gene_id = gene_id.into();
        if self.entries.contains_key(&gene_id) {
            log::debug!("Duplicate annotation for '{}' ignored", gene_id);
            return;
        }
        self.entries.insert(gene_id, annotation);
    }

    pub fn get(&self, gene_id: &str) -> Option<&GeneAnnotation> {
        self.entries.get(gene_id)
    }

    pub fn symbol(&self, gene_id: &str) -> Option<&str> {
        self.get(gene_id).and_then(|a| a.symbol.as_deref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, GeneAnnotation)> for AnnotationTable {
    fn from_iter<I: IntoIterator<Item = (String, GeneAnnotation)>>(iter: I) -> Self {
        let mut table = AnnotationTable::new();
        for (id, ann) in iter {
            table.insert(id, ann);
        }
        table
    }
}
