//! Error reports produced by the consistency checker and consumed here.
//!
//! The exporter only reacts to two kinds: failed resources are skipped in
//! their collection (and not rescued), damaged child collections are skipped
//! entirely so their documents fall through to the orphan scan.

use std::collections::HashSet;

use crate::{
    db::{CollectionId, DocId},
    uri::DbUri,
};

/// One error record from a prior consistency check.
#[derive(Clone, Debug, PartialEq, Eq, displaydoc::Display)]
#[non_exhaustive]
pub enum ConsistencyError {
    /// resource {doc_id} cannot be read: {message}
    ResourceAccessFailed {
        /// Id of the unreadable document.
        doc_id: DocId,
        /// Checker-supplied description.
        message: String,
    },
    /// child collection {uri} (id {collection_id}) is damaged: {message}
    ChildCollection {
        /// Id of the damaged collection.
        collection_id: CollectionId,
        /// Uri of the damaged collection.
        uri: DbUri,
        /// Checker-supplied description.
        message: String,
    },
    /// {message}
    Other {
        /// Checker-supplied description.
        message: String,
    },
}

/// Lookup view over an error list, precomputed once per export.
#[derive(Debug, Default)]
pub(crate) struct ErrorIndex {
    failed_docs: HashSet<DocId>,
    damaged_collections: HashSet<String>,
}

impl ErrorIndex {
    pub(crate) fn new(errors: &[ConsistencyError]) -> Self {
        let mut index = Self::default();
        for error in errors {
            match error {
                ConsistencyError::ResourceAccessFailed { doc_id, .. } => {
                    let _ = index.failed_docs.insert(*doc_id);
                }
                ConsistencyError::ChildCollection { uri, .. } => {
                    let _ = index.damaged_collections.insert(uri.as_str().to_string());
                }
                ConsistencyError::Other { .. } => {}
            }
        }
        index
    }

    pub(crate) fn is_doc_failed(&self, doc_id: DocId) -> bool {
        self.failed_docs.contains(&doc_id)
    }

    pub(crate) fn is_collection_damaged(&self, uri: &DbUri) -> bool {
        self.damaged_collections.contains(uri.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_index_lookups() {
        let errors = vec![
            ConsistencyError::ResourceAccessFailed {
                doc_id: DocId(4),
                message: "page checksum mismatch".to_string(),
            },
            ConsistencyError::ChildCollection {
                collection_id: CollectionId(2),
                uri: DbUri::new("/db/damaged"),
                message: "missing btree page".to_string(),
            },
            ConsistencyError::Other {
                message: "unrelated".to_string(),
            },
        ];
        let index = ErrorIndex::new(&errors);

        assert!(index.is_doc_failed(DocId(4)));
        assert!(!index.is_doc_failed(DocId(5)));
        assert!(index.is_collection_damaged(&DbUri::new("/db/damaged")));
        assert!(!index.is_collection_damaged(&DbUri::new("/db/ok")));
    }
}
