use super::bulk::{request_body, BulkEntry};

/// Bulk entries waiting to be sent, bounded by a byte budget.
#[derive(Debug)]
pub struct Batch {
    entries: Vec<BulkEntry>,
    size: usize,
    max_size: usize,
}

impl Batch {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            size: 0,
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Applies a new byte budget to the following entries.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    /// Cumulative size of all entries in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `entry` could ever be sent, i.e. fits into an empty batch.
    pub fn accepts(&self, entry: &BulkEntry) -> bool {
        entry.size() <= self.max_size
    }

    /// Whether `entry` fits next to the current entries.
    pub fn fits(&self, entry: &BulkEntry) -> bool {
        self.size + entry.size() <= self.max_size
    }

    /// Appends `entry`. Callers check [`fits`](Self::fits) first; an entry
    /// that does not fit is handed back.
    pub fn push(&mut self, entry: BulkEntry) -> Result<(), BulkEntry> {
        if !self.fits(&entry) {
            return Err(entry);
        }
        self.size += entry.size();
        self.entries.push(entry);
        Ok(())
    }

    /// Empties the batch, returning its entries.
    pub fn take(&mut self) -> Vec<BulkEntry> {
        self.size = 0;
        std::mem::take(&mut self.entries)
    }

    pub fn body(&self) -> String {
        request_body(&self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    fn entry(id: &str, payload_bytes: usize) -> BulkEntry {
        let mut content = Map::new();
        content.insert("data".to_string(), Value::String("x".repeat(payload_bytes)));
        BulkEntry::index(id, content).unwrap()
    }

    #[test]
    fn test_batch_never_exceeds_max_size() {
        let mut batch = Batch::new(1_048_576);
        let mut sent = Vec::new();

        for i in 0..3 {
            let next = entry(&format!("doc-{}", i), 400 * 1024);
            if !batch.fits(&next) {
                sent.push(batch.take());
            }
            batch.push(next).unwrap();
            assert!(batch.size() <= batch.max_size());
        }
        sent.push(batch.take());

        let ids: Vec<Vec<&str>> = sent
            .iter()
            .map(|entries| entries.iter().map(BulkEntry::id).collect())
            .collect();
        assert_eq!(ids, vec![vec!["doc-0", "doc-1"], vec!["doc-2"]]);
        assert!(batch.is_empty());
        assert_eq!(batch.size(), 0);
    }

    #[test]
    fn test_oversized_entry_is_not_accepted() {
        let mut batch = Batch::new(100);
        let big = entry("big", 200);

        assert!(!batch.accepts(&big));
        assert!(batch.push(big).is_err());
        assert!(batch.is_empty());
    }

    #[test]
    fn test_body_concatenates_entries() {
        let mut batch = Batch::new(1024);
        batch.push(BulkEntry::delete("a").unwrap()).unwrap();
        batch.push(BulkEntry::delete("b").unwrap()).unwrap();

        assert_eq!(
            batch.body(),
            "{\"delete\":{\"_id\":\"a\"}}\n{\"delete\":{\"_id\":\"b\"}}\n"
        );
        assert_eq!(batch.body().len(), batch.size());
    }
}
