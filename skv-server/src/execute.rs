//! # Command Execution
//!
//! A parsed command applied to the store. Store-level refusals (budget,
//! absent key, present key) are protocol answers, not errors; `Err` is
//! reserved for genuine execution faults and becomes a `SERVER_ERROR`
//! line on the wire.

use skv_common::SkvResult;
use skv_store::Storage;

/// One executable client command.
///
/// Responses returned here carry no trailing terminator; the worker
/// appends the final `\r\n` before writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Insert or overwrite.
    Put { key: Vec<u8> },
    /// Insert only if the key is absent.
    Add { key: Vec<u8> },
    /// Overwrite only if the key is present.
    Replace { key: Vec<u8> },
    /// Look up a key.
    Get { key: Vec<u8> },
    /// Remove a key.
    Delete { key: Vec<u8> },
    /// Report store occupancy.
    Stats,
}

impl Command {
    /// Verb name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Put { .. } => "put",
            Command::Add { .. } => "add",
            Command::Replace { .. } => "replace",
            Command::Get { .. } => "get",
            Command::Delete { .. } => "delete",
            Command::Stats => "stats",
        }
    }

    /// Executes against the store. `arg` is the payload with the wire
    /// terminator already stripped; retrieval commands receive an empty
    /// slice.
    pub fn execute<S: Storage>(&self, store: &mut S, arg: &[u8]) -> SkvResult<Vec<u8>> {
        match self {
            Command::Put { key } => Ok(stored_line(store.put(key, arg))),
            Command::Add { key } => Ok(stored_line(store.put_if_absent(key, arg))),
            Command::Replace { key } => Ok(stored_line(store.set(key, arg))),
            Command::Get { key } => match store.get(key) {
                Some(value) => {
                    let mut out = Vec::with_capacity(value.len() + 24);
                    out.extend_from_slice(b"VALUE ");
                    out.extend_from_slice(value.len().to_string().as_bytes());
                    out.extend_from_slice(b"\r\n");
                    out.extend_from_slice(&value);
                    Ok(out)
                }
                None => Ok(b"NOT_FOUND".to_vec()),
            },
            Command::Delete { key } => {
                if store.delete(key) {
                    Ok(b"DELETED".to_vec())
                } else {
                    Ok(b"NOT_FOUND".to_vec())
                }
            }
            Command::Stats => {
                let out = format!(
                    "STAT items {}\r\nSTAT bytes {}\r\nSTAT limit {}\r\nEND",
                    store.len(),
                    store.used_bytes(),
                    store.max_bytes()
                );
                Ok(out.into_bytes())
            }
        }
    }
}

fn stored_line(applied: bool) -> Vec<u8> {
    if applied {
        b"STORED".to_vec()
    } else {
        b"NOT_STORED".to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skv_store::LruStore;

    #[test]
    fn storage_verbs_map_to_store_semantics() {
        let mut store = LruStore::new(1024);

        let put = Command::Put { key: b"k".to_vec() };
        assert_eq!(put.execute(&mut store, b"v1").unwrap(), b"STORED");

        let add = Command::Add { key: b"k".to_vec() };
        assert_eq!(add.execute(&mut store, b"v2").unwrap(), b"NOT_STORED");

        let replace = Command::Replace { key: b"k".to_vec() };
        assert_eq!(replace.execute(&mut store, b"v3").unwrap(), b"STORED");

        let get = Command::Get { key: b"k".to_vec() };
        assert_eq!(get.execute(&mut store, b"").unwrap(), b"VALUE 2\r\nv3");

        let delete = Command::Delete { key: b"k".to_vec() };
        assert_eq!(delete.execute(&mut store, b"").unwrap(), b"DELETED");
        assert_eq!(delete.execute(&mut store, b"").unwrap(), b"NOT_FOUND");
    }

    #[test]
    fn get_on_missing_key_reports_not_found() {
        let mut store = LruStore::new(1024);
        let get = Command::Get {
            key: b"ghost".to_vec(),
        };
        assert_eq!(get.execute(&mut store, b"").unwrap(), b"NOT_FOUND");
    }

    #[test]
    fn stats_reports_occupancy() {
        let mut store = LruStore::new(100);
        let put = Command::Put { key: b"k".to_vec() };
        put.execute(&mut store, b"value").unwrap();

        let stats = Command::Stats.execute(&mut store, b"").unwrap();
        let text = String::from_utf8(stats).unwrap();
        assert!(text.contains("STAT items 1"));
        assert!(text.contains("STAT bytes 6"));
        assert!(text.contains("STAT limit 100"));
        assert!(text.ends_with("END"));
    }

    #[test]
    fn oversized_put_reports_not_stored() {
        let mut store = LruStore::new(4);
        let put = Command::Put { key: b"k".to_vec() };
        assert_eq!(put.execute(&mut store, b"too-big").unwrap(), b"NOT_STORED");
    }
}
