//! Checksum diff between the local cache and the remote listing

use std::collections::HashSet;

use super::models::{FetchOperations, ResourceMap};

/// Compare local and remote id→checksum maps.
///
/// - remote only: add
/// - both, local checksum non-empty and different: update
/// - local only: remove
///
/// A local record without a checksum was created locally and is left alone
/// when the server also knows it. Add/update follow remote order, remove
/// follows local order.
pub fn compute_needed_operations(local: &ResourceMap, remote: &ResourceMap) -> FetchOperations {
    let mut operations = FetchOperations::default();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queued: HashSet<&str> = HashSet::new();

    for (id, remote_record) in remote {
        match local.get(id) {
            Some(local_record) => {
                seen.insert(id.as_str());
                let checksum = local_record.checksum();
                if !checksum.is_empty()
                    && checksum != remote_record.checksum()
                    && queued.insert(id.as_str())
                {
                    operations.update.push(id.clone());
                }
            }
            None => {
                if queued.insert(id.as_str()) {
                    operations.add.push(id.clone());
                }
            }
        }
    }

    operations.remove = local
        .keys()
        .filter(|id| !seen.contains(id.as_str()))
        .cloned()
        .collect();

    operations
}

/// Split ids into order-preserving chunks of at most `chunk_size`
pub fn chunk_ids(ids: &[String], chunk_size: usize) -> Vec<Vec<String>> {
    ids.chunks(chunk_size.max(1)).map(<[String]>::to_vec).collect()
}
