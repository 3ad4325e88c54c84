use crate::work_item::WorkItemId;

/// Prefix shared by every work item document.
pub const WORK_ITEM_PREFIX: &str = "workitems/";

/// The KV store key for a work item.
pub fn work_item_key(id: &WorkItemId) -> String {
    // Zero-pad the shard so an index's keys sort by shard number
    format!("{}{}/{:010}", WORK_ITEM_PREFIX, id.index, id.shard)
}

/// Exclusive-start and inclusive-end bounds for scanning work items after `after`.
pub fn work_item_scan_bounds(after: Option<&WorkItemId>) -> (Vec<u8>, Vec<u8>) {
    let start = match after {
        // Smallest key strictly greater than the last one returned
        Some(id) => {
            let mut k = work_item_key(id).into_bytes();
            k.push(0x00);
            k
        }
        None => WORK_ITEM_PREFIX.as_bytes().to_vec(),
    };
    let mut end = WORK_ITEM_PREFIX.as_bytes().to_vec();
    end.push(0xFF);
    (start, end)
}
