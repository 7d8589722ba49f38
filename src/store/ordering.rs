//! Balance update ordering
//!
//! Every transaction that updates two account rows locks the smaller id first.
//! Two transfers over the same pair (A→B and B→A) then wait on the same row
//! instead of each holding the row the other needs.

/// Which side of a transfer is updated first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrder {
    SourceFirst,
    DestinationFirst,
}

/// Decide the update order for `(source, destination)`.
///
/// Depends only on the two ids, never on which one is the source.
#[inline]
pub fn update_order(source_id: i64, destination_id: i64) -> UpdateOrder {
    if source_id < destination_id {
        UpdateOrder::SourceFirst
    } else {
        UpdateOrder::DestinationFirst
    }
}
