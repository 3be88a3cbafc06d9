//! Quorum safety checks applied before a datastore member is removed.
use crate::config::DatastoreKind;

/// The smallest embedded datastore that may lose a member.
///
/// With two members left, removing one of them drops the datastore to a
/// single voter while the removal itself still needs agreement from both.
pub const MIN_REMOVABLE_MEMBERS: usize = 3;

/// Reports whether a datastore member may be removed from a datastore that
/// currently has `member_count` members.
///
/// This is advisory only. It does not lock anything, it just declines to
/// start removals that could leave the datastore without quorum. External
/// datastores are owned by the administrator and are never gated.
pub fn can_remove_datastore_member(member_count: usize, kind: DatastoreKind) -> bool {
    match kind {
        DatastoreKind::Embedded => member_count >= MIN_REMOVABLE_MEMBERS,
        DatastoreKind::External => true,
    }
}
