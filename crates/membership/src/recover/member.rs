//! The consensus store roster as written to `cluster.yaml`, and the rules an
//! edited roster has to follow.
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role of a consensus store member in `cluster.yaml`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DqliteRole {
    /// Voting member. A majority of voters is a quorum.
    #[serde(rename = "voter")]
    Voter,
    /// Non-voting member that can be promoted to voter.
    #[serde(rename = "stand-by")]
    StandBy,
    /// Not a member of the database.
    #[serde(rename = "spare")]
    Spare,
}

impl DqliteRole {
    /// The numeric role used in the local `info.yaml`.
    pub fn code(&self) -> u8 {
        match self {
            DqliteRole::Voter => 0,
            DqliteRole::StandBy => 1,
            DqliteRole::Spare => 2,
        }
    }
}

impl fmt::Display for DqliteRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DqliteRole::Voter => "voter",
            DqliteRole::StandBy => "stand-by",
            DqliteRole::Spare => "spare",
        };
        f.write_str(name)
    }
}

/// One entry of `cluster.yaml`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DqliteMemberRecord {
    /// Consensus store id
    pub id: u64,
    /// `ip:port` the member listens on
    pub address: String,
    /// Role of the member
    pub role: DqliteRole,
    /// Member name
    pub name: String,
}

/// Reasons an edited roster is refused.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Members were added or removed
    #[error("the number of members changed from {old} to {new}")]
    MemberCountChanged {
        /// Members before the edit
        old: usize,
        /// Members after the edit
        new: usize,
    },
    /// A member has an id that was not in the original roster
    #[error("member {name} has unknown ID {id}, member IDs cannot change")]
    UnknownId {
        /// The unknown id
        id: u64,
        /// Name of the member carrying it
        name: String,
    },
    /// Two members carry the same id
    #[error("ID {0} is used by more than one member")]
    DuplicateId(u64),
    /// A member was renamed
    #[error("name of member {id} changed from {old} to {new}, member names cannot change")]
    NameChanged {
        /// Id of the renamed member
        id: u64,
        /// Name before the edit
        old: String,
        /// Name after the edit
        new: String,
    },
    /// An address is not `ip:port`
    #[error("invalid address {address:?} for member {name}: {reason}")]
    InvalidAddress {
        /// Member name
        name: String,
        /// The address as written
        address: String,
        /// Parser message
        reason: String,
    },
    /// Two members share an address
    #[error("members {first} and {second} share address {address}")]
    DuplicateAddress {
        /// The shared address
        address: String,
        /// First member using it
        first: String,
        /// Second member using it
        second: String,
    },
    /// Nobody is left to vote
    #[error("at least one member must be a voter")]
    NoVoter,
    /// The edit changed nothing
    #[error("no changes were made to the cluster members")]
    NoChanges,
}

/// Checks that `new` describes the same members as `old`.
///
/// The member count, every id and every name have to stay the same. Roles
/// and addresses may change, as long as every address is a valid `ip:port`
/// used by a single member and at least one member is a voter. Members are
/// matched by id, their order in the list does not matter.
pub fn validate_member_layout(
    old: &[DqliteMemberRecord],
    new: &[DqliteMemberRecord],
) -> Result<(), ValidationError> {
    if old.len() != new.len() {
        return Err(ValidationError::MemberCountChanged {
            old: old.len(),
            new: new.len(),
        });
    }

    let old_by_id: HashMap<u64, &DqliteMemberRecord> = old.iter().map(|m| (m.id, m)).collect();
    let mut seen_ids = HashSet::new();
    let mut addresses: HashMap<SocketAddr, &str> = HashMap::new();

    for member in new {
        let original = old_by_id
            .get(&member.id)
            .ok_or_else(|| ValidationError::UnknownId {
                id: member.id,
                name: member.name.clone(),
            })?;
        if !seen_ids.insert(member.id) {
            return Err(ValidationError::DuplicateId(member.id));
        }
        if original.name != member.name {
            return Err(ValidationError::NameChanged {
                id: member.id,
                old: original.name.clone(),
                new: member.name.clone(),
            });
        }

        let address: SocketAddr =
            member
                .address
                .parse()
                .map_err(|e: std::net::AddrParseError| ValidationError::InvalidAddress {
                    name: member.name.clone(),
                    address: member.address.clone(),
                    reason: e.to_string(),
                })?;
        if let Some(first) = addresses.insert(address, member.name.as_str()) {
            return Err(ValidationError::DuplicateAddress {
                address: member.address.clone(),
                first: first.to_string(),
                second: member.name.clone(),
            });
        }
    }

    if !new.iter().any(|m| m.role == DqliteRole::Voter) {
        return Err(ValidationError::NoVoter);
    }
    Ok(())
}

/// Checks an operator's edit of the roster: the rules of
/// [`validate_member_layout`], and the edit must change something.
pub fn validate_member_changes(
    old: &[DqliteMemberRecord],
    new: &[DqliteMemberRecord],
) -> Result<(), ValidationError> {
    validate_member_layout(old, new)?;
    let unchanged = new
        .iter()
        .all(|m| old.iter().any(|o| o.id == m.id && o == m));
    if unchanged {
        return Err(ValidationError::NoChanges);
    }
    Ok(())
}
