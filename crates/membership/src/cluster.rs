//! `cluster` describes members of the consensus store (dqlite) roster and the
//! client used to query and change it.
use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Role of a member in the consensus store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatastoreRole {
    /// Votes on every change. A majority of voters is a quorum.
    Voter,
    /// Replicates the log without voting, can be promoted to voter.
    StandBy,
    /// Known to the cluster but not replicating.
    Spare,
    /// Still joining the cluster.
    Pending,
    /// Any role this crate does not know about.
    Unknown,
}

impl DatastoreRole {
    /// The name the membership service uses for the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            DatastoreRole::Voter => "voter",
            DatastoreRole::StandBy => "stand-by",
            DatastoreRole::Spare => "spare",
            DatastoreRole::Pending => "PENDING",
            DatastoreRole::Unknown => "unknown",
        }
    }
}

impl From<&str> for DatastoreRole {
    fn from(role: &str) -> Self {
        match role {
            "voter" => DatastoreRole::Voter,
            "stand-by" => DatastoreRole::StandBy,
            "spare" => DatastoreRole::Spare,
            "PENDING" => DatastoreRole::Pending,
            _ => DatastoreRole::Unknown,
        }
    }
}

impl fmt::Display for DatastoreRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a node in the Kubernetes cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterRole {
    /// Runs the Kubernetes control plane and is a consensus store member.
    ControlPlane,
    /// Runs workloads only.
    Worker,
    /// Not known.
    Unknown,
}

/// A snapshot of one member of the consensus store roster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Member name, unique within the cluster
    pub name: String,
    /// `host:port` the member serves the cluster API on
    pub address: String,
    /// Role in the consensus store
    pub datastore_role: DatastoreRole,
    /// Role in the Kubernetes cluster
    pub cluster_role: ClusterRole,
}

impl ClusterMember {
    /// The host part of the member address.
    pub fn host(&self) -> String {
        if let Ok(addr) = self.address.parse::<SocketAddr>() {
            return addr.ip().to_string();
        }
        match self.address.rsplit_once(':') {
            Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']').to_string(),
            None => self.address.clone(),
        }
    }
}

/// Client of the consensus store membership service.
///
/// **Note**: the membership-changing calls of the service are not safe to run
/// concurrently. Callers serialize membership changes above this trait.
#[async_trait]
pub trait MembershipClient: Send + Sync {
    /// Lists all members of the cluster.
    async fn cluster_members(&self) -> anyhow::Result<Vec<ClusterMember>>;

    /// Fetches a single member by name.
    async fn cluster_member(&self, name: &str) -> anyhow::Result<ClusterMember>;

    /// Removes a member. `address` may be empty when the member can no longer
    /// be resolved, it is only used by the service when the name is unknown.
    async fn remove_cluster_member(&self, name: &str, address: &str, force: bool)
        -> anyhow::Result<()>;
}

/// Returns the member called `name` if it is a control-plane node.
///
/// Every consensus store member is a control-plane node, so the lookup goes
/// to the membership service and not to Kubernetes.
pub async fn control_plane_member(
    client: &dyn MembershipClient,
    name: &str,
) -> anyhow::Result<Option<ClusterMember>> {
    let members = client
        .cluster_members()
        .await
        .map_err(|e| anyhow::anyhow!("failed to get cluster members: {:#}", e))?;
    Ok(members
        .into_iter()
        .find(|m| m.name == name)
        .map(|m| ClusterMember {
            cluster_role: ClusterRole::ControlPlane,
            ..m
        }))
}

/// Joins a host and a port, bracketing IPv6 hosts.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{member, FakeMembership};

    #[test]
    fn roles_parse_from_service_strings() {
        assert_eq!(DatastoreRole::from("voter"), DatastoreRole::Voter);
        assert_eq!(DatastoreRole::from("stand-by"), DatastoreRole::StandBy);
        assert_eq!(DatastoreRole::from("spare"), DatastoreRole::Spare);
        assert_eq!(DatastoreRole::from("PENDING"), DatastoreRole::Pending);
        assert_eq!(DatastoreRole::from("pending"), DatastoreRole::Unknown);
        assert_eq!(DatastoreRole::from(""), DatastoreRole::Unknown);
    }

    #[test]
    fn member_host_strips_port() {
        let mut m = member("cp1", "10.0.0.1:6400", DatastoreRole::Voter);
        assert_eq!(m.host(), "10.0.0.1");
        m.address = "[fd00::1]:6400".to_string();
        assert_eq!(m.host(), "fd00::1");
        m.address = "cp1.internal:6400".to_string();
        assert_eq!(m.host(), "cp1.internal");
    }

    #[test]
    fn join_host_port_brackets_ipv6() {
        assert_eq!(join_host_port("10.0.0.1", 2379), "10.0.0.1:2379");
        assert_eq!(join_host_port("fd00::1", 2379), "[fd00::1]:2379");
    }

    #[tokio::test]
    async fn control_plane_lookup_finds_members_only() {
        let membership = FakeMembership::with_members(vec![
            member("cp1", "10.0.0.1:6400", DatastoreRole::Voter),
            member("cp2", "10.0.0.2:6400", DatastoreRole::StandBy),
        ]);

        let found = control_plane_member(&membership, "cp2").await.unwrap().unwrap();
        assert_eq!(found.cluster_role, ClusterRole::ControlPlane);
        assert_eq!(found.datastore_role, DatastoreRole::StandBy);
        assert!(control_plane_member(&membership, "worker1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn control_plane_lookup_propagates_errors() {
        let membership = FakeMembership::with_members(vec![]);
        membership.fail_list();
        let err = control_plane_member(&membership, "cp1").await.unwrap_err();
        assert!(err.to_string().contains("failed to get cluster members"));
    }
}
