#![allow(dead_code)]
//! Fakes of the external systems for the end-to-end scenarios.
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::pin_mut;
use http::{Request as HttpRequest, Response as HttpResponse, StatusCode};
use hyper::Body;
use membership::cluster::{ClusterMember, ClusterRole, DatastoreRole, MembershipClient};
use membership::config::Config;
use membership::datastore::{DatastoreClient, DatastoreConnector};
use membership::node::NodeApi;
use membership::recover::{DqliteMemberRecord, DqliteRole, Editor, RecoveryEngine};
use tower_test::mock;

#[derive(Clone, Default)]
pub struct Calls(Arc<Mutex<Vec<String>>>);

impl Calls {
    pub fn record(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.all()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }
}

pub fn local_config() -> Config {
    Config {
        node_name: "cp1".to_string(),
        state_dir: PathBuf::from("/var/snap/k8s/common/var/lib/k8sd/state"),
        pending_poll_interval: Duration::from_millis(1),
        pending_poll_attempts: 3,
        final_removal_timeout: Duration::from_secs(5),
        owner: None,
    }
}

pub fn control_plane(name: &str, ip: &str) -> ClusterMember {
    ClusterMember {
        name: name.to_string(),
        address: format!("{}:6400", ip),
        datastore_role: DatastoreRole::Voter,
        cluster_role: ClusterRole::ControlPlane,
    }
}

pub struct Roster {
    members: Mutex<Vec<ClusterMember>>,
    calls: Calls,
    fail_remove: bool,
}

impl Roster {
    pub fn new(calls: &Calls, members: Vec<ClusterMember>) -> Self {
        Roster {
            members: Mutex::new(members),
            calls: calls.clone(),
            fail_remove: false,
        }
    }

    pub fn failing_removal(mut self) -> Self {
        self.fail_remove = true;
        self
    }
}

#[async_trait]
impl MembershipClient for Roster {
    async fn cluster_members(&self) -> anyhow::Result<Vec<ClusterMember>> {
        self.calls.record("cluster.members");
        Ok(self.members.lock().unwrap().clone())
    }

    async fn cluster_member(&self, name: &str) -> anyhow::Result<ClusterMember> {
        self.calls.record(format!("cluster.member {}", name));
        let members = self.members.lock().unwrap();
        members
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("member {} not found", name))
    }

    async fn remove_cluster_member(
        &self,
        name: &str,
        _address: &str,
        force: bool,
    ) -> anyhow::Result<()> {
        self.calls.record(format!("cluster.remove {} force={}", name, force));
        if self.fail_remove {
            anyhow::bail!("dqlite: no leader");
        }
        self.members.lock().unwrap().retain(|m| m.name != name);
        Ok(())
    }
}

pub struct Etcd {
    calls: Calls,
    unreachable: bool,
}

impl Etcd {
    pub fn new(calls: &Calls) -> Self {
        Etcd {
            calls: calls.clone(),
            unreachable: false,
        }
    }

    pub fn unreachable(calls: &Calls) -> Self {
        Etcd {
            calls: calls.clone(),
            unreachable: true,
        }
    }
}

#[async_trait]
impl DatastoreConnector for Etcd {
    async fn connect(&self, endpoints: &[String]) -> anyhow::Result<Box<dyn DatastoreClient>> {
        self.calls.record(format!("etcd.connect {}", endpoints.join(",")));
        if self.unreachable {
            anyhow::bail!("context deadline exceeded");
        }
        Ok(Box::new(EtcdClient {
            calls: self.calls.clone(),
        }))
    }
}

struct EtcdClient {
    calls: Calls,
}

#[async_trait]
impl DatastoreClient for EtcdClient {
    async fn remove_node_by_name(&self, name: &str) -> anyhow::Result<()> {
        self.calls.record(format!("etcd.remove {}", name));
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct Nodes {
    calls: Calls,
}

impl Nodes {
    pub fn new(calls: &Calls) -> Self {
        Nodes {
            calls: calls.clone(),
        }
    }
}

#[async_trait]
impl NodeApi for Nodes {
    async fn delete_node(&self, name: &str) -> anyhow::Result<()> {
        self.calls.record(format!("kubernetes.delete {}", name));
        Ok(())
    }
}

/// Creates a kube client backed by a mock API server that answers the
/// `DELETE` of `node_name` with a 404.
pub fn kube_without_node(node_name: &str) -> (kube::Client, tokio::task::JoinHandle<()>) {
    let (mock_service, handle) = mock::pair::<HttpRequest<Body>, HttpResponse<Body>>();
    let node_name = node_name.to_string();
    let spawned = tokio::spawn(async move {
        pin_mut!(handle);
        let (request, send) = handle.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::DELETE);
        assert!(request
            .uri()
            .path()
            .ends_with(&format!("/nodes/{}", node_name)));
        let status = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Status",
            "status": "Failure",
            "message": format!("nodes \"{}\" not found", node_name),
            "reason": "NotFound",
            "code": 404,
        });
        send.send_response(
            HttpResponse::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from(serde_json::to_vec(&status).unwrap()))
                .unwrap(),
        );
    });
    (kube::Client::new(mock_service, "default"), spawned)
}

pub fn dqlite_member(id: u64, name: &str, address: &str, role: DqliteRole) -> DqliteMemberRecord {
    DqliteMemberRecord {
        id,
        address: address.to_string(),
        role,
        name: name.to_string(),
    }
}

/// A recovery engine that keeps the roster in memory and records what it
/// was asked to recover with.
pub struct RecordingEngine {
    state_dir: PathBuf,
    members: Vec<DqliteMemberRecord>,
    pub recovered_with: RefCell<Vec<Vec<DqliteMemberRecord>>>,
}

impl RecordingEngine {
    pub fn new(state_dir: &Path, members: Vec<DqliteMemberRecord>) -> Self {
        RecordingEngine {
            state_dir: state_dir.to_path_buf(),
            members,
            recovered_with: RefCell::new(Vec::new()),
        }
    }
}

impl RecoveryEngine for RecordingEngine {
    fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn database_dir(&self) -> PathBuf {
        self.state_dir.join("database")
    }

    fn cluster_members(&self) -> anyhow::Result<Vec<DqliteMemberRecord>> {
        Ok(self.members.clone())
    }

    fn recover_from_quorum_loss(&self, members: &[DqliteMemberRecord]) -> anyhow::Result<PathBuf> {
        self.recovered_with.borrow_mut().push(members.to_vec());
        Ok(self.state_dir.join("recovery_db.tar.gz"))
    }
}

/// An editor that rewrites the roster with `edit_roster` and leaves the
/// local files alone.
pub struct RosterEditor<F> {
    edit_roster: F,
    edits: RefCell<usize>,
}

impl<F: Fn(Vec<DqliteMemberRecord>) -> Vec<DqliteMemberRecord>> RosterEditor<F> {
    pub fn new(edit_roster: F) -> Self {
        RosterEditor {
            edit_roster,
            edits: RefCell::new(0),
        }
    }
}

impl<F: Fn(Vec<DqliteMemberRecord>) -> Vec<DqliteMemberRecord>> Editor for RosterEditor<F> {
    fn edit(&self, content: &str) -> anyhow::Result<String> {
        let mut edits = self.edits.borrow_mut();
        *edits += 1;
        if *edits > 1 {
            return Ok(content.to_string());
        }
        let roster: Vec<DqliteMemberRecord> =
            serde_yaml::from_str(&membership::recover::strip_helper_comments(content))?;
        Ok(serde_yaml::to_string(&(self.edit_roster)(roster))?)
    }
}
