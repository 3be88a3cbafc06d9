//! In-memory stand-ins for the external systems, shared by unit tests.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::cluster::{ClusterMember, ClusterRole, DatastoreRole, MembershipClient};
use crate::datastore::{DatastoreClient, DatastoreConnector};
use crate::node::NodeApi;

/// Records calls across all fakes so the order between systems can be checked.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn record(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

pub fn member(name: &str, address: &str, role: DatastoreRole) -> ClusterMember {
    ClusterMember {
        name: name.to_string(),
        address: address.to_string(),
        datastore_role: role,
        cluster_role: ClusterRole::ControlPlane,
    }
}

pub fn three_voters() -> Vec<ClusterMember> {
    vec![
        member("cp1", "10.0.0.1:6400", DatastoreRole::Voter),
        member("cp2", "10.0.0.2:6400", DatastoreRole::Voter),
        member("cp3", "10.0.0.3:6400", DatastoreRole::Voter),
    ]
}

#[derive(Default)]
pub struct FakeMembership {
    members: Mutex<Vec<ClusterMember>>,
    log: CallLog,
    fail_list: AtomicBool,
    fail_get: AtomicBool,
    fail_remove: AtomicBool,
    remove_delay: Mutex<Option<Duration>>,
}

impl FakeMembership {
    pub fn with_members(members: Vec<ClusterMember>) -> Self {
        FakeMembership {
            members: Mutex::new(members),
            ..Default::default()
        }
    }

    pub fn logging(mut self, log: &CallLog) -> Self {
        self.log = log.clone();
        self
    }

    pub fn fail_list(&self) {
        self.fail_list.store(true, Ordering::SeqCst);
    }

    pub fn fail_get(&self) {
        self.fail_get.store(true, Ordering::SeqCst);
    }

    pub fn fail_remove(&self) {
        self.fail_remove.store(true, Ordering::SeqCst);
    }

    pub fn delay_remove(&self, delay: Duration) {
        *self.remove_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_role(&self, name: &str, role: DatastoreRole) {
        let mut members = self.members.lock().unwrap();
        if let Some(m) = members.iter_mut().find(|m| m.name == name) {
            m.datastore_role = role;
        }
    }

    pub fn names(&self) -> Vec<String> {
        let members = self.members.lock().unwrap();
        members.iter().map(|m| m.name.clone()).collect()
    }
}

#[async_trait]
impl MembershipClient for FakeMembership {
    async fn cluster_members(&self) -> anyhow::Result<Vec<ClusterMember>> {
        self.log.record("membership.list");
        if self.fail_list.load(Ordering::SeqCst) {
            anyhow::bail!("membership service unreachable");
        }
        Ok(self.members.lock().unwrap().clone())
    }

    async fn cluster_member(&self, name: &str) -> anyhow::Result<ClusterMember> {
        self.log.record(format!("membership.get {}", name));
        if self.fail_get.load(Ordering::SeqCst) {
            anyhow::bail!("membership service unreachable");
        }
        let members = self.members.lock().unwrap();
        members
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("cluster member {} not found", name))
    }

    async fn remove_cluster_member(
        &self,
        name: &str,
        address: &str,
        force: bool,
    ) -> anyhow::Result<()> {
        let delay = *self.remove_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.log
            .record(format!("membership.remove {} {} {}", name, address, force));
        if self.fail_remove.load(Ordering::SeqCst) {
            anyhow::bail!("raft membership change failed");
        }
        self.members.lock().unwrap().retain(|m| m.name != name);
        Ok(())
    }
}

pub struct FakeConnector {
    log: CallLog,
    fail_connect: AtomicBool,
    fail_remove: Arc<AtomicBool>,
    endpoints: Mutex<Vec<Vec<String>>>,
}

impl FakeConnector {
    pub fn new(log: &CallLog) -> Self {
        FakeConnector {
            log: log.clone(),
            fail_connect: AtomicBool::new(false),
            fail_remove: Arc::new(AtomicBool::new(false)),
            endpoints: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_connect(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn fail_remove(&self) {
        self.fail_remove.store(true, Ordering::SeqCst);
    }

    pub fn endpoints(&self) -> Vec<Vec<String>> {
        self.endpoints.lock().unwrap().clone()
    }
}

#[async_trait]
impl DatastoreConnector for FakeConnector {
    async fn connect(&self, endpoints: &[String]) -> anyhow::Result<Box<dyn DatastoreClient>> {
        self.log.record("datastore.connect");
        if self.fail_connect.load(Ordering::SeqCst) {
            anyhow::bail!("dial tcp: connection refused");
        }
        self.endpoints.lock().unwrap().push(endpoints.to_vec());
        Ok(Box::new(FakeDatastoreClient {
            log: self.log.clone(),
            fail_remove: self.fail_remove.clone(),
        }))
    }
}

struct FakeDatastoreClient {
    log: CallLog,
    fail_remove: Arc<AtomicBool>,
}

#[async_trait]
impl DatastoreClient for FakeDatastoreClient {
    async fn remove_node_by_name(&self, name: &str) -> anyhow::Result<()> {
        self.log.record(format!("datastore.remove {}", name));
        if self.fail_remove.load(Ordering::SeqCst) {
            anyhow::bail!("etcdserver: unhealthy cluster");
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.log.record("datastore.close");
        Ok(())
    }
}

pub struct FakeNodes {
    log: CallLog,
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl FakeNodes {
    pub fn new(log: &CallLog) -> Self {
        FakeNodes {
            log: log.clone(),
            fail: AtomicBool::new(false),
            delay: Mutex::new(None),
        }
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl NodeApi for FakeNodes {
    async fn delete_node(&self, name: &str) -> anyhow::Result<()> {
        self.log.record(format!("kubernetes.delete {}", name));
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("the server is currently unable to handle the request");
        }
        Ok(())
    }
}
