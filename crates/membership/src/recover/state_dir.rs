//! A [`RecoveryEngine`] working directly on the files of a k8sd state
//! directory.
//!
//! The layout it expects:
//!
//! ```text
//! <state>/daemon.yaml             name and address of the local member
//! <state>/truststore/<name>.yaml  one entry per trusted member
//! <state>/database/cluster.yaml   consensus store roster
//! <state>/database/info.yaml      ID, Address and Role of the local member
//! ```
//!
//! The Raft log inside the database directory is only rewritten through a
//! [`ConsensusLog`] given to [`StateDir::with_consensus_log`]. Without one,
//! recovery updates the files above but leaves the log's membership as it
//! was, and says so in a warning.
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_yaml::{Mapping, Value};
use tracing::{debug, info, warn};

use super::member::{validate_member_layout, DqliteMemberRecord};
use super::RecoveryEngine;
use crate::fsutil::{write_file, write_file_with, Owner};

const FILE_MODE: u32 = 0o644;
const ARCHIVE_MODE: u32 = 0o600;

/// Name of the archive holding the recovered database.
pub const RECOVERY_TARBALL: &str = "recovery_db.tar.gz";

/// Name of the SQL script applied by the daemon on its next start.
pub const ADDRESS_PATCH: &str = "patch.global.sql";

/// Rewrites the membership recorded in the consensus store's Raft log.
pub trait ConsensusLog {
    /// Makes `members` the configuration of the log in `database_dir`.
    fn reconfigure(&self, database_dir: &Path, members: &[DqliteMemberRecord]) -> anyhow::Result<()>;
}

/// The state directory of a stopped k8sd member.
#[derive(Clone)]
pub struct StateDir {
    root: PathBuf,
    owner: Option<Owner>,
    log: Option<Arc<dyn ConsensusLog>>,
}

/// Everything recovery writes, worked out before anything on disk changes.
struct RecoveryPlan {
    moved: BTreeMap<String, String>,
    files: Vec<(PathBuf, String)>,
}

impl StateDir {
    /// Opens the state directory at `root`. Files written are given to
    /// `owner` when set.
    pub fn new(root: impl Into<PathBuf>, owner: Option<Owner>) -> Self {
        StateDir {
            root: root.into(),
            owner,
            log: None,
        }
    }

    /// Reconfigures `log` as part of every recovery.
    pub fn with_consensus_log(mut self, log: Arc<dyn ConsensusLog>) -> Self {
        self.log = Some(log);
        self
    }

    fn cluster_yaml(&self) -> PathBuf {
        self.database_dir().join("cluster.yaml")
    }

    fn info_yaml(&self) -> PathBuf {
        self.database_dir().join("info.yaml")
    }

    fn daemon_yaml(&self) -> PathBuf {
        self.root.join("daemon.yaml")
    }

    fn truststore_dir(&self) -> PathBuf {
        self.root.join("truststore")
    }

    /// Every member listed in `cluster.yaml`, trusted or not.
    fn roster(&self) -> anyhow::Result<Vec<DqliteMemberRecord>> {
        let path = self.cluster_yaml();
        let content = fs::read_to_string(&path)
            .with_context(|| format!("could not read {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("could not parse {}", path.display()))
    }

    fn truststore_entries(&self) -> anyhow::Result<Vec<(PathBuf, Value)>> {
        let dir = self.truststore_dir();
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("could not read trust store {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let content = fs::read_to_string(&path)
                .with_context(|| format!("could not read {}", path.display()))?;
            let doc: Value = serde_yaml::from_str(&content)
                .with_context(|| format!("could not parse {}", path.display()))?;
            entries.push((path, doc));
        }
        Ok(entries)
    }

    fn trusted_names(&self) -> anyhow::Result<HashSet<String>> {
        Ok(self
            .truststore_entries()?
            .iter()
            .filter_map(|(_, doc)| string_field(doc, "name"))
            .collect())
    }

    /// Packs the database directory into a gzipped tarball at `dest`.
    ///
    /// The tarball is built next to `dest` and renamed over it once
    /// complete, so a failure leaves any earlier tarball in place.
    fn archive_database(&self, dest: &Path) -> anyhow::Result<()> {
        let database_dir = self.database_dir();
        write_file_with(dest, ARCHIVE_MODE, self.owner, |file| {
            let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
            builder
                .append_dir_all("database", &database_dir)
                .with_context(|| format!("could not archive {}", database_dir.display()))?;
            builder.into_inner()?.finish()?;
            Ok(())
        })
    }

    fn backup(&self) -> anyhow::Result<PathBuf> {
        let path = self.root.join(format!(
            "db_backup.{}.tar.gz",
            chrono::Utc::now().timestamp()
        ));
        self.archive_database(&path)?;
        info!(path = %path.display(), "Created database backup");
        Ok(path)
    }

    /// Validates `members` and prepares every file they change.
    ///
    /// Only reads from disk, so a failure here leaves the state directory
    /// untouched.
    fn plan(&self, members: &[DqliteMemberRecord]) -> anyhow::Result<RecoveryPlan> {
        let current = self.cluster_members()?;
        validate_member_layout(&current, members)?;

        let moved: BTreeMap<String, String> = members
            .iter()
            .filter(|m| {
                current
                    .iter()
                    .any(|c| c.id == m.id && c.address != m.address)
            })
            .map(|m| (m.name.clone(), m.address.clone()))
            .collect();

        let mut files = Vec::new();
        for (path, mut doc) in self.truststore_entries()? {
            if let Some(address) = string_field(&doc, "name").and_then(|n| moved.get(&n)) {
                set_field(&mut doc, "address", Value::String(address.clone()))?;
                files.push((path, serde_yaml::to_string(&doc)?));
            }
        }
        files.push((self.info_yaml(), self.local_info(members)?));
        if let Some(daemon) = self.daemon(&moved)? {
            files.push((self.daemon_yaml(), daemon));
        }
        if let Some(script) = address_patch(&moved) {
            files.push((self.database_dir().join(ADDRESS_PATCH), script));
        }
        files.push((self.cluster_yaml(), serde_yaml::to_string(members)?));

        Ok(RecoveryPlan { moved, files })
    }

    /// `info.yaml` with the address and role the local member gets.
    fn local_info(&self, members: &[DqliteMemberRecord]) -> anyhow::Result<String> {
        let path = self.info_yaml();
        let mut doc = read_yaml(&path)?;
        let id = mapping(&doc)?
            .get(&Value::String("ID".to_string()))
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow::anyhow!("{} has no ID", path.display()))?;
        let local = members
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| anyhow::anyhow!("local member {} is not in the new cluster members", id))?;
        set_field(&mut doc, "Address", Value::String(local.address.clone()))?;
        set_field(&mut doc, "Role", Value::Number(u64::from(local.role.code()).into()))?;
        Ok(serde_yaml::to_string(&doc)?)
    }

    /// `daemon.yaml` with the new local address, if it moved.
    fn daemon(&self, moved: &BTreeMap<String, String>) -> anyhow::Result<Option<String>> {
        let mut doc = read_yaml(&self.daemon_yaml())?;
        let new_address = match string_field(&doc, "name").and_then(|n| moved.get(&n)) {
            Some(address) => address.clone(),
            None => return Ok(None),
        };
        set_field(&mut doc, "address", Value::String(new_address))?;
        Ok(Some(serde_yaml::to_string(&doc)?))
    }
}

impl RecoveryEngine for StateDir {
    fn state_dir(&self) -> &Path {
        &self.root
    }

    fn database_dir(&self) -> PathBuf {
        self.root.join("database")
    }

    fn cluster_members(&self) -> anyhow::Result<Vec<DqliteMemberRecord>> {
        let trusted = self.trusted_names()?;
        Ok(self
            .roster()?
            .into_iter()
            .filter(|m| trusted.contains(&m.name))
            .collect())
    }

    fn recover_from_quorum_loss(&self, members: &[DqliteMemberRecord]) -> anyhow::Result<PathBuf> {
        let plan = self.plan(members)?;

        self.backup()?;

        match &self.log {
            Some(log) => log
                .reconfigure(&self.database_dir(), members)
                .context("failed to reconfigure the consensus log")?,
            None => warn!(
                "The Raft log of the database was not reconfigured, only the cluster files were rewritten"
            ),
        }

        for (path, content) in &plan.files {
            write_file(path, content.as_bytes(), FILE_MODE, self.owner)?;
            debug!(path = %path.display(), "Rewrote file");
        }
        let moved = plan.moved;

        let tarball = self.root.join(RECOVERY_TARBALL);
        self.archive_database(&tarball)?;
        info!(path = %tarball.display(), moved = moved.len(), "Recovered cluster members");
        Ok(tarball)
    }
}

fn read_yaml(path: &Path) -> anyhow::Result<Value> {
    let content =
        fs::read_to_string(path).with_context(|| format!("could not read {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("could not parse {}", path.display()))
}

fn mapping(doc: &Value) -> anyhow::Result<&Mapping> {
    doc.as_mapping()
        .ok_or_else(|| anyhow::anyhow!("expected a YAML mapping"))
}

fn string_field(doc: &Value, key: &str) -> Option<String> {
    doc.as_mapping()?
        .get(&Value::String(key.to_string()))?
        .as_str()
        .map(str::to_string)
}

fn set_field(doc: &mut Value, key: &str, value: Value) -> anyhow::Result<()> {
    doc.as_mapping_mut()
        .ok_or_else(|| anyhow::anyhow!("expected a YAML mapping"))?
        .insert(Value::String(key.to_string()), value);
    Ok(())
}

/// The statements that move members in the members table, which can only be
/// updated once the database runs again.
fn address_patch(moved: &BTreeMap<String, String>) -> Option<String> {
    if moved.is_empty() {
        return None;
    }
    Some(
        moved
            .iter()
            .map(|(name, address)| {
                format!(
                    "UPDATE core_cluster_members SET address = {} WHERE name = {};\n",
                    sql_quote(address),
                    sql_quote(name)
                )
            })
            .collect(),
    )
}

fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
