//! Recovery of a cluster whose consensus store lost quorum.
//!
//! When a majority of the voters is gone for good, the remaining members
//! cannot agree on anything, including a change of membership. Recovery is
//! done offline, with every k8sd daemon stopped, from the member holding the
//! most recent database:
//!
//! 1. [`RecoveryWorkflow::precheck`] warns the operator and asks for
//!    confirmation.
//! 2. [`RecoveryWorkflow::recover`] loads the roster, lets the operator edit
//!    it together with the local identity files, validates the edit and hands
//!    it to the [`RecoveryEngine`].
//! 3. The returned [`RecoverySession`] reports the archive that must be
//!    copied to every other surviving member before any of them is started.
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::fsutil::{write_file, Owner};

mod editor;
mod member;
mod state_dir;

pub use editor::{
    edit_with_guide, remove_empty_lines, strip_helper_comments, yaml_comment_lines, Editor,
    ExternalEditor, HELPER_COMMENT_FOOTER,
};
pub use member::{
    validate_member_changes, validate_member_layout, DqliteMemberRecord, DqliteRole,
    ValidationError,
};
pub use state_dir::{ConsensusLog, StateDir, ADDRESS_PATCH, RECOVERY_TARBALL};

const PRE_RECOVERY_MESSAGE: &str = "\
You should only run this command if:
 - A quorum of cluster members is permanently lost
 - You are *absolutely* sure all k8s daemons are stopped (sudo snap stop k8s)
 - This instance has the most up to date database

Note that before applying any changes, a database backup is created at:
* k8sd (microcluster): /var/snap/k8s/common/var/lib/k8sd/state/db_backup.<timestamp>.tar.gz
";

const RECOVERY_CONFIRMATION: &str = "Do you want to proceed? (yes/no): ";

const NON_INTERACTIVE_MESSAGE: &str = "\
Non-interactive mode requested.

The command will assume that the dqlite configuration files have already been
modified with the updated cluster member roles and addresses.

Initiating the dqlite database recovery.
";

const CLUSTER_YAML_GUIDE: &str = "\
# Member roles can be modified. Unrecoverable nodes should be given the role \"spare\".
#
# \"voter\" (0) - Voting member of the database. A majority of voters is a quorum.
# \"stand-by\" (1) - Non-voting member of the database; can be promoted to voter.
# \"spare\" (2) - Not a member of the database.
#
# Member addresses can be changed. Each address must be a unique ip:port.
#
# The edit is aborted if:
# - the number of members changes
# - the name of any member changes
# - the ID of any member changes
# - no member is left with the \"voter\" role
# - no changes are made
";

const INFO_YAML_GUIDE: &str = "\
# Verify the ID, address and role of the local node.
#
# Cluster members:
";

const DAEMON_YAML_GUIDE: &str = "\
# Verify the name and address of the local node.
#
# Cluster members:
";

/// Access to the persisted consensus store of a stopped member.
pub trait RecoveryEngine {
    /// The k8sd state directory.
    fn state_dir(&self) -> &Path;

    /// The directory holding the consensus store.
    fn database_dir(&self) -> PathBuf;

    /// The roster, restricted to members present in the trust store.
    fn cluster_members(&self) -> anyhow::Result<Vec<DqliteMemberRecord>>;

    /// Reconfigures the consensus store with `members`.
    ///
    /// Implementations back up the database before changing anything, update
    /// every persisted address, and return the path of an archive of the
    /// recovered database.
    fn recover_from_quorum_loss(&self, members: &[DqliteMemberRecord]) -> anyhow::Result<PathBuf>;
}

/// Options of a recovery run.
#[derive(Clone, Debug, Default)]
pub struct RecoveryConfig {
    /// The k8sd state directory
    pub state_dir: PathBuf,
    /// Skip every prompt and assume the files were edited beforehand
    pub non_interactive: bool,
    /// Owner given to files written during recovery
    pub owner: Option<Owner>,
}

/// The operator's terminal.
pub struct Console<R, W> {
    input: R,
    output: W,
    is_terminal: bool,
}

impl<R: BufRead, W: Write> Console<R, W> {
    /// Creates a console over arbitrary streams.
    pub fn new(input: R, output: W, is_terminal: bool) -> Self {
        Console {
            input,
            output,
            is_terminal,
        }
    }

    /// The output stream.
    pub fn output(&mut self) -> &mut W {
        &mut self.output
    }

    /// The output stream, consuming the console.
    pub fn into_output(self) -> W {
        self.output
    }
}

impl Console<io::StdinLock<'static>, io::Stdout> {
    /// The console of the current process.
    pub fn stdio() -> Self {
        let stdin = io::stdin();
        let is_terminal = stdin.is_terminal();
        Console::new(stdin.lock(), io::stdout(), is_terminal)
    }
}

/// Reasons recovery refuses to start.
#[derive(Debug, Error)]
pub enum PrecheckError {
    /// Prompts were requested but nobody can answer them
    #[error("interactive mode requested in a non-interactive terminal")]
    NotATerminal,
    /// No state directory was given
    #[error("k8sd state dir not specified")]
    MissingStateDir,
    /// The answer could not be read
    #[error("couldn't read user input, error: {0}")]
    Input(io::Error),
    /// The console could not be written
    #[error("couldn't write to the terminal, error: {0}")]
    Output(io::Error),
    /// The operator did not answer `yes`
    #[error("cluster edit aborted; no changes made")]
    Aborted,
}

/// Reasons recovery failed once started.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The roster could not be loaded
    #[error("could not retrieve K8sd cluster members, error: {0:#}")]
    LoadMembers(anyhow::Error),
    /// The roster could not be shown to the operator
    #[error("could not serialize cluster members, error: {0}")]
    Serialize(serde_yaml::Error),
    /// The editor failed or an edited file could not be handled
    #[error("interactive text editor failed, error: {0:#}")]
    Editor(anyhow::Error),
    /// The edited roster is not valid YAML
    #[error("couldn't parse cluster.yaml, error: {0}")]
    Parse(serde_yaml::Error),
    /// The edited roster breaks a membership rule
    #[error("invalid cluster member changes: {0}")]
    Validation(#[from] ValidationError),
    /// The engine could not recover the database
    #[error("k8sd recovery failed, error: {0:#}")]
    Recover(anyhow::Error),
}

/// Outcome of a recovery run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoverySession {
    /// The roster before recovery
    pub old_members: Vec<DqliteMemberRecord>,
    /// The roster recovery was done with
    pub edited_members: Vec<DqliteMemberRecord>,
    /// Archive of the recovered database
    pub backup_path: PathBuf,
}

impl RecoverySession {
    /// Tells the operator where the recovered database is and what to do
    /// with it.
    pub fn report<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let path = self.backup_path.display();
        writeln!(out, "K8sd cluster changes applied.")?;
        writeln!(out, "New database state saved to {}", path)?;
        writeln!(
            out,
            "*Before* starting any cluster member, copy {} to {} on all remaining cluster members.",
            path, path
        )?;
        writeln!(out, "K8sd will load this file during startup.")?;
        writeln!(out)
    }
}

/// Drives a quorum-loss recovery.
pub struct RecoveryWorkflow<E, D> {
    config: RecoveryConfig,
    engine: E,
    editor: D,
}

impl<E: RecoveryEngine, D: Editor> RecoveryWorkflow<E, D> {
    /// Creates the workflow.
    pub fn new(config: RecoveryConfig, engine: E, editor: D) -> Self {
        RecoveryWorkflow {
            config,
            engine,
            editor,
        }
    }

    /// The engine recovery runs against.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Refuses to start unless recovery can run and the operator agreed.
    ///
    /// Non-interactive runs never read from the console.
    pub fn precheck<R: BufRead, W: Write>(
        &self,
        console: &mut Console<R, W>,
    ) -> Result<(), PrecheckError> {
        debug!("Running prechecks");
        if !console.is_terminal && !self.config.non_interactive {
            return Err(PrecheckError::NotATerminal);
        }
        if self.config.state_dir.as_os_str().is_empty() {
            return Err(PrecheckError::MissingStateDir);
        }

        let out = &mut console.output;
        writeln!(out, "{}", PRE_RECOVERY_MESSAGE).map_err(PrecheckError::Output)?;

        if self.config.non_interactive {
            writeln!(out, "{}", NON_INTERACTIVE_MESSAGE).map_err(PrecheckError::Output)?;
            return Ok(());
        }

        write!(out, "{}", RECOVERY_CONFIRMATION).map_err(PrecheckError::Output)?;
        out.flush().map_err(PrecheckError::Output)?;
        let mut answer = String::new();
        let read = console
            .input
            .read_line(&mut answer)
            .map_err(PrecheckError::Input)?;
        if read == 0 {
            return Err(PrecheckError::Input(io::ErrorKind::UnexpectedEof.into()));
        }
        if !answer.trim_end_matches(&['\r', '\n'][..]).eq_ignore_ascii_case("yes") {
            return Err(PrecheckError::Aborted);
        }
        writeln!(console.output).map_err(PrecheckError::Output)?;
        Ok(())
    }

    /// Loads, edits, validates and recovers the roster.
    pub fn recover(&self) -> Result<RecoverySession, RecoveryError> {
        let old_members = self
            .engine
            .cluster_members()
            .map_err(RecoveryError::LoadMembers)?;
        info!(members = old_members.len(), "Loaded cluster members");
        let old_yaml = serde_yaml::to_string(&old_members).map_err(RecoveryError::Serialize)?;

        let cluster_yaml = if self.config.non_interactive {
            old_yaml
        } else {
            self.edit_interactively(&old_yaml)
                .map_err(RecoveryError::Editor)?
        };

        let edited_members: Vec<DqliteMemberRecord> =
            serde_yaml::from_str(&cluster_yaml).map_err(RecoveryError::Parse)?;
        if self.config.non_interactive {
            validate_member_layout(&old_members, &edited_members)?;
        } else {
            validate_member_changes(&old_members, &edited_members)?;
        }

        let backup_path = self
            .engine
            .recover_from_quorum_loss(&edited_members)
            .map_err(RecoveryError::Recover)?;
        Ok(RecoverySession {
            old_members,
            edited_members,
            backup_path,
        })
    }

    /// Runs the prechecks, the recovery and the report on `console`.
    pub fn run<R: BufRead, W: Write>(
        &self,
        console: &mut Console<R, W>,
    ) -> anyhow::Result<RecoverySession> {
        self.precheck(console)
            .map_err(|e| anyhow::anyhow!("Recovery precheck failed: {}", e))?;
        let session = self
            .recover()
            .map_err(|e| anyhow::anyhow!("Failed to recover k8sd, error: {}", e))?;
        session.report(console.output())?;
        Ok(session)
    }

    /// Shows the roster, then the local `info.yaml` and `daemon.yaml`, to
    /// the operator. The two local files are written back as soon as they
    /// are edited. Returns the edited roster.
    fn edit_interactively(&self, members_yaml: &str) -> anyhow::Result<String> {
        let database_dir = self.engine.database_dir();
        let cluster_yaml_path = database_dir.join("cluster.yaml");
        let guide = format!(
            "# K8sd cluster configuration\n# (based on the trust store and {})\n#\n{}{}\n{}",
            cluster_yaml_path.display(),
            CLUSTER_YAML_GUIDE,
            HELPER_COMMENT_FOOTER,
            members_yaml
        );
        let cluster_yaml = edit_with_guide(&self.editor, &guide, "")?;
        let listing = yaml_comment_lines(&cluster_yaml);

        let info_yaml_path = database_dir.join("info.yaml");
        self.edit_local_file(&info_yaml_path, "info.yaml", INFO_YAML_GUIDE, &listing)?;

        let daemon_yaml_path = self.engine.state_dir().join("daemon.yaml");
        self.edit_local_file(&daemon_yaml_path, "daemon.yaml", DAEMON_YAML_GUIDE, &listing)?;

        Ok(cluster_yaml)
    }

    fn edit_local_file(
        &self,
        path: &Path,
        title: &str,
        guide: &str,
        listing: &str,
    ) -> anyhow::Result<()> {
        let current = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("could not read file: {}, error: {}", path.display(), e)
        })?;
        let guide = format!(
            "# K8sd {}\n# ({})\n#\n{}{}\n{}",
            title,
            path.display(),
            guide,
            listing,
            HELPER_COMMENT_FOOTER
        );
        let edited = edit_with_guide(&self.editor, &guide, &remove_empty_lines(&current))?;
        write_file(path, edited.as_bytes(), 0o644, self.config.owner).map_err(|e| {
            anyhow::anyhow!("could not write file: {}, error: {:#}", path.display(), e)
        })?;
        info!(path = %path.display(), "Applied local changes");
        Ok(())
    }
}
