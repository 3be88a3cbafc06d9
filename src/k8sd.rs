use membership::config::{Command, Config, Opts};
use membership::recover::{Console, ExternalEditor, RecoveryConfig, RecoveryWorkflow, StateDir};
use structopt::StructOpt;
use tracing::debug;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let opts = Opts::from_args();

    // Logs go to stderr so they do not mix with the prompts and report.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_opts(&opts)?;
    match opts.command {
        Command::ClusterRecover { non_interactive } => {
            cluster_recover(&config, non_interactive);
            Ok(())
        }
    }
}

/// Rewrites the cluster files of the state directory for the edited roster.
///
/// No dqlite binding is linked into this binary, so the Raft log keeps its
/// old membership. The recovery engine logs a warning saying so.
fn cluster_recover(config: &Config, non_interactive: bool) {
    debug!(state_dir = %config.state_dir.display(), non_interactive, "Starting cluster recovery");
    let workflow = RecoveryWorkflow::new(
        RecoveryConfig {
            state_dir: config.state_dir.clone(),
            non_interactive,
            owner: config.owner,
        },
        StateDir::new(&config.state_dir, config.owner),
        ExternalEditor,
    );
    let mut console = Console::stdio();
    if let Err(e) = workflow.run(&mut console) {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}
