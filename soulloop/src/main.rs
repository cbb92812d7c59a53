//! Autonomous development loop CLI.
//!
//! Souls live in `<data-dir>/souls.db`; the pause flag and `config.toml` sit
//! next to it. `run` and `resume` drive the loop in the foreground until every
//! soul they touched has settled or stopped chaining.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};

use soulloop::controller::{Controller, LoopError};
use soulloop::core::extractor::extract_feedback;
use soulloop::core::soul::Soul;
use soulloop::core::types::SoulStatus;
use soulloop::exit_codes;
use soulloop::io::config::{CONFIG_FILE, LoopConfig, load_config};
use soulloop::io::executor::ProcessExecutor;
use soulloop::io::git::{GitPublisher, NoopPublisher, Publisher};
use soulloop::io::store::{SoulStore, StoreError};
use soulloop::logging;

const DEFAULT_DATA_DIR: &str = ".soulloop";

#[derive(Parser)]
#[command(
    name = "soulloop",
    version,
    about = "Autonomous development loop driving a coding agent until a project is production ready"
)]
struct Cli {
    /// Directory holding souls.db, the pause flag and config.toml.
    #[arg(long, global = true, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a project directory as a soul and print its id.
    Create {
        path: PathBuf,
        /// Display name (defaults to the folder name).
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "objective")]
        objectives: Vec<String>,
        #[arg(long = "requirement")]
        requirements: Vec<String>,
    },
    /// List souls, most recently active first.
    List,
    /// Print a soul as JSON.
    Show { id: String },
    /// Replace a soul's objectives and/or requirements.
    Edit {
        id: String,
        #[arg(long = "objective")]
        objectives: Vec<String>,
        #[arg(long = "requirement")]
        requirements: Vec<String>,
    },
    Delete { id: String },
    /// Launch an iteration and drive the loop until it settles.
    Run {
        id: String,
        /// Start with a test iteration instead of a development one.
        #[arg(long)]
        test: bool,
        /// Close iterations left open by a `run` that died, then launch.
        #[arg(long)]
        force: bool,
    },
    /// Stop launching new iterations.
    Pause,
    /// Clear the pause flag, restart interrupted souls and drive the loop.
    Resume,
    /// Print the pause state and soul counts by status.
    Status,
    /// Run the feedback extractor over a transcript file and print JSON.
    Extract {
        file: PathBuf,
        #[arg(long, default_value = "manual")]
        agent_id: String,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let data_dir = cli.data_dir;
    match cli.command {
        Command::Create {
            path,
            name,
            objectives,
            requirements,
        } => cmd_create(&data_dir, &path, name.as_deref(), objectives, requirements),
        Command::List => cmd_list(&data_dir),
        Command::Show { id } => cmd_show(&data_dir, &id),
        Command::Edit {
            id,
            objectives,
            requirements,
        } => cmd_edit(&data_dir, &id, objectives, requirements),
        Command::Delete { id } => {
            open_store(&data_dir)?.delete(&id)?;
            Ok(exit_codes::OK)
        }
        Command::Run { id, test, force } => cmd_run(&data_dir, &id, test, force),
        Command::Pause => {
            open_controller(&data_dir)?.set_paused(true)?;
            println!("paused");
            Ok(exit_codes::OK)
        }
        Command::Resume => cmd_resume(&data_dir),
        Command::Status => cmd_status(&data_dir),
        Command::Extract { file, agent_id } => cmd_extract(&file, &agent_id),
    }
}

fn open_store(data_dir: &Path) -> Result<SoulStore> {
    SoulStore::open(data_dir).with_context(|| format!("open store in {}", data_dir.display()))
}

type CliController = Controller<ProcessExecutor, dyn Publisher>;

fn open_controller(data_dir: &Path) -> Result<CliController> {
    let config: LoopConfig = load_config(&data_dir.join(CONFIG_FILE))?;
    let store = Arc::new(open_store(data_dir)?);
    let executor = Arc::new(ProcessExecutor::new(config.agent.clone()));
    let publisher: Arc<dyn Publisher> = if config.publish.enabled {
        Arc::new(GitPublisher::new(config.publish.remote.clone()))
    } else {
        Arc::new(NoopPublisher)
    };
    Ok(Controller::new(store, executor, publisher, config))
}

fn cmd_create(
    data_dir: &Path,
    path: &Path,
    name: Option<&str>,
    objectives: Vec<String>,
    requirements: Vec<String>,
) -> Result<i32> {
    let project_path = fs::canonicalize(path)
        .with_context(|| format!("project path {} must exist", path.display()))?;
    if !project_path.is_dir() {
        bail!("project path {} is not a directory", project_path.display());
    }
    let mut soul = Soul::new(project_path, name.unwrap_or_default());
    soul.set_objectives(objectives);
    soul.set_requirements(requirements);
    open_store(data_dir)?.create(&soul)?;
    println!("{}", soul.id);
    Ok(exit_codes::OK)
}

fn cmd_list(data_dir: &Path) -> Result<i32> {
    for soul in open_store(data_dir)?.list()? {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            soul.id,
            soul.status,
            soul.name,
            soul.project_path.display(),
            soul.feedback_summary()
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_show(data_dir: &Path, id: &str) -> Result<i32> {
    let soul = open_store(data_dir)?.get(id)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&soul).context("serialize soul")?
    );
    Ok(exit_codes::OK)
}

fn cmd_edit(
    data_dir: &Path,
    id: &str,
    objectives: Vec<String>,
    requirements: Vec<String>,
) -> Result<i32> {
    if objectives.is_empty() && requirements.is_empty() {
        bail!("nothing to edit: pass --objective and/or --requirement");
    }
    let store = open_store(data_dir)?;
    if !objectives.is_empty() {
        store.update_objectives(id, objectives)?;
    }
    if !requirements.is_empty() {
        store.update_requirements(id, requirements)?;
    }
    Ok(exit_codes::OK)
}

fn cmd_run(data_dir: &Path, id: &str, test: bool, force: bool) -> Result<i32> {
    let controller = open_controller(data_dir)?;
    if force {
        let closed = controller.abandon_open_iterations(id)?;
        if closed > 0 {
            eprintln!("closed {closed} abandoned iteration(s)");
        }
    }
    let launched = if test {
        controller.launch_test(id)?
    } else {
        controller.launch_development(id, None)?
    };
    if launched.is_none() {
        eprintln!("loop is paused; run `soulloop resume` first");
        return Ok(exit_codes::PAUSED);
    }
    controller.run_until_idle();
    controller.wait_for_publishes();

    let soul = controller.store().get(id)?;
    println!("{}\t{}\t{}", soul.id, soul.status, soul.feedback_summary());
    Ok(exit_codes::OK)
}

fn cmd_resume(data_dir: &Path) -> Result<i32> {
    let controller = open_controller(data_dir)?;
    let relaunched = controller.set_paused(false)?;
    println!("resumed ({} souls restarted)", relaunched.len());
    controller.run_until_idle();
    controller.wait_for_publishes();
    Ok(exit_codes::OK)
}

fn cmd_status(data_dir: &Path) -> Result<i32> {
    let store = open_store(data_dir)?;
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for status in [SoulStatus::Standby, SoulStatus::Working] {
        counts.insert(status.as_str(), 0);
    }
    for soul in store.list()? {
        *counts.entry(soul.status.as_str()).or_default() += 1;
    }
    println!("paused: {}", store.is_paused());
    for (status, count) in counts {
        println!("{status}: {count}");
    }
    Ok(exit_codes::OK)
}

fn cmd_extract(file: &Path, agent_id: &str) -> Result<i32> {
    let transcript =
        fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let extracted = extract_feedback(&transcript, agent_id, Utc::now());
    println!(
        "{}",
        serde_json::to_string_pretty(&extracted).context("serialize extracted feedback")?
    );
    Ok(exit_codes::OK)
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(store_err) = cause.downcast_ref::<StoreError>() {
            return store_exit_code(store_err);
        }
        if let Some(loop_err) = cause.downcast_ref::<LoopError>() {
            return match loop_err {
                LoopError::Store(store_err) => store_exit_code(store_err),
                LoopError::AlreadyRunning { .. } => exit_codes::CONFLICT,
                LoopError::ExecutionFailure { .. } => exit_codes::INVALID,
            };
        }
    }
    exit_codes::INVALID
}

fn store_exit_code(err: &StoreError) -> i32 {
    match err {
        StoreError::NotFound(_) => exit_codes::NOT_FOUND,
        StoreError::Conflict(_) => exit_codes::CONFLICT,
        _ => exit_codes::INVALID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_create_with_lists() {
        let cli = Cli::parse_from([
            "soulloop",
            "create",
            "/work/todo",
            "--objective",
            "a",
            "--objective",
            "b",
            "--requirement",
            "rust",
        ]);
        assert_eq!(cli.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        match cli.command {
            Command::Create {
                path,
                name,
                objectives,
                requirements,
            } => {
                assert_eq!(path, PathBuf::from("/work/todo"));
                assert_eq!(name, None);
                assert_eq!(objectives, vec!["a", "b"]);
                assert_eq!(requirements, vec!["rust"]);
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn parse_run_test_with_data_dir() {
        let cli = Cli::parse_from(["soulloop", "--data-dir", "/tmp/x", "run", "soul-1", "--test"]);
        assert_eq!(cli.data_dir, PathBuf::from("/tmp/x"));
        assert!(matches!(
            cli.command,
            Command::Run {
                test: true,
                force: false,
                ..
            }
        ));

        let cli = Cli::parse_from(["soulloop", "run", "soul-1", "--force"]);
        assert!(matches!(cli.command, Command::Run { force: true, .. }));
    }

    #[test]
    fn parse_extract_defaults_agent_id() {
        let cli = Cli::parse_from(["soulloop", "extract", "out.txt"]);
        assert!(matches!(
            cli.command,
            Command::Extract { agent_id, .. } if agent_id == "manual"
        ));
    }

    #[test]
    fn store_errors_map_to_stable_exit_codes() {
        let not_found = anyhow::Error::new(StoreError::NotFound("soul x".to_string()));
        assert_eq!(exit_code_for(&not_found), exit_codes::NOT_FOUND);

        let conflict =
            anyhow::Error::new(LoopError::Store(StoreError::Conflict("p".to_string())))
                .context("run soul");
        assert_eq!(exit_code_for(&conflict), exit_codes::CONFLICT);

        let running = anyhow::Error::new(LoopError::AlreadyRunning {
            soul_id: "s".to_string(),
            agent_id: "a".to_string(),
        });
        assert_eq!(exit_code_for(&running), exit_codes::CONFLICT);
        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), exit_codes::INVALID);
    }

    #[test]
    fn create_then_status_uses_data_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path().join("todo");
        fs::create_dir_all(&project).expect("mkdir");
        let data_dir = temp.path().join("data");

        cmd_create(&data_dir, &project, None, vec!["ship".to_string()], Vec::new())
            .expect("create");
        let store = open_store(&data_dir).expect("store");
        let souls = store.list().expect("list");
        assert_eq!(souls.len(), 1);
        assert_eq!(souls[0].name, "todo");
        assert_eq!(souls[0].objectives, vec!["ship"]);

        let err = cmd_create(&data_dir, &project, None, Vec::new(), Vec::new()).unwrap_err();
        assert_eq!(exit_code_for(&err), exit_codes::CONFLICT);
    }
}
