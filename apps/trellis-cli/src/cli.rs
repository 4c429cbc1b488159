use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use trellis_core::registry::{CancellationToken, ToolHandle, ToolRegistry};
use trellis_runtime::{init_tracing, EngineApp, Plan, PlanStatus, TrellisConfig};

const EXIT_FAILED: i32 = 1;
const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Parser)]
#[command(name = "trellis", about = "Run dependency-ordered tool plans")]
pub struct Cli {
    /// Engine config; built-in defaults are used when omitted
    #[arg(long, global = true, env = "TRELLIS_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a plan and print its result as JSON
    Run(RunArgs),
    /// Check a plan for cycles, duplicate ids and unknown tools
    Validate(PlanArgs),
    /// Print the dependency levels of a plan
    Levels(PlanArgs),
}

#[derive(Debug, Args, Clone)]
struct PlanArgs {
    /// Plan JSON file, or `-` for stdin
    #[arg(value_name = "PLAN")]
    plan: PathBuf,
}

#[derive(Debug, Args, Clone)]
struct RunArgs {
    #[command(flatten)]
    plan: PlanArgs,
    /// Single-line JSON output
    #[arg(long)]
    compact: bool,
}

impl Cli {
    /// Run the selected command and return the process exit code.
    pub async fn run(self) -> anyhow::Result<i32> {
        let app = build_app(self.config.as_deref())?;
        match self.command {
            Command::Run(args) => run_plan(&app, args).await,
            Command::Validate(args) => {
                let plan = read_plan(&args.plan)?;
                let levels = app
                    .executor
                    .dependency_levels(&plan)
                    .with_context(|| format!("plan '{}' is invalid", plan.id))?;
                let unknown = unknown_tools(&app, &plan);
                for tool in &unknown {
                    eprintln!("warning: tool '{}' is not registered", tool);
                }
                println!(
                    "plan '{}' ok: {} steps in {} levels",
                    plan.id,
                    plan.steps.len(),
                    levels.len()
                );
                Ok(if unknown.is_empty() { 0 } else { EXIT_FAILED })
            }
            Command::Levels(args) => {
                let plan = read_plan(&args.plan)?;
                let levels = app
                    .executor
                    .dependency_levels(&plan)
                    .with_context(|| format!("plan '{}' is invalid", plan.id))?;
                println!("{}", serde_json::to_string_pretty(&levels)?);
                Ok(0)
            }
        }
    }
}

fn build_app(config: Option<&Path>) -> anyhow::Result<EngineApp> {
    match config {
        Some(path) => EngineApp::from_config_path(path)
            .with_context(|| format!("failed to start engine from {}", path.display())),
        None => {
            let config = TrellisConfig::default();
            init_tracing(&config.observability);
            EngineApp::from_config(config, Path::new(".")).context("failed to start engine")
        }
    }
}

async fn run_plan(app: &EngineApp, args: RunArgs) -> anyhow::Result<i32> {
    let plan = read_plan(&args.plan.plan)?;
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling plan");
            on_signal.cancel();
        }
    });

    let result = app.run_plan_with_cancellation(&plan, cancel).await;
    signal_task.abort();
    let result = result.with_context(|| format!("plan '{}' is invalid", plan.id))?;

    let rendered = if args.compact {
        serde_json::to_string(&result)?
    } else {
        serde_json::to_string_pretty(&result)?
    };
    println!("{}", rendered);
    Ok(exit_code(result.status))
}

fn exit_code(status: PlanStatus) -> i32 {
    match status {
        PlanStatus::Succeeded => 0,
        PlanStatus::Failed => EXIT_FAILED,
        PlanStatus::Cancelled => EXIT_CANCELLED,
    }
}

fn read_plan(path: &Path) -> anyhow::Result<Plan> {
    let text = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read plan from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read plan {}", path.display()))?
    };
    Plan::from_json(&text).context("plan is not valid JSON")
}

fn unknown_tools(app: &EngineApp, plan: &Plan) -> Vec<String> {
    plan.tools()
        .into_iter()
        .filter(|tool| matches!(app.registry.resolve_tool(tool), ToolHandle::Unknown))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from(["trellis", "run", "plan.json", "--compact"]).expect("args");
        assert!(cli.config.is_none());
        match cli.command {
            Command::Run(args) => {
                assert!(args.compact);
                assert_eq!(args.plan.plan, PathBuf::from("plan.json"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_config_flag_is_global() {
        let cli = Cli::try_parse_from(["trellis", "levels", "p.json", "--config", "t.yaml"])
            .expect("args");
        assert_eq!(cli.config, Some(PathBuf::from("t.yaml")));
    }

    #[test]
    fn test_read_plan_and_unknown_tools() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("plan.json");
        std::fs::write(
            &path,
            r#"{"id": "p", "steps": [
                {"id": "a", "tool": "echo"},
                {"id": "b", "tool": "missing", "depends_on": ["a"]}
            ]}"#,
        )
        .expect("write");
        let plan = read_plan(&path).expect("plan");
        assert_eq!(plan.steps.len(), 2);

        let app = EngineApp::from_config(TrellisConfig::default(), Path::new(".")).expect("app");
        assert_eq!(unknown_tools(&app, &plan), vec!["missing".to_string()]);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(PlanStatus::Succeeded), 0);
        assert_eq!(exit_code(PlanStatus::Failed), EXIT_FAILED);
        assert_eq!(exit_code(PlanStatus::Cancelled), EXIT_CANCELLED);
    }
}
