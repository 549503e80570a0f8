use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use ejudge::config::{init_config, JudgeConfig};
use ejudge::isolation::worker::serve;
use ejudge::registry::registry;
use ejudge::{judge, RunOptions};

#[derive(Debug, Parser)]
#[command(name = "ejudge", version, about = "Build and run programs against test inputs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a program against input files, or interactively when none are given
    Run {
        file: PathBuf,
        /// Language name, alias or extension (default: from the file name)
        #[arg(short, long)]
        language: Option<String>,
        /// File with one input per line; repeat for several test cases
        #[arg(short, long = "inputs")]
        inputs: Vec<PathBuf>,
        /// Time limit per test case, in seconds
        #[arg(short, long)]
        timeout: Option<f64>,
        /// Build and run inside the sandboxed worker
        #[arg(long)]
        sandbox: bool,
        /// Stop at the first failure
        #[arg(long)]
        raises: bool,
        /// Feed all inputs at once instead of interacting line by line
        #[arg(long)]
        stream_compare: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a program attached to the terminal
    Exec {
        file: PathBuf,
        #[arg(short, long)]
        language: Option<String>,
    },
    /// List supported languages
    Languages,
    /// Serve one isolated request over stdin/stdout
    #[command(hide = true)]
    Worker,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ejudge=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    init_config(JudgeConfig::from_env()?)?;

    match cli.command {
        Command::Worker => {
            serve(tokio::io::stdin(), tokio::io::stdout()).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Languages => {
            for binding in registry()?.languages() {
                println!(
                    "{:<10} {:<30} .{}",
                    binding.language,
                    binding.description,
                    binding.extensions.join(" .")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Exec { file, language } => {
            exec(&file, language.as_deref()).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            file,
            language,
            inputs,
            timeout,
            sandbox,
            raises,
            stream_compare,
            json,
        } => {
            if inputs.is_empty() {
                exec(&file, language.as_deref()).await?;
                return Ok(ExitCode::SUCCESS);
            }

            let source = read_source(&file)?;
            let language = judge::resolve_language(language.as_deref(), Some(&file))?;
            let input_sets = inputs
                .iter()
                .map(|path| read_inputs(path))
                .collect::<Result<Vec<_>>>()?;
            let timeout = timeout
                .map(Duration::try_from_secs_f64)
                .transpose()
                .context("Invalid timeout")?;

            let options = RunOptions::default()
                .with_timeout(timeout)
                .sandboxed(sandbox)
                .raising(raises)
                .with_stream_compare(stream_compare.then_some(true));

            info!("Running {} ({}) against {} input files", file.display(), language, input_sets.len());
            let report = judge::run(&source, &language, input_sets, &options).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report);
            }
            Ok(if report.all_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

async fn exec(file: &Path, language: Option<&str>) -> Result<()> {
    let source = read_source(file)?;
    let language = judge::resolve_language(language, Some(file))?;
    debug!("Executing {} as {}", file.display(), language);

    let build = judge::build(&language, &source, Default::default()).await?;
    if let Some(err) = build.error().await {
        anyhow::bail!("Build failed:\n{}", err.message);
    }

    let mut run = registry()?.new_execution_manager(&language, &build, Vec::new())?;
    run.run_interactive().await?;
    build.close().await;
    Ok(())
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// One input per line
fn read_inputs(path: &Path) -> Result<Vec<String>> {
    let content = read_source(path)?;
    Ok(content.lines().map(str::to_string).collect())
}
