use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use console::Style;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use taro::api::ApiClient;
use taro::cli::{Cli, Command, ConfigAction, OutputFormat};
use taro::config::TaroConfig;
use taro::error::TaroError;
use taro::execution::{Execution, ExecutionState};
use taro::job::{generate_instance_id, JobInfo, JobInstance};
use taro::listening::{StateFilter, StateReceiver};
use taro::log::{self, LogSinks};
use taro::persistence::DisabledJob;
use taro::plugin::PluginRegistry;
use taro::process::ProcessExecution;
use taro::runner::JobRunner;
use taro::{paths, persistence, ui};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            let red = Style::new().red().bold();
            if matches!(e.downcast_ref::<TaroError>(), Some(TaroError::PersistenceDisabled)) {
                eprintln!(
                    "{} job history and disabled jobs need persistence; set `enabled = true` in the [persistence] section of taro.toml",
                    red.apply_to("Persistence is disabled:")
                );
            } else {
                eprintln!("{} {e:#}", red.apply_to("Error:"));
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = if cli.def_config {
        TaroConfig::default()
    } else {
        TaroConfig::load(cli.config.as_deref())?
    };
    config.apply_overrides(&cli.log_overrides())?;
    log::init(&LogSinks::from_config(&config)?)?;

    match cli.command {
        Command::Exec {
            id,
            capture,
            queue_size,
            command,
        } => exec(&config, id, capture, queue_size, command).await,
        Command::Ps { pattern, format } => {
            let pattern = pattern.unwrap_or_default();
            let jobs = blocking(move || Ok(api_client()?.read_jobs_info(&pattern)?)).await?;
            print_jobs(&jobs, format);
            Ok(ExitCode::SUCCESS)
        }
        Command::Stop { pattern, signal } => {
            let results = blocking(move || {
                let mut client = api_client()?;
                Ok(match signal {
                    Some(signal) => client.interrupt_jobs(&pattern, signal)?,
                    None => client.stop_jobs(&pattern)?,
                })
            })
            .await?;
            ui::print_control_results(&results);
            Ok(ExitCode::SUCCESS)
        }
        Command::Tail { pattern } => {
            let pattern = pattern.unwrap_or_default();
            let tails = blocking(move || Ok(api_client()?.read_tail(&pattern)?)).await?;
            ui::print_tail(&tails);
            Ok(ExitCode::SUCCESS)
        }
        Command::Wait {
            pattern,
            states,
            count,
        } => {
            let filter = StateFilter {
                instance_match: pattern.unwrap_or_default(),
                states,
            };
            wait(filter, count).await
        }
        Command::History {
            chronological,
            format,
        } => {
            let jobs = persistence::open(&config)?.read_jobs(chronological)?;
            print_jobs(&jobs, format);
            Ok(ExitCode::SUCCESS)
        }
        Command::Disable { regex, ids } => {
            let jobs = ids
                .iter()
                .map(|id| DisabledJob::new(id.as_str(), regex))
                .collect::<Result<Vec<_>, _>>()?;
            let added = persistence::open(&config)?.add_disabled_jobs(&jobs)?;
            if added.is_empty() {
                println!("{}", Style::new().yellow().apply_to("Already disabled"));
            }
            ui::print_disabled_jobs(&added);
            Ok(ExitCode::SUCCESS)
        }
        Command::Enable { ids } => {
            let removed = persistence::open(&config)?.remove_disabled_jobs(&ids)?;
            if removed.is_empty() {
                println!("{}", Style::new().yellow().apply_to("No matching disabled job"));
            }
            for job_id in removed {
                println!("{job_id}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Disabled => {
            ui::print_disabled_jobs(&persistence::open(&config)?.read_disabled_jobs()?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Config {
            action: ConfigAction::Show,
        } => {
            print!("{}", config.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

fn api_client() -> Result<ApiClient> {
    Ok(ApiClient::new(paths::socket_dir()?)?)
}

fn print_jobs(jobs: &[JobInfo], format: OutputFormat) {
    match format {
        OutputFormat::Table => ui::print_jobs_table(jobs),
        OutputFormat::Json => ui::print_jobs_json(jobs),
    }
}

fn signal_exit(signal: i32) -> ExitCode {
    ExitCode::from((128 + signal) as u8)
}

async fn exec(
    config: &TaroConfig,
    id: Option<String>,
    capture: bool,
    queue_size: usize,
    command: Vec<String>,
) -> Result<ExitCode> {
    let socket_dir = paths::socket_dir()?;
    let runner = JobRunner::from_config(&socket_dir, config, &PluginRegistry::with_builtins())?;

    let job_id = id.unwrap_or_else(|| {
        command
            .first()
            .and_then(|program| Path::new(program).file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    let execution: Arc<dyn Execution> = if capture {
        Arc::new(ProcessExecution::capturing(command, queue_size))
    } else {
        Arc::new(ProcessExecution::new(command))
    };
    let instance = JobInstance::new(job_id, generate_instance_id(), execution);
    if capture {
        instance.add_output_observer(|_: &JobInfo, line: &str| println!("{line}"));
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let run = runner.run(instance.clone());
    tokio::pin!(run);

    let received = tokio::select! {
        info = &mut run => return Ok(exec_exit(&info?)),
        _ = sigterm.recv() => libc::SIGTERM,
        _ = sigint.recv() => libc::SIGINT,
    };

    tracing::warn!(signal = received, instance_id = %instance.instance_id(), "terminated_by_signal");
    if let Err(e) = instance.interrupt(libc::SIGTERM) {
        tracing::error!(error = %e, "interrupt_failed");
    }
    run.await?;
    Ok(signal_exit(received))
}

fn exec_exit(info: &JobInfo) -> ExitCode {
    let state = info.state();
    if state == ExecutionState::Completed {
        return ExitCode::SUCCESS;
    }
    if state == ExecutionState::Disabled {
        eprintln!(
            "{} job {} is disabled",
            ui::state_style(state).apply_to(state),
            info.job_id
        );
    }
    if let Some(err) = &info.exec_error {
        eprintln!("{}: {}", ui::state_style(state).apply_to(state), err.message);
    }
    ExitCode::FAILURE
}

async fn wait(filter: StateFilter, count: u32) -> Result<ExitCode> {
    let mut receiver = StateReceiver::start(&paths::socket_dir()?, filter)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    receiver.add_observer(move |info: &JobInfo| {
        let _ = tx.send(info.clone());
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let progress = ui::WaitProgress::start("Waiting for state changes");
    let mut remaining = count.max(1);

    let code = loop {
        tokio::select! {
            Some(info) = rx.recv() => {
                progress.state_changed(&info);
                remaining -= 1;
                if remaining == 0 {
                    break ExitCode::SUCCESS;
                }
            }
            _ = sigterm.recv() => break signal_exit(libc::SIGTERM),
            _ = sigint.recv() => break signal_exit(libc::SIGINT),
        }
    };

    progress.finish();
    receiver.close();
    Ok(code)
}
