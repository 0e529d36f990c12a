//! Subcommand handlers.

use std::path::Path;

use anyhow::{Context, Result};
use flowreg_session_controller::{
    FileStorage, LocalRunner, PollSettings, SubmissionController,
    local::DEFAULT_PYTHON,
};
use flowreg_session_core::{JobHandle, MsgStore, SessionConfig, SessionEvent};
use flowreg_session_slurm::{PipelineStage, StatusReport};
use flowreg_session_transport::SshTransport;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::settings::Settings;

type Controller = SubmissionController<SshTransport, FileStorage>;

fn controller(settings: &Settings) -> Result<Controller> {
    let transport = SshTransport::default().with_connect_timeout(settings.connect_timeout());
    let storage = FileStorage::new(settings.state_path()?);
    let mut controller = SubmissionController::new(
        transport,
        storage,
        settings.remote.clone(),
        settings.mappings.clone(),
    );
    if let Some(dir) = &settings.bundle_dir {
        controller = controller.with_bundle_root(dir);
    }
    Ok(controller)
}

async fn load_config(path: &Path) -> Result<SessionConfig> {
    let config = SessionConfig::load(path)
        .await
        .with_context(|| format!("Failed to load session config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping");
            trigger.cancel();
        }
    });
    token
}

fn format_event(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::State(state) => Some(format!("== {state:?}")),
        SessionEvent::Progress(line) | SessionEvent::Stdout(line) => Some(line.clone()),
        SessionEvent::Warning(line) => Some(format!("warning: {line}")),
        SessionEvent::Stderr(line) => Some(format!("stderr: {line}")),
        SessionEvent::Submitted { stage1, stage23 } => Some(format!(
            "Submitted stage 1 as job {stage1}, stage 2+3 as job {stage23}"
        )),
        SessionEvent::JobState { job, state } => Some(format!("job {job}: {state}")),
        SessionEvent::Error(_) | SessionEvent::Finished => None,
    }
}

/// Print events from `store` to stderr until `Finished`.
fn print_events(store: &MsgStore) -> tokio::task::JoinHandle<()> {
    let mut events = store.until_finished();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let Some(line) = format_event(&event) {
                eprintln!("{line}");
            }
        }
    })
}

fn poll_settings(settings: &Settings, interval: Option<u64>, timeout: Option<u64>) -> PollSettings {
    let mut poll = settings.poll.clone();
    if let Some(secs) = interval {
        poll.interval_secs = secs;
    }
    if let Some(secs) = timeout {
        poll.timeout_secs = secs;
    }
    poll.to_settings()
}

fn print_report(report: &StatusReport) {
    println!("{}", report.render());
}

pub async fn check(settings: &Settings) -> Result<()> {
    let reply = controller(settings)?.test_connection().await?;
    println!("SSH connection to {} OK: {reply}", settings.remote.host_alias);
    Ok(())
}

pub async fn upload(settings: &Settings, config: &Path) -> Result<()> {
    let config = load_config(config).await?;
    let run = controller(settings)?.upload(&config).await?;
    for warning in &run.upload_warnings {
        eprintln!("warning: {warning}");
    }
    println!("Uploaded {} to {}:{}", run.run_name, run.host_alias, run.remote_run_dir);
    println!("Stage 1 array size: {}", run.num_tasks);
    Ok(())
}

pub async fn submit(settings: &Settings) -> Result<()> {
    let run = controller(settings)?.submit().await?;
    let show = |job: Option<&JobHandle>| job.map_or_else(|| "-".to_string(), ToString::to_string);
    println!("Stage 1 job: {}", show(run.stage1_job.as_ref()));
    println!("Stage 2+3 job: {}", show(run.stage23_job.as_ref()));
    Ok(())
}

pub async fn status(settings: &Settings) -> Result<()> {
    print_report(&controller(settings)?.refresh_status().await?);
    Ok(())
}

pub async fn watch(settings: &Settings, interval: Option<u64>, timeout: Option<u64>) -> Result<()> {
    let controller = controller(settings)?;
    let printer = print_events(&controller.msg_store());
    let result = controller
        .poll_until_terminal(poll_settings(settings, interval, timeout), &cancel_on_ctrl_c())
        .await;
    controller.msg_store().push_finished();
    let _ = printer.await;
    print_report(&result?);
    Ok(())
}

pub async fn logs(settings: &Settings, lines: u32) -> Result<()> {
    println!("{}", controller(settings)?.tail_latest_log(lines).await?);
    Ok(())
}

pub async fn cancel(settings: &Settings, job_ids: &[String]) -> Result<()> {
    let jobs: Vec<JobHandle> = job_ids.iter().map(JobHandle::new).collect();
    let cancelled = controller(settings)?.cancel_jobs(&jobs).await?;
    if cancelled.is_empty() {
        println!("Nothing to cancel.");
    } else {
        let ids: Vec<String> = cancelled.iter().map(ToString::to_string).collect();
        println!("Cancelled {}", ids.join(" "));
    }
    Ok(())
}

pub async fn run(
    settings: &Settings,
    config: &Path,
    interval: Option<u64>,
    timeout: Option<u64>,
) -> Result<()> {
    let config = load_config(config).await?;
    let controller = controller(settings)?;
    let printer = print_events(&controller.msg_store());
    let result = controller
        .run(&config, poll_settings(settings, interval, timeout), &cancel_on_ctrl_c())
        .await;
    let _ = printer.await;
    print_report(&result?);
    Ok(())
}

pub async fn forget(settings: &Settings) -> Result<()> {
    match controller(settings)?.forget_run().await? {
        Some(run) => println!(
            "Forgot {} ({}:{}); remote files and jobs were left alone.",
            run.run_name, run.host_alias, run.remote_run_dir
        ),
        None => println!("No run state to forget."),
    }
    Ok(())
}

pub async fn browse(settings: &Settings, dir: Option<&str>, depth: u32, limit: u32) -> Result<()> {
    let controller = controller(settings)?;
    if let Some(dir) = dir {
        let listing = controller.list_directory(dir).await?;
        println!("{}", listing.path);
        for child in listing.children {
            println!("  {child}");
        }
    } else {
        for path in controller.list_directories(None, depth, limit).await? {
            println!("{path}");
        }
    }
    Ok(())
}

pub async fn local(settings: &Settings, config: &Path, stage: PipelineStage) -> Result<()> {
    let config = load_config(config).await?;
    let python = settings.python.as_deref().unwrap_or(DEFAULT_PYTHON);
    let mut runner = LocalRunner::new(python);
    if let Some(dir) = &settings.bundle_dir {
        runner = runner.with_scratch_dir(dir);
    }
    let printer = print_events(&runner.msg_store());
    let result = runner.run(&config, stage, &cancel_on_ctrl_c()).await;
    let _ = printer.await;
    result?;
    println!("Local run finished.");
    Ok(())
}

pub async fn config_validate(path: &Path) -> Result<()> {
    let config = load_config(path).await?;
    println!(
        "{} is valid (root {}, pattern {}, {} parameters)",
        path.display(),
        config.root.display(),
        config.pattern,
        config.parameters.len()
    );
    Ok(())
}

pub async fn config_show(settings: &Settings, path: &Path, mapped: bool) -> Result<()> {
    let config = load_config(path).await?;
    let yaml = if mapped {
        config.map_paths(&settings.mappings).to_yaml(false)?
    } else {
        config.to_yaml(false)?
    };
    print!("{yaml}");
    Ok(())
}

pub async fn config_save(input: &Path, output: &Path, prefer_relative: bool) -> Result<()> {
    let config = load_config(input).await?;
    config.save(output, prefer_relative).await?;
    println!("Saved {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use flowreg_session_core::{JobState, SubmissionState};

    use super::*;

    #[test]
    fn events_render_for_the_terminal() {
        assert_eq!(
            format_event(&SessionEvent::State(SubmissionState::Uploading)).as_deref(),
            Some("== Uploading")
        );
        assert_eq!(
            format_event(&SessionEvent::JobState {
                job: JobHandle::new("12"),
                state: JobState::Running,
            })
            .as_deref(),
            Some("job 12: running")
        );
        assert_eq!(format_event(&SessionEvent::Finished), None);
    }

    #[test]
    fn poll_overrides() {
        let settings = Settings::default();
        let poll = poll_settings(&settings, Some(0), Some(60));
        assert_eq!(poll.interval, std::time::Duration::from_secs(1));
        assert_eq!(poll.timeout, std::time::Duration::from_secs(60));
    }

    #[tokio::test]
    async fn config_save_converts_toml_to_relative_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("session.toml");
        std::fs::write(
            &input,
            "root = \"/data/exp\"\noutput_root = \"/data/exp/out\"\nsigma = 1.5\n",
        )
        .unwrap();
        let output = dir.path().join("session.yaml");
        config_save(&input, &output, true).await.unwrap();

        let saved = SessionConfig::load(&output).await.unwrap();
        assert_eq!(saved.output_root, Some("out".into()));
        assert!(saved.parameters.contains_key("sigma"));
    }

    #[tokio::test]
    async fn forget_removes_the_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("last_run.json");
        let mut settings = Settings::default();
        settings.state_file = Some(state.clone());

        forget(&settings).await.unwrap();

        std::fs::write(
            &state,
            r#"{"run_name":"run_1","remote_run_dir":"~/runs/run_1","local_bundle_dir":"/tmp/run_1",
               "config_filename":"session_config.yaml","num_tasks":2,"stage1_job":null,
               "stage23_job":null,"upload_warnings":[],"host_alias":"deigo"}"#,
        )
        .unwrap();
        forget(&settings).await.unwrap();
        assert!(!state.exists());
    }
}
