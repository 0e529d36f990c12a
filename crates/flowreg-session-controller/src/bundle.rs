//! Local run bundle: the directory mirrored into the remote run directory.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use flowreg_session_core::{
    PathMapping, RemoteProfile, RemoteRun, SessionConfig, config::DEFAULT_CONFIG_FILENAME,
};
use flowreg_session_slurm::{STAGE1_SCRIPT, STAGE23_SCRIPT, stage1_script, stage23_script};

use crate::error::ControllerError;

/// Default parent of local bundle directories.
#[must_use]
pub fn default_bundle_root() -> PathBuf {
    std::env::temp_dir().join("flowreg-session")
}

/// `run_YYYYmmdd_HHMMSS`.
#[must_use]
pub fn run_name(now: DateTime<Local>) -> String {
    now.format("run_%Y%m%d_%H%M%S").to_string()
}

/// Write the mapped configuration and the stage 1 script into a fresh
/// bundle directory under `bundle_root`.
///
/// # Errors
/// Returns error if the bundle cannot be written.
pub async fn prepare_bundle(
    bundle_root: &Path,
    run_name: &str,
    config: &SessionConfig,
    profile: &RemoteProfile,
    mappings: &[PathMapping],
    num_tasks: u32,
) -> Result<RemoteRun, ControllerError> {
    let bundle_dir = bundle_root.join(run_name);
    tokio::fs::create_dir_all(&bundle_dir)
        .await
        .map_err(ControllerError::io(&bundle_dir))?;

    // the job runs from the remote run directory, not from `root`
    config
        .absolutized()
        .map_paths(mappings)
        .save(&bundle_dir.join(DEFAULT_CONFIG_FILENAME), false)
        .await?;

    let script_path = bundle_dir.join(STAGE1_SCRIPT);
    tokio::fs::write(
        &script_path,
        stage1_script(DEFAULT_CONFIG_FILENAME, num_tasks, profile),
    )
    .await
    .map_err(ControllerError::io(&script_path))?;

    tracing::info!(bundle = %bundle_dir.display(), num_tasks, "Prepared run bundle");
    Ok(RemoteRun {
        run_name: run_name.to_string(),
        remote_run_dir: profile.run_dir(run_name),
        local_bundle_dir: bundle_dir,
        config_filename: DEFAULT_CONFIG_FILENAME.to_string(),
        num_tasks,
        stage1_job: None,
        stage23_job: None,
        upload_warnings: Vec::new(),
        host_alias: profile.host_alias.clone(),
    })
}

/// Render the stage 2+3 script for `stage1_job` into the run's bundle,
/// recreating the bundle directory if it was cleaned up.
///
/// # Errors
/// Returns error if the script cannot be written.
pub async fn write_stage23_script(
    run: &RemoteRun,
    stage1_job: &str,
    profile: &RemoteProfile,
) -> Result<PathBuf, ControllerError> {
    tokio::fs::create_dir_all(&run.local_bundle_dir)
        .await
        .map_err(ControllerError::io(&run.local_bundle_dir))?;
    let path = run.local_bundle_dir.join(STAGE23_SCRIPT);
    tokio::fs::write(
        &path,
        stage23_script(&run.config_filename, stage1_job, profile),
    )
    .await
    .map_err(ControllerError::io(&path))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn run_name_format() {
        let now = Local.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(run_name(now), "run_20260304_050607");
    }

    #[tokio::test]
    async fn bundle_holds_mapped_config_and_stage1_script() {
        let root = tempfile::tempdir().unwrap();
        let mut config = SessionConfig::new("/data/exp1");
        config.output_root = Some("out".into());
        let profile = RemoteProfile::new("deigo").with_remote_base_dir("~/runs/");
        let mappings = [PathMapping::new("/data", "/bucket/lab")];

        let run = prepare_bundle(root.path(), "run_1", &config, &profile, &mappings, 3)
            .await
            .unwrap();
        assert_eq!(run.remote_run_dir, "~/runs/run_1");
        assert_eq!(run.local_bundle_dir, root.path().join("run_1"));
        assert_eq!(run.num_tasks, 3);

        let saved = SessionConfig::load(&run.local_bundle_dir.join("session_config.yaml"))
            .await
            .unwrap();
        assert_eq!(saved.root, PathBuf::from("/bucket/lab/exp1"));
        assert_eq!(saved.output_root, Some(PathBuf::from("/bucket/lab/exp1/out")));

        let script =
            std::fs::read_to_string(run.local_bundle_dir.join("stage1_array.sbatch")).unwrap();
        assert!(script.contains("#SBATCH --array=1-3"));
    }

    #[tokio::test]
    async fn stage23_script_is_written_next_to_stage1() {
        let root = tempfile::tempdir().unwrap();
        let profile = RemoteProfile::new("deigo");
        let run = prepare_bundle(
            root.path(),
            "run_2",
            &SessionConfig::new("/data"),
            &profile,
            &[],
            1,
        )
        .await
        .unwrap();
        std::fs::remove_dir_all(&run.local_bundle_dir).unwrap();

        let path = write_stage23_script(&run, "555", &profile).await.unwrap();
        assert_eq!(path, run.local_bundle_dir.join("stage23.sbatch"));
        let script = std::fs::read_to_string(path).unwrap();
        assert!(script.contains("afterok:555"));
    }
}
