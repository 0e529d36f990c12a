//! Batch scripts and Python entry snippets for the three pipeline stages.

use flowreg_session_core::RemoteProfile;

/// File name of the stage 1 array script inside the run directory.
pub const STAGE1_SCRIPT: &str = "stage1_array.sbatch";
/// File name of the dependent stage 2+3 script inside the run directory.
pub const STAGE23_SCRIPT: &str = "stage23.sbatch";

/// Which part of the pipeline a snippet runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    /// All three stages in sequence.
    All,
    /// Per-file compensation; every file when no task index is given.
    Stage1,
    /// Between-average alignment.
    Stage2,
    /// Valid mask. Needs the stage 2 result, so stage 2 runs first.
    Stage3,
}

/// Escape `value` as a single-quoted Python string literal.
fn py_str(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn config_line(config_path: &str) -> String {
    format!("config = SessionConfig.from_file({})", py_str(config_path))
}

/// Python source that loads `config_path` and runs `stage`.
#[must_use]
pub fn pipeline_snippet(stage: PipelineStage, config_path: &str) -> String {
    let config = config_line(config_path);
    let mut lines = vec!["from pyflowreg.session.config import SessionConfig"];
    let stage1 = "from pyflowreg.session.stage1_compensate import run_stage1";
    let stage2 = "from pyflowreg.session.stage2_between_avgs import run_stage2";
    let stage3 = "from pyflowreg.session.stage3_valid_mask import run_stage3";
    match stage {
        PipelineStage::All => lines.extend([stage1, stage2, stage3]),
        PipelineStage::Stage1 => lines.push(stage1),
        PipelineStage::Stage2 => lines.push(stage2),
        PipelineStage::Stage3 => lines.extend([stage2, stage3]),
    }

    lines.push(&config);
    match stage {
        PipelineStage::Stage1 => lines.push("run_stage1(config)"),
        PipelineStage::Stage2 => lines.push("run_stage2(config)"),
        PipelineStage::All | PipelineStage::Stage3 => {
            if stage == PipelineStage::All {
                lines.push("run_stage1(config)");
            }
            lines.extend([
                "middle_idx, avg, displacements = run_stage2(config)",
                "del avg",
                "run_stage3(config, middle_idx, displacements)",
            ]);
        }
    }
    let mut source = lines.join("\n");
    source.push('\n');
    source
}

fn header(profile: &RemoteProfile) -> Vec<String> {
    let sbatch = &profile.sbatch;
    let mut lines = vec!["#!/bin/bash".to_string(), "#SBATCH -o slurm-%j.out".to_string()];
    if !sbatch.partition.trim().is_empty() {
        lines.push(format!("#SBATCH --partition={}", sbatch.partition.trim()));
    }
    if !sbatch.time.trim().is_empty() {
        lines.push(format!("#SBATCH --time={}", sbatch.time.trim()));
    }
    if !sbatch.mem.trim().is_empty() {
        lines.push(format!("#SBATCH --mem={}", sbatch.mem.trim()));
    }
    if sbatch.cpus > 0 {
        lines.push(format!("#SBATCH --cpus-per-task={}", sbatch.cpus));
    }
    if sbatch.gpus > 0 {
        lines.push(format!("#SBATCH --gres=gpu:{}", sbatch.gpus));
    }
    lines
}

fn assemble(mut header: Vec<String>, profile: &RemoteProfile, python: &[String]) -> String {
    header.push(String::new());
    header.push("set -euo pipefail".to_string());
    let activate = profile.env_activation_cmd.trim();
    if !activate.is_empty() {
        header.push(activate.to_string());
    }
    header.push("python - <<'PY'".to_string());
    header.extend(python.iter().cloned());
    header.push("PY".to_string());
    header.push(String::new());
    header.join("\n")
}

/// Stage 1 array job: one task per input file.
///
/// Tasks whose index is past the number of files discovered on the cluster
/// exit without work, so an oversized array is harmless.
#[must_use]
pub fn stage1_script(config_filename: &str, num_tasks: u32, profile: &RemoteProfile) -> String {
    let mut lines = header(profile);
    lines.push(format!("#SBATCH --array=1-{}", num_tasks.max(1)));
    let python = [
        "import os".to_string(),
        "from pyflowreg.session.config import SessionConfig".to_string(),
        "from pyflowreg.session.stage1_compensate import discover_input_files, run_stage1"
            .to_string(),
        config_line(config_filename),
        "task_index = int(os.environ['SLURM_ARRAY_TASK_ID']) - 1".to_string(),
        "n_files = len(list(discover_input_files(config)))".to_string(),
        "if task_index >= n_files:".to_string(),
        "    print(f'Skipping task {task_index}: only {n_files} files discovered.')".to_string(),
        "else:".to_string(),
        "    run_stage1(config, task_index=task_index)".to_string(),
    ];
    assemble(lines, profile, &python)
}

/// Stage 2+3 job, held until every stage 1 task exits successfully.
#[must_use]
pub fn stage23_script(config_filename: &str, stage1_job: &str, profile: &RemoteProfile) -> String {
    let mut lines = header(profile);
    lines.push(format!("#SBATCH --dependency=afterok:{stage1_job}"));
    let python = [
        "from pyflowreg.session.config import SessionConfig".to_string(),
        "from pyflowreg.session.stage2_between_avgs import run_stage2".to_string(),
        "from pyflowreg.session.stage3_valid_mask import run_stage3".to_string(),
        config_line(config_filename),
        "middle_idx, avg, displacements = run_stage2(config)".to_string(),
        "del avg".to_string(),
        "run_stage3(config, middle_idx, displacements)".to_string(),
    ];
    assemble(lines, profile, &python)
}

#[cfg(test)]
mod tests {
    use flowreg_session_core::SbatchDefaults;

    use super::*;

    fn profile() -> RemoteProfile {
        let mut profile = RemoteProfile::new("deigo");
        profile.env_activation_cmd = "source ~/venv/bin/activate".to_string();
        profile.sbatch = SbatchDefaults {
            partition: "compute".to_string(),
            time: "01:00:00".to_string(),
            mem: "32G".to_string(),
            cpus: 4,
            gpus: 0,
        };
        profile
    }

    #[test]
    fn stage1_declares_array_and_skips_extra_tasks() {
        let script = stage1_script("session_config.yaml", 12, &profile());
        assert!(script.starts_with("#!/bin/bash\n#SBATCH -o slurm-%j.out\n"));
        assert!(script.contains("#SBATCH --array=1-12"));
        assert!(script.contains("#SBATCH --partition=compute"));
        assert!(script.contains("#SBATCH --time=01:00:00"));
        assert!(script.contains("#SBATCH --mem=32G"));
        assert!(script.contains("#SBATCH --cpus-per-task=4"));
        assert!(!script.contains("--gres"));
        assert!(script.contains("source ~/venv/bin/activate\npython - <<'PY'"));
        assert!(script.contains("SessionConfig.from_file('session_config.yaml')"));
        assert!(script.contains("task_index = int(os.environ['SLURM_ARRAY_TASK_ID']) - 1"));
        assert!(script.contains("if task_index >= n_files:"));
        assert!(script.contains("run_stage1(config, task_index=task_index)"));
        assert!(script.ends_with("PY\n"));
    }

    #[test]
    fn stage23_declares_dependency() {
        let mut profile = profile();
        profile.sbatch.gpus = 1;
        profile.env_activation_cmd.clear();
        let script = stage23_script("session_config.yaml", "4242", &profile);
        assert!(script.contains("#SBATCH --dependency=afterok:4242"));
        assert!(script.contains("#SBATCH --gres=gpu:1"));
        assert!(script.contains("set -euo pipefail\npython - <<'PY'"));
        assert!(script.contains("middle_idx, avg, displacements = run_stage2(config)"));
        assert!(script.contains("run_stage3(config, middle_idx, displacements)"));
        assert!(!script.contains("--array"));
    }

    #[test]
    fn empty_sbatch_fields_are_omitted() {
        let mut profile = RemoteProfile::new("deigo");
        profile.sbatch = SbatchDefaults {
            partition: String::new(),
            time: "  ".to_string(),
            mem: String::new(),
            cpus: 0,
            gpus: 0,
        };
        let script = stage1_script("c.yaml", 0, &profile);
        let directives: Vec<_> = script.lines().filter(|l| l.starts_with("#SBATCH")).collect();
        assert_eq!(directives, vec!["#SBATCH -o slurm-%j.out", "#SBATCH --array=1-1"]);
    }

    #[test]
    fn config_path_is_escaped_for_python() {
        let snippet = pipeline_snippet(PipelineStage::Stage2, "/tmp/it's\\here.yaml");
        assert!(snippet.contains(r"SessionConfig.from_file('/tmp/it\'s\\here.yaml')"));
        assert!(snippet.contains("run_stage2(config)"));
        assert!(!snippet.contains("run_stage3"));
    }

    #[test]
    fn stage3_snippet_runs_stage2_first() {
        let snippet = pipeline_snippet(PipelineStage::Stage3, "c.yaml");
        let stage2 = snippet.find("run_stage2(config)").unwrap();
        let stage3 = snippet.find("run_stage3(config,").unwrap();
        assert!(stage2 < stage3);
        assert!(!snippet.contains("run_stage1"));
    }

    #[test]
    fn full_snippet_runs_every_stage() {
        let snippet = pipeline_snippet(PipelineStage::All, "c.yaml");
        assert!(snippet.contains("run_stage1(config)\n"));
        assert!(snippet.contains("del avg"));
        assert!(snippet.contains("run_stage3"));
    }
}
