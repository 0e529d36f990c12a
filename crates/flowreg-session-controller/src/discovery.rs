//! Local input discovery, used to size the stage 1 array.

use std::path::Path;

use flowreg_session_core::SessionConfig;

/// Array size used when local discovery fails or finds nothing. Surplus
/// tasks exit immediately on the cluster.
pub const FALLBACK_ARRAY_TASKS: u32 = 2048;

/// Count files in `root` whose name matches the glob `pattern`.
///
/// # Errors
/// Returns error if the pattern is malformed, spans directories, or `root`
/// cannot be read.
pub async fn count_input_files(root: &Path, pattern: &str) -> std::io::Result<usize> {
    let invalid = |reason: String| std::io::Error::new(std::io::ErrorKind::InvalidInput, reason);
    if pattern.contains(['/', '\\']) {
        return Err(invalid(format!("pattern {pattern:?} spans directories")));
    }
    let matcher =
        glob::Pattern::new(pattern).map_err(|e| invalid(format!("pattern {pattern:?}: {e}")))?;
    let mut entries = tokio::fs::read_dir(root).await?;
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if matcher.matches(&entry.file_name().to_string_lossy()) {
            count += 1;
        }
    }
    Ok(count)
}

/// Stage 1 array size for `config`, plus warnings explaining any fallback.
pub async fn array_size(config: &SessionConfig) -> (u32, Vec<String>) {
    let mut warnings = Vec::new();
    let discovered = match count_input_files(&config.root, &config.pattern).await {
        Ok(n) => u32::try_from(n).unwrap_or(u32::MAX),
        Err(e) => {
            warnings.push(format!("Local input discovery failed: {e}"));
            0
        }
    };
    if discovered > 0 {
        tracing::debug!(discovered, root = %config.root.display(), "Discovered input files");
        return (discovered, warnings);
    }
    if warnings.is_empty() {
        warnings.push("Local input discovery found 0 files.".to_string());
    }
    warnings.push(format!(
        "Using fallback Stage1 array size {FALLBACK_ARRAY_TASKS}. \
         Tasks beyond discovered files will auto-skip on the cluster."
    ));
    (FALLBACK_ARRAY_TASKS, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_matching_files_only() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.tif", "b.tif", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.tif")).unwrap();

        let config = SessionConfig::new(dir.path());
        let (size, warnings) = array_size(&config).await;
        assert_eq!(size, 2);
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn character_classes_and_single_wildcards_match() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["m_ch1.tif", "m_ch2.tif", "m_ch3.tif", "rec_01.h5", "rec_1.h5"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        assert_eq!(count_input_files(dir.path(), "*_ch[12].tif").await.unwrap(), 2);
        assert_eq!(count_input_files(dir.path(), "rec_??.h5").await.unwrap(), 1);
        assert_eq!(count_input_files(dir.path(), "*").await.unwrap(), 5);

        let mut config = SessionConfig::new(dir.path());
        config.pattern = "*_ch[12].tif".to_string();
        let (size, warnings) = array_size(&config).await;
        assert_eq!(size, 2);
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn malformed_pattern_is_a_discovery_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.tif"), b"x").unwrap();
        let err = count_input_files(dir.path(), "[a.tif").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);

        let mut config = SessionConfig::new(dir.path());
        config.pattern = "[a.tif".to_string();
        let (size, warnings) = array_size(&config).await;
        assert_eq!(size, FALLBACK_ARRAY_TASKS);
        assert!(warnings[0].starts_with("Local input discovery failed:"));
    }

    #[tokio::test]
    async fn empty_root_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let (size, warnings) = array_size(&SessionConfig::new(dir.path())).await;
        assert_eq!(size, FALLBACK_ARRAY_TASKS);
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0], "Local input discovery found 0 files.");
        assert!(warnings[1].contains("2048"));
    }

    #[tokio::test]
    async fn missing_root_falls_back_with_reason() {
        let config = SessionConfig::new("/no/such/flowreg/root");
        let (size, warnings) = array_size(&config).await;
        assert_eq!(size, FALLBACK_ARRAY_TASKS);
        assert!(warnings[0].starts_with("Local input discovery failed:"));
    }
}
