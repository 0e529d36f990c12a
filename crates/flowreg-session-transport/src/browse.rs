//! Remote directory browsing for picking a run base directory.

use std::collections::BTreeSet;

use flowreg_session_core::{RemoteProfile, Transport, TransportError};

use crate::command::quote;

const BASE_MARKER: &str = "__BASE__:";
const NOT_DIR_MARKER: &str = "__WARN_NOT_DIR__:";

/// One level of a remote directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDirectoryListing {
    /// Directory actually listed, with `~` expanded.
    pub path: String,
    /// Sorted, de-duplicated child directories.
    pub children: Vec<String>,
}

/// Shell prelude that expands a leading `~` in `$var`.
fn expand_home(var: &str) -> String {
    format!(r#"case "${var}" in "~") {var}="$HOME" ;; "~/"*) {var}="$HOME/${{{var}#??}}" ;; esac; "#)
}

/// List the child directories of `directory` on the target.
///
/// Falls back to `$HOME` when `directory` is not a directory; an empty
/// request means `~`.
///
/// # Errors
/// Returns transport errors, or `UnexpectedOutput` if the listing cannot be
/// parsed.
pub async fn list_remote_directory<T: Transport + ?Sized>(
    transport: &T,
    target: &RemoteProfile,
    directory: &str,
) -> Result<RemoteDirectoryListing, TransportError> {
    let requested = match directory.trim() {
        "" => "~",
        dir => dir,
    };
    let command = format!(
        "requested={}; {}\
         if [ ! -d \"$requested\" ]; then echo \"{NOT_DIR_MARKER}$requested\"; requested=\"$HOME\"; fi; \
         printf \"{BASE_MARKER}%s\\n\" \"$requested\"; \
         find \"$requested\" -mindepth 1 -maxdepth 1 -type d 2>/dev/null | sort",
        quote(requested)?,
        expand_home("requested"),
    );
    let output = transport.execute(target, &command).await?;
    parse_directory_listing(&output.stdout).ok_or_else(|| TransportError::UnexpectedOutput {
        command: "directory listing".to_string(),
        output: output.stdout,
    })
}

/// List directories below `start_dir` (default: the profile's base dir) up
/// to `max_depth` levels, at most `limit` entries, base directory first.
///
/// The base directory is created if it does not exist.
///
/// # Errors
/// Returns transport errors.
pub async fn list_remote_directories<T: Transport + ?Sized>(
    transport: &T,
    target: &RemoteProfile,
    start_dir: Option<&str>,
    max_depth: u32,
    limit: u32,
) -> Result<Vec<String>, TransportError> {
    let requested = start_dir
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| Some(target.remote_base_dir.trim()).filter(|s| !s.is_empty()))
        .unwrap_or("~");
    let command = format!(
        "base={}; {}\
         mkdir -p \"$base\" >/dev/null 2>&1 || true; \
         printf \"%s\\n\" \"$base\"; \
         find \"$base\" -mindepth 1 -maxdepth {} -type d 2>/dev/null | sort | head -n {}",
        quote(requested)?,
        expand_home("base"),
        max_depth.max(1),
        limit.max(1),
    );
    let output = transport.execute(target, &command).await?;

    let mut seen = BTreeSet::new();
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && seen.insert(line.to_string()))
        .map(ToString::to_string)
        .collect())
}

/// Parse marker-annotated `find` output.
#[must_use]
pub fn parse_directory_listing(output: &str) -> Option<RemoteDirectoryListing> {
    let mut base = None;
    let mut children = BTreeSet::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(path) = line.strip_prefix(BASE_MARKER) {
            base = Some(path.to_string());
        } else if !line.starts_with(NOT_DIR_MARKER) {
            children.insert(line.to_string());
        }
    }
    base.map(|path| RemoteDirectoryListing {
        path,
        children: children.into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Mutex};

    use async_trait::async_trait;
    use flowreg_session_core::ExecOutput;

    use super::*;

    struct CannedTransport {
        stdout: String,
        commands: Mutex<Vec<String>>,
    }

    impl CannedTransport {
        fn new(stdout: &str) -> Self {
            Self {
                stdout: stdout.to_string(),
                commands: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl Transport for CannedTransport {
        async fn test_connection(&self, _: &RemoteProfile) -> Result<String, TransportError> {
            Ok("connected".to_string())
        }

        async fn upload(&self, _: &RemoteProfile, _: &Path, _: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn execute(
            &self,
            _: &RemoteProfile,
            command: &str,
        ) -> Result<ExecOutput, TransportError> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(ExecOutput {
                stdout: self.stdout.clone(),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn listing_returns_base_and_sorted_children() {
        let transport = CannedTransport::new(
            "__BASE__:/home/test/runs\n/home/test/runs/z\n/home/test/runs/a\n/home/test/runs/a\n",
        );
        let profile = RemoteProfile::new("deigo").with_remote_base_dir("~/runs");
        let listing = list_remote_directory(&transport, &profile, "~/runs")
            .await
            .unwrap();
        assert_eq!(listing.path, "/home/test/runs");
        assert_eq!(listing.children, vec!["/home/test/runs/a", "/home/test/runs/z"]);

        let command = transport.commands.lock().unwrap()[0].clone();
        assert!(command.starts_with("requested='~/runs';"));
        assert!(command.contains("find"));
    }

    #[tokio::test]
    async fn directories_are_unique_in_order() {
        let transport = CannedTransport::new(
            "/home/test/runs\n/home/test/runs/a\n/home/test/runs/a\n\n/home/test/runs/b\n",
        );
        let profile = RemoteProfile::new("deigo").with_remote_base_dir("~/runs");
        let dirs = list_remote_directories(&transport, &profile, None, 0, 200)
            .await
            .unwrap();
        assert_eq!(
            dirs,
            vec!["/home/test/runs", "/home/test/runs/a", "/home/test/runs/b"]
        );
        let command = transport.commands.lock().unwrap()[0].clone();
        assert!(command.contains("-maxdepth 1"));
        assert!(command.contains("mkdir -p"));
    }

    #[tokio::test]
    async fn missing_base_marker_is_unexpected_output() {
        let transport = CannedTransport::new("/tmp/a\n/tmp/b\n");
        let err = list_remote_directory(&transport, &RemoteProfile::default(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnexpectedOutput { .. }));
    }

    #[test]
    fn warn_marker_is_ignored() {
        let listing = parse_directory_listing(
            "__WARN_NOT_DIR__:/bad/path\n__BASE__:/home/test\n/home/test/a\n",
        )
        .unwrap();
        assert_eq!(listing.path, "/home/test");
        assert_eq!(listing.children, vec!["/home/test/a"]);
    }

    #[test]
    fn home_expansion_snippet() {
        assert_eq!(
            expand_home("base"),
            r#"case "$base" in "~") base="$HOME" ;; "~/"*) base="$HOME/${base#??}" ;; esac; "#
        );
    }
}
