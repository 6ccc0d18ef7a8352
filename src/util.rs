use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Truncate a string to at most `max` characters (Unicode-safe).
pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Milliseconds since the Unix epoch, used for backup file suffixes.
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandRunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.map(|s| s.success()).unwrap_or(false)
    }

    pub fn combined_output(&self) -> String {
        let mut combined = String::new();
        if !self.stdout.is_empty() {
            combined.push_str(&self.stdout);
        }
        if !self.stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&self.stderr);
        }
        combined
    }
}

/// Run a command with a hard timeout, draining stdout/stderr on threads so a
/// chatty child can never block on a full pipe.
pub fn run_command_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<CommandRunResult, String> {
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("Failed to start command: {}", e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Failed to capture stderr".to_string())?;

    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let mut reader = BufReader::new(stdout);
        let _ = reader.read_to_end(&mut buf);
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let mut reader = BufReader::new(stderr);
        let _ = reader.read_to_end(&mut buf);
        buf
    });

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    let _ = child.kill();
                    match child.wait() {
                        Ok(status) => break Some(status),
                        Err(_) => break None,
                    }
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(format!("Failed to wait for command: {}", e)),
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandRunResult {
        status,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
    })
}

#[derive(Debug)]
pub struct RepoPath {
    pub absolute: PathBuf,
    pub relative: PathBuf,
}

/// Resolve a backend-supplied path against the repository root.
///
/// Rejects absolute paths and parent traversal so an imprecise edit
/// instruction can never name a file outside the working tree. The target
/// itself does not have to exist yet.
pub fn resolve_repo_path(repo_root: &Path, candidate: &Path) -> Result<RepoPath, String> {
    if candidate.as_os_str().is_empty() {
        return Err("Path is empty".to_string());
    }
    if candidate.is_absolute() {
        return Err(format!(
            "Absolute paths are not allowed: {}",
            candidate.display()
        ));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(format!(
            "Parent traversal is not allowed: {}",
            candidate.display()
        ));
    }

    let root = repo_root
        .canonicalize()
        .map_err(|e| format!("Failed to resolve repo root: {}", e))?;
    let joined = root.join(candidate);
    let parent = joined
        .parent()
        .ok_or_else(|| format!("Invalid path: {}", candidate.display()))?;
    let parent_canon = canonicalize_existing_parent(parent)?;

    if !parent_canon.starts_with(&root) {
        return Err(format!("Path escapes repository: {}", candidate.display()));
    }

    let relative = joined
        .strip_prefix(&root)
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|_| candidate.to_path_buf());

    Ok(RepoPath {
        absolute: joined,
        relative,
    })
}

fn canonicalize_existing_parent(path: &Path) -> Result<PathBuf, String> {
    let mut current = path.to_path_buf();
    while !current.exists() {
        if !current.pop() {
            return Err("Path has no existing parent".to_string());
        }
    }
    current
        .canonicalize()
        .map_err(|e| format!("Failed to resolve path {}: {}", current.display(), e))
}

#[cfg(test)]
mod tests {
    use super::{resolve_repo_path, truncate};
    use std::path::PathBuf;

    #[test]
    fn test_truncate_unicode_safe() {
        let input = "ééééé";
        assert_eq!(truncate(input, 4), "é...");
    }

    #[test]
    fn test_truncate_small_max() {
        let input = "こんにちは";
        assert_eq!(truncate(input, 3), "こんに");
        assert_eq!(truncate(input, 0), "");
    }

    #[test]
    fn test_resolve_repo_path_accepts_missing_file() {
        let root = tempfile::tempdir().unwrap();
        let candidate = PathBuf::from("tests/login.spec.ts");
        let resolved = resolve_repo_path(root.path(), &candidate).unwrap();
        assert_eq!(resolved.relative, candidate);
        assert!(resolved.absolute.ends_with("tests/login.spec.ts"));
    }

    #[test]
    fn test_resolve_repo_path_rejects_traversal() {
        let root = tempfile::tempdir().unwrap();
        let err = resolve_repo_path(root.path(), &PathBuf::from("../outside.ts")).unwrap_err();
        assert!(err.contains("Parent traversal"));
    }

    #[test]
    fn test_resolve_repo_path_rejects_absolute() {
        let root = tempfile::tempdir().unwrap();
        let err = resolve_repo_path(root.path(), &PathBuf::from("/etc/passwd")).unwrap_err();
        assert!(err.contains("Absolute paths"));
    }
}
