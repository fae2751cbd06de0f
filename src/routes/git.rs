//! Version-control introspection over the working directory.
//!
//! - `GET /api/git/status` — branch plus staged/unstaged/untracked paths,
//!   parsed from `git status --porcelain`
//! - `GET /api/git/diff`   — unstaged and staged diffs with per-file
//!   add/delete counts, parsed from `git diff --numstat`
//!
//! A non-repository working directory is not an error; both endpoints answer
//! with `is_repo`/empty fields so the client can degrade gracefully.

use axum::{extract::State, Json};
use serde::Serialize;
use serde_json::Value;
use tokio::process::Command;

use crate::state::AppState;

/// One file in a diff, with numstat counts.
#[derive(Debug, Serialize)]
pub struct DiffFile {
    pub path: String,
    pub status: String,
    pub additions: u32,
    pub deletions: u32,
}

/// Run git in the working directory, capturing stdout. `Err` carries stderr.
async fn run_git(work_dir: &str, args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(work_dir)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| e.to_string())?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).into_owned())
    }
}

async fn is_git_repo(work_dir: &str) -> bool {
    run_git(work_dir, &["rev-parse", "--git-dir"]).await.is_ok()
}

async fn current_branch(work_dir: &str) -> String {
    run_git(work_dir, &["rev-parse", "--abbrev-ref", "HEAD"])
        .await
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Split `git status --porcelain` output into staged, unstaged, and
/// untracked path lists.
fn parse_porcelain(output: &str) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut staged = Vec::new();
    let mut unstaged = Vec::new();
    let mut untracked = Vec::new();

    for line in output.lines() {
        if line.len() < 3 {
            continue;
        }
        let bytes = line.as_bytes();
        let index_status = bytes[0] as char;
        let work_status = bytes[1] as char;
        let file = line[3..].trim().to_string();

        if index_status != ' ' && index_status != '?' {
            staged.push(file.clone());
        }
        if work_status != ' ' && work_status != '?' {
            unstaged.push(file.clone());
        }
        if index_status == '?' && work_status == '?' {
            untracked.push(file);
        }
    }

    (staged, unstaged, untracked)
}

/// Parse `git diff --numstat` output. Binary files report `-` counts, which
/// read as zero.
fn parse_numstat(output: &str) -> Vec<DiffFile> {
    let mut files = Vec::new();
    for line in output.lines() {
        let mut parts = line.split_whitespace();
        let (Some(add), Some(del), Some(path)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        let additions: u32 = add.parse().unwrap_or(0);
        let deletions: u32 = del.parse().unwrap_or(0);
        let status = if additions > 0 && deletions == 0 {
            "added"
        } else if additions == 0 && deletions > 0 {
            "deleted"
        } else {
            "modified"
        };
        files.push(DiffFile {
            path: path.to_string(),
            status: status.to_string(),
            additions,
            deletions,
        });
    }
    files
}

/// `GET /api/git/status`.
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let work_dir = &state.config.work_dir;
    if !is_git_repo(work_dir).await {
        return Json(serde_json::json!({
            "is_repo": false,
            "branch": "",
            "has_changes": false,
            "staged": [],
            "unstaged": [],
            "untracked": [],
        }));
    }

    let branch = current_branch(work_dir).await;
    let porcelain = run_git(work_dir, &["status", "--porcelain"])
        .await
        .unwrap_or_default();
    let (staged, unstaged, untracked) = parse_porcelain(&porcelain);
    let has_changes = !staged.is_empty() || !unstaged.is_empty() || !untracked.is_empty();

    Json(serde_json::json!({
        "is_repo": true,
        "branch": branch,
        "has_changes": has_changes,
        "staged": staged,
        "unstaged": unstaged,
        "untracked": untracked,
    }))
}

/// `GET /api/git/diff`.
pub async fn diff(State(state): State<AppState>) -> Json<Value> {
    let work_dir = &state.config.work_dir;
    if !is_git_repo(work_dir).await {
        return Json(serde_json::json!({
            "branch": "",
            "files": [],
            "diff": "",
            "has_changes": false,
            "staged": [],
            "staged_diff": "",
        }));
    }

    let branch = current_branch(work_dir).await;
    let diff = run_git(work_dir, &["diff"]).await.unwrap_or_default();
    let files = parse_numstat(
        &run_git(work_dir, &["diff", "--numstat"])
            .await
            .unwrap_or_default(),
    );
    let staged_diff = run_git(work_dir, &["diff", "--cached"])
        .await
        .unwrap_or_default();
    let staged = parse_numstat(
        &run_git(work_dir, &["diff", "--cached", "--numstat"])
            .await
            .unwrap_or_default(),
    );
    let has_changes = !files.is_empty() || !staged.is_empty();

    Json(serde_json::json!({
        "branch": branch,
        "files": files,
        "diff": diff,
        "has_changes": has_changes,
        "staged": staged,
        "staged_diff": staged_diff,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn porcelain_classifies_stage_states() {
        let output = "M  staged.rs\n M unstaged.rs\nMM both.rs\n?? new.rs\nA  added.rs\n";
        let (staged, unstaged, untracked) = parse_porcelain(output);
        assert_eq!(staged, ["staged.rs", "both.rs", "added.rs"]);
        assert_eq!(unstaged, ["unstaged.rs", "both.rs"]);
        assert_eq!(untracked, ["new.rs"]);
    }

    #[test]
    fn porcelain_ignores_short_lines() {
        let (staged, unstaged, untracked) = parse_porcelain("\nM\n");
        assert!(staged.is_empty() && unstaged.is_empty() && untracked.is_empty());
    }

    #[test]
    fn numstat_parses_counts_and_status() {
        let output = "10\t0\tnew_file.rs\n0\t5\tremoved.rs\n3\t2\tchanged.rs\n-\t-\timage.png\n";
        let files = parse_numstat(output);
        assert_eq!(files.len(), 4);
        assert_eq!(files[0].status, "added");
        assert_eq!(files[0].additions, 10);
        assert_eq!(files[1].status, "deleted");
        assert_eq!(files[2].status, "modified");
        // Binary numstat markers read as zero/zero → modified.
        assert_eq!(files[3].status, "modified");
        assert_eq!(files[3].additions, 0);
    }
}
