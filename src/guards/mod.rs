//! Pre-commit guard install/uninstall/status (spec.md §6.4).
//!
//! Writes a shell script to `<repo>/.git/hooks/pre-commit` carrying the
//! literal marker `ntm-precommit-guard` plus `# Project: <key>` and
//! `# Repository: <path>` comment lines, so a later `status`/`uninstall`
//! call can recognize a hook this crate installed versus one it didn't.
//!
//! No teacher or sibling example implements a git-hook installer
//! directly — see `DESIGN.md` for the grounding note. The write itself
//! reuses `store::atomic_write` (write-temp-then-rename), the one
//! file-persistence convention this crate carries everywhere, and the
//! executable-bit handling follows the same "set permissions right after
//! the write completes" ordering the teacher uses wherever it writes a
//! script (e.g. `src/session/coordinator.rs`'s `send_coordination_message`
//! writing files other processes immediately act on).

use std::path::{Path, PathBuf};

use crate::store::atomic_write;

pub const GUARD_MARKER: &str = "ntm-precommit-guard";

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("guard already installed")]
    AlreadyInstalled,
    #[error("pre-commit hook exists but was not installed by ntm")]
    NotManagedByNtm,
    #[error("no guard installed for this repository")]
    NotInstalled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardStatus {
    /// No `pre-commit` hook exists at all.
    NotInstalled,
    /// Installed by this crate, for `project_key`.
    Installed { project_key: String },
    /// A `pre-commit` hook exists but lacks the ntm marker.
    Foreign,
}

fn hook_path(repo: &Path) -> PathBuf {
    repo.join(".git").join("hooks").join("pre-commit")
}

fn render_script(project_key: &str, repo: &Path) -> String {
    format!(
        "#!/bin/sh\n\
         # {marker}\n\
         # Project: {project_key}\n\
         # Repository: {repo}\n\
         #\n\
         # Installed by `ntm guards install`. Remove with `ntm guards uninstall`\n\
         # or delete this file directly.\n\
         exit 0\n",
        marker = GUARD_MARKER,
        project_key = project_key,
        repo = repo.display(),
    )
}

/// Parses an existing hook's first few lines for the marker and project
/// key, without assuming anything about the rest of the script body.
fn parse_existing(contents: &str) -> GuardStatus {
    if !contents.contains(GUARD_MARKER) {
        return GuardStatus::Foreign;
    }
    let project_key = contents
        .lines()
        .find_map(|line| line.trim().strip_prefix("# Project:"))
        .map(|rest| rest.trim().to_string())
        .unwrap_or_default();
    GuardStatus::Installed { project_key }
}

/// **Status(repo)** (spec.md §6.4).
pub async fn status(repo: &Path) -> Result<GuardStatus, GuardError> {
    let path = hook_path(repo);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => Ok(parse_existing(&contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(GuardStatus::NotInstalled),
        Err(e) => Err(e.into()),
    }
}

/// **Install(repo, project_key)** (spec.md §6.4): idempotent — a second
/// call against an already-installed hook for the same (or any) project
/// reports [`GuardError::AlreadyInstalled`] and leaves the file untouched
/// rather than overwriting it.
pub async fn install(repo: &Path, project_key: &str) -> Result<GuardStatus, GuardError> {
    match status(repo).await? {
        GuardStatus::Installed { .. } => return Err(GuardError::AlreadyInstalled),
        GuardStatus::Foreign => return Err(GuardError::NotManagedByNtm),
        GuardStatus::NotInstalled => {}
    }

    let path = hook_path(repo);
    let script = render_script(project_key, repo);
    atomic_write(&path, script.as_bytes())
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(&path).await?.permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await?;
    }

    Ok(GuardStatus::Installed {
        project_key: project_key.to_string(),
    })
}

/// **Uninstall(repo)** (spec.md §6.4): refuses to remove any `pre-commit`
/// hook lacking the ntm marker.
pub async fn uninstall(repo: &Path) -> Result<(), GuardError> {
    match status(repo).await? {
        GuardStatus::NotInstalled => Err(GuardError::NotInstalled),
        GuardStatus::Foreign => Err(GuardError::NotManagedByNtm),
        GuardStatus::Installed { .. } => {
            tokio::fs::remove_file(hook_path(repo)).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join(".git").join("hooks"))
            .await
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn install_then_status_round_trips() {
        let dir = init_repo().await;
        install(dir.path(), "proj-1").await.unwrap();
        let status = status(dir.path()).await.unwrap();
        assert_eq!(
            status,
            GuardStatus::Installed {
                project_key: "proj-1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn second_install_is_idempotent_and_leaves_file_untouched() {
        let dir = init_repo().await;
        install(dir.path(), "proj-1").await.unwrap();
        let before = tokio::fs::read_to_string(hook_path(dir.path())).await.unwrap();

        let err = install(dir.path(), "proj-2").await.unwrap_err();
        assert!(matches!(err, GuardError::AlreadyInstalled));

        let after = tokio::fs::read_to_string(hook_path(dir.path())).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn uninstall_removes_an_installed_guard() {
        let dir = init_repo().await;
        install(dir.path(), "proj-1").await.unwrap();
        uninstall(dir.path()).await.unwrap();
        assert_eq!(status(dir.path()).await.unwrap(), GuardStatus::NotInstalled);
    }

    #[tokio::test]
    async fn uninstall_refuses_a_foreign_hook() {
        let dir = init_repo().await;
        tokio::fs::write(hook_path(dir.path()), "#!/bin/sh\necho hi\n")
            .await
            .unwrap();
        let err = uninstall(dir.path()).await.unwrap_err();
        assert!(matches!(err, GuardError::NotManagedByNtm));
        assert_eq!(status(dir.path()).await.unwrap(), GuardStatus::Foreign);
    }

    #[tokio::test]
    async fn uninstall_without_a_hook_reports_not_installed() {
        let dir = init_repo().await;
        let err = uninstall(dir.path()).await.unwrap_err();
        assert!(matches!(err, GuardError::NotInstalled));
    }
}
