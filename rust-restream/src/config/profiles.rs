//! Profile directories.
//!
//! Each job lives in its own directory under a profiles root:
//!
//! ```text
//! profiles/
//!   <source-id>/
//!     config.toml
//!     worker.pid    (while a worker runs the job)
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use super::job::{JobConfig, config_path};
use crate::{Error, Result};

/// A discovered job: its id and the config file the worker is started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobProfile {
    pub job_id: String,
    pub group: String,
    pub config_path: PathBuf,
}

impl JobProfile {
    /// Whether the profile passes a group filter; `None` matches every group.
    pub fn in_group(&self, group: Option<&str>) -> bool {
        group.is_none_or(|g| self.group == g)
    }
}

/// Number of profiles per group, ordered by group name.
pub fn group_counts(profiles: &[JobProfile]) -> BTreeMap<&str, usize> {
    let mut counts = BTreeMap::new();
    for profile in profiles {
        *counts.entry(profile.group.as_str()).or_default() += 1;
    }
    counts
}

/// Find every profile under `root` that has a loadable config, sorted by job id.
///
/// Profiles whose config fails to load are skipped with a warning so one bad
/// profile never hides the others.
pub fn discover_profiles(root: &Path) -> Result<Vec<JobProfile>> {
    let mut profiles = Vec::new();

    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let config_path = config_path(&path);
        if !config_path.is_file() {
            continue;
        }
        match JobConfig::load(&config_path) {
            Ok(config) => profiles.push(JobProfile {
                job_id: config.source.id,
                group: config.source.group,
                config_path,
            }),
            Err(e) => warn!(path = %config_path.display(), error = %e, "Skipping profile"),
        }
    }

    profiles.sort_by(|a, b| a.job_id.cmp(&b.job_id));
    Ok(profiles)
}

/// Create a new profile directory with a starter config.
///
/// Refuses to touch an existing profile.
pub fn create_profile(root: &Path, source_id: &str, group: Option<&str>) -> Result<PathBuf> {
    let source_id = checked_id(source_id)?;
    let profile_dir = root.join(source_id);
    if profile_dir.exists() {
        return Err(Error::config(format!(
            "profile '{}' already exists",
            profile_dir.display()
        )));
    }

    let mut config = JobConfig::template(source_id);
    if let Some(group) = group.map(str::trim).filter(|g| !g.is_empty()) {
        config.source.group = group.to_string();
    }

    std::fs::create_dir_all(&profile_dir)?;
    let path = config_path(&profile_dir);
    std::fs::write(&path, config.to_toml()?)?;
    Ok(path)
}

/// Delete the profile directory of `job_id`.
///
/// Refuses while a worker holds the profile's running marker unless `force`
/// is set. Returns the removed directory.
pub fn delete_profile(root: &Path, job_id: &str, force: bool) -> Result<PathBuf> {
    let job_id = checked_id(job_id)?;
    let profile_dir = match discover_profiles(root)?
        .into_iter()
        .find(|p| p.job_id == job_id)
    {
        Some(profile) => profile
            .config_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::config(format!("profile '{}' has no directory", job_id)))?,
        // A profile whose config no longer loads is still deletable by directory name.
        None if config_path(&root.join(job_id)).is_file() => root.join(job_id),
        None => return Err(Error::config(format!("no profile '{}'", job_id))),
    };

    if let Some(pid) = running_pid(&profile_dir) {
        if !force {
            return Err(Error::config(format!(
                "job '{}' is running (pid {}); stop it first",
                job_id, pid
            )));
        }
        warn!(job_id, pid, "Deleting profile of a running job");
    }

    std::fs::remove_dir_all(&profile_dir)?;
    Ok(profile_dir)
}

fn checked_id(id: &str) -> Result<&str> {
    let id = id.trim();
    if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
        return Err(Error::config(format!("invalid source id '{}'", id)));
    }
    Ok(id)
}

/// File a worker keeps in its profile directory while it runs.
pub const RUNNING_MARKER: &str = "worker.pid";

/// Pid recorded in a profile's running marker, if there is one.
pub fn running_pid(profile_dir: &Path) -> Option<u32> {
    std::fs::read_to_string(profile_dir.join(RUNNING_MARKER))
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
}

/// Marks a profile as running for as long as it is held.
#[derive(Debug)]
pub struct RunningMarker {
    path: PathBuf,
}

impl RunningMarker {
    /// Record the current process as the worker of the profile owning `config_path`.
    pub fn acquire(config_path: &Path) -> std::io::Result<Self> {
        let dir = config_path.parent().unwrap_or_else(|| Path::new("."));
        let path = dir.join(RUNNING_MARKER);
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(Self { path })
    }
}

impl Drop for RunningMarker {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Failed to remove running marker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_discover() {
        let root = tempfile::tempdir().unwrap();
        create_profile(root.path(), "b-source", None).unwrap();
        create_profile(root.path(), "a-source", Some("evening")).unwrap();

        // Ignored: stray file, directory without config, broken config.
        std::fs::write(root.path().join("notes.txt"), "x").unwrap();
        std::fs::create_dir(root.path().join("empty")).unwrap();
        let broken = root.path().join("broken");
        std::fs::create_dir(&broken).unwrap();
        std::fs::write(config_path(&broken), "[source\n").unwrap();

        let profiles = discover_profiles(root.path()).unwrap();
        let ids: Vec<_> = profiles.iter().map(|p| p.job_id.as_str()).collect();
        assert_eq!(ids, ["a-source", "b-source"]);
        assert!(profiles[0].config_path.ends_with("a-source/config.toml"));
        assert_eq!(profiles[0].group, "evening");
        assert_eq!(profiles[1].group, crate::config::DEFAULT_GROUP);
    }

    #[test]
    fn test_group_filter_and_counts() {
        let root = tempfile::tempdir().unwrap();
        create_profile(root.path(), "a", Some("evening")).unwrap();
        create_profile(root.path(), "b", Some("evening")).unwrap();
        create_profile(root.path(), "c", None).unwrap();
        let profiles = discover_profiles(root.path()).unwrap();

        let evening: Vec<_> = profiles
            .iter()
            .filter(|p| p.in_group(Some("evening")))
            .map(|p| p.job_id.as_str())
            .collect();
        assert_eq!(evening, ["a", "b"]);
        assert_eq!(profiles.iter().filter(|p| p.in_group(None)).count(), 3);
        assert!(!profiles.iter().any(|p| p.in_group(Some("morning"))));

        let counts: Vec<_> = group_counts(&profiles).into_iter().collect();
        assert_eq!(counts, [("default", 1), ("evening", 2)]);
    }

    #[test]
    fn test_create_refuses_existing_profile() {
        let root = tempfile::tempdir().unwrap();
        create_profile(root.path(), "dup", None).unwrap();
        assert!(create_profile(root.path(), "dup", None).is_err());
    }

    #[test]
    fn test_create_rejects_bad_ids() {
        let root = tempfile::tempdir().unwrap();
        assert!(create_profile(root.path(), "", None).is_err());
        assert!(create_profile(root.path(), "../escape", None).is_err());
        assert!(delete_profile(root.path(), "../escape", true).is_err());
    }

    #[test]
    fn test_delete_profile() {
        let root = tempfile::tempdir().unwrap();
        create_profile(root.path(), "gone", None).unwrap();
        create_profile(root.path(), "kept", None).unwrap();

        let removed = delete_profile(root.path(), "gone", false).unwrap();
        assert!(!removed.exists());
        let ids: Vec<_> = discover_profiles(root.path())
            .unwrap()
            .into_iter()
            .map(|p| p.job_id)
            .collect();
        assert_eq!(ids, ["kept"]);

        assert!(delete_profile(root.path(), "gone", false).is_err());
    }

    #[test]
    fn test_delete_refuses_running_job() {
        let root = tempfile::tempdir().unwrap();
        let config = create_profile(root.path(), "live", None).unwrap();
        let profile_dir = config.parent().unwrap().to_path_buf();

        let marker = RunningMarker::acquire(&config).unwrap();
        assert_eq!(running_pid(&profile_dir), Some(std::process::id()));
        assert!(delete_profile(root.path(), "live", false).is_err());
        assert!(config.is_file());

        drop(marker);
        assert_eq!(running_pid(&profile_dir), None);
        delete_profile(root.path(), "live", false).unwrap();
        assert!(!profile_dir.exists());
    }

    #[test]
    fn test_force_deletes_stale_marker() {
        let root = tempfile::tempdir().unwrap();
        let config = create_profile(root.path(), "crashed", None).unwrap();
        let profile_dir = config.parent().unwrap().to_path_buf();
        std::fs::write(profile_dir.join(RUNNING_MARKER), "4242").unwrap();

        assert!(delete_profile(root.path(), "crashed", false).is_err());
        delete_profile(root.path(), "crashed", true).unwrap();
        assert!(!profile_dir.exists());
    }
}
