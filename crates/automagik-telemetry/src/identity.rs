//! Anonymous identifiers and the opt-out marker
//!
//! The user id is a random UUID persisted under `~/.automagik/user_id` so it
//! is stable across runs of any Automagik project on the same account. It is
//! never derived from hardware or account details. Session, trace and span
//! ids are random per use.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

const STATE_DIR: &str = ".automagik";
const USER_ID_FILE: &str = "user_id";
const OPT_OUT_MARKER: &str = ".automagik-no-telemetry";

fn home(home_override: Option<&Path>) -> Option<PathBuf> {
    home_override.map(Path::to_path_buf).or_else(dirs::home_dir)
}

pub fn user_id_path(home_override: Option<&Path>) -> Option<PathBuf> {
    home(home_override).map(|h| h.join(STATE_DIR).join(USER_ID_FILE))
}

pub fn opt_out_marker_path(home_override: Option<&Path>) -> Option<PathBuf> {
    home(home_override).map(|h| h.join(OPT_OUT_MARKER))
}

/// Load the persisted user id, creating it on first use.
///
/// Never fails: if the file can't be read or written, an id that lives only
/// for this process is returned instead.
pub fn get_or_create_user_id(home_override: Option<&Path>) -> String {
    let Some(path) = user_id_path(home_override) else {
        debug!("no home directory, using in-memory user id");
        return Uuid::new_v4().to_string();
    };

    // Try to load cached user id
    if let Ok(id) = fs::read_to_string(&path) {
        let id = id.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }

    let user_id = Uuid::new_v4().to_string();
    if let Err(e) = persist(&path, &user_id) {
        debug!("could not persist user id to {}: {}", path.display(), e);
    }
    user_id
}

fn persist(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)
}

pub fn opt_out_marker_exists(home_override: Option<&Path>) -> bool {
    opt_out_marker_path(home_override).is_some_and(|p| p.exists())
}

pub fn write_opt_out_marker(home_override: Option<&Path>) -> io::Result<()> {
    let path = opt_out_marker_path(home_override)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no home directory"))?;
    persist(&path, "")
}

/// Remove the opt-out marker; a missing marker is not an error
pub fn remove_opt_out_marker(home_override: Option<&Path>) -> io::Result<()> {
    let Some(path) = opt_out_marker_path(home_override) else {
        return Ok(());
    };
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// 16 random bytes as 32 lowercase hex chars
pub fn generate_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// 8 random bytes as 16 lowercase hex chars
pub fn generate_span_id() -> String {
    format!("{:016x}", Uuid::new_v4().as_u64_pair().0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_user_id_is_stable() {
        let temp_dir = TempDir::new().unwrap();
        let id1 = get_or_create_user_id(Some(temp_dir.path()));
        let id2 = get_or_create_user_id(Some(temp_dir.path()));

        assert_eq!(id1, id2);
        assert!(Uuid::parse_str(&id1).is_ok());
        assert!(temp_dir.path().join(".automagik/user_id").exists());
    }

    #[test]
    fn test_user_id_reads_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join(".automagik")).unwrap();
        fs::write(temp_dir.path().join(".automagik/user_id"), "existing-id\n").unwrap();

        assert_eq!(get_or_create_user_id(Some(temp_dir.path())), "existing-id");
    }

    #[test]
    fn test_user_id_falls_back_when_unwritable() {
        let temp_dir = TempDir::new().unwrap();
        // A file where the state directory should be
        fs::write(temp_dir.path().join(".automagik"), "").unwrap();

        let id1 = get_or_create_user_id(Some(temp_dir.path()));
        let id2 = get_or_create_user_id(Some(temp_dir.path()));
        assert!(Uuid::parse_str(&id1).is_ok());
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_opt_out_marker_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let home = Some(temp_dir.path());

        assert!(!opt_out_marker_exists(home));
        remove_opt_out_marker(home).unwrap();

        write_opt_out_marker(home).unwrap();
        assert!(opt_out_marker_exists(home));
        assert!(temp_dir.path().join(".automagik-no-telemetry").exists());

        remove_opt_out_marker(home).unwrap();
        assert!(!opt_out_marker_exists(home));
    }

    #[test]
    fn test_id_formats() {
        let trace_id = generate_trace_id();
        let span_id = generate_span_id();

        assert_eq!(trace_id.len(), 32);
        assert_eq!(span_id.len(), 16);
        assert!(trace_id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(span_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_trace_id(), trace_id);
    }
}
