//! Platform directories and file helpers

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "FieldSync";

/// Get the platform-specific data directory for storing application data
///
/// Returns:
/// - Windows: %LOCALAPPDATA%\FieldSync
/// - macOS: ~/Library/Application Support/FieldSync
/// - Linux/Other: ~/.local/share/FieldSync
pub fn get_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".data")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}

/// Get the platform-specific config directory
///
/// Returns:
/// - Windows: %APPDATA%\FieldSync
/// - macOS: ~/Library/Application Support/FieldSync
/// - Linux/Other: ~/.config/FieldSync
pub fn get_config_dir() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}

/// Default location of the configuration file
pub fn get_default_config_path() -> PathBuf {
    get_config_dir().join("fieldsync.toml")
}

/// Ensure `dir` exists, creating it if necessary
pub fn ensure_dir(dir: &Path) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    Ok(dir.to_path_buf())
}

/// Replace `path` with `contents` atomically.
///
/// Writes to a sibling temp file first, syncs it, then renames over the
/// target. On Unix the file is created owner read/write only.
pub fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_data_dir_is_app_scoped() {
        assert!(get_data_dir().ends_with(APP_DIR));
        assert!(get_config_dir().ends_with(APP_DIR));
        assert_eq!(
            get_default_config_path().file_name().unwrap(),
            "fieldsync.toml"
        );
    }

    #[test]
    fn test_write_private_file_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_private_file(&path, b"first").unwrap();
        write_private_file(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!dir.path().join("nested").join("state.json.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_write_private_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secret");
        write_private_file(&path, b"x").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
