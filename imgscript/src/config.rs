//! Runtime configuration and command-file discovery.
//!
//! | Source | Effect |
//! |--------|--------|
//! | `IMGSCRIPT_USER` | user command file, instead of the default location |
//! | `IMGSCRIPT_PATH` | extra command files, separated like `PATH` |
//! | `<config dir>/imgscript/user.ims` | default user command file |
//!
//! Command files are plain text or gzip-compressed.

use std::io::Read;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use flate2::read::GzDecoder;

pub const DEFAULT_MAX_CALL_DEPTH: usize = 128;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Initial `$^`.  Negative values silence `echo` and `warn`.
    pub verbosity: i32,
    /// Call-stack frames allowed before `StackOverflow`.
    pub max_call_depth: usize,
    /// Command files loaded after the user file, in order.
    pub command_paths: Vec<PathBuf>,
    /// Explicit user command file.
    pub user_file: Option<PathBuf>,
    pub load_user_file: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verbosity: 0,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            command_paths: Vec::new(),
            user_file: None,
            load_user_file: true,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var_os(key).map(|v| v.to_string_lossy().into_owned()));
        config
    }

    /// Apply `IMGSCRIPT_USER` and `IMGSCRIPT_PATH` as returned by `get`.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(user) = get("IMGSCRIPT_USER").filter(|v| !v.is_empty()) {
            self.user_file = Some(PathBuf::from(user));
        }
        if let Some(paths) = get("IMGSCRIPT_PATH") {
            self.command_paths
                .extend(std::env::split_paths(&paths).filter(|p| !p.as_os_str().is_empty()));
        }
    }

    /// The user command file, if loading it is enabled.
    pub fn user_command_file(&self) -> Option<PathBuf> {
        if !self.load_user_file {
            return None;
        }
        self.user_file.clone().or_else(default_user_file)
    }
}

/// `<config dir>/imgscript/user.ims`
pub fn default_user_file() -> Option<PathBuf> {
    ProjectDirs::from("", "", "imgscript").map(|dirs| dirs.config_dir().join("user.ims"))
}

/// Read a command file, decompressing it when it is gzip data.
pub fn read_command_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut text = String::new();
        GzDecoder::new(bytes.as_slice()).read_to_string(&mut text)?;
        return Ok(text);
    }
    String::from_utf8(bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    #[test]
    fn defaults() {
        let c = Config::new();
        assert_eq!(c.max_call_depth, DEFAULT_MAX_CALL_DEPTH);
        assert_eq!(c.verbosity, 0);
        assert!(c.command_paths.is_empty());
    }

    #[test]
    fn environment_overrides() {
        let mut c = Config::new();
        c.apply_env(|key| match key {
            "IMGSCRIPT_USER" => Some("/tmp/mine.ims".into()),
            "IMGSCRIPT_PATH" => Some("/a.ims:/b.ims".into()),
            _ => None,
        });
        assert_eq!(c.user_command_file(), Some(PathBuf::from("/tmp/mine.ims")));
        assert_eq!(c.command_paths, vec![PathBuf::from("/a.ims"), PathBuf::from("/b.ims")]);
    }

    #[test]
    fn user_file_can_be_disabled() {
        let c = Config { load_user_file: false, user_file: Some("x".into()), ..Config::default() };
        assert_eq!(c.user_command_file(), None);
    }

    #[test]
    fn default_user_file_location() {
        if let Some(p) = default_user_file() {
            assert!(p.ends_with("user.ims"));
        }
    }

    #[test]
    fn reads_plain_and_gzip_files() {
        let dir = tempfile::tempdir().unwrap();

        let plain = dir.path().join("plain.ims");
        std::fs::write(&plain, "inc : add 1\n").unwrap();
        assert_eq!(read_command_file(&plain).unwrap(), "inc : add 1\n");

        let packed = dir.path().join("packed.ims.gz");
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"dec : sub 1\n").unwrap();
        std::fs::write(&packed, enc.finish().unwrap()).unwrap();
        assert_eq!(read_command_file(&packed).unwrap(), "dec : sub 1\n");
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(read_command_file(Path::new("/nonexistent/imgscript/file.ims")).is_err());
    }
}
