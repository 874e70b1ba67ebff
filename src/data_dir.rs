use std::io::Write;
use std::path::{Path, PathBuf};

/// Commented default written by `init`. Must stay loadable by `load_config`.
const DEFAULT_CONFIG: &str = "\
# playtime-warden configuration

# Process names to track (case-insensitive).
processes = [\"steam\", \"minecraft-launcher\"]

[quota]
daily_limit_mins = 120
reset_time = \"08:00\"

[warning]
first_threshold_mins = 15
final_threshold_mins = 5

[enforcement]
tick_interval_secs = 5
save_interval_secs = 60
terminate_attempts = 3
terminate_retry_delay_ms = 1000

[storage]
# state_file = \"/path/to/state.json\"
# log_file = \"/path/to/playtime-warden.log\"
";

/// Per-user data directory (default `~/.config/playtime-warden/`) holding
/// the config file and the persisted quota state.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The platform config directory joined with the package name, or a
    /// dot-directory in the working directory when there is none.
    pub fn default_root() -> PathBuf {
        match dirs::config_dir() {
            Some(dir) => dir.join(env!("CARGO_PKG_NAME")),
            None => PathBuf::from(concat!(".", env!("CARGO_PKG_NAME"))),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn state(&self) -> PathBuf {
        self.root.join("state.json")
    }

    /// Create the directory and a default `config.toml`. An existing config
    /// is never overwritten. Returns whether the directory was new.
    pub fn init(&self) -> std::io::Result<bool> {
        let is_new = !self.root.is_dir();
        std::fs::create_dir_all(&self.root)?;

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.config())
        {
            Ok(mut file) => file.write_all(DEFAULT_CONFIG.as_bytes())?,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        Ok(is_new)
    }

    /// Create the parent directory of `path` if it has one.
    pub fn ensure_parent(path: &Path) -> std::io::Result<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }
}
