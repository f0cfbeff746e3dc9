use std::path::{Path, PathBuf};

pub const STORAGE_PATH_VAR: &str = "HANNA_STORAGE_PATH";
pub const CONTROL_SOCKET_VAR: &str = "HANNA_CONTROL_SOCKET";

const FALLBACK_HOME: &str = "~";
const STORAGE_SUBDIR: &str = ".hanna";
const CONFIG_FILE: &str = "config.json";
const ACCESSORIES_SUBDIR: &str = "accessories";
const PERSIST_SUBDIR: &str = "persist";
const CONTROL_SOCKET_FILE: &str = "hanna.sock";

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

/// Resolved locations of the user files of one host installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    /// Storage root: explicit path > $HANNA_STORAGE_PATH > ~/.hanna
    pub fn resolve(custom: Option<&Path>) -> Self {
        let root = custom
            .map(Path::to_path_buf)
            .or_else(|| env_opt(STORAGE_PATH_VAR).map(PathBuf::from))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from(FALLBACK_HOME))
                    .join(STORAGE_SUBDIR)
            });
        tracing::trace!(dir = %root.display(), "Resolved storage directory");
        Self { root }
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<storage>/config.json`
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Directory holding the cached accessory files of every bridge.
    pub fn accessory_path(&self) -> PathBuf {
        self.root.join(ACCESSORIES_SUBDIR)
    }

    /// Directory handed to the protocol runtime for pairing state.
    pub fn persist_path(&self) -> PathBuf {
        self.root.join(PERSIST_SUBDIR)
    }

    /// Control socket ($HANNA_CONTROL_SOCKET or `<storage>/hanna.sock`)
    pub fn control_socket_path(&self) -> PathBuf {
        let path = env_opt(CONTROL_SOCKET_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.root.join(CONTROL_SOCKET_FILE));
        tracing::trace!(path = %path.display(), "Control socket path");
        path
    }
}
