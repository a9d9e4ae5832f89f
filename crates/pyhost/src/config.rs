//! Startup configuration: where the interpreter lives and what it should see.

use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    process::Command,
};

use indexmap::IndexMap;

/// Environment variable naming the Python shared library.
pub const LIB_ENV: &str = "PYHOST_PYTHON_LIB";
/// Environment variable naming the Python home (the `sys.prefix` of the distribution).
pub const HOME_ENV: &str = "PYHOST_PYTHON_HOME";
/// Environment variable naming the interpreter executable.
pub const EXECUTABLE_ENV: &str = "PYHOST_PYTHON_EXECUTABLE";
/// Environment variable listing extra `sys.path` entries, separated like `PATH`.
pub const SYS_PATH_ENV: &str = "PYHOST_SYS_PATH";

/// Everything needed to start the interpreter.
///
/// Can be built in code, deserialized from JSON, read from `PYHOST_*` environment variables, or
/// probed from an installed `python3` executable.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InitConfig {
    /// The `libpython` shared library to load.
    pub library_path: PathBuf,
    /// Python home, the prefix containing the standard library.
    pub home: PathBuf,
    /// Interpreter executable, reported to Python as the program name.
    pub executable: PathBuf,
    /// Directories appended to `sys.path` after startup.
    pub sys_paths: Vec<PathBuf>,
    /// Variables set in `os.environ` on top of the environment inherited from the host process.
    pub env: IndexMap<String, String>,
}

impl InitConfig {
    pub fn new(library_path: impl Into<PathBuf>, home: impl Into<PathBuf>, executable: impl Into<PathBuf>) -> Self {
        Self {
            library_path: library_path.into(),
            home: home.into(),
            executable: executable.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn sys_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sys_paths.push(path.into());
        self
    }

    /// Overrides one environment variable. Later calls for the same key win.
    #[must_use]
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&json)
    }

    /// Reads `PYHOST_PYTHON_LIB`, `PYHOST_PYTHON_HOME`, `PYHOST_PYTHON_EXECUTABLE` and the optional
    /// `PYHOST_SYS_PATH`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let var = |name: &'static str| env::var_os(name).map(PathBuf::from).ok_or(ConfigError::Missing(name));
        let mut config = Self::new(var(LIB_ENV)?, var(HOME_ENV)?, var(EXECUTABLE_ENV)?);
        if let Some(paths) = env::var_os(SYS_PATH_ENV) {
            config.sys_paths = env::split_paths(&paths).filter(|p| !p.as_os_str().is_empty()).collect();
        }
        Ok(config)
    }

    /// Asks an installed interpreter where its shared library, home and site-packages are.
    pub fn probe(python: &Path) -> Result<Self, ConfigError> {
        let output = Command::new(python)
            .args(["-c", PROBE_SCRIPT])
            .output()
            .map_err(|e| ConfigError::Io {
                path: python.to_path_buf(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(ConfigError::Probe(String::from_utf8_lossy(&output.stderr).trim().to_owned()));
        }
        let probed: Probed =
            serde_json::from_slice(&output.stdout).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let library_path = probed
            .library_path
            .ok_or_else(|| ConfigError::Probe(format!("{} has no shared libpython", python.display())))?;
        Ok(Self {
            library_path,
            home: probed.home,
            executable: probed.executable,
            sys_paths: probed.sys_paths,
            env: IndexMap::new(),
        })
    }

    /// Checks that the three required paths are set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, path) in [
            ("library_path", &self.library_path),
            ("home", &self.home),
            ("executable", &self.executable),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Missing(name));
            }
        }
        Ok(())
    }
}

#[derive(serde::Deserialize)]
struct Probed {
    library_path: Option<PathBuf>,
    home: PathBuf,
    executable: PathBuf,
    sys_paths: Vec<PathBuf>,
}

const PROBE_SCRIPT: &str = r#"
import json, os, sys, sysconfig

def library():
    names = [sysconfig.get_config_var(v) for v in ("LDLIBRARY", "INSTSONAME")]
    dirs = [sysconfig.get_config_var(v) for v in ("LIBDIR", "LIBPL")]
    dirs += [os.path.join(sys.base_prefix, "lib"), sys.base_prefix]
    for d in filter(None, dirs):
        for n in filter(None, names):
            candidate = os.path.join(d, n)
            if os.path.isfile(candidate) and not candidate.endswith(".a"):
                return candidate
    return None

print(json.dumps({
    "library_path": library(),
    "home": sys.base_prefix,
    "executable": sys.executable,
    "sys_paths": [p for p in sys.path if p.endswith(("site-packages", "dist-packages"))],
}))
"#;

/// Failure to assemble an [`InitConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required setting is absent.
    Missing(&'static str),
    /// A file or process could not be read.
    Io { path: PathBuf, message: String },
    /// JSON did not match the expected shape.
    Parse(String),
    /// The probed interpreter cannot be embedded.
    Probe(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(name) => write!(f, "missing configuration: {name}"),
            Self::Io { path, message } => write!(f, "{}: {message}", path.display()),
            Self::Parse(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Probe(msg) => write!(f, "probing the Python installation failed: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn builder_collects_paths_and_environment() {
        let config = InitConfig::new("/opt/py/lib/libpython3.12.so", "/opt/py", "/opt/py/bin/python3")
            .sys_path("/app/vendor")
            .env_var("LANG", "C.UTF-8")
            .env_var("HOME", "/home/app");
        assert_eq!(config.sys_paths, [PathBuf::from("/app/vendor")]);
        assert_eq!(config.env.keys().collect::<Vec<_>>(), ["LANG", "HOME"]);
    }

    #[test]
    fn json_fills_defaults_and_rejects_unknown_fields() {
        let config = InitConfig::from_json_str(
            r#"{"library_path": "/lib/libpython3.so", "home": "/usr", "executable": "/usr/bin/python3"}"#,
        )
        .unwrap();
        assert_eq!(config, InitConfig::new("/lib/libpython3.so", "/usr", "/usr/bin/python3"));
        assert!(config.env.is_empty());

        let err = InitConfig::from_json_str(r#"{"libary_path": "/x"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "unexpected error: {err}");
    }

    #[test]
    fn json_environment_keeps_order() {
        let config = InitConfig::from_json_str(r#"{"env": {"B": "2", "A": "1"}}"#).unwrap();
        assert_eq!(config.env.into_iter().collect::<Vec<_>>(), [
            ("B".to_owned(), "2".to_owned()),
            ("A".to_owned(), "1".to_owned())
        ]);
    }

    #[test]
    fn validate_names_the_missing_path() {
        let config = InitConfig::new("/lib/libpython3.so", "", "/usr/bin/python3");
        assert_eq!(config.validate(), Err(ConfigError::Missing("home")));
        assert_eq!(InitConfig::new("a", "b", "c").validate(), Ok(()));
    }

    #[test]
    fn missing_config_file_reports_its_path() {
        let err = InitConfig::from_json_file(Path::new("/nonexistent/pyhost.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/pyhost.json"));
    }
}
