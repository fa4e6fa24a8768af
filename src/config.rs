//! Configuration loading and the username blacklist.
//!
//! The main configuration is a plain INI file with one section per role
//! (`[server]` for the master, `[honeypot]` for the sensor, `[database]`
//! for the store). Files are searched in `/etc/blacknet` then `~/.blacknet`
//! unless an explicit path is given.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use configparser::ini::Ini;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no configuration file found")]
    NotFound,

    #[error("{}: {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("missing configuration key [{role}] {key}")]
    Missing { role: String, key: String },
}

/// Directories searched for `blacknet.cfg` and `blacklist.cfg`.
fn config_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from("/etc/blacknet")];
    if let Some(home) = std::env::var_os("HOME") {
        dirs.push(PathBuf::from(home).join(".blacknet"));
    }
    dirs
}

/// Loaded INI configuration, reloadable in place.
pub struct BlacknetConfig {
    ini: Ini,
    path: PathBuf,
}

impl BlacknetConfig {
    /// Find and load the configuration from an explicit path or the
    /// standard locations. Missing configuration is a fatal startup error.
    pub fn load(cfg_file: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match cfg_file {
            Some(p) => p.to_path_buf(),
            None => config_dirs()
                .into_iter()
                .map(|d| d.join("blacknet.cfg"))
                .find(|p| p.is_file())
                .ok_or(ConfigError::NotFound)?,
        };

        let mut ini = Ini::new();
        ini.load(&path)
            .map_err(|e| ConfigError::Parse(path.clone(), e))?;
        Ok(Self { ini, path })
    }

    /// Re-read the same configuration file.
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        self.ini
            .load(&self.path)
            .map_err(|e| ConfigError::Parse(self.path.clone(), e))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, role: &str, key: &str) -> Option<String> {
        self.ini.get(role, key)
    }

    pub fn has(&self, role: &str, key: &str) -> bool {
        self.ini.get(role, key).is_some()
    }

    /// Fetch a key that must be present for the role to function.
    pub fn get_required(&self, role: &str, key: &str) -> Result<String, ConfigError> {
        self.get(role, key).ok_or_else(|| ConfigError::Missing {
            role: role.to_owned(),
            key: key.to_owned(),
        })
    }

    pub fn get_bool(&self, role: &str, key: &str) -> bool {
        self.get(role, key)
            .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on" | "True"))
            .unwrap_or(false)
    }
}

// =============================================================================
// BLACKLIST
// =============================================================================

/// Username blacklist, keyed by sensor name.
///
/// INI-style sections name a sensor (or `*` for every sensor); each section
/// body is one username per line. `;` and `#` begin comments. A matching
/// (sensor, user) pair is dropped before any database write.
#[derive(Debug, Default)]
pub struct Blacklist {
    entries: HashMap<String, HashSet<String>>,
    extra_file: Option<PathBuf>,
}

impl Blacklist {
    /// Load blacklists from the standard locations plus the configured
    /// extra file. Unreadable files are skipped.
    pub fn load(config: &BlacknetConfig) -> Self {
        let mut blacklist = Self {
            entries: HashMap::new(),
            extra_file: config.get("server", "blacklist_file").map(PathBuf::from),
        };
        blacklist.read_all();
        blacklist
    }

    pub fn reload(&mut self, config: &BlacknetConfig) {
        self.entries.clear();
        self.extra_file = config.get("server", "blacklist_file").map(PathBuf::from);
        self.read_all();
    }

    fn read_all(&mut self) {
        let mut files: Vec<PathBuf> = config_dirs()
            .into_iter()
            .map(|d| d.join("blacklist.cfg"))
            .collect();
        if let Some(extra) = &self.extra_file {
            files.push(extra.clone());
        }

        for file in files {
            if let Ok(content) = std::fs::read_to_string(&file) {
                self.parse(&content);
                info!("loaded blacklist file {}", file.display());
            }
        }
    }

    fn parse(&mut self, content: &str) {
        let mut section: Option<String> = None;

        for line in content.lines() {
            if line.starts_with('[') && line.ends_with(']') && line.len() > 2 {
                let name = line[1..line.len() - 1].to_owned();
                self.entries.entry(name.clone()).or_default();
                section = Some(name);
            } else if let Some(name) = &section {
                // Strip at the first comment marker.
                let user = line.split([';', '#']).next().unwrap_or("").trim();
                if !user.is_empty() {
                    if let Some(users) = self.entries.get_mut(name) {
                        users.insert(user.to_owned());
                    }
                }
            }
        }
    }

    /// Whether this (sensor, user) pair is filtered out.
    pub fn has(&self, sensor: &str, user: &str) -> bool {
        let hit = |section: &str| {
            self.entries
                .get(section)
                .map(|users| users.contains(user))
                .unwrap_or(false)
        };
        hit(sensor) || hit("*")
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(HashSet::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(content: &str) -> Blacklist {
        let mut blacklist = Blacklist::default();
        blacklist.parse(content);
        blacklist
    }

    #[test]
    fn test_blacklist_sections() {
        let bl = parsed("[sensor-a]\nroot\nadmin\n[sensor-b]\nguest\n");
        assert!(bl.has("sensor-a", "root"));
        assert!(bl.has("sensor-a", "admin"));
        assert!(!bl.has("sensor-a", "guest"));
        assert!(bl.has("sensor-b", "guest"));
        assert!(!bl.has("sensor-c", "root"));
    }

    #[test]
    fn test_blacklist_wildcard() {
        let bl = parsed("[*]\nroot\n");
        assert!(bl.has("any-sensor", "root"));
        assert!(!bl.has("any-sensor", "admin"));
    }

    #[test]
    fn test_blacklist_comments() {
        let bl = parsed("[*]\nroot ; common noise\n# full comment line\nadmin# inline\n");
        assert!(bl.has("x", "root"));
        assert!(bl.has("x", "admin"));
        assert!(!bl.has("x", "# full comment line"));
    }

    #[test]
    fn test_blacklist_lines_outside_section_ignored() {
        let bl = parsed("root\n[*]\nadmin\n");
        assert!(!bl.has("x", "root"));
        assert!(bl.has("x", "admin"));
    }

    #[test]
    fn test_blacklist_empty() {
        assert!(Blacklist::default().is_empty());
        assert!(!parsed("[*]\nroot\n").is_empty());
    }
}
