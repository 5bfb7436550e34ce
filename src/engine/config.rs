use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{anyhow, bail};

use crate::engine::adapter::Protocol;
use crate::engine::EngineError;
use crate::time::TimeControl;
use crate::util::Res;

/// Everything needed to start and drive one engine.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct EngineConfig {
    /// Display name; the configuration manager keeps these unique.
    pub name: String,
    pub executable: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub args: Vec<String>,
    pub protocol: Protocol,
    pub ponder: bool,
    /// Marks the engine that plays every opponent in a gauntlet.
    pub gauntlet: bool,
    pub tc: TimeControl,
    /// Option overrides applied right after the protocol handshake.
    pub options: BTreeMap<String, String>,
    pub stderr_file: Option<PathBuf>,
}

impl EngineConfig {
    /// Fills in the derived fields. Name uniqueness is the configuration
    /// manager's job, not ours.
    pub fn finalize(mut self) -> Res<Self> {
        if self.executable.as_os_str().is_empty() {
            return Err(EngineError::Configuration(
                "an engine needs an executable (cmd=...)".to_string(),
            )
            .into());
        }
        if self.name.is_empty() {
            self.name = self
                .executable
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("engine")
                .to_string();
        }
        Ok(self)
    }
}

/// Walks `name`, `name_2`, `name_3`, ... and returns the first candidate
/// `taken` doesn't claim. Case is ignored so per-engine logfile names stay
/// distinct on case-insensitive filesystems.
fn free_name(name: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(name) {
        return name.to_string();
    }
    (2_usize..)
        .map(|n| format!("{name}_{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap()
}

/// Owns the persistent engine configurations and keeps their display names
/// unique. Guarded internally; callers only ever get copies.
#[derive(Debug, Default)]
pub struct EngineConfigManager {
    configs: Mutex<Vec<EngineConfig>>,
}

impl EngineConfigManager {
    /// Adds a configuration, disambiguating its display name against the
    /// ones already present. Returns the name the engine ended up with.
    pub fn add(&self, mut config: EngineConfig) -> String {
        let mut configs = self.configs.lock().unwrap();
        config.name = free_name(&config.name, |candidate| {
            configs.iter().any(|c| c.name.eq_ignore_ascii_case(candidate))
        });
        let name = config.name.clone();
        configs.push(config);
        name
    }

    pub fn find(&self, name: &str) -> Option<EngineConfig> {
        self.configs
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn all(&self) -> Vec<EngineConfig> {
        self.configs.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.configs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.lock().unwrap().is_empty()
    }

    /// Writes all configurations in the INI-like text form `load` reads.
    pub fn save(&self, path: &Path) -> Res<()> {
        let mut out = String::new();
        for config in self.configs.lock().unwrap().iter() {
            writeln!(out, "[engine]")?;
            writeln!(out, "name={}", config.name)?;
            writeln!(out, "cmd={}", config.executable.display())?;
            if let Some(dir) = &config.working_dir {
                writeln!(out, "dir={}", dir.display())?;
            }
            for arg in &config.args {
                writeln!(out, "arg={arg}")?;
            }
            writeln!(out, "proto={}", config.protocol.to_string().to_lowercase())?;
            if config.tc != TimeControl::default() {
                writeln!(out, "tc={}", config.tc.to_pgn())?;
            }
            if config.ponder {
                writeln!(out, "ponder=true")?;
            }
            if config.gauntlet {
                writeln!(out, "gauntlet=true")?;
            }
            for (name, value) in &config.options {
                writeln!(out, "option.{name}={value}")?;
            }
            writeln!(out)?;
        }
        fs::write(path, out)?;
        Ok(())
    }

    pub fn load(&self, path: &Path) -> Res<()> {
        let text = fs::read_to_string(path)?;
        let mut parsed: Vec<EngineConfig> = vec![];
        let mut current: Option<EngineConfig> = None;
        for (num, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line == "[engine]" {
                if let Some(config) = current.take() {
                    parsed.push(config);
                }
                current = Some(EngineConfig::default());
                continue;
            }
            let config = current
                .as_mut()
                .ok_or_else(|| anyhow!("Line {} is outside an [engine] section", num + 1))?;
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("Expected 'key=value' on line {}", num + 1))?;
            match key.trim() {
                "name" => config.name = value.to_string(),
                "cmd" => config.executable = PathBuf::from(value),
                "dir" => config.working_dir = Some(PathBuf::from(value)),
                "arg" => config.args.push(value.to_string()),
                "proto" => {
                    config.protocol = Protocol::from_str(value)
                        .map_err(|_| anyhow!("Unknown protocol '{value}' on line {}", num + 1))?;
                }
                "tc" => config.tc = TimeControl::from_str(value)?,
                "ponder" => config.ponder = value == "true",
                "gauntlet" => config.gauntlet = value == "true",
                "stderr" => config.stderr_file = Some(PathBuf::from(value)),
                key => match key.strip_prefix("option.") {
                    Some(option) => {
                        _ = config.options.insert(option.to_string(), value.to_string());
                    }
                    None => bail!("Unknown key '{key}' on line {}", num + 1),
                },
            }
        }
        if let Some(config) = current {
            parsed.push(config);
        }
        for config in parsed {
            if config.executable.as_os_str().is_empty() {
                bail!("An [engine] section in '{}' has no cmd", path.display())
            }
            _ = self.add(config);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> EngineConfig {
        EngineConfig {
            name: name.to_string(),
            executable: PathBuf::from("/usr/bin/true"),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn display_names_are_disambiguated() {
        let manager = EngineConfigManager::default();
        assert_eq!(manager.add(named("Duplicated")), "Duplicated");
        assert_eq!(manager.add(named("duplicated")), "duplicated_2");
        assert_eq!(manager.add(named("Duplicated")), "Duplicated_3");
        assert_eq!(manager.len(), 3);
        assert!(manager.find("duplicated_3").is_some());
    }

    #[test]
    fn finalize_requires_an_executable_and_derives_the_name() {
        assert!(EngineConfig::default().finalize().is_err());
        let config = EngineConfig {
            executable: PathBuf::from("/engines/crabwise-engine"),
            ..EngineConfig::default()
        }
        .finalize()
        .unwrap();
        assert_eq!(config.name, "crabwise-engine");
    }

    #[test]
    fn config_file_round_trips() {
        let manager = EngineConfigManager::default();
        let mut options = BTreeMap::new();
        _ = options.insert("Hash".to_string(), "128".to_string());
        _ = manager.add(EngineConfig {
            name: "RoundTrip A".to_string(),
            executable: PathBuf::from("/usr/bin/true"),
            working_dir: Some(PathBuf::from("/tmp")),
            args: vec!["--silent".to_string()],
            protocol: Protocol::Xboard,
            ponder: true,
            gauntlet: true,
            tc: TimeControl::from_str("40/60+0.5").unwrap(),
            options,
            stderr_file: None,
        });
        let dir = std::env::temp_dir().join("calipers-config-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engines.ini");
        manager.save(&path).unwrap();

        let restored = EngineConfigManager::default();
        restored.load(&path).unwrap();
        let config = restored.find("roundtrip a").unwrap();
        assert_eq!(config.protocol, Protocol::Xboard);
        assert_eq!(config.tc.to_pgn(), "40/60+0.5");
        assert!(config.ponder);
        assert!(config.gauntlet);
        assert_eq!(config.options.get("Hash").unwrap(), "128");
        assert_eq!(config.args, vec!["--silent"]);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn adding_the_same_name_twice_yields_a_suffix() {
        let manager = EngineConfigManager::default();
        assert_eq!(manager.add(named("Twin")), "Twin");
        assert_eq!(manager.add(named("Twin")), "Twin_2");
        assert_eq!(manager.len(), 2);
    }
}
