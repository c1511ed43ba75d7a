//! Daemon configuration.
//!
//! Loaded once at startup, validated, then shared read-only between
//! sessions via `Arc`. Sessions mutate the filesystem a target points at,
//! never the target record itself.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::Deserialize;

/// Wildcard principal name: any authenticated principal may deploy.
pub const WILDCARD: &str = "*";

#[derive(Debug, Deserialize)]
struct ConfigFile {
    backup_dir: PathBuf,
    #[serde(default)]
    principals: Vec<Principal>,
    #[serde(default)]
    targets: Vec<TargetSpec>,
}

#[derive(Debug, Deserialize)]
struct TargetSpec {
    name: String,
    path: PathBuf,
    #[serde(default)]
    authorized: Vec<String>,
    #[serde(default)]
    before: String,
    #[serde(default)]
    after: String,
}

/// A named principal and its shared secret.
#[derive(Debug, Clone, Deserialize)]
pub struct Principal {
    pub name: String,
    pub password: String,
}

/// A hook command, split into program and arguments at config load so there
/// is no quoting ambiguity at run time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl HookCommand {
    /// Whitespace-split a configured hook line. Empty or blank lines are a
    /// no-op, not an error.
    pub fn parse(line: &str) -> Option<HookCommand> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?.to_string();
        Some(HookCommand {
            program,
            args: parts.map(str::to_string).collect(),
        })
    }
}

impl fmt::Display for HookCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A deployable artifact location plus its authorization and hooks.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    /// Absolute path replaced on deployment. May be a file or a directory.
    pub path: PathBuf,
    pub authorized: Vec<String>,
    pub before: Option<HookCommand>,
    pub after: Option<HookCommand>,
}

impl Target {
    pub fn allows(&self, principal: &str) -> bool {
        self.authorized
            .iter()
            .any(|name| name == WILDCARD || name == principal)
    }
}

#[derive(Debug)]
pub struct Config {
    pub backup_dir: PathBuf,
    pub principals: Vec<Principal>,
    pub targets: Vec<Target>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let parsed: ConfigFile = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Config::from_file(parsed)
    }

    fn from_file(file: ConfigFile) -> anyhow::Result<Config> {
        if file.backup_dir.as_os_str().is_empty() {
            bail!("backup_dir must be set");
        }

        let mut principal_names = HashSet::new();
        for principal in &file.principals {
            if principal.name.is_empty() {
                bail!("principal name must not be empty");
            }
            if !principal_names.insert(principal.name.clone()) {
                bail!("duplicate principal name: {}", principal.name);
            }
        }

        let mut target_names = HashSet::new();
        let targets = file
            .targets
            .into_iter()
            .map(|spec| {
                if spec.name.is_empty() {
                    bail!("target name must not be empty");
                }
                if !target_names.insert(spec.name.clone()) {
                    bail!("duplicate target name: {}", spec.name);
                }
                if !spec.path.is_absolute() {
                    bail!(
                        "target {} path must be absolute: {}",
                        spec.name,
                        spec.path.display()
                    );
                }
                Ok(Target {
                    name: spec.name,
                    path: spec.path,
                    authorized: spec.authorized,
                    before: HookCommand::parse(&spec.before),
                    after: HookCommand::parse(&spec.after),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Config {
            backup_dir: file.backup_dir,
            principals: file.principals,
            targets,
        })
    }

    pub fn target(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> anyhow::Result<Config> {
        Config::from_file(toml::from_str(toml_str).unwrap())
    }

    #[test]
    fn full_config_parses() {
        let config = parse(
            r#"
            backup_dir = "/var/lib/dcontrol/backups"

            [[principals]]
            name = "alice"
            password = "hunter2"

            [[targets]]
            name = "app"
            path = "/srv/app"
            authorized = ["alice"]
            before = "systemctl stop app"
            after = "systemctl start app"
            "#,
        )
        .unwrap();

        assert_eq!(config.backup_dir, PathBuf::from("/var/lib/dcontrol/backups"));
        assert_eq!(config.principals.len(), 1);

        let target = config.target("app").unwrap();
        assert_eq!(target.path, PathBuf::from("/srv/app"));
        assert!(target.allows("alice"));
        assert!(!target.allows("bob"));
        assert_eq!(
            target.before,
            Some(HookCommand {
                program: "systemctl".to_string(),
                args: vec!["stop".to_string(), "app".to_string()],
            })
        );
    }

    #[test]
    fn empty_hooks_are_none() {
        let config = parse(
            r#"
            backup_dir = "/backups"

            [[targets]]
            name = "app"
            path = "/srv/app"
            "#,
        )
        .unwrap();

        let target = config.target("app").unwrap();
        assert_eq!(target.before, None);
        assert_eq!(target.after, None);
    }

    #[test]
    fn blank_hook_is_none() {
        assert_eq!(HookCommand::parse("   "), None);
        assert_eq!(HookCommand::parse(""), None);
    }

    #[test]
    fn wildcard_allows_anyone() {
        let config = parse(
            r#"
            backup_dir = "/backups"

            [[targets]]
            name = "app"
            path = "/srv/app"
            authorized = ["*"]
            "#,
        )
        .unwrap();

        assert!(config.target("app").unwrap().allows("anyone"));
    }

    #[test]
    fn duplicate_target_rejected() {
        let result = parse(
            r#"
            backup_dir = "/backups"

            [[targets]]
            name = "app"
            path = "/srv/app"

            [[targets]]
            name = "app"
            path = "/srv/other"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn relative_target_path_rejected() {
        let result = parse(
            r#"
            backup_dir = "/backups"

            [[targets]]
            name = "app"
            path = "srv/app"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn missing_target_lookup() {
        let config = parse(r#"backup_dir = "/backups""#).unwrap();
        assert!(config.target("nope").is_none());
    }
}
