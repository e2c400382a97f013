//! `devloop.yaml` loading, defaults, and the template written by `init`.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub const CONFIG_FILE: &str = "devloop.yaml";

/// Rule name used by the generated default configuration. Also the label
/// `/__build-status` reports when a marker cannot be attributed to a rule
/// (marker filenames do not carry the rule name).
pub const DEFAULT_RULE_NAME: &str = "go-build";

const DEFAULT_CONFIG: &str = r#"# devloop configuration file
# Place this file in your project root as devloop.yaml

# Port for the development proxy server
proxy_port: 3000

# Port your backend server listens on
backend_port: 8080

# Directory where build status files are stored
build_status_dir: tmp/.build-status

# Build rules define conditional build steps based on file changes.
# Rules run in order on startup, and individually when matching files
# change.
build_rules:
  - name: "go-build"
    watch:
      - "**/*.go"
    ignore:
      - "**/*_test.go"
      - "vendor/**"
      - "node_modules/**"
    command: "go build -o ./tmp/main ."

# Command that starts your application after a successful build
run_cmd: "./tmp/main"
"#;

/// A named association between watch globs, ignore globs, and a shell
/// command; the unit of conditional rebuild.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildRule {
    pub name: String,
    pub watch: Vec<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
    pub command: String,
}

/// Immutable after load. Declaration order of `build_rules` is preserved;
/// it is meaningful for the initial full build.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
    #[serde(default = "default_build_status_dir")]
    pub build_status_dir: PathBuf,
    #[serde(default = "default_run_cmd")]
    pub run_cmd: String,
    #[serde(default)]
    pub build_rules: Vec<BuildRule>,
    /// Set from the `--debug` flag, never from the file.
    #[serde(skip)]
    pub debug: bool,
}

fn default_proxy_port() -> u16 {
    3000
}

fn default_backend_port() -> u16 {
    8080
}

fn default_build_status_dir() -> PathBuf {
    PathBuf::from("tmp/.build-status")
}

fn default_run_cmd() -> String {
    "./tmp/main".to_string()
}

impl Config {
    /// Reads and validates `devloop.yaml` from the current directory.
    pub async fn load() -> Result<Self> {
        let raw = match tokio::fs::read_to_string(CONFIG_FILE).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                bail!("{CONFIG_FILE} not found. Run `devloop init` to create one");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {CONFIG_FILE}"));
            }
        };
        Self::parse(&raw)
    }

    fn parse(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .with_context(|| format!("failed to parse {CONFIG_FILE}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        // Rule names key the debouncer and the running-builds map; two
        // rules sharing a name would silently share a build slot.
        let mut seen = HashSet::new();
        for rule in &self.build_rules {
            if !seen.insert(rule.name.as_str()) {
                bail!("duplicate build rule name: {}", rule.name);
            }
        }
        Ok(())
    }

    /// Writes the commented default `devloop.yaml` to the current
    /// directory, replacing any existing file.
    pub fn write_default() -> Result<()> {
        std::fs::write(CONFIG_FILE, DEFAULT_CONFIG)
            .with_context(|| format!("failed to write {CONFIG_FILE}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_parses_with_expected_values() {
        let config = Config::parse(DEFAULT_CONFIG).expect("default config parses");
        assert_eq!(config.proxy_port, 3000);
        assert_eq!(config.backend_port, 8080);
        assert_eq!(config.build_status_dir, PathBuf::from("tmp/.build-status"));
        assert_eq!(config.run_cmd, "./tmp/main");
        assert!(!config.debug);

        assert_eq!(config.build_rules.len(), 1);
        let rule = &config.build_rules[0];
        assert_eq!(rule.name, DEFAULT_RULE_NAME);
        assert_eq!(rule.watch, vec!["**/*.go"]);
        assert_eq!(
            rule.ignore,
            vec!["**/*_test.go", "vendor/**", "node_modules/**"]
        );
        assert_eq!(rule.command, "go build -o ./tmp/main .");
    }

    #[test]
    fn absent_fields_take_documented_defaults() {
        let config = Config::parse("backend_port: 9000\n").expect("parses");
        assert_eq!(config.proxy_port, 3000);
        assert_eq!(config.backend_port, 9000);
        assert_eq!(config.build_status_dir, PathBuf::from("tmp/.build-status"));
        assert_eq!(config.run_cmd, "./tmp/main");
        assert!(config.build_rules.is_empty());
    }

    #[test]
    fn rule_ignore_list_is_optional() {
        let raw = r#"
build_rules:
  - name: assets
    watch: ["web/*.css"]
    command: "make css"
"#;
        let config = Config::parse(raw).expect("parses");
        assert!(config.build_rules[0].ignore.is_empty());
    }

    #[test]
    fn duplicate_rule_names_are_rejected() {
        let raw = r#"
build_rules:
  - name: build
    watch: ["**/*.go"]
    command: "true"
  - name: build
    watch: ["**/*.css"]
    command: "true"
"#;
        let err = Config::parse(raw).expect_err("duplicate names must fail");
        assert!(err.to_string().contains("duplicate build rule name"));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        assert!(Config::parse("proxy_port: [not a port").is_err());
    }

    #[test]
    fn template_names_match_the_shared_default_rule() {
        // `/__build-status` reports DEFAULT_RULE_NAME for markers, so the
        // template must keep using it.
        assert!(DEFAULT_CONFIG.contains(&format!("name: \"{DEFAULT_RULE_NAME}\"")));
    }
}
