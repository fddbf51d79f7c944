//! Server, client and per-folder configuration.
//!
//! [`Options`] are the user-facing settings. They arrive as
//! `initializationOptions`, are replaced on `workspace/didChangeConfiguration`,
//! and can be overridden per folder by a `.keel.yaml` file at the folder root.
//! Every View captures the options it was created with; a change of options
//! produces new Views rather than mutating existing ones.

use crate::error::{Error, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use keel_files::{ContentHash, KindRules};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Name of the per-folder configuration file.
pub const FOLDER_CONFIG_FILE: &str = ".keel.yaml";

/// When diagnostics are recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DiagnosticsTrigger {
    /// After every edit.
    #[default]
    #[serde(alias = "OnEdit")]
    Edit,
    /// Only when a file is saved.
    #[serde(alias = "OnSave")]
    Save,
}

/// User settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    /// Delay between the fast and the full diagnostics phase. Zero disables
    /// the fast phase.
    #[serde(with = "duration_string")]
    pub diagnostics_delay: Duration,
    /// When diagnostics are recomputed.
    pub diagnostics_trigger: DiagnosticsTrigger,
    /// Extra flags passed to the build tool.
    pub build_flags: Vec<String>,
    /// Build tags selecting conditional files.
    pub build_tags: Vec<String>,
    /// Extra environment for the build tool.
    pub env: BTreeMap<String, String>,
    /// Target operating system; the host's when unset.
    pub target_os: Option<String>,
    /// Target architecture; the host's when unset.
    pub target_arch: Option<String>,
    /// `+dir` / `-dir` entries including or excluding workspace directories.
    pub directory_filters: Vec<String>,
    /// Analyzers to enable or disable by name.
    pub analyses: BTreeMap<String, bool>,
    /// Workspace-relative directories for which optimization details are
    /// reported.
    pub optimization_details: Vec<String>,
    /// Report known vulnerabilities of required modules.
    pub vulncheck: bool,
    /// Report available upgrades of required modules.
    pub check_upgrades: bool,
    /// Extensions (without the dot) of template files.
    pub template_extensions: Vec<String>,
    /// Report progress for every diagnostics pass.
    pub verbose_work_done_progress: bool,
    /// Show the first internal error of the process to the user.
    pub report_internal_bugs: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            diagnostics_delay: Duration::from_secs(1),
            diagnostics_trigger: DiagnosticsTrigger::Edit,
            build_flags: Vec::new(),
            build_tags: Vec::new(),
            env: BTreeMap::new(),
            target_os: None,
            target_arch: None,
            directory_filters: vec!["-**/node_modules".to_string()],
            analyses: BTreeMap::new(),
            optimization_details: Vec::new(),
            vulncheck: false,
            check_upgrades: false,
            template_extensions: vec!["tmpl".to_string()],
            verbose_work_done_progress: false,
            report_internal_bugs: true,
        }
    }
}

impl Options {
    /// Decode client settings.
    ///
    /// Settings may be given bare or nested under a `"keel"` key, as clients
    /// commonly send a section of their global configuration. `null` yields
    /// the defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a recognized key has the wrong type.
    pub fn from_settings(settings: &Value) -> Result<Self> {
        let section = match settings {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => map.get("keel").unwrap_or(settings),
            other => {
                return Err(Error::Config(format!("settings must be an object, got {other}")));
            }
        };
        Self::deserialize(section).map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply key-by-key overrides on top of these options.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `overrides` is not an object or an override
    /// has the wrong type.
    pub fn with_overrides(&self, overrides: &Value) -> Result<Self> {
        let Value::Object(overrides) = overrides else {
            return Err(Error::Config("overrides must be a mapping".to_string()));
        };
        let mut merged = serde_json::to_value(self)?;
        if let Value::Object(base) = &mut merged {
            for (key, value) in overrides {
                base.insert(key.clone(), value.clone());
            }
        }
        Ok(serde_json::from_value(merged)?)
    }

    /// Stable digest of every setting, used to key snapshot caches.
    #[must_use]
    pub fn hash(&self) -> ContentHash {
        ContentHash::of(&serde_json::to_vec(self).unwrap_or_default())
    }

    /// File classification rules implied by these options.
    #[must_use]
    pub fn kind_rules(&self) -> KindRules {
        KindRules {
            template_extensions: self.template_extensions.clone(),
            ..KindRules::default()
        }
    }

    /// Parsed directory filters.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for entries without a `+`/`-` prefix or with an
    /// invalid glob.
    pub fn directory_filters(&self) -> Result<DirectoryFilters> {
        DirectoryFilters::parse(&self.directory_filters)
    }
}

/// Read the per-folder overrides from `<root>/.keel.yaml`, if present.
///
/// # Errors
///
/// Returns `Error::Config` if the file exists but is not a YAML mapping, and
/// `Error::Transient` if it cannot be read.
pub async fn load_folder_overrides(root: &Path) -> Result<Option<Value>> {
    let path = root.join(FOLDER_CONFIG_FILE);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    debug!(path = %path.display(), "Loaded folder configuration");
    let value: Value = serde_yaml::from_str(&content)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    match value {
        Value::Null => Ok(None),
        Value::Object(_) => Ok(Some(value)),
        _ => Err(Error::Config(format!("{}: expected a mapping", path.display()))),
    }
}

/// Include/exclude rules over workspace-relative directories.
///
/// Rules are evaluated in order and the last matching rule wins. A rule for
/// `dir` also covers everything beneath it.
#[derive(Debug, Clone, Default)]
pub struct DirectoryFilters {
    rules: Vec<(bool, GlobSet)>,
}

impl DirectoryFilters {
    /// Parse `+dir` / `-dir` entries.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for malformed entries.
    pub fn parse(entries: &[String]) -> Result<Self> {
        let mut rules = Vec::with_capacity(entries.len());
        for entry in entries {
            let (include, path) = match entry.split_at_checked(1) {
                Some(("+", rest)) => (true, rest),
                Some(("-", rest)) => (false, rest),
                _ => {
                    return Err(Error::Config(format!(
                        "invalid directory filter {entry:?}: must start with '+' or '-'"
                    )));
                }
            };
            let path = path.trim_matches('/');
            if path.is_empty() {
                continue;
            }
            let mut set = GlobSetBuilder::new();
            for pattern in [path.to_string(), format!("{path}/**")] {
                let glob = GlobBuilder::new(&pattern)
                    .literal_separator(true)
                    .build()
                    .map_err(|e| Error::Config(format!("invalid directory filter {entry:?}: {e}")))?;
                set.add(glob);
            }
            let set = set
                .build()
                .map_err(|e| Error::Config(format!("invalid directory filter {entry:?}: {e}")))?;
            rules.push((include, set));
        }
        Ok(Self { rules })
    }

    /// Whether the directory at `dir` (workspace-relative, `/`-separated) is
    /// excluded.
    #[must_use]
    pub fn excludes(&self, dir: &str) -> bool {
        let mut excluded = false;
        for (include, set) in &self.rules {
            if set.is_match(dir) {
                excluded = !include;
            }
        }
        excluded
    }
}

/// Client capabilities the core adapts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// The client accepts dynamic `workspace/didChangeWatchedFiles`
    /// registrations.
    pub dynamic_watched_files: bool,
    /// The client understands relative glob patterns.
    pub relative_patterns: bool,
    /// The client supports `window/workDoneProgress/create`.
    pub work_done_progress: bool,
    /// The client displays `window/showMessage`.
    pub show_message: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            dynamic_watched_files: false,
            relative_patterns: false,
            work_done_progress: false,
            show_message: true,
        }
    }
}

impl ClientOptions {
    /// Extract the relevant flags from serialized `ClientCapabilities`.
    #[must_use]
    pub fn from_capabilities(capabilities: &Value) -> Self {
        let flag = |pointer: &str| {
            capabilities
                .pointer(pointer)
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };
        Self {
            dynamic_watched_files: flag("/workspace/didChangeWatchedFiles/dynamicRegistration"),
            relative_patterns: flag("/workspace/didChangeWatchedFiles/relativePatternSupport"),
            work_done_progress: flag("/window/workDoneProgress"),
            show_message: true,
        }
    }
}

/// Process-level tuning that is not exposed as a user setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Number of full diagnostics passes that may run at once.
    pub diagnostics_concurrency: usize,
    /// How long shutdown waits for outstanding snapshot references.
    pub drain_timeout: Duration,
    /// Pause before the fast diagnostics phase.
    pub min_diagnostics_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            diagnostics_concurrency: 1,
            drain_timeout: Duration::from_secs(5),
            min_diagnostics_delay: Duration::from_millis(20),
        }
    }
}

/// Parse a duration such as `"250ms"`, `"1s"`, `"1.5s"`, `"2m"` or `"0"`.
///
/// # Errors
///
/// Returns `Error::Config` for unknown units or malformed numbers.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(|| Error::Config(format!("duration {text:?} has no unit")))?;
    let (number, unit) = text.split_at(split);
    let nanos_per_unit: u64 = match unit {
        "ns" => 1,
        "us" | "µs" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60_000_000_000,
        "h" => 3_600_000_000_000,
        _ => return Err(Error::Config(format!("unknown duration unit {unit:?}"))),
    };
    let invalid = || Error::Config(format!("invalid duration {text:?}"));

    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(nanos_per_unit)
            .map(Duration::from_nanos)
            .ok_or_else(invalid);
    }
    let value: f64 = number.parse().map_err(|_| invalid())?;
    #[allow(clippy::cast_precision_loss)]
    let seconds = value * nanos_per_unit as f64 / 1e9;
    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}

/// Render a duration in the format accepted by [`parse_duration`].
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    if duration.is_zero() {
        "0".to_string()
    } else if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else if duration.subsec_nanos() % 1_000_000 == 0 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{}ns", duration.as_nanos())
    }
}

mod duration_string {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("250ms", Duration::from_millis(250))]
    #[case("1s", Duration::from_secs(1))]
    #[case("1.5s", Duration::from_millis(1500))]
    #[case("2m", Duration::from_secs(120))]
    #[case("0", Duration::ZERO)]
    fn parses_durations(#[case] text: &str, #[case] expected: Duration) {
        assert_eq!(parse_duration(text).unwrap(), expected);
    }

    #[rstest]
    #[case("10")]
    #[case("1 parsec")]
    #[case("ms")]
    fn rejects_bad_durations(#[case] text: &str) {
        assert!(matches!(parse_duration(text), Err(Error::Config(_))));
    }

    #[test]
    fn settings_may_be_nested_under_keel() {
        let options = Options::from_settings(&json!({
            "keel": { "diagnosticsDelay": "200ms", "diagnosticsTrigger": "Save" }
        }))
        .unwrap();
        assert_eq!(options.diagnostics_delay, Duration::from_millis(200));
        assert_eq!(options.diagnostics_trigger, DiagnosticsTrigger::Save);
    }

    #[test]
    fn on_save_alias_is_accepted() {
        let options = Options::from_settings(&json!({ "diagnosticsTrigger": "OnSave" })).unwrap();
        assert_eq!(options.diagnostics_trigger, DiagnosticsTrigger::Save);
    }

    #[test]
    fn wrong_type_is_a_config_error() {
        let err = Options::from_settings(&json!({ "vulncheck": "yes" })).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn overrides_replace_individual_keys() {
        let base = Options {
            build_tags: vec!["integration".to_string()],
            ..Options::default()
        };
        let merged = base.with_overrides(&json!({ "targetOs": "plan9" })).unwrap();
        assert_eq!(merged.target_os.as_deref(), Some("plan9"));
        assert_eq!(merged.build_tags, vec!["integration".to_string()]);
        assert_ne!(merged.hash(), base.hash());
    }

    #[test]
    fn options_survive_serialization() {
        let options = Options {
            diagnostics_delay: Duration::from_millis(20),
            ..Options::default()
        };
        let value = serde_json::to_value(&options).unwrap();
        assert_eq!(value["diagnosticsDelay"], "20ms");
        assert_eq!(Options::from_settings(&value).unwrap(), options);
    }

    #[rstest]
    #[case(&["-vendor"], "vendor", true)]
    #[case(&["-vendor"], "vendor/lib", true)]
    #[case(&["-vendor"], "vendored", false)]
    #[case(&["-vendor", "+vendor/keep"], "vendor/keep/x", false)]
    #[case(&["-**/node_modules"], "web/node_modules/pkg", true)]
    #[case(&["-gen/*"], "gen/a/b", true)]
    fn directory_filters_last_match_wins(#[case] entries: &[&str], #[case] dir: &str, #[case] excluded: bool) {
        let entries: Vec<String> = entries.iter().map(ToString::to_string).collect();
        assert_eq!(DirectoryFilters::parse(&entries).unwrap().excludes(dir), excluded);
    }

    #[test]
    fn directory_filter_needs_a_sign() {
        assert!(DirectoryFilters::parse(&["vendor".to_string()]).is_err());
    }

    #[test]
    fn client_options_read_nested_capabilities() {
        let caps = json!({
            "workspace": { "didChangeWatchedFiles": {
                "dynamicRegistration": true, "relativePatternSupport": true
            }},
            "window": { "workDoneProgress": true }
        });
        let options = ClientOptions::from_capabilities(&caps);
        assert!(options.dynamic_watched_files);
        assert!(options.relative_patterns);
        assert!(options.work_done_progress);
        assert!(!ClientOptions::from_capabilities(&json!({})).dynamic_watched_files);
    }

    #[tokio::test]
    async fn folder_overrides_are_read_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_folder_overrides(dir.path()).await.unwrap().is_none());

        std::fs::write(dir.path().join(FOLDER_CONFIG_FILE), "targetOs: plan9\nvulncheck: true\n").unwrap();
        let overrides = load_folder_overrides(dir.path()).await.unwrap().unwrap();
        let options = Options::default().with_overrides(&overrides).unwrap();
        assert_eq!(options.target_os.as_deref(), Some("plan9"));
        assert!(options.vulncheck);

        std::fs::write(dir.path().join(FOLDER_CONFIG_FILE), "- a\n- b\n").unwrap();
        assert!(matches!(
            load_folder_overrides(dir.path()).await,
            Err(Error::Config(_))
        ));
    }
}
