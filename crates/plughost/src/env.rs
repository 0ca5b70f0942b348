//! Launch environment for the plugin host.
//!
//! The worker inherits the supervisor's environment minus everything under the
//! reserved prefix, plus a serialized localization config and whatever the
//! registered contributors add.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Variables under this prefix belong to the supervisor and never reach the worker.
pub const RESERVED_ENV_PREFIX: &str = "HOSTED_PLUGIN";

/// Variable carrying the serialized [`LocalizationConfig`].
pub const LOCALIZATION_ENV: &str = "VSCODE_NLS_CONFIG";

/// Variable carrying the extension test suite location, when one is configured.
pub const EXTENSION_TESTS_PATH_ENV: &str = "extensionTestsPath";

pub type Environment = BTreeMap<String, String>;

/// Adds or overrides worker environment variables.
pub trait EnvContributor: Send + Sync {
    fn contribute(&self, env: &mut Environment);
}

impl<F> EnvContributor for F
where
    F: Fn(&mut Environment) + Send + Sync,
{
    fn contribute(&self, env: &mut Environment) {
        self(env)
    }
}

/// Localization settings handed to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalizationConfig {
    pub locale: String,
    pub available_languages: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translations_config_file: Option<PathBuf>,
}

impl Default for LocalizationConfig {
    fn default() -> Self {
        Self {
            locale: "en".to_string(),
            available_languages: BTreeMap::new(),
            translations_config_file: None,
        }
    }
}

impl LocalizationConfig {
    pub fn new(locale: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
            ..Self::default()
        }
    }

    pub fn with_language(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.available_languages.insert(key.into(), value.into());
        self
    }
}

/// Builds the worker environment. Contributors run in registration order.
#[derive(Clone)]
pub struct EnvironmentBuilder {
    reserved_prefix: String,
    localization: LocalizationConfig,
    contributors: Vec<Arc<dyn EnvContributor>>,
    extension_tests_path: Option<PathBuf>,
}

impl Default for EnvironmentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentBuilder {
    pub fn new() -> Self {
        Self {
            reserved_prefix: RESERVED_ENV_PREFIX.to_string(),
            localization: LocalizationConfig::default(),
            contributors: Vec::new(),
            extension_tests_path: None,
        }
    }

    pub fn with_reserved_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.reserved_prefix = prefix.into();
        self
    }

    pub fn with_localization(mut self, localization: LocalizationConfig) -> Self {
        self.localization = localization;
        self
    }

    pub fn with_contributor(mut self, contributor: impl EnvContributor + 'static) -> Self {
        self.contributors.push(Arc::new(contributor));
        self
    }

    pub fn with_contributors(
        mut self,
        contributors: impl IntoIterator<Item = Arc<dyn EnvContributor>>,
    ) -> Self {
        self.contributors.extend(contributors);
        self
    }

    pub fn with_extension_tests_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.extension_tests_path = Some(path.into());
        self
    }

    /// Derive the worker environment from the raw process environment
    /// (`std::env::vars_os()`). Entries that are not valid Unicode are skipped.
    pub fn build_os(&self, base: impl IntoIterator<Item = (OsString, OsString)>) -> Environment {
        let unicode = base.into_iter().filter_map(|(key, value)| {
            match (key.into_string(), value.into_string()) {
                (Ok(key), Ok(value)) => Some((key, value)),
                (Ok(key), Err(_)) => {
                    tracing::warn!(key, "Skipping environment variable with non-Unicode value");
                    None
                }
                (Err(key), _) => {
                    tracing::warn!(key = %key.to_string_lossy(), "Skipping environment variable with non-Unicode name");
                    None
                }
            }
        });
        self.build(unicode)
    }

    /// Derive the worker environment from `base`.
    pub fn build(&self, base: impl IntoIterator<Item = (String, String)>) -> Environment {
        let mut env: Environment = base
            .into_iter()
            .filter(|(key, _)| !key.starts_with(&self.reserved_prefix))
            .collect();

        match serde_json::to_string(&self.localization) {
            Ok(json) => {
                env.insert(LOCALIZATION_ENV.to_string(), json);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize localization config");
            }
        }

        for contributor in &self.contributors {
            contributor.contribute(&mut env);
        }

        if let Some(ref path) = self.extension_tests_path {
            env.insert(
                EXTENSION_TESTS_PATH_ENV.to_string(),
                path.to_string_lossy().into_owned(),
            );
        }

        env
    }
}

/// Translate `--{server_name}-inspect[-brk][=port]` from the supervisor's own
/// arguments into the worker's inspector flags.
pub fn inspect_args(server_name: &str, supervisor_args: &[String]) -> Vec<String> {
    let prefix = format!("--{server_name}-inspect");
    supervisor_args
        .iter()
        .find_map(|arg| arg.strip_prefix(&prefix))
        .map(|suffix| vec!["--nolazy".to_string(), format!("--inspect{suffix}")])
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn strips_reserved_prefix() {
        let env = EnvironmentBuilder::new().build(vars(&[
            ("PATH", "/usr/bin"),
            ("HOSTED_PLUGIN", "1"),
            ("HOSTED_PLUGIN_HOSTNAME", "localhost"),
            ("MY_HOSTED_PLUGIN", "kept"),
        ]));

        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(env.get("MY_HOSTED_PLUGIN").map(String::as_str), Some("kept"));
        assert!(!env.contains_key("HOSTED_PLUGIN"));
        assert!(!env.contains_key("HOSTED_PLUGIN_HOSTNAME"));
    }

    #[test]
    fn injects_localization_as_json() {
        let localization = LocalizationConfig::new("de").with_language("*", "de");
        let env = EnvironmentBuilder::new()
            .with_localization(localization.clone())
            .build(Vec::new());

        let raw = env.get(LOCALIZATION_ENV).unwrap();
        let parsed: LocalizationConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed, localization);
        assert_eq!(raw, r#"{"locale":"de","availableLanguages":{"*":"de"}}"#);
    }

    #[test]
    fn contributors_apply_in_order_and_override() {
        let env = EnvironmentBuilder::new()
            .with_contributor(|env: &mut Environment| {
                env.insert("MODE".to_string(), "first".to_string());
                env.insert("ONLY_FIRST".to_string(), "1".to_string());
            })
            .with_contributor(|env: &mut Environment| {
                env.insert("MODE".to_string(), "second".to_string());
                env.remove("PATH");
            })
            .build(vars(&[("PATH", "/usr/bin")]));

        assert_eq!(env.get("MODE").map(String::as_str), Some("second"));
        assert_eq!(env.get("ONLY_FIRST").map(String::as_str), Some("1"));
        assert!(!env.contains_key("PATH"));
    }

    #[test]
    fn contributors_cannot_be_undone_by_prefix_stripping() {
        // Stripping happens before contributors run.
        let env = EnvironmentBuilder::new()
            .with_contributor(|env: &mut Environment| {
                env.insert("HOSTED_PLUGIN_PORT".to_string(), "3030".to_string());
            })
            .build(vars(&[("HOSTED_PLUGIN_PORT", "1")]));

        assert_eq!(env.get("HOSTED_PLUGIN_PORT").map(String::as_str), Some("3030"));
    }

    #[test]
    fn sets_extension_tests_path() {
        let env = EnvironmentBuilder::new()
            .with_extension_tests_path("/work/tests")
            .build(Vec::new());
        assert_eq!(
            env.get(EXTENSION_TESTS_PATH_ENV).map(String::as_str),
            Some("/work/tests")
        );
    }

    #[cfg(unix)]
    #[test]
    fn non_unicode_entries_are_skipped() {
        use std::os::unix::ffi::OsStringExt;

        let env = EnvironmentBuilder::new().build_os(vec![
            (OsString::from("PATH"), OsString::from("/usr/bin")),
            (OsString::from("BAD_VALUE"), OsString::from_vec(vec![0xff, 0xfe])),
            (OsString::from_vec(vec![b'K', 0xff]), OsString::from("x")),
            (OsString::from("HOSTED_PLUGIN_PORT"), OsString::from("1")),
        ]);

        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert!(!env.contains_key("BAD_VALUE"));
        assert!(!env.contains_key("HOSTED_PLUGIN_PORT"));
        assert!(env.contains_key(LOCALIZATION_ENV));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn inspect_flag_is_translated() {
        let args = vec![
            "--port=3000".to_string(),
            "--hosted-plugin-inspect=9339".to_string(),
        ];
        assert_eq!(
            inspect_args("hosted-plugin", &args),
            vec!["--nolazy".to_string(), "--inspect=9339".to_string()]
        );

        let brk = vec!["--hosted-plugin-inspect-brk".to_string()];
        assert_eq!(
            inspect_args("hosted-plugin", &brk),
            vec!["--nolazy".to_string(), "--inspect-brk".to_string()]
        );
    }

    #[test]
    fn no_inspect_flag_means_no_worker_flags() {
        let args = vec!["--inspect=9229".to_string(), "--other-inspect".to_string()];
        assert!(inspect_args("hosted-plugin", &args).is_empty());
    }
}
