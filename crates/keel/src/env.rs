//! Build environments and their resolution.

use crate::error::Result;
use crate::options::Options;
use async_trait::async_trait;
use keel_files::ContentHash;
use lsp_types::Url;
use serde::{Deserialize, Serialize};

/// The resolved build environment of a View.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Env {
    /// Target operating system.
    pub target_os: String,
    /// Target architecture.
    pub target_arch: String,
    /// Active build tags.
    pub build_tags: Vec<String>,
    /// Version of the tool chain in use.
    pub toolchain: String,
    /// Module proxy, if one is configured.
    pub module_proxy: Option<String>,
    /// The pseudo-file declaring predeclared identifiers, if any.
    pub builtin_file: Option<Url>,
}

impl Env {
    /// The environment of the machine the server runs on.
    #[must_use]
    pub fn host() -> Self {
        Self {
            target_os: std::env::consts::OS.to_string(),
            target_arch: std::env::consts::ARCH.to_string(),
            build_tags: Vec::new(),
            toolchain: String::new(),
            module_proxy: None,
            builtin_file: None,
        }
    }

    /// Whether this environment targets the same platform as `default`.
    #[must_use]
    pub fn same_platform(&self, default: &Env) -> bool {
        self.target_os == default.target_os && self.target_arch == default.target_arch
    }

    /// Tag appended to diagnostics that only this environment reports:
    /// empty for the default platform, `" [os,arch]"` otherwise.
    #[must_use]
    pub fn suffix(&self, default: &Env) -> String {
        if self.same_platform(default) {
            String::new()
        } else {
            format!(" [{},{}]", self.target_os, self.target_arch)
        }
    }

    /// Stable digest of the environment, used to key snapshot caches.
    #[must_use]
    pub fn hash(&self) -> ContentHash {
        ContentHash::of(&serde_json::to_vec(self).unwrap_or_default())
    }
}

/// Resolves the build environment of a workspace folder.
#[async_trait]
pub trait EnvResolver: Send + Sync {
    /// Resolve the environment for `folder` under `options`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool chain cannot be queried. The folder is
    /// then not added.
    async fn fetch_env(&self, folder: &Url, options: &Options) -> Result<Env>;
}

/// Resolver that derives the environment from the host and the options alone.
///
/// The tool chain version is taken from the `KEEL_TOOLCHAIN` entry of the
/// options' `env`, falling back to the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostEnvResolver;

#[async_trait]
impl EnvResolver for HostEnvResolver {
    async fn fetch_env(&self, _folder: &Url, options: &Options) -> Result<Env> {
        let mut env = Env::host();
        if let Some(os) = &options.target_os {
            env.target_os.clone_from(os);
        }
        if let Some(arch) = &options.target_arch {
            env.target_arch.clone_from(arch);
        }
        env.build_tags.clone_from(&options.build_tags);
        env.toolchain = options
            .env
            .get("KEEL_TOOLCHAIN")
            .cloned()
            .or_else(|| std::env::var("KEEL_TOOLCHAIN").ok())
            .unwrap_or_default();
        env.module_proxy = options.env.get("KEEL_PROXY").cloned();
        Ok(env)
    }
}

/// Resolver returning a fixed environment, with the target platform still
/// taken from the options.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Clone)]
pub struct StaticEnvResolver {
    env: Env,
}

#[cfg(any(test, feature = "test-util"))]
impl StaticEnvResolver {
    /// Resolve every folder to `env`.
    #[must_use]
    pub fn new(env: Env) -> Self {
        Self { env }
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Default for StaticEnvResolver {
    fn default() -> Self {
        Self::new(Env::host())
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl EnvResolver for StaticEnvResolver {
    async fn fetch_env(&self, _folder: &Url, options: &Options) -> Result<Env> {
        let mut env = self.env.clone();
        if let Some(os) = &options.target_os {
            env.target_os.clone_from(os);
        }
        if let Some(arch) = &options.target_arch {
            env.target_arch.clone_from(arch);
        }
        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder() -> Url {
        Url::parse("file:///work/").unwrap()
    }

    #[test]
    fn host_env_has_no_suffix() {
        assert_eq!(Env::host().suffix(&Env::host()), "");
    }

    #[test]
    fn foreign_platform_is_suffixed() {
        let env = Env {
            target_os: "plan9".to_string(),
            target_arch: "arm".to_string(),
            ..Env::host()
        };
        assert_eq!(env.suffix(&Env::host()), " [plan9,arm]");
        assert_ne!(env.hash(), Env::host().hash());
    }

    #[tokio::test]
    async fn host_resolver_applies_target_overrides() {
        let options = Options {
            target_os: Some("plan9".to_string()),
            build_tags: vec!["debug".to_string()],
            ..Options::default()
        };
        let env = HostEnvResolver.fetch_env(&folder(), &options).await.unwrap();
        assert_eq!(env.target_os, "plan9");
        assert_eq!(env.target_arch, std::env::consts::ARCH);
        assert_eq!(env.build_tags, vec!["debug".to_string()]);
    }
}
