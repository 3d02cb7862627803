//! Resolution of the Vault connection settings from flags, environment
//! variables, and an optional external helper command.

use std::process::Stdio;

use anyhow::{bail, Context};
use serde::Deserialize;
use tokio::process::Command;

/// Everything needed to read secrets from a Vault server over HTTP.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub token: String,
    /// One or more secret paths, joined by `path_delim`.
    #[serde(default)]
    pub path: String,
    #[serde(default, rename = "path-delim")]
    pub path_delim: String,
}

impl VaultConfig {
    /// Build the config from CLI flags, falling back to `VAULT_*` environment
    /// variables for anything not given. The path delimiter defaults to ","
    /// and a trailing slash on the address is stripped.
    pub fn resolve(
        address: Option<String>,
        token: Option<String>,
        path: Option<String>,
        path_delim: Option<String>,
    ) -> Self {
        let mut config = VaultConfig {
            address: address.unwrap_or_default(),
            token: token.unwrap_or_default(),
            path: path.unwrap_or_default(),
            path_delim: path_delim.unwrap_or_default(),
        };

        if config.address.is_empty() {
            config.address = env_or_empty("VAULT_ADDR");
        }
        if config.token.is_empty() {
            config.token = env_or_empty("VAULT_TOKEN");
        }
        if config.path.is_empty() {
            config.path = env_or_empty("VAULT_PATH");
        }

        // The delimiter defaults to a comma, so the environment only gets a
        // say when the flag was absent or left at that default.
        if config.path_delim.is_empty() || config.path_delim == "," {
            let from_env = env_or_empty("VAULT_PATH_DELIM");
            if !from_env.is_empty() {
                config.path_delim = from_env;
            }
        }
        if config.path_delim.is_empty() {
            config.path_delim = ",".to_string();
        }

        if let Some(stripped) = config.address.strip_suffix('/') {
            config.address = stripped.to_string();
        }

        config
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.address.is_empty() {
            bail!("missing vault address");
        }
        reqwest::Url::parse(&self.address).context("invalid vault address")?;
        if self.path.is_empty() {
            bail!("missing vault secret path");
        }
        if self.token.is_empty() {
            bail!("missing vault token");
        }
        if self.path_delim.is_empty() {
            bail!("missing vault secret path delimiter");
        }
        Ok(())
    }

    /// The ordered list of secret paths to fetch and merge.
    pub fn secret_paths(&self) -> Vec<String> {
        self.path
            .split(&self.path_delim)
            .map(str::to_string)
            .collect()
    }

    /// Run `helper` to produce config values: it gets the already-resolved
    /// fields as `VAULT_*` environment variables, prints a JSON object to
    /// stdout, and its stderr passes straight through. Non-empty keys in its
    /// output override the current values.
    pub async fn generate(self, helper: &str) -> anyhow::Result<Self> {
        let mut command = Command::new(helper);
        command.stdout(Stdio::piped()).stderr(Stdio::inherit());

        if !self.address.is_empty() {
            command.env("VAULT_ADDR", &self.address);
        }
        if !self.token.is_empty() {
            command.env("VAULT_TOKEN", &self.token);
        }
        if !self.path.is_empty() {
            command.env("VAULT_PATH", &self.path);
        }
        if !self.path_delim.is_empty() {
            command.env("VAULT_PATH_DELIM", &self.path_delim);
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("failed to run config helper {}", helper))?;
        if !output.status.success() {
            bail!("config helper {} failed with {}", helper, output.status);
        }

        let generated: VaultConfig = serde_json::from_slice(&output.stdout)
            .context("config helper printed invalid JSON")?;
        Ok(self.merged_with(generated))
    }

    fn merged_with(mut self, other: VaultConfig) -> Self {
        if !other.address.is_empty() {
            self.address = other.address;
        }
        if !other.token.is_empty() {
            self.token = other.token;
        }
        if !other.path.is_empty() {
            self.path = other.path;
        }
        if !other.path_delim.is_empty() {
            self.path_delim = other.path_delim;
        }
        self
    }
}

fn env_or_empty(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;

    // resolve() reads process-wide VAULT_* variables; serialize the tests
    // that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_vault_env() {
        for name in ["VAULT_ADDR", "VAULT_TOKEN", "VAULT_PATH", "VAULT_PATH_DELIM"] {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn flags_take_precedence_over_environment() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_vault_env();
        std::env::set_var("VAULT_ADDR", "http://from-env:8200");
        std::env::set_var("VAULT_TOKEN", "env-token");

        let config = VaultConfig::resolve(
            Some("http://from-flag:8200".to_string()),
            None,
            Some("secret/app".to_string()),
            None,
        );

        assert_eq!(config.address, "http://from-flag:8200");
        assert_eq!(config.token, "env-token");
        assert_eq!(config.path, "secret/app");
        assert_eq!(config.path_delim, ",");
        clear_vault_env();
    }

    #[test]
    fn environment_delimiter_replaces_the_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_vault_env();
        std::env::set_var("VAULT_PATH_DELIM", ";");

        let config = VaultConfig::resolve(None, None, None, Some(",".to_string()));
        assert_eq!(config.path_delim, ";");

        let config = VaultConfig::resolve(None, None, None, Some(":".to_string()));
        assert_eq!(config.path_delim, ":");
        clear_vault_env();
    }

    #[test]
    fn trailing_slash_is_stripped_from_the_address() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_vault_env();

        let config = VaultConfig::resolve(
            Some("http://vault:8200/".to_string()),
            None,
            None,
            None,
        );
        assert_eq!(config.address, "http://vault:8200");
    }

    #[test]
    fn validate_rejects_incomplete_configs() {
        let complete = VaultConfig {
            address: "http://vault:8200".to_string(),
            token: "tok".to_string(),
            path: "secret/app".to_string(),
            path_delim: ",".to_string(),
        };
        assert!(complete.validate().is_ok());

        let mut missing_address = complete.clone();
        missing_address.address.clear();
        assert!(missing_address.validate().is_err());

        let mut bad_address = complete.clone();
        bad_address.address = "not a url".to_string();
        assert!(bad_address.validate().is_err());

        let mut missing_token = complete.clone();
        missing_token.token.clear();
        assert!(missing_token.validate().is_err());

        let mut missing_path = complete;
        missing_path.path.clear();
        assert!(missing_path.validate().is_err());
    }

    #[test]
    fn secret_paths_split_on_the_delimiter() {
        let config = VaultConfig {
            path: "secret/app;secret/db".to_string(),
            path_delim: ";".to_string(),
            ..Default::default()
        };
        assert_eq!(config.secret_paths(), vec!["secret/app", "secret/db"]);

        let single = VaultConfig {
            path: "secret/app".to_string(),
            path_delim: ",".to_string(),
            ..Default::default()
        };
        assert_eq!(single.secret_paths(), vec!["secret/app"]);
    }

    fn write_helper(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("helper.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn helper_output_overrides_resolved_values() {
        let dir = tempfile::tempdir().unwrap();
        let helper = write_helper(&dir, r#"echo "{\"token\": \"tok-$VAULT_ADDR\"}""#);

        let config = VaultConfig {
            address: "http://vault:8200".to_string(),
            token: "original".to_string(),
            path: "secret/app".to_string(),
            path_delim: ",".to_string(),
        };
        let generated = config.generate(&helper).await.unwrap();

        // The helper saw our address in its environment and replaced the
        // token; everything it left out is preserved.
        assert_eq!(generated.token, "tok-http://vault:8200");
        assert_eq!(generated.address, "http://vault:8200");
        assert_eq!(generated.path, "secret/app");
    }

    #[tokio::test]
    async fn failing_helper_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let helper = write_helper(&dir, "exit 3");

        let result = VaultConfig::default().generate(&helper).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn helper_printing_garbage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let helper = write_helper(&dir, "echo not-json");

        let result = VaultConfig::default().generate(&helper).await;
        assert!(result.is_err());
    }
}
