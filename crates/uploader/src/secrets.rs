//! The vault seam.
//!
//! Connection secrets are named `<prefix>--<protocol>--<field>`, where the
//! prefix is the project's keyvault alias when one is configured and the
//! project slug otherwise. Secrets are fetched fresh for every upload, so a
//! rotation in the vault takes effect without a restart.

use project_config::ProjectConfig;

#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    async fn fetch(&self, name: &str) -> anyhow::Result<String>;
}

/// Secret prefix for a project: the keyvault alias if set, else the slug.
pub fn secret_prefix(config: &ProjectConfig) -> String {
    config
        .project
        .azure_kv_alias
        .clone()
        .unwrap_or_else(|| config.slug())
}

/// Environment-backed store for development and the test harness: the secret
/// `some-project--ftp--host` is read from `PIXL_SECRET_SOME_PROJECT__FTP__HOST`.
pub struct EnvSecretStore;

fn env_name(secret: &str) -> String {
    format!("PIXL_SECRET_{}", secret.to_uppercase().replace('-', "_"))
}

#[async_trait::async_trait]
impl SecretStore for EnvSecretStore {
    async fn fetch(&self, name: &str) -> anyhow::Result<String> {
        std::env::var(env_name(name))
            .map_err(|_| anyhow::anyhow!("secret '{name}' is not set in the environment"))
    }
}
