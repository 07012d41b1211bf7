//! AWS SDK configuration and the connection test.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_types::region::Region;
use aws_types::SdkConfig;
use tracing::{debug, info};

use crate::args::Args;
use crate::error::ConnectionError;

/// Resolved static credentials for this run.
#[derive(Debug, Clone)]
pub struct AccessKey {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl AccessKey {
    /// Resolve from the CLI: either a direct secret or a password-store
    /// reference of the form `ident@/path/to/store`. The store is a JSON
    /// object mapping identifiers to secrets.
    pub fn from_args(args: &Args) -> Result<Self> {
        let access_key_id = args
            .access_key_id
            .clone()
            .ok_or_else(|| anyhow!("--access-key-id is required"))?;
        let secret_access_key = match (&args.secret_access_key, &args.secret_access_key_reference) {
            (Some(secret), _) => secret.clone(),
            (None, Some(reference)) => resolve_password_store(reference)?,
            (None, None) => bail!("either --secret-access-key or --secret-access-key-reference is required"),
        };
        Ok(Self {
            access_key_id,
            secret_access_key,
        })
    }

    fn to_credentials(&self) -> Credentials {
        Credentials::from_keys(&self.access_key_id, &self.secret_access_key, None)
    }
}

fn resolve_password_store(reference: &str) -> Result<String> {
    let (ident, path) = reference
        .split_once('@')
        .ok_or_else(|| anyhow!("password store reference must look like ident@/path/to/store"))?;
    lookup_password(ident, Path::new(path))
}

fn lookup_password(ident: &str, store: &Path) -> Result<String> {
    let text = fs::read_to_string(store)
        .with_context(|| format!("failed to read password store {}", store.display()))?;
    let entries: HashMap<String, String> = serde_json::from_str(&text)
        .with_context(|| format!("password store {} is not a JSON object", store.display()))?;
    entries
        .get(ident)
        .cloned()
        .ok_or_else(|| anyhow!("password store has no entry {:?}", ident))
}

/// Export the proxy settings for the SDK's default connector. Done once,
/// before any client is built.
pub fn apply_proxy_settings(args: &Args) {
    let Some(host) = &args.proxy_host else {
        return;
    };
    let authority = match (&args.proxy_user, &args.proxy_password) {
        (Some(user), Some(password)) => format!("{}:{}@{}", user, password, host),
        (Some(user), None) => format!("{}@{}", user, host),
        _ => host.clone(),
    };
    let url = match args.proxy_port {
        Some(port) => format!("http://{}:{}", authority, port),
        None => format!("http://{}", authority),
    };
    debug!(proxy = %host, "routing AWS requests through proxy");
    std::env::set_var("HTTP_PROXY", &url);
    std::env::set_var("HTTPS_PROXY", &url);
}

/// Build the SDK configuration for one region.
pub async fn sdk_config_for_region(key: &AccessKey, region: &str) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .credentials_provider(key.to_credentials())
        .load()
        .await
}

/// Region every account-global API is served from.
pub const GLOBAL_REGION: &str = "us-east-1";

/// Verify the credentials with STS and return the account id.
///
/// Any STS failure is mapped to [`ConnectionError`]: the caller decides
/// whether that means "exit 2" (`--connection-test`) or "report and exit 0"
/// (normal run).
pub async fn connection_test(key: &AccessKey) -> Result<String, ConnectionError> {
    let config = sdk_config_for_region(key, GLOBAL_REGION).await;
    let client = aws_sdk_sts::Client::new(&config);
    let identity = client
        .get_caller_identity()
        .send()
        .await
        .map_err(|err| ConnectionError(err.to_string()))?;
    let account = identity
        .account()
        .ok_or_else(|| ConnectionError("STS response has no account id".to_string()))?
        .to_string();
    info!(account = %account, "credentials verified");
    Ok(account)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_store_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store.json");
        fs::write(&store, r#"{"aws-secret": "s3cr3t"}"#).unwrap();

        let secret = lookup_password("aws-secret", &store).unwrap();
        assert_eq!(secret, "s3cr3t");

        assert!(lookup_password("missing", &store).is_err());
    }

    #[test]
    fn test_reference_format_is_enforced() {
        assert!(resolve_password_store("no-at-sign").is_err());
    }
}
