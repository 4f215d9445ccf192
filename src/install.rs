//! Package cache population for the `install` verb.
//!
//! Fetches a package manifest from the registry and lays it out under the
//! local cache (`<cache>/<name>/<version>/manifest.json`). The manifest
//! carries the command line `run` uses to spawn the server.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{RestartConfig, ServerConfig};
use crate::error::GatewayError;
use crate::retry::{classify_status, classify_transport};

/// Default registry queried when none is configured.
pub const DEFAULT_REGISTRY_URL: &str = "https://registry.fluidmcp.com";

/// Installed package manifest, as served by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
}

impl PackageManifest {
    /// Server record template for a freshly installed package.
    pub fn to_server_config(&self, install_path: PathBuf) -> ServerConfig {
        ServerConfig {
            id: self.name.replace('/', "-"),
            enabled: true,
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            install_path: Some(install_path),
            port: None,
            probe_url: None,
            restart: RestartConfig::default(),
            stderr_markers: vec!["cuda out of memory".to_string()],
            grace_period_secs: 5,
            call_timeout_secs: 30,
            stream_timeout_secs: 300,
            stderr_capacity: 10_000,
        }
    }
}

/// Split a `name@version` reference; a bare name selects `latest`.
pub fn parse_package_spec(spec: &str) -> crate::Result<(&str, &str)> {
    let (name, version) = match spec.rsplit_once('@') {
        Some((name, version)) if !version.is_empty() => (name, version),
        Some(_) => {
            return Err(GatewayError::InvalidConfig(
                spec.to_string(),
                "empty version after '@'".to_string(),
            ));
        }
        None => (spec, "latest"),
    };
    if name.is_empty() {
        return Err(GatewayError::InvalidConfig(
            spec.to_string(),
            "empty package name".to_string(),
        ));
    }
    Ok((name, version))
}

/// Cache directory for one package version.
pub fn package_dir(cache_root: &Path, name: &str, version: &str) -> PathBuf {
    cache_root.join(name.replace('/', "_")).join(version)
}

/// Fetch a package manifest and write it into the cache. Returns the
/// directory the package was installed into.
pub async fn install_package(
    spec: &str,
    registry_url: &str,
    cache_root: &Path,
) -> crate::Result<PathBuf> {
    let (name, version) = parse_package_spec(spec)?;
    let url = format!(
        "{}/packages/{}/{}",
        registry_url.trim_end_matches('/'),
        name,
        version
    );
    tracing::info!(package = %name, version = %version, "fetching package manifest");

    let client = reqwest::Client::new();
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| classify_transport(name, &e))?;
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(classify_status(status.as_u16(), message));
    }
    let manifest: PackageManifest = response
        .json()
        .await
        .map_err(|e| classify_transport(name, &e))?;

    let dir = package_dir(cache_root, &manifest.name, &manifest.version);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| GatewayError::Io(name.to_string(), e.to_string()))?;
    let manifest_path = dir.join("manifest.json");
    let body = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| GatewayError::Io(name.to_string(), e.to_string()))?;
    tokio::fs::write(&manifest_path, body)
        .await
        .map_err(|e| GatewayError::Io(name.to_string(), e.to_string()))?;

    tracing::info!(package = %manifest.name, version = %manifest.version, path = %dir.display(), "installed");
    Ok(dir)
}

/// Load an installed manifest from the cache.
pub async fn load_manifest(dir: &Path) -> crate::Result<PackageManifest> {
    let path = dir.join("manifest.json");
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| GatewayError::Io(path.display().to_string(), e.to_string()))?;
    serde_json::from_str(&content)
        .map_err(|e| GatewayError::InvalidConfig(path.display().to_string(), e.to_string()))
}
