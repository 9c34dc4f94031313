//! Minimal Kubernetes Secret client
//!
//! Decryption keys may live in a Secret on the host cluster. This client is
//! deliberately small: resolve a kubeconfig (explicit path, `$KUBECONFIG`,
//! or `~/.kube/config`), build a TLS-configured HTTP client for the
//! selected context, and GET one Secret. Registry construction tolerates a
//! client that cannot be built; the run degrades to locally supplied keys.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug)]
pub struct SecretClient {
    http: reqwest::Client,
    server: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(rename = "current-context")]
    current_context: Option<String>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: Cluster,
}

#[derive(Debug, Deserialize)]
struct Cluster {
    server: String,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: Option<String>,
    #[serde(rename = "insecure-skip-tls-verify", default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: KubeContext,
}

#[derive(Debug, Deserialize)]
struct KubeContext {
    cluster: String,
    user: String,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    user: User,
}

#[derive(Debug, Default, Deserialize)]
struct User {
    token: Option<String>,
    #[serde(rename = "client-certificate-data")]
    client_certificate_data: Option<String>,
    #[serde(rename = "client-key-data")]
    client_key_data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SecretObject {
    #[serde(default)]
    data: HashMap<String, String>,
}

impl SecretClient {
    /// Build a client for the kubeconfig's current context
    ///
    /// `api_url` overrides the cluster server address from the kubeconfig.
    pub async fn connect(kubeconfig: Option<&Path>, api_url: Option<&str>) -> Result<Self> {
        let path = match kubeconfig {
            Some(p) => p.to_path_buf(),
            None => default_kubeconfig()?,
        };
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading kubeconfig {}", path.display()))?;
        let config: Kubeconfig = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("parsing kubeconfig {}", path.display()))?;

        let context_name = config
            .current_context
            .as_deref()
            .ok_or_else(|| anyhow!("kubeconfig has no current-context"))?;
        let context = config
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .map(|c| &c.context)
            .ok_or_else(|| anyhow!("kubeconfig context {:?} not found", context_name))?;
        let cluster = config
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| anyhow!("kubeconfig cluster {:?} not found", context.cluster))?;
        let user = config
            .users
            .iter()
            .find(|u| u.name == context.user)
            .map(|u| &u.user)
            .ok_or_else(|| anyhow!("kubeconfig user {:?} not found", context.user))?;

        let mut builder = reqwest::Client::builder();
        if let Some(ca) = &cluster.certificate_authority_data {
            let pem = BASE64
                .decode(ca)
                .context("decoding certificate-authority-data")?;
            builder = builder.add_root_certificate(
                reqwest::Certificate::from_pem(&pem).context("parsing cluster CA certificate")?,
            );
        }
        if cluster.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let (Some(cert), Some(key)) = (&user.client_certificate_data, &user.client_key_data) {
            let mut pem = BASE64
                .decode(cert)
                .context("decoding client-certificate-data")?;
            pem.extend(BASE64.decode(key).context("decoding client-key-data")?);
            builder = builder
                .identity(reqwest::Identity::from_pem(&pem).context("parsing client identity")?);
        }

        let server = api_url
            .map(str::to_string)
            .unwrap_or_else(|| cluster.server.clone());

        debug!("kubernetes secret client for {}", server);
        Ok(Self {
            http: builder.build().context("building http client")?,
            server: server.trim_end_matches('/').to_string(),
            token: user.token.clone(),
        })
    }

    /// Fetch one Secret and base64-decode its data entries
    pub async fn get_secret(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<HashMap<String, Vec<u8>>> {
        let url = format!(
            "{}/api/v1/namespaces/{}/secrets/{}",
            self.server, namespace, name
        );

        let mut request = self.http.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("requesting secret {}/{}", namespace, name))?;
        if !response.status().is_success() {
            bail!(
                "secret {}/{} request failed: {}",
                namespace,
                name,
                response.status()
            );
        }

        let secret: SecretObject = response
            .json()
            .await
            .with_context(|| format!("decoding secret {}/{}", namespace, name))?;

        let mut data = HashMap::new();
        for (key, value) in secret.data {
            let decoded = BASE64
                .decode(&value)
                .with_context(|| format!("secret entry {} is not valid base64", key))?;
            data.insert(key, decoded);
        }
        Ok(data)
    }
}

fn default_kubeconfig() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("KUBECONFIG") {
        return Ok(PathBuf::from(path));
    }
    dirs::home_dir()
        .map(|home| home.join(".kube").join("config"))
        .ok_or_else(|| anyhow!("no kubeconfig path available"))
}
