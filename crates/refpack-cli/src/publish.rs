//! Pushing packages to a package feed.

use crate::config::PublishTarget;
use anyhow::{Context, Result};
use refpack_core::{Error, Publisher};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::debug;

const PUBLISH_RESOURCE: &str = "PackagePublish/2.0.0";
const PUSH_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct ServiceIndex {
    #[serde(default)]
    resources: Vec<ServiceResource>,
}

#[derive(Debug, Deserialize)]
struct ServiceResource {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@type")]
    kind: String,
}

/// Where a feed accepts packages
#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    /// HTTP push endpoint
    Http(String),
    /// Local folder feed
    Directory(std::path::PathBuf),
}

/// Publishes packages with one push per package and no retries
pub(crate) struct FeedPublisher {
    runtime: Runtime,
    client: reqwest::Client,
    source: String,
    api_key: String,
    endpoint: Option<Endpoint>,
}

impl FeedPublisher {
    pub(crate) fn new(target: &PublishTarget) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start the async runtime")?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("refpack/", env!("CARGO_PKG_VERSION")))
            .timeout(PUSH_TIMEOUT)
            .build()
            .context("Failed to build the HTTP client")?;
        Ok(Self {
            runtime,
            client,
            source: target.source.trim().to_string(),
            api_key: target.api_key.clone(),
            endpoint: None,
        })
    }

    async fn resolve(&self) -> std::result::Result<Endpoint, String> {
        let source = self.source.as_str();
        if !source.starts_with("http://") && !source.starts_with("https://") {
            return Ok(Endpoint::Directory(source.into()));
        }
        if !source.ends_with(".json") {
            return Ok(Endpoint::Http(format!(
                "{}/api/v2/package",
                source.trim_end_matches('/')
            )));
        }

        let index: ServiceIndex = self
            .client
            .get(source)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| format!("service index unavailable: {e}"))?
            .json()
            .await
            .map_err(|e| format!("service index unreadable: {e}"))?;
        index
            .resources
            .into_iter()
            .find(|r| r.kind == PUBLISH_RESOURCE)
            .map(|r| Endpoint::Http(r.id))
            .ok_or_else(|| format!("service index has no {PUBLISH_RESOURCE} resource"))
    }

    async fn push(&self, url: &str, package: &Path) -> std::result::Result<(), String> {
        let bytes = fs::read(package).map_err(|e| format!("cannot read package: {e}"))?;
        let name = package
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let form = Form::new().part("package", Part::bytes(bytes).file_name(name));

        let response = self
            .client
            .put(url)
            .header("X-NuGet-ApiKey", &self.api_key)
            .header("X-NuGet-Protocol-Version", "4.1.0")
            .multipart(form)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;
        let status = response.status();
        if status.is_success() {
            debug!("feed answered {}", status);
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(format!("feed answered {status}: {}", body.trim()))
        }
    }

    fn endpoint(&mut self) -> std::result::Result<Endpoint, String> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(endpoint.clone());
        }
        let endpoint = self.runtime.block_on(self.resolve())?;
        debug!("publishing endpoint for {} is {:?}", self.source, endpoint);
        self.endpoint = Some(endpoint.clone());
        Ok(endpoint)
    }
}

impl Publisher for FeedPublisher {
    fn destination(&self) -> &str {
        &self.source
    }

    fn publish(&mut self, package: &Path) -> refpack_core::Result<()> {
        let source = self.source.clone();
        let fail = |reason: String| Error::publish(package, source.as_str(), reason);
        match self.endpoint().map_err(fail)? {
            Endpoint::Http(url) => self.runtime.block_on(self.push(&url, package)).map_err(fail),
            Endpoint::Directory(dir) => {
                let file_name = package.file_name().unwrap_or_default();
                fs::create_dir_all(&dir)
                    .and_then(|()| fs::copy(package, dir.join(file_name)))
                    .map(|_| ())
                    .map_err(|e| fail(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn publisher(source: &str) -> FeedPublisher {
        FeedPublisher::new(&PublishTarget {
            api_key: "key".into(),
            publish: true,
            source: source.into(),
        })
        .unwrap()
    }

    #[test]
    fn test_v2_endpoint() {
        let mut publisher = publisher("https://feed.example/nuget/");
        assert_eq!(
            publisher.endpoint().unwrap(),
            Endpoint::Http("https://feed.example/nuget/api/v2/package".into())
        );
    }

    #[test]
    fn test_service_index_parsing() {
        let index: ServiceIndex = serde_json::from_str(
            r#"{
                "version": "3.0.0",
                "resources": [
                    { "@id": "https://feed.example/query", "@type": "SearchQueryService" },
                    { "@id": "https://feed.example/api/v2/package", "@type": "PackagePublish/2.0.0" }
                ]
            }"#,
        )
        .unwrap();
        let publish = index
            .resources
            .iter()
            .find(|r| r.kind == PUBLISH_RESOURCE)
            .unwrap();
        assert_eq!(publish.id, "https://feed.example/api/v2/package");
    }

    #[test]
    fn test_directory_feed() {
        let dir = TempDir::new().unwrap();
        let package = dir.path().join("Lib.nupkg");
        fs::write(&package, b"zip").unwrap();
        let feed = dir.path().join("feed");

        let mut publisher = publisher(feed.to_str().unwrap());
        publisher.publish(&package).unwrap();
        assert_eq!(fs::read(feed.join("Lib.nupkg")).unwrap(), b"zip");
    }
}
