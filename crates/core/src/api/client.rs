//! HTTP transport for the build service source API.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Method, RequestBuilder, Response, Url};
use tracing::{debug, info, instrument};

use super::parser::{
    manifest_to_xml, package_meta_xml, parse_commit_reply, parse_directory, parse_package_list,
    parse_status_summary,
};
use super::{CommitFlags, CommitReply, LinkResolution, ManifestEntry, RevisionQuery, Transport};
use crate::config::AppConfig;
use crate::errors::ApiError;
use crate::models::SourceTree;

/// Asynchronous client for the `/source` API.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    username: String,
    password: Option<String>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base", &self.base.as_str())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(
        api_url: &str,
        username: impl Into<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let base = Url::parse(api_url.trim_end_matches('/'))
            .map_err(|e| ApiError::Parse(format!("invalid API URL '{api_url}': {e}")))?;
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("pkgsync/0.1"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        let username = username.into();
        info!(api_url = %base, username = %username, "created ApiClient");
        Ok(Self {
            http,
            base,
            username,
            password,
        })
    }

    /// Build a client from a resolved configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self, ApiError> {
        Self::new(
            &config.api.url,
            config.api.username.clone(),
            config.api.password.clone(),
            Duration::from_secs(config.api.timeout_secs),
        )
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::Parse(format!("API URL '{}' cannot be a base", self.base)))?
            .pop_if_empty()
            .push("source")
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let req = self.http.request(method, url);
        match &self.password {
            Some(pw) => req.basic_auth(&self.username, Some(pw)),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, ApiError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let url = resp.url().to_string();
        let body = resp.text().await.unwrap_or_default();
        if status.as_u16() == 404 {
            return Err(ApiError::NotFound(url));
        }
        Err(ApiError::Status {
            status: status.as_u16(),
            body: parse_status_summary(&body).unwrap_or(body),
        })
    }
}

fn tree_query(query: &RevisionQuery) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if let Some(rev) = &query.rev {
        params.push(("rev", rev.clone()));
    }
    if query.expand {
        params.push(("expand", "1".to_string()));
    }
    if let Some(linkrev) = &query.linkrev {
        params.push(("linkrev", linkrev.clone()));
    }
    if query.last_working {
        params.push(("lastworking", "1".to_string()));
    }
    params
}

impl Transport for ApiClient {
    #[instrument(skip(self))]
    async fn fetch_tree(
        &self,
        project: &str,
        package: &str,
        query: &RevisionQuery,
    ) -> Result<SourceTree, ApiError> {
        let url = self.url(&[project, package])?;
        let resp = self
            .send(self.request(Method::GET, url).query(&tree_query(query)))
            .await?;
        let tree = parse_directory(&resp.text().await?)?;
        debug!(rev = %tree.meta.revision, count = tree.files.len(), "fetched listing");
        Ok(tree)
    }

    #[instrument(skip(self))]
    async fn fetch_file(
        &self,
        project: &str,
        package: &str,
        name: &str,
        revision: &str,
    ) -> Result<Vec<u8>, ApiError> {
        let url = self.url(&[project, package, name])?;
        let resp = self
            .send(self.request(Method::GET, url).query(&[("rev", revision)]))
            .await?;
        Ok(resp.bytes().await?.to_vec())
    }

    #[instrument(skip(self, manifest, message), fields(entries = manifest.len()))]
    async fn propose_commit(
        &self,
        project: &str,
        package: &str,
        manifest: &[ManifestEntry],
        message: &str,
        flags: &CommitFlags,
    ) -> Result<CommitReply, ApiError> {
        let url = self.url(&[project, package])?;
        let mut params = vec![
            ("cmd", "commitfilelist".to_string()),
            ("user", self.username.clone()),
            ("comment", message.to_string()),
        ];
        if flags.keeplink {
            params.push(("keeplink", "1".to_string()));
        }
        if flags.repairlink {
            params.push(("repairlink", "1".to_string()));
        }
        if let Some(linkrev) = &flags.linkrev {
            params.push(("linkrev", linkrev.clone()));
        }
        let resp = self
            .send(
                self.request(Method::POST, url)
                    .query(&params)
                    .body(manifest_to_xml(manifest)),
            )
            .await?;
        parse_commit_reply(&resp.text().await?)
    }

    #[instrument(skip(self, content), fields(bytes = content.len()))]
    async fn upload_file(
        &self,
        project: &str,
        package: &str,
        name: &str,
        content: &[u8],
    ) -> Result<(), ApiError> {
        let url = self.url(&[project, package, name])?;
        self.send(
            self.request(Method::PUT, url)
                .query(&[("rev", "repository")])
                .body(content.to_vec()),
        )
        .await?;
        debug!(name, "uploaded file");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_package(
        &self,
        project: &str,
        package: &str,
        title: &str,
    ) -> Result<(), ApiError> {
        let url = self.url(&[project, package, "_meta"])?;
        self.send(
            self.request(Method::PUT, url)
                .body(package_meta_xml(project, package, title)),
        )
        .await?;
        info!(project, package, "created package");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_package(&self, project: &str, package: &str) -> Result<(), ApiError> {
        let url = self.url(&[project, package])?;
        self.send(self.request(Method::DELETE, url)).await?;
        info!(project, package, "deleted package");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn resolve_link(
        &self,
        project: &str,
        package: &str,
        linkrev: Option<&str>,
    ) -> Result<LinkResolution, ApiError> {
        let query = RevisionQuery::latest()
            .expanded()
            .with_linkrev(linkrev.map(str::to_string));
        match self.fetch_tree(project, package, &query).await {
            Ok(tree) => match tree.meta.linkinfo.and_then(|li| li.error) {
                Some(reason) => Ok(LinkResolution::Broken(reason)),
                None => Ok(LinkResolution::Expanded(tree.meta.tree_hash)),
            },
            // The service answers 400 with the expansion error as summary.
            Err(ApiError::Status { status: 400, body }) => Ok(LinkResolution::Broken(body)),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn list_packages(&self, project: &str) -> Result<Vec<String>, ApiError> {
        let url = self.url(&[project])?;
        let resp = self.send(self.request(Method::GET, url)).await?;
        parse_package_list(&resp.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ApiClient {
        ApiClient::new(
            "https://api.example.org/",
            "alice",
            None,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_url_segments_are_escaped() {
        let url = client().url(&["home:alice", "foo", "a b.patch"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.org/source/home:alice/foo/a%20b.patch"
        );
    }

    #[test]
    fn test_tree_query_params() {
        let q = RevisionQuery::at("5")
            .expanded()
            .with_linkrev(Some("base".into()));
        let params = tree_query(&q);
        assert_eq!(
            params,
            vec![
                ("rev", "5".to_string()),
                ("expand", "1".to_string()),
                ("linkrev", "base".to_string()),
            ]
        );
        assert!(tree_query(&RevisionQuery::latest()).is_empty());
    }

    #[test]
    fn test_invalid_base_url() {
        let err = ApiClient::new("not a url", "a", None, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ApiError::Parse(_)));
    }

    #[test]
    fn test_debug_hides_password() {
        let c = ApiClient::new(
            "https://api.example.org",
            "alice",
            Some("hunter2".into()),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(!format!("{c:?}").contains("hunter2"));
    }
}
