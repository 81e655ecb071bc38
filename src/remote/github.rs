//! GitHub REST implementation of the remote repository capability
//!
//! Talks to the v3 API with a bearer credential supplied at construction.
//! Commit history is paginated and the walk stops as soon as the recorded
//! cursor is seen; file content moves through the contents API in base64.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{with_retry, RemoteError, RemoteFactory, RemoteRepository, RetryPolicy};
use crate::data::{CommitRef, RemoteFile, RepositoryTarget};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const COMMITS_PER_PAGE: usize = 100;
/// Upper bound on pages walked per fetch; beyond this the cursor is treated
/// as lost and the collected window is returned for dedup to absorb.
const MAX_COMMIT_PAGES: usize = 10;

#[derive(Deserialize)]
struct CommitListItem {
    sha: String,
    commit: CommitBody,
}

#[derive(Deserialize)]
struct CommitBody {
    message: String,
}

#[derive(Deserialize)]
struct CommitDetail {
    sha: String,
    commit: CommitBody,
    #[serde(default)]
    files: Vec<CommitFile>,
}

#[derive(Deserialize)]
struct CommitFile {
    filename: String,
    status: String,
}

#[derive(Deserialize)]
struct ContentsEntry {
    name: String,
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct FileContents {
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
}

#[derive(Deserialize)]
struct PutContentsResponse {
    commit: CommitSha,
}

#[derive(Deserialize)]
struct CommitSha {
    sha: String,
}

/// One remote GitHub repository, scoped to a target's branch.
pub struct GithubRemote {
    client: Client,
    api_base: String,
    token: String,
    target: RepositoryTarget,
    retry: RetryPolicy,
}

impl GithubRemote {
    pub fn new(
        client: Client,
        api_base: impl Into<String>,
        token: impl Into<String>,
        target: RepositoryTarget,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            token: token.into(),
            target,
            retry,
        }
    }

    fn repo_url(&self, tail: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_base, self.target.key.owner, self.target.key.name, tail
        )
    }

    /// Issue one GET, mapping the response onto the error taxonomy.
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, RemoteError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_error_response(status, response.headers()));
        }
        response
            .json()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))
    }

    /// One page of the commit listing, newest first.
    async fn commit_page(&self, page: usize) -> Result<Vec<CommitListItem>, RemoteError> {
        self.get_json(
            &self.repo_url("commits"),
            &[
                ("sha", self.target.key.branch.clone()),
                ("per_page", COMMITS_PER_PAGE.to_string()),
                ("page", page.to_string()),
            ],
        )
        .await
    }

    /// Commit detail, including the files it touched.
    async fn commit_detail(&self, sha: &str) -> Result<CommitDetail, RemoteError> {
        self.get_json(&self.repo_url(&format!("commits/{sha}")), &[])
            .await
    }

    fn is_message_file(&self, path: &str) -> bool {
        let prefix = format!("{}/", self.target.message_path.trim_matches('/'));
        path.starts_with(&prefix) && path.ends_with(".json")
    }
}

#[async_trait::async_trait]
impl RemoteRepository for GithubRemote {
    async fn head(&self) -> Result<Option<CommitRef>, RemoteError> {
        let result = with_retry(&self.retry, "head", || async {
            self.get_json::<Vec<CommitListItem>>(
                &self.repo_url("commits"),
                &[
                    ("sha", self.target.key.branch.clone()),
                    ("per_page", "1".to_string()),
                ],
            )
            .await
        })
        .await;

        match result {
            Ok(items) => Ok(items.into_iter().next().map(|item| CommitRef {
                sha: item.sha,
                message: item.commit.message,
                paths: Vec::new(),
            })),
            // GitHub answers 409 for a repository with no commits yet
            Err(RemoteError::Conflict(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn commits_since(&self, cursor: &str) -> Result<Vec<CommitRef>, RemoteError> {
        let mut newer: Vec<CommitListItem> = Vec::new();
        let mut cursor_seen = false;

        'pages: for page in 1..=MAX_COMMIT_PAGES {
            let items = with_retry(&self.retry, "commits_since", || self.commit_page(page)).await?;
            let last_page = items.len() < COMMITS_PER_PAGE;
            for item in items {
                if item.sha == cursor {
                    cursor_seen = true;
                    break 'pages;
                }
                newer.push(item);
            }
            if last_page {
                break;
            }
        }

        if !cursor_seen && !newer.is_empty() {
            tracing::warn!(
                target = %self.target.key,
                cursor,
                window = newer.len(),
                "Cursor not found in commit history; replaying collected window"
            );
        }

        // Oldest first, so per-target processing follows branch history
        newer.reverse();

        let mut commits = Vec::with_capacity(newer.len());
        for item in newer {
            let detail =
                with_retry(&self.retry, "commit_detail", || self.commit_detail(&item.sha)).await?;
            let paths = detail
                .files
                .into_iter()
                .filter(|f| matches!(f.status.as_str(), "added" | "modified"))
                .filter(|f| self.is_message_file(&f.filename))
                .map(|f| f.filename)
                .collect();
            commits.push(CommitRef {
                sha: detail.sha,
                message: detail.commit.message,
                paths,
            });
        }
        Ok(commits)
    }

    async fn list_files(&self, dir: &str) -> Result<Vec<RemoteFile>, RemoteError> {
        let url = self.repo_url(&format!("contents/{}", dir.trim_matches('/')));
        let entries = with_retry(&self.retry, "list_files", || async {
            self.get_json::<Vec<ContentsEntry>>(
                &url,
                &[("ref", self.target.key.branch.clone())],
            )
            .await
        })
        .await?;

        Ok(entries
            .into_iter()
            .filter(|entry| entry.kind == "file")
            .map(|entry| RemoteFile {
                path: entry.path,
                name: entry.name,
            })
            .collect())
    }

    async fn read_file(
        &self,
        reference: Option<&str>,
        path: &str,
    ) -> Result<Vec<u8>, RemoteError> {
        let url = self.repo_url(&format!("contents/{}", path.trim_start_matches('/')));
        let reference = reference
            .map(str::to_string)
            .unwrap_or_else(|| self.target.key.branch.clone());

        let contents = with_retry(&self.retry, "read_file", || async {
            self.get_json::<FileContents>(&url, &[("ref", reference.clone())])
                .await
        })
        .await?;

        if contents.encoding != "base64" {
            return Err(RemoteError::Network(format!(
                "unexpected contents encoding: {}",
                contents.encoding
            )));
        }
        decode_base64_content(&contents.content)
            .ok_or_else(|| RemoteError::Network(format!("undecodable contents for {path}")))
    }

    async fn commit_file(
        &self,
        path: &str,
        content: &[u8],
        message: &str,
    ) -> Result<CommitRef, RemoteError> {
        let url = self.repo_url(&format!("contents/{}", path.trim_start_matches('/')));
        let body = serde_json::json!({
            "message": message,
            "content": BASE64.encode(content),
            "branch": self.target.key.branch,
        });

        let response = with_retry(&self.retry, "commit_file", || async {
            let response = self
                .client
                .put(&url)
                .json(&body)
                .bearer_auth(&self.token)
                .header("Accept", "application/vnd.github.v3+json")
                .send()
                .await
                .map_err(|e| RemoteError::Network(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(map_error_response(status, response.headers()));
            }
            response
                .json::<PutContentsResponse>()
                .await
                .map_err(|e| RemoteError::Network(e.to_string()))
        })
        .await?;

        Ok(CommitRef {
            sha: response.commit.sha,
            message: message.to_string(),
            paths: vec![path.to_string()],
        })
    }
}

/// Map an error response onto the taxonomy the coordinators dispatch on.
fn map_error_response(status: StatusCode, headers: &HeaderMap) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED => RemoteError::Auth("credential rejected (401)".into()),
        StatusCode::FORBIDDEN => {
            // GitHub reports primary rate limiting as 403 with the quota headers
            if rate_limit_exhausted(headers) {
                RemoteError::RateLimited {
                    retry_after: retry_after_hint(headers),
                }
            } else {
                RemoteError::Auth("access forbidden (403)".into())
            }
        }
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited {
            retry_after: retry_after_hint(headers),
        },
        StatusCode::NOT_FOUND => RemoteError::NotFound("resource not found (404)".into()),
        // 422 is GitHub's answer when the file already exists or the branch moved
        StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            RemoteError::Conflict(format!("remote rejected write ({})", status.as_u16()))
        }
        other => RemoteError::Network(format!("unexpected status {}", other.as_u16())),
    }
}

fn rate_limit_exhausted(headers: &HeaderMap) -> bool {
    headers.contains_key(RETRY_AFTER)
        || headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "0")
            .unwrap_or(false)
}

fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// The contents API wraps base64 at 60 columns; strip whitespace first.
fn decode_base64_content(content: &str) -> Option<Vec<u8>> {
    let compact: String = content.split_whitespace().collect();
    BASE64.decode(compact).ok()
}

/// Creates [`GithubRemote`] clients sharing one HTTP client and credential.
pub struct GithubRemoteFactory {
    client: Client,
    api_base: String,
    token: String,
    retry: RetryPolicy,
}

impl GithubRemoteFactory {
    pub fn new(
        token: impl Into<String>,
        api_base: Option<String>,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .user_agent(concat!("repochat/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        Ok(Self {
            client,
            api_base: api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            token: token.into(),
            retry,
        })
    }
}

impl RemoteFactory for GithubRemoteFactory {
    fn remote_for(&self, target: &RepositoryTarget) -> Arc<dyn RemoteRepository> {
        Arc::new(GithubRemote::new(
            self.client.clone(),
            self.api_base.clone(),
            self.token.clone(),
            target.clone(),
            self.retry,
        ))
    }
}
