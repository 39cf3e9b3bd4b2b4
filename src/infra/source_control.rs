//! 源码托管平台 HTTP Client（GitLab 兼容 API）
//!
//! 负责 manifest 文件读取、提交、打 tag 以及流水线查询

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::domain::pipeline::PipelineInfo;

/// 源码托管平台错误
#[derive(Debug, Error)]
pub enum SourceControlError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("source control returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("file '{path}' not found on branch '{branch}'")]
    FileNotFound { path: String, branch: String },

    /// 文件在读取之后被其他提交修改过
    #[error("file '{path}' changed since it was read")]
    StaleFile { path: String },

    #[error("invalid file content: {0}")]
    InvalidContent(String),

    #[error("invalid API url: {0}")]
    InvalidUrl(String),
}

impl SourceControlError {
    /// 是否是乐观并发冲突，重新读取后可以重试
    pub fn is_conflict(&self) -> bool {
        matches!(self, SourceControlError::StaleFile { .. })
    }
}

/// 文件内容及其最后一次提交
#[derive(Clone, Debug)]
pub struct RepoFile {
    pub content: String,
    /// 提交时原样带回，文件在此之后被修改则提交被拒绝
    pub last_commit_id: String,
}

/// 提交结果
#[derive(Clone, Debug, Deserialize)]
pub struct CommitInfo {
    pub id: String,
    #[serde(default)]
    pub web_url: Option<String>,
}

/// 源码托管平台 API
#[async_trait]
pub trait SourceControlApi: Send + Sync {
    /// 读取 `{repo, path, branch}` 的文件内容和最后一次提交
    async fn get_file(&self, repo: &str, path: &str, branch: &str) -> Result<RepoFile, SourceControlError>;

    /// 提交单个文件的新内容
    ///
    /// `last_commit_id` 与分支上的当前值不一致时返回 `StaleFile`
    async fn commit_file(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
        last_commit_id: &str,
    ) -> Result<CommitInfo, SourceControlError>;

    /// 创建 tag
    async fn create_tag(
        &self,
        repo: &str,
        tag_name: &str,
        target: &str,
        message: &str,
    ) -> Result<(), SourceControlError>;

    /// 列出某个提交的流水线
    async fn list_pipelines(&self, repo: &str, sha: &str) -> Result<Vec<PipelineInfo>, SourceControlError>;
}

/// GitLab 客户端
#[derive(Clone)]
pub struct GitLabClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct CommitAction<'a> {
    action: &'static str,
    file_path: &'a str,
    content: &'a str,
    last_commit_id: &'a str,
}

#[derive(Deserialize)]
struct FileResponse {
    content: String,
    #[serde(default)]
    encoding: String,
    last_commit_id: String,
}

#[derive(Serialize)]
struct CommitRequest<'a> {
    branch: &'a str,
    commit_message: &'a str,
    actions: Vec<CommitAction<'a>>,
}

#[derive(Serialize)]
struct TagRequest<'a> {
    tag_name: &'a str,
    #[serde(rename = "ref")]
    target: &'a str,
    message: &'a str,
}

impl GitLabClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    /// 拼接 API 路径，每一段单独转义（项目 ID 和文件路径可能包含 `/`）
    fn endpoint(&self, segments: &[&str]) -> Result<Url, SourceControlError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| SourceControlError::InvalidUrl(format!("{}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| SourceControlError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.header("PRIVATE-TOKEN", token),
            None => builder,
        }
    }
}

/// GitLab 用 400 拒绝基于旧版本的修改
fn is_stale_rejection(status: StatusCode, body: &str) -> bool {
    status == StatusCode::CONFLICT
        || (status == StatusCode::BAD_REQUEST && body.contains("has changed since you started editing"))
}

fn decode_content(file: FileResponse) -> Result<RepoFile, SourceControlError> {
    let content = if file.encoding == "base64" {
        let compact: String = file.content.split_whitespace().collect();
        let raw = STANDARD
            .decode(compact)
            .map_err(|e| SourceControlError::InvalidContent(e.to_string()))?;
        String::from_utf8(raw).map_err(|e| SourceControlError::InvalidContent(e.to_string()))?
    } else {
        file.content
    };
    Ok(RepoFile {
        content,
        last_commit_id: file.last_commit_id,
    })
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, SourceControlError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SourceControlError::Status { status, body })
}

#[async_trait]
impl SourceControlApi for GitLabClient {
    async fn get_file(&self, repo: &str, path: &str, branch: &str) -> Result<RepoFile, SourceControlError> {
        let url = self.endpoint(&["projects", repo, "repository", "files", path])?;
        let resp = self
            .authorized(self.client.get(url))
            .query(&[("ref", branch)])
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SourceControlError::FileNotFound {
                path: path.to_string(),
                branch: branch.to_string(),
            });
        }
        let file: FileResponse = check(resp).await?.json().await?;
        decode_content(file)
    }

    async fn commit_file(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
        last_commit_id: &str,
    ) -> Result<CommitInfo, SourceControlError> {
        let url = self.endpoint(&["projects", repo, "repository", "commits"])?;
        let body = CommitRequest {
            branch,
            commit_message: message,
            actions: vec![CommitAction {
                action: "update",
                file_path: path,
                content,
                last_commit_id,
            }],
        };

        let resp = self.authorized(self.client.post(url)).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if is_stale_rejection(status, &body) {
                return Err(SourceControlError::StaleFile { path: path.to_string() });
            }
            return Err(SourceControlError::Status { status, body });
        }
        let commit: CommitInfo = resp.json().await?;

        info!(repo = %repo, branch = %branch, path = %path, commit = %commit.id, "Manifest committed");
        Ok(commit)
    }

    async fn create_tag(
        &self,
        repo: &str,
        tag_name: &str,
        target: &str,
        message: &str,
    ) -> Result<(), SourceControlError> {
        let url = self.endpoint(&["projects", repo, "repository", "tags"])?;
        let body = TagRequest {
            tag_name,
            target,
            message,
        };
        let resp = self.authorized(self.client.post(url)).json(&body).send().await?;
        check(resp).await?;

        info!(repo = %repo, tag = %tag_name, target = %target, "Tag created");
        Ok(())
    }

    async fn list_pipelines(&self, repo: &str, sha: &str) -> Result<Vec<PipelineInfo>, SourceControlError> {
        let url = self.endpoint(&["projects", repo, "pipelines"])?;
        let resp = self
            .authorized(self.client.get(url))
            .query(&[("sha", sha)])
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }
}
