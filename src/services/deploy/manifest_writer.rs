//! Manifest 提交
//!
//! 同一文件、同一分支的服务合并为一次提交

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::env::constants::MANIFEST_COMMIT_ATTEMPTS;
use crate::domain::deploy::ManifestCommit;
use crate::error::DeployError;
use crate::infra::source_control::SourceControlApi;
use crate::services::manifest;

/// manifest 文件位置
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManifestFile {
    pub repo_id: String,
    pub file_path: String,
    pub branch: String,
}

/// 需要写入的一项
#[derive(Clone, Debug)]
pub struct ManifestEntry {
    /// manifest 中的服务 key
    pub key: String,
    pub tag: String,
}

/// 单个文件的写入结果
#[derive(Clone, Debug)]
pub enum FileUpdate {
    Committed(ManifestCommit),
    /// 文件中所有服务已经是目标 tag
    Unchanged,
}

pub struct ManifestWriter {
    source_control: Arc<dyn SourceControlApi>,
}

impl ManifestWriter {
    pub fn new(source_control: Arc<dyn SourceControlApi>) -> Self {
        Self { source_control }
    }

    /// 修改并提交一个文件
    ///
    /// 任何一项校验失败都会放弃整个文件的提交。提交带上读取时的 `last_commit_id`，
    /// 文件在此期间被其他部署修改时重新读取、重新修改后再提交。
    pub async fn update_file(&self, file: &ManifestFile, entries: &[ManifestEntry]) -> Result<FileUpdate, DeployError> {
        let mut attempt = 1;
        loop {
            let current = self
                .source_control
                .get_file(&file.repo_id, &file.file_path, &file.branch)
                .await?;

            let Some((content, message)) = patch_entries(file, &current.content, entries)? else {
                info!(repo = %file.repo_id, path = %file.file_path, "Manifest already up to date");
                return Ok(FileUpdate::Unchanged);
            };

            match self
                .source_control
                .commit_file(
                    &file.repo_id,
                    &file.branch,
                    &file.file_path,
                    &content,
                    &message,
                    &current.last_commit_id,
                )
                .await
            {
                Ok(commit) => {
                    return Ok(FileUpdate::Committed(ManifestCommit {
                        commit_id: commit.id,
                        branch: file.branch.clone(),
                        file_path: file.file_path.clone(),
                    }))
                }
                Err(e) if e.is_conflict() && attempt < MANIFEST_COMMIT_ATTEMPTS => {
                    warn!(
                        repo = %file.repo_id,
                        path = %file.file_path,
                        attempt,
                        "Manifest changed concurrently, re-reading"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// 按顺序处理同一仓库的多个文件，避免并发写同一仓库
    pub async fn update_repo(
        &self,
        files: Vec<(ManifestFile, Vec<ManifestEntry>)>,
    ) -> Vec<(ManifestFile, Result<FileUpdate, DeployError>)> {
        let mut results = Vec::with_capacity(files.len());
        for (file, entries) in files {
            let result = self.update_file(&file, &entries).await;
            if let Err(ref e) = result {
                warn!(repo = %file.repo_id, path = %file.file_path, error = %e, "Manifest update failed");
            }
            results.push((file, result));
        }
        results
    }

    /// 在 manifest 仓库上创建发布 tag
    pub async fn create_release_tag(&self, repo_id: &str, tag: &str, target: &str) -> Result<(), DeployError> {
        let message = format!("Release {}", tag);
        self.source_control
            .create_tag(repo_id, tag, target, &message)
            .await?;
        Ok(())
    }
}

/// 把所有项写进 `content`，全部已是目标 tag 时返回 `None`
fn patch_entries(
    file: &ManifestFile,
    content: &str,
    entries: &[ManifestEntry],
) -> Result<Option<(String, String)>, DeployError> {
    let mut content = content.to_string();
    let mut changed = Vec::new();
    for entry in entries {
        if !manifest::validate_service_exists(&content, &entry.key) {
            return Err(DeployError::ManifestValidation(format!(
                "service '{}' not found in {}",
                entry.key, file.file_path
            )));
        }
        if manifest::extract_tag(&content, &entry.key).as_deref() == Some(entry.tag.as_str()) {
            continue;
        }

        content = manifest::patch_tag(&content, &entry.key, &entry.tag);
        if manifest::extract_tag(&content, &entry.key).as_deref() != Some(entry.tag.as_str()) {
            return Err(DeployError::ManifestValidation(format!(
                "service '{}' in {} has no image line",
                entry.key, file.file_path
            )));
        }
        changed.push(entry);
    }

    if changed.is_empty() {
        return Ok(None);
    }
    Ok(Some((manifest::clean(&content)?, commit_message(&changed))))
}

/// e.g. "deploy: api 1.3.0, worker 1.3.0"
fn commit_message(entries: &[&ManifestEntry]) -> String {
    let parts: Vec<String> = entries
        .iter()
        .map(|e| format!("{} {}", e.key, e.tag))
        .collect();
    format!("deploy: {}", parts.join(", "))
}
