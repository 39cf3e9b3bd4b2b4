//! 节点镜像同步
//!
//! 在每个就绪节点上并发拉取镜像。每个节点的结果相互独立，
//! 一个节点失败或变慢不会影响其他节点。

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::env::constants::PULL_TIMEOUT_SECS;
use crate::domain::cluster::{ClusterNode, ImageRef, NodeImage};
use crate::domain::deploy::{ImagePullOutcome, SyncReport};
use crate::domain::registry::RegistryCredential;
use crate::infra::cluster::ClusterApi;
use crate::services::credential::CredentialCache;

pub struct NodeImageSynchronizer {
    cluster: Arc<dyn ClusterApi>,
    /// 未配置时匿名拉取
    credentials: Option<Arc<CredentialCache>>,
    pull_timeout: Duration,
}

impl NodeImageSynchronizer {
    pub fn new(cluster: Arc<dyn ClusterApi>, credentials: Option<Arc<CredentialCache>>) -> Self {
        Self {
            cluster,
            credentials,
            pull_timeout: Duration::from_secs(PULL_TIMEOUT_SECS),
        }
    }

    pub fn with_pull_timeout(mut self, pull_timeout: Duration) -> Self {
        self.pull_timeout = pull_timeout;
        self
    }

    /// 在所有就绪节点上拉取镜像
    ///
    /// 非就绪节点直接跳过，不产生结果。凭证获取失败时所有就绪节点都记为失败。
    pub async fn sync_image(&self, nodes: &[ClusterNode], image: &ImageRef) -> SyncReport {
        let ready: Vec<&ClusterNode> = nodes.iter().filter(|n| n.is_ready()).collect();
        let skipped = nodes.len() - ready.len();
        if skipped > 0 {
            debug!(image = %image, skipped = skipped, "Skipping nodes that are not ready");
        }

        let credential = match &self.credentials {
            Some(cache) => match cache.get_credential().await {
                Ok(credential) => Some(credential),
                Err(e) => {
                    error!(image = %image, error = %e, "Cannot pull without registry credential");
                    let message = format!("registry credential unavailable: {}", e);
                    return SyncReport {
                        image: image.to_string(),
                        outcomes: ready
                            .iter()
                            .map(|n| ImagePullOutcome::failed(&n.hostname, message.clone()))
                            .collect(),
                    };
                }
            },
            None => None,
        };

        // 全部拉取完成后再统一检查本地镜像
        let pulls = join_all(
            ready
                .iter()
                .map(|node| self.pull_on(node, image, credential.as_deref())),
        )
        .await;

        let outcomes = join_all(ready.iter().zip(pulls).map(|(node, pulled)| async move {
            match pulled {
                Ok(()) => self.inspect(node, image).await,
                Err(message) => ImagePullOutcome::failed(&node.hostname, message),
            }
        }))
        .await;

        let report = SyncReport {
            image: image.to_string(),
            outcomes,
        };

        if report.is_usable() {
            info!(image = %image, pulled = %report.summary(), "Image synchronized");
        } else {
            error!(image = %image, attempted = report.total(), "Image pull failed on every node");
        }
        report
    }

    async fn pull_on(
        &self,
        node: &ClusterNode,
        image: &ImageRef,
        credential: Option<&RegistryCredential>,
    ) -> Result<(), String> {
        match tokio::time::timeout(self.pull_timeout, self.cluster.pull_image(node, image, credential)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(node = %node.hostname, image = %image, error = %e, "Image pull failed");
                Err(e.to_string())
            }
            Err(_) => {
                warn!(node = %node.hostname, image = %image, "Image pull timed out");
                Err(format!("pull timed out after {}s", self.pull_timeout.as_secs()))
            }
        }
    }

    /// 读取节点本地镜像补全 digest 和 image id，失败时只省略这些信息
    async fn inspect(&self, node: &ClusterNode, image: &ImageRef) -> ImagePullOutcome {
        let mut outcome = ImagePullOutcome::success(&node.hostname);
        match self.cluster.list_node_images(node).await {
            Ok(images) => {
                if let Some(local) = find_local_image(&images, image) {
                    outcome.image_id = Some(local.id.clone());
                    outcome.digest = local_digest(local, image);
                }
            }
            Err(e) => {
                debug!(node = %node.hostname, error = %e, "Cannot inspect local images");
            }
        }
        outcome
    }
}

fn find_local_image<'a>(images: &'a [NodeImage], image: &ImageRef) -> Option<&'a NodeImage> {
    let reference = image.without_digest().to_string();
    images.iter().find(|local| {
        local
            .repo_tags
            .as_ref()
            .is_some_and(|tags| tags.iter().any(|t| *t == reference))
    })
}

fn local_digest(local: &NodeImage, image: &ImageRef) -> Option<String> {
    let prefix = format!("{}@", image.name());
    local
        .repo_digests
        .as_ref()?
        .iter()
        .find_map(|d| d.strip_prefix(&prefix).map(String::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{down_node, ready_node, FakeCluster, FakeRegistry};

    fn image() -> ImageRef {
        ImageRef::parse("registry.example.com/team/api:1.3.0")
    }

    fn local_image() -> NodeImage {
        NodeImage {
            id: "sha256:local".to_string(),
            repo_tags: Some(vec!["registry.example.com/team/api:1.3.0".to_string()]),
            repo_digests: Some(vec!["registry.example.com/team/api@sha256:remote".to_string()]),
        }
    }

    #[tokio::test]
    async fn test_partial_failure_is_usable() {
        let cluster = Arc::new(
            FakeCluster::new(vec![ready_node("n1"), ready_node("n2"), ready_node("n3")]).fail_pull_on("n3"),
        );
        let sync = NodeImageSynchronizer::new(cluster.clone(), None);

        let report = sync
            .sync_image(&cluster.list_nodes().await.unwrap(), &image())
            .await;

        assert_eq!(report.total(), 3);
        assert_eq!(report.succeeded(), 2);
        assert!(report.is_usable());
        assert_eq!(report.summary(), "2/3 nodes");
        let failed = report.outcomes.iter().find(|o| o.node == "n3").unwrap();
        assert!(failed.error.as_deref().unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_all_failed_is_not_usable() {
        let cluster = Arc::new(
            FakeCluster::new(vec![ready_node("n1"), ready_node("n2")])
                .fail_pull_on("n1")
                .fail_pull_on("n2"),
        );
        let sync = NodeImageSynchronizer::new(cluster.clone(), None);

        let report = sync
            .sync_image(&cluster.list_nodes().await.unwrap(), &image())
            .await;
        assert!(!report.is_usable());
        assert_eq!(report.total(), 2);
    }

    #[tokio::test]
    async fn test_skips_nodes_that_are_not_ready() {
        let cluster = Arc::new(FakeCluster::new(vec![ready_node("n1"), down_node("n2")]));
        let sync = NodeImageSynchronizer::new(cluster.clone(), None);

        let report = sync
            .sync_image(&cluster.list_nodes().await.unwrap(), &image())
            .await;

        assert_eq!(report.total(), 1);
        assert_eq!(cluster.pulls(), vec![("n1".to_string(), image().to_string())]);
    }

    #[tokio::test]
    async fn test_digest_recovered_when_inspection_succeeds() {
        let cluster = Arc::new(
            FakeCluster::new(vec![ready_node("n1"), ready_node("n2")]).with_node_images("n1", vec![local_image()]),
        );
        let sync = NodeImageSynchronizer::new(cluster.clone(), None);

        let report = sync
            .sync_image(&cluster.list_nodes().await.unwrap(), &image())
            .await;

        let n1 = report.outcomes.iter().find(|o| o.node == "n1").unwrap();
        assert_eq!(n1.digest.as_deref(), Some("sha256:remote"));
        assert_eq!(n1.image_id.as_deref(), Some("sha256:local"));

        // n2 没有镜像列表，拉取仍然算成功
        let n2 = report.outcomes.iter().find(|o| o.node == "n2").unwrap();
        assert!(n2.is_success());
        assert!(n2.digest.is_none());
    }

    #[tokio::test]
    async fn test_stuck_pull_times_out_per_node() {
        let cluster = Arc::new(FakeCluster::new(vec![ready_node("n1"), ready_node("n2")]).hang_pull_on("n2"));
        let sync = NodeImageSynchronizer::new(cluster.clone(), None).with_pull_timeout(Duration::from_millis(50));

        let report = sync
            .sync_image(&cluster.list_nodes().await.unwrap(), &image())
            .await;

        assert_eq!(report.succeeded(), 1);
        let stuck = report.outcomes.iter().find(|o| o.node == "n2").unwrap();
        assert!(stuck.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_credential_failure_fails_every_ready_node() {
        let cluster = Arc::new(FakeCluster::new(vec![ready_node("n1"), ready_node("n2")]));
        let registry = Arc::new(FakeRegistry::new("AWS:secret", None));
        registry.set_failing(true);
        let credentials = Arc::new(CredentialCache::new(registry));
        let sync = NodeImageSynchronizer::new(cluster.clone(), Some(credentials));

        let report = sync
            .sync_image(&cluster.list_nodes().await.unwrap(), &image())
            .await;

        assert_eq!(report.total(), 2);
        assert!(!report.is_usable());
        assert!(cluster.pulls().is_empty());
    }
}
