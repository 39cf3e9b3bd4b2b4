//! 服务更新
//!
//! 改写服务镜像并带上读取时的版本号提交，版本过期时返回 `VersionConflict`

use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::cluster::{ImageRef, ServiceSpec};
use crate::error::DeployError;
use crate::infra::cluster::ClusterApi;
use crate::services::credential::CredentialCache;

pub struct ServiceUpdater {
    cluster: Arc<dyn ClusterApi>,
    credentials: Option<Arc<CredentialCache>>,
}

impl ServiceUpdater {
    pub fn new(cluster: Arc<dyn ClusterApi>, credentials: Option<Arc<CredentialCache>>) -> Self {
        Self { cluster, credentials }
    }

    /// 把服务切换到新镜像，返回提交的规格
    ///
    /// 新镜像不带 digest，force update 计数加一，保证即使镜像字符串不变也会滚动更新
    pub async fn update_service(&self, service: &ServiceSpec, image: &ImageRef) -> Result<ServiceSpec, DeployError> {
        let mut updated = service.clone();
        updated.image = image.without_digest().to_string();
        updated.force_update = service.force_update.wrapping_add(1);

        // 节点已经拉取过镜像，凭证只用于让调度器校验，获取失败不阻塞更新
        let credential = match &self.credentials {
            Some(cache) => match cache.get_credential().await {
                Ok(credential) => Some(credential),
                Err(e) => {
                    warn!(service = %service.name, error = %e, "Updating service without registry auth");
                    None
                }
            },
            None => None,
        };

        self.cluster
            .update_service(&updated, service.version_index, credential.as_deref())
            .await?;

        info!(
            service = %service.name,
            from = %service.image,
            to = %updated.image,
            version = service.version_index,
            "Service updated"
        );
        Ok(updated)
    }
}
