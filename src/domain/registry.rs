//! 镜像仓库凭证

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// 短期仓库凭证
#[derive(Clone, Debug)]
pub struct RegistryCredential {
    pub username: String,
    pub password: String,
    pub registry_host: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct AuthConfig<'a> {
    username: &'a str,
    password: &'a str,
    serveraddress: &'a str,
}

impl RegistryCredential {
    /// 是否仍在有效期内
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// 构造 `X-Registry-Auth` 头的值
    pub fn registry_auth_header(&self) -> String {
        let auth = AuthConfig {
            username: &self.username,
            password: &self.password,
            serveraddress: &self.registry_host,
        };
        let json = serde_json::to_vec(&auth).unwrap_or_default();
        URL_SAFE.encode(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn credential(expires_at: DateTime<Utc>) -> RegistryCredential {
        RegistryCredential {
            username: "AWS".to_string(),
            password: "secret".to_string(),
            registry_host: "registry.example.com".to_string(),
            expires_at,
        }
    }

    #[test]
    fn test_validity_window() {
        let now = Utc::now();
        assert!(credential(now + Duration::minutes(5)).is_valid_at(now));
        assert!(!credential(now).is_valid_at(now));
    }

    #[test]
    fn test_registry_auth_header_roundtrips_json() {
        let header = credential(Utc::now()).registry_auth_header();
        let decoded = URL_SAFE.decode(header).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["username"], "AWS");
        assert_eq!(value["serveraddress"], "registry.example.com");
    }
}
