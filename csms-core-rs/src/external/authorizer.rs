//! Id tag authorization from a static list

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Authorizer, ExternalError};
use crate::ocpp::types::{AuthorizationStatus, IdTagInfo};

/// One entry of the local id tag list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdTagEntry {
    pub id_tag: String,
    #[serde(default = "accepted")]
    pub status: AuthorizationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id_tag: Option<String>,
}

fn accepted() -> AuthorizationStatus {
    AuthorizationStatus::Accepted
}

/// Authorizer over a fixed id tag list. Without a list every tag is accepted.
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    tags: Option<HashMap<String, IdTagEntry>>,
}

impl StaticAuthorizer {
    pub fn accept_all() -> Self {
        Self { tags: None }
    }

    pub fn with_tags(tags: impl IntoIterator<Item = IdTagEntry>) -> Self {
        Self {
            tags: Some(tags.into_iter().map(|t| (t.id_tag.clone(), t)).collect()),
        }
    }

    fn decide(&self, id_tag: &str, now: DateTime<Utc>) -> IdTagInfo {
        let Some(tags) = &self.tags else {
            return IdTagInfo::accepted();
        };

        match tags.get(id_tag) {
            None => IdTagInfo::with_status(AuthorizationStatus::Invalid),
            Some(entry) => {
                let expired = entry.expiry_date.is_some_and(|expiry| expiry <= now);
                let status = if expired && entry.status == AuthorizationStatus::Accepted {
                    AuthorizationStatus::Expired
                } else {
                    entry.status
                };
                IdTagInfo {
                    status,
                    expiry_date: entry.expiry_date,
                    parent_id_tag: entry.parent_id_tag.clone(),
                }
            }
        }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(&self, id_tag: &str) -> Result<IdTagInfo, ExternalError> {
        let info = self.decide(id_tag, Utc::now());
        debug!(%id_tag, status = ?info.status, "Authorized id tag");
        Ok(info)
    }
}
