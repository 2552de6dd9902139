//! Station directory backed by a JSON file

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::authorizer::{IdTagEntry, StaticAuthorizer};
use super::{ExternalError, StationDirectory, StationInfo};
use crate::ocpp::session::ChargePointIdentity;

/// On-disk layout of the stations file
///
/// ```json
/// {
///   "stations": [
///     {"identity": "CP-1", "vendor": "Acme", "model": "X1", "connectors": 2,
///      "ratePerKwh": 0.35, "authKey": "secret"}
///   ],
///   "idTags": [{"idTag": "TAG-1"}]
/// }
/// ```
///
/// Without `idTags` every id tag is accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationsFile {
    #[serde(default)]
    pub stations: Vec<StationInfo>,
    #[serde(default)]
    pub id_tags: Option<Vec<IdTagEntry>>,
}

impl StationsFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ExternalError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;
        let file: StationsFile = serde_json::from_str(&data)?;
        info!(
            "Loaded {} stations from {:?} (id tags: {})",
            file.stations.len(),
            path,
            file.id_tags
                .as_ref()
                .map_or("accept all".to_string(), |t| t.len().to_string())
        );
        Ok(file)
    }

    pub fn into_parts(self) -> (StaticDirectory, StaticAuthorizer) {
        let directory = StaticDirectory::new(self.stations);
        let authorizer = match self.id_tags {
            Some(tags) => StaticAuthorizer::with_tags(tags),
            None => StaticAuthorizer::accept_all(),
        };
        (directory, authorizer)
    }
}

/// In-memory station directory
#[derive(Debug, Default)]
pub struct StaticDirectory {
    stations: HashMap<ChargePointIdentity, StationInfo>,
}

impl StaticDirectory {
    pub fn new(stations: impl IntoIterator<Item = StationInfo>) -> Self {
        Self {
            stations: stations
                .into_iter()
                .map(|s| (s.identity.clone(), s))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }
}

#[async_trait]
impl StationDirectory for StaticDirectory {
    async fn find_by_identity(
        &self,
        identity: &ChargePointIdentity,
    ) -> Result<Option<StationInfo>, ExternalError> {
        Ok(self.stations.get(identity).cloned())
    }
}
