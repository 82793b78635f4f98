use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A directory entry from the user listing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct User {
    pub id: i64,
    pub username: String,
    pub nickname: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub avatar: String,
    /// Account status as the backend encodes it: 1 active, 0 disabled.
    pub status: i32,
    #[serde(rename = "createTime")]
    pub create_time: Option<DateTime<Utc>>,
    #[serde(rename = "updateTime")]
    pub update_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub roles: Option<Vec<String>>,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Query parameters for the paginated user listing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(rename = "sortBy", skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    #[serde(rename = "sortOrder", skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<SortOrder>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// One page of the user directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserPage {
    pub records: Vec<User>,
    pub total: u64,
    pub current: u64,
    pub size: u64,
}
