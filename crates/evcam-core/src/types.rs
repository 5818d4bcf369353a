use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role carried in a viewer's claims bundle.
///
/// Unrecognised role strings degrade to `Viewer`, the least-privileged role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Uploader,
    #[default]
    #[serde(other)]
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Uploader => "uploader",
            Role::Viewer => "viewer",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verified identity of the caller, produced from a signed claims bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub role: Role,
    pub assigned_cameras: Vec<String>,
    pub expiry: DateTime<Utc>,
}

/// Outcome of a camera-level authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow,
    Forbidden,
}

impl Identity {
    /// Admins see every camera; everyone else only their assigned cameras.
    /// An object without a camera id is visible to admins only.
    pub fn camera_access(&self, camera_id: Option<&str>) -> Access {
        if self.role == Role::Admin {
            return Access::Allow;
        }
        match camera_id {
            Some(cam) if self.assigned_cameras.iter().any(|c| c == cam) => Access::Allow,
            _ => Access::Forbidden,
        }
    }

    /// Only uploaders and admins may append plate numbers to stored objects.
    pub fn may_update_metadata(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Uploader)
    }
}

/// Metadata persisted alongside every stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectMetadata {
    pub camera_id: Option<String>,
    pub plate_numbers: Vec<String>,
    pub is_encrypted: bool,
    pub container_format: Option<String>,
}

impl ObjectMetadata {
    /// Pure authorization decision for (object metadata, identity).
    pub fn authorize(&self, identity: &Identity) -> Access {
        identity.camera_access(self.camera_id.as_deref())
    }
}

/// One row of a search result, as returned to viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub video_id: String,
    pub filename: String,
    pub camera_id: Option<String>,
    /// Upload time rendered in the configured display offset (`%Y-%m-%d %H:%M:%S`)
    pub upload_date_ist: String,
    pub plates_found: Vec<String>,
}
