//! Camera catalogs fetched from the backend.
//!
//! A catalog is a read-only snapshot; refetching replaces it wholesale.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::detection::Domain;
use crate::error::Result;

/// Metadata for one camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraInfo {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Whether the camera may be used.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Camera watches a restricted zone.
    #[serde(default)]
    pub is_restricted: bool,
    /// Camera watches a smoking zone.
    #[serde(default)]
    pub is_smoking_zone: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ModelCamerasResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    cameras: BTreeMap<String, CameraInfo>,
    #[serde(default)]
    message: Option<String>,
}

/// Cameras known to the backend, keyed by index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CameraCatalog {
    cameras: BTreeMap<u32, CameraInfo>,
}

impl CameraCatalog {
    /// Build a catalog from the `/api/rtsp/cameras` body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not a JSON object of camera entries.
    pub fn from_rtsp_json(body: &str) -> Result<Self> {
        let raw: BTreeMap<String, CameraInfo> = serde_json::from_str(body)?;
        Ok(Self::from_raw(raw))
    }

    /// Build a catalog from the `/api/model-cameras/{model}` body.
    ///
    /// A response with `ok: false` yields an empty catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON of the expected shape.
    pub fn from_model_json(body: &str) -> Result<Self> {
        let response: ModelCamerasResponse = serde_json::from_str(body)?;
        if !response.ok {
            warn!(
                message = response.message.as_deref().unwrap_or("none"),
                "Backend reported no model cameras"
            );
            return Ok(Self::default());
        }
        Ok(Self::from_raw(response.cameras))
    }

    fn from_raw(raw: BTreeMap<String, CameraInfo>) -> Self {
        let mut cameras = BTreeMap::new();
        for (key, mut info) in raw {
            let Ok(id) = key.trim().parse::<u32>() else {
                warn!(key = %key, "Ignoring camera with non-numeric id");
                continue;
            };
            if info.name.is_empty() {
                info.name = format!("Camera {id}");
            }
            cameras.insert(id, info);
        }
        Self { cameras }
    }

    /// Look up a camera.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&CameraInfo> {
        self.cameras.get(&id)
    }

    /// Iterate cameras in index order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &CameraInfo)> {
        self.cameras.iter().map(|(id, info)| (*id, info))
    }

    /// Indices of enabled cameras, ascending.
    #[must_use]
    pub fn enabled_ids(&self) -> Vec<u32> {
        self.iter()
            .filter(|(_, info)| info.enabled)
            .map(|(id, _)| id)
            .collect()
    }

    /// The camera a poller for `domain` should start on.
    ///
    /// Restricted and smoking pollers prefer cameras flagged for their zone;
    /// everything falls back to the first enabled camera. `None` means no
    /// camera is configured.
    #[must_use]
    pub fn default_for(&self, domain: Domain) -> Option<u32> {
        let flagged = self.iter().find(|(_, info)| {
            info.enabled
                && match domain {
                    Domain::Restricted => info.is_restricted,
                    Domain::Smoking => info.is_smoking_zone,
                    Domain::Unauthorized | Domain::Ppe => false,
                }
        });
        flagged
            .map(|(id, _)| id)
            .or_else(|| self.enabled_ids().first().copied())
    }

    /// Number of cameras.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RTSP: &str = r#"{
        "0": {"name": "Lobby", "enabled": true},
        "1": {"name": "Dock", "enabled": false},
        "2": {"enabled": true}
    }"#;

    const MODEL: &str = r#"{
        "ok": true,
        "cameras": {
            "0": {"name": "Lobby", "enabled": true},
            "3": {"name": "Server room", "enabled": true, "is_restricted": true},
            "4": {"name": "Yard", "enabled": false, "is_smoking_zone": true},
            "5": {"name": "Roof", "enabled": true, "is_smoking_zone": true}
        }
    }"#;

    #[test]
    fn test_from_rtsp_json() {
        let catalog = CameraCatalog::from_rtsp_json(RTSP).unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.get(0).unwrap().name, "Lobby");
        assert!(!catalog.get(1).unwrap().enabled);
        assert_eq!(catalog.get(2).unwrap().name, "Camera 2");
        assert_eq!(catalog.enabled_ids(), vec![0, 2]);
    }

    #[test]
    fn test_from_model_json_flags() {
        let catalog = CameraCatalog::from_model_json(MODEL).unwrap();
        assert!(catalog.get(3).unwrap().is_restricted);
        assert!(catalog.get(5).unwrap().is_smoking_zone);
        assert!(!catalog.get(0).unwrap().is_restricted);
    }

    #[test]
    fn test_default_for_domain() {
        let catalog = CameraCatalog::from_model_json(MODEL).unwrap();
        assert_eq!(catalog.default_for(Domain::Restricted), Some(3));
        // camera 4 is a smoking zone but disabled
        assert_eq!(catalog.default_for(Domain::Smoking), Some(5));
        assert_eq!(catalog.default_for(Domain::Ppe), Some(0));
    }

    #[test]
    fn test_default_for_empty_catalog() {
        let catalog = CameraCatalog::default();
        assert!(catalog.is_empty());
        assert_eq!(catalog.default_for(Domain::Unauthorized), None);
    }

    #[test]
    fn test_model_not_ok_is_empty() {
        let catalog =
            CameraCatalog::from_model_json(r#"{"ok": false, "message": "unknown model"}"#).unwrap();
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_non_numeric_ids_skipped() {
        let catalog =
            CameraCatalog::from_rtsp_json(r#"{"lobby": {"name": "x"}, "7": {"name": "y"}}"#)
                .unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get(7).is_some());
    }

    #[test]
    fn test_invalid_json() {
        assert!(CameraCatalog::from_rtsp_json("[1, 2]").is_err());
    }

    #[test]
    fn test_refetch_replaces() {
        let mut catalog = CameraCatalog::from_model_json(MODEL).unwrap();
        assert!(catalog.get(5).is_some());
        catalog = CameraCatalog::from_rtsp_json(RTSP).unwrap();
        assert!(catalog.get(5).is_none());
    }
}
