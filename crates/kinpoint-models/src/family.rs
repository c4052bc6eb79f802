use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role a user holds inside a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FamilyRole {
    Head,
    Member,
    Child,
}

impl FamilyRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::Member => "member",
            Self::Child => "child",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "head" => Some(Self::Head),
            "member" => Some(Self::Member),
            "child" => Some(Self::Child),
            _ => None,
        }
    }
}

/// One member of a family as cached under `family:<fid>:members`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyMember {
    pub user_id: String,
    pub role: FamilyRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<DateTime<Utc>>,
}

/// Circular geofence attached to a family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geofence {
    pub id: String,
    pub family_id: String,
    pub name: String,
    pub center_lat: f64,
    pub center_lon: f64,
    pub radius_m: f64,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trip() {
        for role in [FamilyRole::Head, FamilyRole::Member, FamilyRole::Child] {
            assert_eq!(FamilyRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(FamilyRole::parse("owner"), None);
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&FamilyRole::Child).unwrap(),
            "\"child\""
        );
    }
}
