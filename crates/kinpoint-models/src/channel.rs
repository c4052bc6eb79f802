//! Bus channel grammar. Every cross-instance fan-out message travels on one
//! of three channel families; the dispatcher pattern-subscribes to all of
//! them and routes by the parsed segment.

/// Pattern matching every per-family location channel.
pub const PATTERN_FAMILY_LOCATION: &str = "family:*:location";
/// Pattern matching every per-family alerts channel.
pub const PATTERN_FAMILY_ALERTS: &str = "family:*:alerts";
/// Pattern matching every per-user notification channel.
pub const PATTERN_USER_NOTIFICATIONS: &str = "user:*:notifications";

pub fn family_location(family_id: &str) -> String {
    format!("family:{family_id}:location")
}

pub fn family_alerts(family_id: &str) -> String {
    format!("family:{family_id}:alerts")
}

pub fn user_notifications(user_id: &str) -> String {
    format!("user:{user_id}:notifications")
}

/// A parsed bus channel name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusRoute {
    FamilyLocation(String),
    FamilyAlerts(String),
    UserNotifications(String),
}

/// Parse a concrete channel name into its route. Matching is literal on the
/// fixed segments; the middle segment is the family or user ID and must be
/// non-empty.
pub fn parse(channel: &str) -> Option<BusRoute> {
    let mut parts = channel.splitn(3, ':');
    let head = parts.next()?;
    let id = parts.next()?;
    let tail = parts.next()?;
    if id.is_empty() {
        return None;
    }
    match (head, tail) {
        ("family", "location") => Some(BusRoute::FamilyLocation(id.to_string())),
        ("family", "alerts") => Some(BusRoute::FamilyAlerts(id.to_string())),
        ("user", "notifications") => Some(BusRoute::UserNotifications(id.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_and_parser_agree() {
        assert_eq!(
            parse(&family_location("fA")),
            Some(BusRoute::FamilyLocation("fA".into()))
        );
        assert_eq!(
            parse(&family_alerts("fA")),
            Some(BusRoute::FamilyAlerts("fA".into()))
        );
        assert_eq!(
            parse(&user_notifications("u1")),
            Some(BusRoute::UserNotifications("u1".into()))
        );
    }

    #[test]
    fn rejects_foreign_channels() {
        assert_eq!(parse("family::location"), None);
        assert_eq!(parse("family:fA:typing"), None);
        assert_eq!(parse("group:fA:location"), None);
        assert_eq!(parse("family:fA"), None);
    }

    #[test]
    fn colon_in_id_cannot_forge_a_route() {
        // splitn keeps everything after the second colon as the tail, so an
        // ID with a colon cannot masquerade as another route.
        assert_eq!(parse("family:fA:extra:location"), None);
    }
}
