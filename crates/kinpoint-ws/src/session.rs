use std::collections::HashSet;

/// Per-socket state. One user may hold several concurrent sessions;
/// presence is the union of their room joins.
pub struct Session {
    pub socket_id: String,
    pub user_id: String,
    /// Families this socket may act on. Resolved at authentication and
    /// updated in place when membership broadcasts target this user.
    pub family_ids: Vec<String>,
    pub joined_rooms: HashSet<String>,
    /// Bearer presented at connect, forwarded to tenant-scoped writes.
    pub bearer: String,
}

impl Session {
    pub fn new(user_id: String, family_ids: Vec<String>, bearer: String) -> Self {
        Self {
            socket_id: uuid::Uuid::new_v4().to_string(),
            user_id,
            family_ids,
            joined_rooms: HashSet::new(),
            bearer,
        }
    }

    pub fn authorized(&self, family_id: &str) -> bool {
        self.family_ids.iter().any(|member| member == family_id)
    }

    pub fn add_family(&mut self, family_id: &str) {
        if !self.authorized(family_id) {
            self.family_ids.push(family_id.to_string());
        }
    }

    pub fn remove_family(&mut self, family_id: &str) {
        self.family_ids.retain(|member| member != family_id);
        self.joined_rooms.remove(family_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_set_updates_in_place() {
        let mut session = Session::new("u1".into(), vec!["fA".into()], "token".into());
        assert!(session.authorized("fA"));
        assert!(!session.authorized("fB"));

        session.add_family("fB");
        session.add_family("fB");
        assert_eq!(session.family_ids.len(), 2);

        session.joined_rooms.insert("fB".into());
        session.remove_family("fB");
        assert!(!session.authorized("fB"));
        assert!(!session.joined_rooms.contains("fB"));
    }

    #[test]
    fn socket_ids_are_unique() {
        let a = Session::new("u1".into(), vec![], "t".into());
        let b = Session::new("u1".into(), vec![], "t".into());
        assert_ne!(a.socket_id, b.socket_id);
    }
}
