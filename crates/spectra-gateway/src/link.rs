use std::fmt;

/// Classified form of a group reference the way join operations need it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupLink {
    /// Public `@username` (stored without the `@`).
    Username(String),
    /// Private invite hash from `t.me/joinchat/<hash>` or `t.me/+<hash>`.
    Invite(String),
    /// Raw numeric entity id.
    Id(i64),
}

impl GroupLink {
    /// Classify a target string. Accepts `@name`, invite links with or
    /// without scheme, bare `t.me/<name>` links, and numeric ids; anything
    /// else is treated as a username-ish opaque handle.
    pub fn parse(target: &str) -> GroupLink {
        let t = target.trim();

        if let Ok(id) = t.parse::<i64>() {
            return GroupLink::Id(id);
        }

        if let Some(name) = t.strip_prefix('@') {
            return GroupLink::Username(name.to_string());
        }

        let path = t
            .strip_prefix("https://")
            .or_else(|| t.strip_prefix("http://"))
            .unwrap_or(t);

        if let Some(rest) = path.strip_prefix("t.me/joinchat/") {
            return GroupLink::Invite(trim_link_tail(rest).to_string());
        }
        if let Some(rest) = path.strip_prefix("t.me/+") {
            return GroupLink::Invite(trim_link_tail(rest).to_string());
        }
        if let Some(rest) = path.strip_prefix("t.me/") {
            return GroupLink::Username(trim_link_tail(rest).to_string());
        }

        GroupLink::Username(t.to_string())
    }

    /// Group kind stored on discovered-group rows.
    pub fn kind_str(&self) -> &'static str {
        match self {
            GroupLink::Username(_) => "username",
            GroupLink::Invite(_) => "private",
            GroupLink::Id(_) => "unknown",
        }
    }
}

fn trim_link_tail(s: &str) -> &str {
    s.split(['?', '/']).next().unwrap_or(s)
}

impl fmt::Display for GroupLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupLink::Username(name) => write!(f, "@{name}"),
            GroupLink::Invite(hash) => write!(f, "https://t.me/joinchat/{hash}"),
            GroupLink::Id(id) => write!(f, "{id}"),
        }
    }
}
