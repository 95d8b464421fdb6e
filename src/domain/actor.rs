use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Finance,
    Staff,
}

/// Who performed an operation. Automated work (webhooks, the sweeper) runs as
/// `Actor::System` so audit records never carry a hardcoded user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Actor {
    System,
    Staff { id: String, role: Role },
}

impl Actor {
    pub fn staff(id: impl Into<String>, role: Role) -> Self {
        Actor::Staff {
            id: id.into(),
            role,
        }
    }

    /// Privileged actors may confirm payments and reconcile bank statements.
    pub fn is_privileged(&self) -> bool {
        match self {
            Actor::System => true,
            Actor::Staff { role, .. } => matches!(role, Role::Admin | Role::Finance),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Actor::System => "system",
            Actor::Staff { id, .. } => id,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}
