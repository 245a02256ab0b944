//! Composite registry keys
//!
//! Every key renders as `{ID:a|b|...}`. Components are escaped so that no two
//! distinct tuples can render to the same string.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The (organization, service, group) triple models are grouped under
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub organization_id: String,
    pub service_id: String,
    pub group_id: String,
}

impl Scope {
    pub fn new(
        organization_id: impl Into<String>,
        service_id: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            service_id: service_id.into(),
            group_id: group_id.into(),
        }
    }

    pub fn model_key(&self, model_id: impl Into<String>) -> ModelKey {
        ModelKey {
            organization_id: self.organization_id.clone(),
            service_id: self.service_id.clone(),
            group_id: self.group_id.clone(),
            model_id: model_id.into(),
        }
    }

    /// Addresses are lower-cased: index lookups match any spelling
    pub fn user_key(&self, user_address: impl Into<String>) -> ModelUserKey {
        ModelUserKey {
            organization_id: self.organization_id.clone(),
            service_id: self.service_id.clone(),
            group_id: self.group_id.clone(),
            user_address: user_address.into().to_ascii_lowercase(),
        }
    }

    pub fn pending_key(&self) -> PendingModelKey {
        PendingModelKey {
            organization_id: self.organization_id.clone(),
            service_id: self.service_id.clone(),
            group_id: self.group_id.clone(),
        }
    }

    pub fn public_key(&self) -> PublicModelKey {
        PublicModelKey {
            organization_id: self.organization_id.clone(),
            service_id: self.service_id.clone(),
            group_id: self.group_id.clone(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_id(f, &[&self.organization_id, &self.service_id, &self.group_id])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub organization_id: String,
    pub service_id: String,
    pub group_id: String,
    pub model_id: String,
}

impl ModelKey {
    pub fn scope(&self) -> Scope {
        Scope::new(&self.organization_id, &self.service_id, &self.group_id)
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_id(
            f,
            &[
                &self.organization_id,
                &self.service_id,
                &self.group_id,
                &self.model_id,
            ],
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelUserKey {
    pub organization_id: String,
    pub service_id: String,
    pub group_id: String,
    pub user_address: String,
}

impl fmt::Display for ModelUserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_id(
            f,
            &[
                &self.organization_id,
                &self.service_id,
                &self.group_id,
                &self.user_address,
            ],
        )
    }
}

/// Key of a scope's pending work queue
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingModelKey {
    pub organization_id: String,
    pub service_id: String,
    pub group_id: String,
}

impl fmt::Display for PendingModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_id(f, &[&self.organization_id, &self.service_id, &self.group_id])
    }
}

/// Key of a scope's public-model index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicModelKey {
    pub organization_id: String,
    pub service_id: String,
    pub group_id: String,
}

impl fmt::Display for PublicModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_id(f, &[&self.organization_id, &self.service_id, &self.group_id])
    }
}

fn write_id(f: &mut fmt::Formatter<'_>, parts: &[&str]) -> fmt::Result {
    f.write_str("{ID:")?;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            f.write_str("|")?;
        }
        for c in part.chars() {
            if matches!(c, '\\' | '|' | '}') {
                f.write_str("\\")?;
            }
            write!(f, "{}", c)?;
        }
    }
    f.write_str("}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_key_format() {
        let key = Scope::new("org1", "svc1", "grp1").model_key("1");
        assert_eq!(key.to_string(), "{ID:org1|svc1|grp1|1}");
        assert_eq!(key.scope(), Scope::new("org1", "svc1", "grp1"));
    }

    #[test]
    fn test_scope_keys_format() {
        let scope = Scope::new("org1", "svc1", "grp1");
        assert_eq!(scope.pending_key().to_string(), "{ID:org1|svc1|grp1}");
        assert_eq!(scope.public_key().to_string(), "{ID:org1|svc1|grp1}");
        assert_eq!(scope.user_key("0xabc").to_string(), "{ID:org1|svc1|grp1|0xabc}");
    }

    #[test]
    fn test_user_key_ignores_address_case() {
        let scope = Scope::new("org1", "svc1", "grp1");
        assert_eq!(scope.user_key("0xABc"), scope.user_key("0xabC"));
        assert_eq!(scope.user_key("0xABC").to_string(), "{ID:org1|svc1|grp1|0xabc}");
    }

    #[test]
    fn test_separator_in_component_does_not_collide() {
        let a = Scope::new("a|b", "c", "d").model_key("e");
        let b = Scope::new("a", "b|c", "d").model_key("e");
        assert_ne!(a.to_string(), b.to_string());
        assert_eq!(a.to_string(), "{ID:a\\|b|c|d|e}");
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let scope = Scope::new("o", "s", "99ybRIg2wAx55mqVsA6sB4S7WxPQHNKqa4BPu/bhj+U=");
        assert_eq!(scope.model_key("m").to_string(), scope.model_key("m").to_string());
    }
}
