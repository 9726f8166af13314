//! Policy Repository
//!
//! Address settings and security roles keyed by wildcard address pattern.
//! Settings resolve to the record at the single most specific matching
//! pattern. Roles resolve to every role stored at that same pattern; a
//! narrower pattern fully shadows a broader one.

mod pattern;
mod repository;

use std::collections::BTreeMap;

use mq_common::{AddressSettings, SecurityRole, WildcardConfig};
use tracing::info;

use crate::error::ControlError;
use crate::Result;

pub use pattern::{AddressPattern, Segment, Specificity};
pub use repository::HierarchicalRepository;

/// Comma-separated role names granted each capability.
#[derive(Debug, Clone, Default)]
pub struct RoleGrants {
    pub send: String,
    pub consume: String,
    pub create_durable_queue: String,
    pub delete_durable_queue: String,
    pub create_non_durable_queue: String,
    pub delete_non_durable_queue: String,
    pub manage: String,
    pub browse: String,
    pub create_address: String,
    pub delete_address: String,
}

impl RoleGrants {
    /// One role per distinct name, with the capabilities it was listed under.
    pub fn into_roles(self) -> Vec<SecurityRole> {
        let mut roles: BTreeMap<String, SecurityRole> = BTreeMap::new();

        let mut grant = |names: &str, set: fn(&mut SecurityRole)| {
            for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                let role = roles
                    .entry(name.to_string())
                    .or_insert_with(|| SecurityRole::new(name));
                set(role);
            }
        };

        grant(&self.send, |r| r.send = true);
        grant(&self.consume, |r| r.consume = true);
        grant(&self.create_durable_queue, |r| r.create_durable_queue = true);
        grant(&self.delete_durable_queue, |r| r.delete_durable_queue = true);
        grant(&self.create_non_durable_queue, |r| r.create_non_durable_queue = true);
        grant(&self.delete_non_durable_queue, |r| r.delete_non_durable_queue = true);
        grant(&self.manage, |r| r.manage = true);
        grant(&self.browse, |r| r.browse = true);
        grant(&self.create_address, |r| r.create_address = true);
        grant(&self.delete_address, |r| r.delete_address = true);

        roles.into_values().collect()
    }
}

/// Reject settings that could never be honoured.
pub fn validate_settings(settings: &AddressSettings) -> Result<()> {
    if settings.max_size_bytes < -1 {
        return Err(ControlError::invalid(format!(
            "maxSizeBytes must be -1 or positive, got {}",
            settings.max_size_bytes
        )));
    }
    if settings.max_size_bytes != -1 && settings.page_size_bytes > settings.max_size_bytes {
        return Err(ControlError::invalid(format!(
            "pageSizeBytes ({}) must not exceed maxSizeBytes ({})",
            settings.page_size_bytes, settings.max_size_bytes
        )));
    }
    if settings.page_size_bytes <= 0 {
        return Err(ControlError::invalid("pageSizeBytes must be positive"));
    }
    if settings.redelivery_multiplier < 1.0 {
        return Err(ControlError::invalid(format!(
            "redeliveryMultiplier must be at least 1.0, got {}",
            settings.redelivery_multiplier
        )));
    }
    Ok(())
}

/// Lifecycle-scoped owner of the settings and security repositories.
pub struct PolicyRepository {
    settings: HierarchicalRepository<AddressSettings>,
    security: HierarchicalRepository<Vec<SecurityRole>>,
}

impl PolicyRepository {
    pub fn new(
        wildcard: WildcardConfig,
        default_settings: AddressSettings,
        default_roles: Vec<SecurityRole>,
    ) -> Self {
        Self {
            settings: HierarchicalRepository::new(wildcard, default_settings),
            security: HierarchicalRepository::new(wildcard, normalize_roles(default_roles)),
        }
    }

    pub fn wildcard(&self) -> &WildcardConfig {
        self.settings.wildcard()
    }

    pub fn add_address_settings(&self, pattern: &str, settings: AddressSettings) -> Result<()> {
        validate_settings(&settings)?;
        self.settings.add_match(pattern, settings)?;
        info!(pattern = %pattern, "Address settings added");
        Ok(())
    }

    /// Removing an unknown pattern is not an error.
    pub fn remove_address_settings(&self, pattern: &str) -> Result<()> {
        if self.settings.remove_match(pattern)?.is_some() {
            info!(pattern = %pattern, "Address settings removed");
        }
        Ok(())
    }

    pub fn resolve_settings(&self, address: &str) -> AddressSettings {
        self.settings.get_match(address)
    }

    pub fn address_settings_patterns(&self) -> Vec<String> {
        self.settings.patterns()
    }

    /// Replace the roles stored at `pattern`.
    pub fn add_security_settings(&self, pattern: &str, roles: Vec<SecurityRole>) -> Result<()> {
        let roles = normalize_roles(roles);
        let count = roles.len();
        self.security.add_match(pattern, roles)?;
        info!(pattern = %pattern, roles = count, "Security settings added");
        Ok(())
    }

    pub fn remove_security_settings(&self, pattern: &str) -> Result<()> {
        if self.security.remove_match(pattern)?.is_some() {
            info!(pattern = %pattern, "Security settings removed");
        }
        Ok(())
    }

    pub fn resolve_roles(&self, address: &str) -> Vec<SecurityRole> {
        self.security.get_match(address)
    }

    /// Forget cached resolutions for a deleted address.
    pub fn forget_address(&self, address: &str) {
        self.settings.evict(address);
        self.security.evict(address);
    }

    pub fn security_patterns(&self) -> Vec<String> {
        self.security.patterns()
    }

    pub fn address_settings_as_json(&self, address: &str) -> Result<String> {
        Ok(serde_json::to_string(&self.resolve_settings(address))?)
    }

    pub fn roles_as_json(&self, address: &str) -> Result<String> {
        Ok(serde_json::to_string(&self.resolve_roles(address))?)
    }
}

/// Sort by name and keep the last definition of a repeated name.
fn normalize_roles(roles: Vec<SecurityRole>) -> Vec<SecurityRole> {
    let mut by_name: BTreeMap<String, SecurityRole> = BTreeMap::new();
    for role in roles {
        by_name.insert(role.name.clone(), role);
    }
    by_name.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_grants_merge_by_name() {
        let roles = RoleGrants {
            send: "foo".into(),
            consume: "foo, bar".into(),
            browse: "bar".into(),
            ..Default::default()
        }
        .into_roles();

        assert_eq!(roles.len(), 2);
        let bar = &roles[0];
        let foo = &roles[1];
        assert_eq!(bar.name, "bar");
        assert!(bar.consume && bar.browse && !bar.send);
        assert_eq!(foo.name, "foo");
        assert!(foo.send && foo.consume && !foo.browse);
    }

    #[test]
    fn test_settings_validation() {
        let ok = AddressSettings {
            max_size_bytes: 20,
            page_size_bytes: 10,
            ..Default::default()
        };
        assert!(validate_settings(&ok).is_ok());

        let page_too_big = AddressSettings {
            max_size_bytes: 100,
            page_size_bytes: 1000,
            ..Default::default()
        };
        assert!(validate_settings(&page_too_big).is_err());

        let unlimited = AddressSettings {
            max_size_bytes: -1,
            page_size_bytes: 1000,
            ..Default::default()
        };
        assert!(validate_settings(&unlimited).is_ok());

        let below_unlimited = AddressSettings {
            max_size_bytes: -2,
            ..Default::default()
        };
        assert!(validate_settings(&below_unlimited).is_err());
    }
}
