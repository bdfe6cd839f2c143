//! Client-side defaults applied when groups and items are created.

use crate::variant::VarType;

/// `LOCALE_SYSTEM_DEFAULT`.
pub const LOCALE_SYSTEM_DEFAULT: u32 = 0x0800;
/// `LOCALE_USER_DEFAULT`.
pub const LOCALE_USER_DEFAULT: u32 = 0x0400;

/// Defaults for new groups.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupDefaults {
    pub active: bool,
    /// Requested update rate in milliseconds.
    pub update_rate: u32,
    pub percent_deadband: f32,
    pub locale_id: u32,
    /// Minutes to add to UTC for the group's local time.
    pub time_bias: i32,
}

impl Default for GroupDefaults {
    fn default() -> Self {
        Self {
            active: true,
            update_rate: 1000,
            percent_deadband: 0.0,
            locale_id: LOCALE_USER_DEFAULT,
            time_bias: 0,
        }
    }
}

/// Per-call overrides for a new group; same shape as the defaults.
pub type GroupOptions = GroupDefaults;

/// Defaults for new items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDefaults {
    pub active: bool,
    /// `VT_EMPTY` lets the server pick the canonical type.
    pub requested_type: VarType,
    pub access_path: String,
}

impl Default for ItemDefaults {
    fn default() -> Self {
        Self {
            active: true,
            requested_type: VarType::EMPTY,
            access_path: String::new(),
        }
    }
}

/// Settings shared by a server connection and everything below it.
///
/// # Examples
///
/// ```
/// use opc_da_client::ClientConfig;
///
/// let config = ClientConfig::default()
///     .with_client_name("line-3 historian")
///     .with_intake_capacity(256);
/// assert_eq!(config.intake_capacity, 256);
/// assert_eq!(config.groups.update_rate, 1000);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub groups: GroupDefaults,
    pub items: ItemDefaults,
    /// Slots per event kind between a callback sink and its dispatcher.
    pub intake_capacity: usize,
    /// Default queue size handed to new subscribers.
    pub subscriber_capacity: usize,
    /// Sent to the server through `IOPCCommon::SetClientName` on connect.
    pub client_name: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            groups: GroupDefaults::default(),
            items: ItemDefaults::default(),
            intake_capacity: 100,
            subscriber_capacity: 100,
            client_name: None,
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn with_groups(mut self, groups: GroupDefaults) -> Self {
        self.groups = groups;
        self
    }

    #[must_use]
    pub fn with_items(mut self, items: ItemDefaults) -> Self {
        self.items = items;
        self
    }

    #[must_use]
    pub fn with_intake_capacity(mut self, capacity: usize) -> Self {
        self.intake_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert!(config.groups.active);
        assert_eq!(config.groups.locale_id, LOCALE_USER_DEFAULT);
        assert_eq!(config.items.requested_type, VarType::EMPTY);
        assert_eq!(config.intake_capacity, 100);
        assert!(config.client_name.is_none());
    }

    #[test]
    fn test_capacities_never_zero() {
        let config = ClientConfig::default()
            .with_intake_capacity(0)
            .with_subscriber_capacity(0);
        assert_eq!(config.intake_capacity, 1);
        assert_eq!(config.subscriber_capacity, 1);
    }
}
