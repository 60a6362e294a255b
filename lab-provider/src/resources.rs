//! Resource sizing: ceilings, floors and the overrides sent to a backend.
//!
//! A request is first clamped to the backend's ceilings. The template's own
//! figures are the floor; only values above the floor are sent, so a
//! template is never shrunk.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Resources {
    pub memory_mb: u64,
    pub cpu_cores: u32,
    pub disk_gb: u64,
}

impl Resources {
    pub const fn new(memory_mb: u64, cpu_cores: u32, disk_gb: u64) -> Self {
        Self {
            memory_mb,
            cpu_cores,
            disk_gb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_mb: u64,
    pub max_cpu_cores: u32,
    pub max_disk_gb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 8192,
            max_cpu_cores: 4,
            max_disk_gb: 100,
        }
    }
}

impl ResourceLimits {
    /// Cap every figure at its ceiling. Never fails.
    pub fn clamp(&self, requested: Resources) -> Resources {
        Resources {
            memory_mb: requested.memory_mb.min(self.max_memory_mb),
            cpu_cores: requested.cpu_cores.min(self.max_cpu_cores),
            disk_gb: requested.disk_gb.min(self.max_disk_gb),
        }
    }
}

/// Values to send to the hypervisor. `None` means "keep the template's".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceOverrides {
    pub memory_mb: Option<u64>,
    pub cpu_cores: Option<u32>,
    /// Absolute target disk size.
    pub disk_gb: Option<u64>,
    /// Growth relative to the template disk, for backends that resize by delta.
    pub disk_grow_gb: Option<u64>,
}

impl ResourceOverrides {
    pub fn is_empty(&self) -> bool {
        self.memory_mb.is_none() && self.cpu_cores.is_none() && self.disk_gb.is_none()
    }

    /// What the machine ends up with once the overrides are applied.
    pub fn effective(&self, template: Resources) -> Resources {
        Resources {
            memory_mb: self.memory_mb.unwrap_or(template.memory_mb),
            cpu_cores: self.cpu_cores.unwrap_or(template.cpu_cores),
            disk_gb: self.disk_gb.unwrap_or(template.disk_gb),
        }
    }
}

/// Compare an already clamped request against the template floor.
pub fn plan_overrides(template: Resources, requested: Resources) -> ResourceOverrides {
    let grow_disk = requested.disk_gb > template.disk_gb;

    ResourceOverrides {
        memory_mb: (requested.memory_mb > template.memory_mb).then_some(requested.memory_mb),
        cpu_cores: (requested.cpu_cores > template.cpu_cores).then_some(requested.cpu_cores),
        disk_gb: grow_disk.then_some(requested.disk_gb),
        disk_grow_gb: grow_disk.then(|| requested.disk_gb - template.disk_gb),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: Resources = Resources::new(1024, 2, 20);

    #[test]
    fn test_request_below_template_sends_nothing() {
        let overrides = plan_overrides(TEMPLATE, Resources::new(512, 1, 10));
        assert!(overrides.is_empty());
        assert_eq!(overrides.disk_grow_gb, None);
        assert_eq!(overrides.effective(TEMPLATE), TEMPLATE);
    }

    #[test]
    fn test_only_memory_above_floor_is_overridden() {
        let overrides = plan_overrides(TEMPLATE, Resources::new(4096, 1, 10));
        assert_eq!(overrides.memory_mb, Some(4096));
        assert_eq!(overrides.cpu_cores, None);
        assert_eq!(overrides.disk_gb, None);
    }

    #[test]
    fn test_disk_grows_by_delta() {
        let overrides = plan_overrides(TEMPLATE, Resources::new(1024, 2, 50));
        assert_eq!(overrides.disk_gb, Some(50));
        assert_eq!(overrides.disk_grow_gb, Some(30));
    }

    #[test]
    fn test_equal_values_are_not_overrides() {
        assert!(plan_overrides(TEMPLATE, TEMPLATE).is_empty());
    }

    #[test]
    fn test_clamp_caps_silently() {
        let limits = ResourceLimits {
            max_memory_mb: 4096,
            max_cpu_cores: 4,
            max_disk_gb: 40,
        };
        let clamped = limits.clamp(Resources::new(65536, 32, 500));
        assert_eq!(clamped, Resources::new(4096, 4, 40));

        let small = Resources::new(512, 1, 10);
        assert_eq!(limits.clamp(small), small);
    }

    #[test]
    fn test_unknown_template_disk_grows_full_request() {
        let template = Resources::new(1024, 2, 0);
        let overrides = plan_overrides(template, Resources::new(1024, 2, 20));
        assert_eq!(overrides.disk_grow_gb, Some(20));
    }
}
