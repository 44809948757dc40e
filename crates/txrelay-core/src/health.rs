//! Health check system for monitoring relay component status.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Component name of the record source.
pub const COMPONENT_SOURCE: &str = "source";
/// Component name of the transactional sink.
pub const COMPONENT_SINK: &str = "sink";
/// Component name of the relay loop.
pub const COMPONENT_RELAY: &str = "relay";

/// Health status of a component.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentStatus {
    /// Component is healthy
    Healthy,
    /// Component is degraded but operational
    Degraded(String),
    /// Component is unhealthy
    Unhealthy(String),
    /// Component status is unknown
    Unknown,
}

impl ComponentStatus {
    /// Lowercase label used in HTTP responses.
    pub fn label(&self) -> &'static str {
        match self {
            ComponentStatus::Healthy => "healthy",
            ComponentStatus::Degraded(_) => "degraded",
            ComponentStatus::Unhealthy(_) => "unhealthy",
            ComponentStatus::Unknown => "unknown",
        }
    }

    /// Reason attached to a degraded or unhealthy status.
    pub fn message(&self) -> Option<&str> {
        match self {
            ComponentStatus::Degraded(msg) | ComponentStatus::Unhealthy(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Overall system health status.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    /// All components healthy
    Healthy,
    /// Some components degraded
    Degraded,
    /// System is unhealthy
    Unhealthy,
}

impl HealthStatus {
    /// Lowercase label used in HTTP responses.
    pub fn label(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Health check manager for tracking component health.
pub struct HealthCheck {
    components: RwLock<HashMap<String, ComponentStatus>>,
    started_at: Instant,
    relay_running: RwLock<bool>,
}

impl HealthCheck {
    /// Create a new health check manager.
    pub fn new() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            started_at: Instant::now(),
            relay_running: RwLock::new(false),
        }
    }

    /// Create a manager with the relay's components registered as unknown.
    pub fn for_relay() -> Self {
        let health = Self::new();
        for name in [COMPONENT_SOURCE, COMPONENT_SINK, COMPONENT_RELAY] {
            health.register_component(name);
        }
        health
    }

    /// Register a component to track.
    pub fn register_component(&self, name: &str) {
        let mut components = self.components.write();
        components.insert(name.to_string(), ComponentStatus::Unknown);
    }

    /// Mark a component as healthy.
    pub fn mark_healthy(&self, name: &str) {
        let mut components = self.components.write();
        components.insert(name.to_string(), ComponentStatus::Healthy);
    }

    /// Mark a component as degraded.
    pub fn mark_degraded(&self, name: &str, reason: &str) {
        let mut components = self.components.write();
        components.insert(
            name.to_string(),
            ComponentStatus::Degraded(reason.to_string()),
        );
    }

    /// Mark a component as unhealthy.
    pub fn mark_unhealthy(&self, name: &str, reason: &str) {
        let mut components = self.components.write();
        components.insert(
            name.to_string(),
            ComponentStatus::Unhealthy(reason.to_string()),
        );
    }

    /// Get the status of a specific component.
    pub fn get_component_status(&self, name: &str) -> Option<ComponentStatus> {
        let components = self.components.read();
        components.get(name).cloned()
    }

    /// Get all component statuses.
    pub fn get_all_statuses(&self) -> HashMap<String, ComponentStatus> {
        self.components.read().clone()
    }

    /// Get overall system health status.
    pub fn overall_status(&self) -> HealthStatus {
        let components = self.components.read();

        let mut has_degraded = false;
        for status in components.values() {
            match status {
                ComponentStatus::Unhealthy(_) => return HealthStatus::Unhealthy,
                ComponentStatus::Degraded(_) => has_degraded = true,
                _ => {}
            }
        }

        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Check if the system is operational (healthy or degraded).
    pub fn is_operational(&self) -> bool {
        matches!(
            self.overall_status(),
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    /// Ready to relay: the loop is running and nothing is unhealthy.
    pub fn is_ready(&self) -> bool {
        self.is_relay_running() && self.is_operational()
    }

    /// Mark the relay loop as started.
    pub fn relay_started(&self) {
        *self.relay_running.write() = true;
    }

    /// Mark the relay loop as stopped.
    pub fn relay_stopped(&self) {
        *self.relay_running.write() = false;
    }

    /// Check if the relay loop is running.
    pub fn is_relay_running(&self) -> bool {
        *self.relay_running.read()
    }

    /// Time since the manager was created.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}
