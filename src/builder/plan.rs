//! The build plan: what goes into the image
//!
//! A [`ContainerBuildPlan`] is assembled by the caller and handed to the
//! pipeline immutably: named application layers made of [`LayerEntry`]
//! lists, plus the execution parameters layered on top of whatever the
//! base image provides.

use std::collections::{BTreeMap, BTreeSet};

use crate::image::config::HealthcheckTemplate;
use crate::tar_builder::LayerEntry;

/// One named application layer.
#[derive(Debug, Clone)]
pub struct LayerSpec {
    /// Short name used in history records and progress output, e.g.
    /// `"dependencies"` or `"classes"`.
    pub name: String,
    pub entries: Vec<LayerEntry>,
}

impl LayerSpec {
    pub fn new(name: impl Into<String>, entries: Vec<LayerEntry>) -> Self {
        Self {
            name: name.into(),
            entries,
        }
    }
}

/// Immutable description of the image to build.
#[derive(Debug, Clone, Default)]
pub struct ContainerBuildPlan {
    pub layers: Vec<LayerSpec>,
    pub environment: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub exposed_ports: BTreeSet<String>,
    pub volumes: BTreeSet<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub healthcheck: Option<HealthcheckTemplate>,
}

impl ContainerBuildPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(mut self, layer: LayerSpec) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn with_environment_variable(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.entrypoint = Some(entrypoint);
        self
    }

    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = Some(cmd);
        self
    }

    pub fn with_exposed_port(mut self, port: impl Into<String>) -> Self {
        self.exposed_ports.insert(port.into());
        self
    }

    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volumes.insert(volume.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    pub fn with_healthcheck(mut self, healthcheck: HealthcheckTemplate) -> Self {
        self.healthcheck = Some(healthcheck);
        self
    }
}
