//! Image model: references, layers, manifests, configuration, archives

pub mod archive;
pub mod config;
pub mod layer;
pub mod manifest;
pub mod reference;

use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::digest::Digest;
use crate::error::Result;

use config::{
    ContainerConfigurationTemplate, ExecutionTemplate, HealthcheckTemplate, HistoryTemplate,
    RootFsTemplate,
};
use layer::Layer;

/// Format an instant the way config JSON wants it: RFC 3339, UTC, seconds.
pub fn format_timestamp(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// An immutable image under construction or freshly pulled.
///
/// Layer order is apply order and is significant; the image's identity is
/// the digest of its manifest bytes once pushed or archived.
#[derive(Debug, Clone, Default)]
pub struct Image {
    pub architecture: String,
    pub os: String,
    pub created: Option<SystemTime>,
    pub layers: Vec<Layer>,
    pub environment: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub exposed_ports: BTreeSet<String>,
    pub volumes: BTreeSet<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub healthcheck: Option<HealthcheckTemplate>,
    pub history: Vec<HistoryTemplate>,
    /// Unknown top-level fields inherited from the base image's config.
    pub inherited_root_fields: BTreeMap<String, serde_json::Value>,
    /// Unknown `config` fields inherited from the base image's config.
    pub inherited_config_fields: BTreeMap<String, serde_json::Value>,
}

impl Image {
    pub fn new(architecture: impl Into<String>, os: impl Into<String>) -> Self {
        Image {
            architecture: architecture.into(),
            os: os.into(),
            ..Default::default()
        }
    }

    /// Import everything a base image passes down to its children.
    pub fn absorb_base_configuration(&mut self, base: &ContainerConfigurationTemplate) {
        self.inherited_root_fields = base.extra.clone();
        self.history = base.history.clone();

        let Some(config) = &base.config else {
            return;
        };
        for pair in config.env.iter().flatten() {
            if let Some((key, value)) = pair.split_once('=') {
                self.environment
                    .insert(key.to_string(), value.to_string());
            }
        }
        if let Some(labels) = &config.labels {
            self.labels.extend(labels.clone());
        }
        if let Some(ports) = &config.exposed_ports {
            self.exposed_ports.extend(ports.keys().cloned());
        }
        if let Some(volumes) = &config.volumes {
            self.volumes.extend(volumes.keys().cloned());
        }
        self.entrypoint = config.entrypoint.clone();
        self.cmd = config.cmd.clone();
        self.user = config.user.clone();
        self.working_dir = config.working_dir.clone();
        self.healthcheck = config.healthcheck.clone();
        self.inherited_config_fields = config.extra.clone();
    }

    pub fn add_layer(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    /// Ordered diff-ids of every layer; fails if any layer is still
    /// unwritten or lacks a diff-id.
    pub fn diff_ids(&self) -> Result<Vec<Digest>> {
        self.layers.iter().map(|layer| layer.diff_id()).collect()
    }

    /// Synthesise the container configuration for this image.
    pub fn to_configuration(&self) -> Result<ContainerConfigurationTemplate> {
        let empty_object_map = |keys: &BTreeSet<String>| {
            if keys.is_empty() {
                None
            } else {
                Some(
                    keys.iter()
                        .map(|k| (k.clone(), serde_json::json!({})))
                        .collect::<BTreeMap<_, _>>(),
                )
            }
        };

        let env = if self.environment.is_empty() {
            None
        } else {
            Some(
                self.environment
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            )
        };
        let labels = if self.labels.is_empty() {
            None
        } else {
            Some(self.labels.clone())
        };

        let execution = ExecutionTemplate {
            env,
            entrypoint: self.entrypoint.clone(),
            cmd: self.cmd.clone(),
            labels,
            exposed_ports: empty_object_map(&self.exposed_ports),
            volumes: empty_object_map(&self.volumes),
            user: self.user.clone(),
            working_dir: self.working_dir.clone(),
            healthcheck: self.healthcheck.clone(),
            extra: self.inherited_config_fields.clone(),
        };

        Ok(ContainerConfigurationTemplate {
            created: self.created.map(format_timestamp),
            architecture: self.architecture.clone(),
            os: self.os.clone(),
            config: Some(execution),
            rootfs: RootFsTemplate::layers(self.diff_ids()?),
            history: self.history.clone(),
            extra: self.inherited_root_fields.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobDescriptor;
    use std::time::{Duration, UNIX_EPOCH};

    fn reference_layer(seed: &[u8]) -> Layer {
        Layer::Reference {
            diff_id: Digest::of_bytes(seed),
            descriptor: BlobDescriptor::new(seed.len() as u64, Digest::of_bytes(seed)),
        }
    }

    #[test]
    fn epoch_formats_as_rfc3339() {
        assert_eq!(format_timestamp(UNIX_EPOCH), "1970-01-01T00:00:00Z");
        assert_eq!(
            format_timestamp(UNIX_EPOCH + Duration::from_secs(1)),
            "1970-01-01T00:00:01Z"
        );
    }

    #[test]
    fn configuration_carries_ordered_diff_ids() {
        let mut image = Image::new("amd64", "linux");
        image.add_layer(reference_layer(b"first"));
        image.add_layer(reference_layer(b"second"));
        image.created = Some(UNIX_EPOCH);

        let config = image.to_configuration().unwrap();
        assert_eq!(config.rootfs.fs_type, "layers");
        assert_eq!(
            config.rootfs.diff_ids,
            vec![Digest::of_bytes(b"first"), Digest::of_bytes(b"second")]
        );
        assert_eq!(config.created.as_deref(), Some("1970-01-01T00:00:00Z"));
        assert_eq!(config.architecture, "amd64");
    }

    #[test]
    fn base_configuration_is_absorbed_and_preserved() {
        let base_json = serde_json::json!({
            "architecture": "arm64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/usr/bin", "LANG=C.UTF-8"],
                "Entrypoint": ["/docker-entrypoint.sh"],
                "ExposedPorts": {"80/tcp": {}},
                "Labels": {"vendor": "example"},
                "OnBuild": ["RUN echo hi"],
            },
            "rootfs": {"type": "layers", "diff_ids": []},
            "variant": "v8",
        });
        let base =
            ContainerConfigurationTemplate::parse(&serde_json::to_vec(&base_json).unwrap())
                .unwrap();

        let mut image = Image::new("arm64", "linux");
        image.absorb_base_configuration(&base);
        image.environment.insert("APP_HOME".into(), "/app".into());

        let config = image.to_configuration().unwrap();
        let execution = config.config.as_ref().unwrap();
        let env = execution.env.as_ref().unwrap();
        assert!(env.contains(&"PATH=/usr/bin".to_string()));
        assert!(env.contains(&"APP_HOME=/app".to_string()));
        assert_eq!(execution.entrypoint.as_ref().unwrap()[0], "/docker-entrypoint.sh");
        assert!(execution.exposed_ports.as_ref().unwrap().contains_key("80/tcp"));
        // Unknown fields ride along untouched.
        assert!(execution.extra.contains_key("OnBuild"));
        assert_eq!(config.extra["variant"], serde_json::json!("v8"));
    }

    #[test]
    fn environment_overrides_win_over_base() {
        let base_json = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {"Env": ["MODE=base"]},
            "rootfs": {"type": "layers", "diff_ids": []},
        });
        let base =
            ContainerConfigurationTemplate::parse(&serde_json::to_vec(&base_json).unwrap())
                .unwrap();
        let mut image = Image::new("amd64", "linux");
        image.absorb_base_configuration(&base);
        image.environment.insert("MODE".into(), "app".into());

        let config = image.to_configuration().unwrap();
        let env = config.config.unwrap().env.unwrap();
        assert_eq!(env, vec!["MODE=app".to_string()]);
    }
}
