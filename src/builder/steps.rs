//! The asynchronous steps of the build pipeline
//!
//! Each step has typed inputs and one typed output and runs on the shared
//! executor. Identical layer work coalesces onto one future per digest, so
//! concurrent builds in one process never download or build the same layer
//! twice.

use std::fs::File;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use futures::FutureExt;
use uuid::Uuid;

use crate::blob::{self, BlobDescriptor};
use crate::cache::{Cache, CachedLayer};
use crate::config::BuildConfiguration;
use crate::error::{BuildError, Result};
use crate::executor::StepExecutor;
use crate::image::config::ContainerConfigurationTemplate;
use crate::image::layer::Layer;
use crate::image::manifest::{
    self, DescriptorTemplate, Manifest, RawManifest,
};
use crate::image::reference::ImageReference;
use crate::progress::{Allocation, EventDispatcher};
use crate::registry::{BlobMount, RegistryClient};
use crate::tar_builder::TarLayerBuilder;

use super::plan::LayerSpec;

/// Whether the produced image speaks Docker or OCI media types; follows
/// the base image, Docker for scratch and schema-1 bases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Docker,
    Oci,
}

impl OutputFormat {
    pub fn manifest_media_type(&self) -> &'static str {
        match self {
            OutputFormat::Docker => manifest::DOCKER_MANIFEST_V2,
            OutputFormat::Oci => manifest::OCI_MANIFEST,
        }
    }

    pub fn config_media_type(&self) -> &'static str {
        match self {
            OutputFormat::Docker => manifest::DOCKER_CONFIG_MEDIA_TYPE,
            OutputFormat::Oci => manifest::OCI_CONFIG_MEDIA_TYPE,
        }
    }

    pub fn layer_media_type(&self) -> &'static str {
        match self {
            OutputFormat::Docker => manifest::DOCKER_LAYER_MEDIA_TYPE,
            OutputFormat::Oci => manifest::OCI_LAYER_MEDIA_TYPE,
        }
    }
}

/// Everything learned about the base image from its manifest and config.
pub struct BaseImage {
    pub manifest: Option<RawManifest>,
    pub configuration: Option<ContainerConfigurationTemplate>,
    pub layers: Vec<Layer>,
    pub format: OutputFormat,
}

impl BaseImage {
    pub fn scratch() -> Self {
        BaseImage {
            manifest: None,
            configuration: None,
            layers: Vec::new(),
            format: OutputFormat::Docker,
        }
    }
}

/// Shared state threaded through every step of one build.
pub struct BuildSession {
    pub config: BuildConfiguration,
    pub executor: Arc<StepExecutor>,
    pub events: EventDispatcher,
    pub base_cache: Arc<Cache>,
    pub app_cache: Arc<Cache>,
}

impl BuildSession {
    /// Fetch the base image's manifest and container config, resolving
    /// manifest lists against the configured platform. Digest-pinned
    /// references reuse the on-disk metadata cache and skip the network.
    pub async fn pull_base_image(&self, client: &Arc<RegistryClient>) -> Result<BaseImage> {
        let reference = &self.config.base_image;
        self.events.step_started("pull base image manifest");

        if reference.digest().is_some() {
            if let Some(cached) = self.base_cache.read_image_metadata(reference)? {
                // Any defect in the cached copy falls through to the network.
                let assembled = RawManifest::from_bytes(cached.manifest.clone(), None)
                    .and_then(|raw| self.assemble_base(raw, Some(&cached.config), client));
                if let Ok(base) = assembled {
                    self.events.debug(format!(
                        "base image {} served from the metadata cache",
                        reference
                    ));
                    self.events.step_completed("pull base image manifest");
                    return Ok(base);
                }
            }
        }

        let raw = client
            .pull_manifest_for_platform(
                &reference.reference(),
                &self.config.platform.architecture,
                &self.config.platform.os,
            )
            .await?;

        let base = match &raw.manifest {
            Manifest::Image(template) => {
                let config_bytes = self
                    .pull_base_config(client, &template.config.digest, template.config.size)
                    .await?;
                self.base_cache
                    .write_image_metadata(reference, &raw.bytes, &config_bytes)?;
                self.assemble_base(raw, Some(&config_bytes), client)?
            }
            Manifest::V1(_) => self.assemble_base(raw, None, client)?,
            Manifest::List(_) => {
                // pull_manifest_for_platform already resolved lists; a list
                // here means the child was itself a list.
                return Err(BuildError::RegistryTransport(
                    "manifest list resolved to another manifest list".to_string(),
                ));
            }
        };

        self.events.step_completed("pull base image manifest");
        Ok(base)
    }

    async fn pull_base_config(
        &self,
        client: &Arc<RegistryClient>,
        digest: &crate::digest::Digest,
        size: u64,
    ) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(size as usize);
        client
            .pull_blob(digest, Some(size), &mut bytes, None)
            .await?;
        Ok(bytes)
    }

    fn assemble_base(
        &self,
        raw: RawManifest,
        config_bytes: Option<&[u8]>,
        _client: &Arc<RegistryClient>,
    ) -> Result<BaseImage> {
        match &raw.manifest {
            Manifest::Image(template) => {
                let config_bytes = config_bytes.ok_or_else(|| {
                    BuildError::RegistryTransport(
                        "image manifest without container config bytes".to_string(),
                    )
                })?;
                let configuration = ContainerConfigurationTemplate::parse(config_bytes)?;
                if configuration.rootfs.diff_ids.len() != template.layers.len() {
                    return Err(BuildError::RegistryTransport(format!(
                        "base image lists {} layers but {} diff-ids",
                        template.layers.len(),
                        configuration.rootfs.diff_ids.len()
                    )));
                }
                let format = if template.media_type == manifest::OCI_MANIFEST {
                    OutputFormat::Oci
                } else {
                    OutputFormat::Docker
                };
                let layers = template
                    .layers
                    .iter()
                    .zip(&configuration.rootfs.diff_ids)
                    .map(|(descriptor, diff_id)| Layer::Reference {
                        diff_id: diff_id.clone(),
                        descriptor: BlobDescriptor::new(
                            descriptor.size,
                            descriptor.digest.clone(),
                        )
                        .with_media_type(descriptor.media_type.clone()),
                    })
                    .collect();
                Ok(BaseImage {
                    manifest: Some(raw.clone()),
                    configuration: Some(configuration),
                    layers,
                    format,
                })
            }
            Manifest::V1(v1) => {
                // Schema 1 lists layers newest-first and provides no
                // diff-ids; every layer must be pulled before its bytes can
                // be described.
                let layers = v1
                    .fs_layers
                    .iter()
                    .rev()
                    .map(|fs_layer| Layer::ReferenceNoDiffId {
                        descriptor: BlobDescriptor::new(0, fs_layer.blob_sum.clone()),
                    })
                    .collect();
                Ok(BaseImage {
                    manifest: Some(raw.clone()),
                    configuration: None,
                    layers,
                    format: OutputFormat::Docker,
                })
            }
            Manifest::List(_) => Err(BuildError::RegistryTransport(
                "cannot assemble a base image from a manifest list".to_string(),
            )),
        }
    }

    /// Build one application layer, or skip the work entirely on a
    /// selector hit. Concurrent builds of identical entries coalesce.
    pub async fn build_application_layer(
        &self,
        spec: &LayerSpec,
        modification_time: SystemTime,
        allocation: Arc<Allocation>,
    ) -> Result<CachedLayer> {
        let mut builder = TarLayerBuilder::new();
        for mut entry in spec.entries.iter().cloned() {
            entry.modification_time = modification_time;
            builder.add_entry(entry);
        }

        let name = spec.name.clone();
        let events = self.events.clone();
        let cache = self.app_cache.clone();

        self.events.step_started(format!("build layer '{}'", name));
        let selector = builder.selector()?;
        let key = selector.clone();

        let cached = self
            .executor
            .coalesce(&key, move || {
                async move {
                    let selector_for_put = selector.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        if let Some(hit) = cache.get_by_selector(&selector_for_put)? {
                            events.debug(format!(
                                "layer '{}' found in cache by selector",
                                name
                            ));
                            return Ok(hit);
                        }
                        cache.put(
                            Some(&selector_for_put),
                            builder.to_compressed_blob().as_ref(),
                        )
                    })
                    .await
                    .map_err(|e| BuildError::Io(io::Error::other(e)))??;
                    Ok(result)
                }
                .boxed()
            })
            .await?;

        self.events.progress(&allocation, allocation.units());
        self.events
            .step_completed(format!("build layer '{}'", spec.name));
        Ok(cached)
    }

    /// Fetch one base layer into the cache, verifying the digest while it
    /// streams. A cache hit means no network I/O at all; concurrent pulls
    /// of the same digest share one download.
    pub async fn pull_and_cache_base_layer(
        &self,
        client: &Arc<RegistryClient>,
        descriptor: &BlobDescriptor,
        allocation: Arc<Allocation>,
    ) -> Result<CachedLayer> {
        let digest = descriptor.digest.clone();
        let expected_size = (descriptor.size > 0).then_some(descriptor.size);
        let cache = self.base_cache.clone();
        let client = client.clone();
        let events = self.events.clone();

        self.executor
            .coalesce(&digest.clone(), move || {
                async move {
                    if let Some(hit) = cache.get_by_digest(&digest)? {
                        events.progress(&allocation, allocation.units());
                        return Ok(hit);
                    }

                    events.step_started(format!("pull base layer {}", digest));
                    let staging = cache.root().join("tmp").join(Uuid::new_v4().to_string());
                    let mut file = File::create(&staging)?;
                    let pulled = client
                        .pull_blob(&digest, expected_size, &mut file, Some(&allocation))
                        .await;
                    drop(file);
                    if let Err(e) = pulled {
                        let _ = std::fs::remove_file(&staging);
                        return Err(e);
                    }

                    let cache_for_put = cache.clone();
                    let staging_for_put = staging.clone();
                    let cached = tokio::task::spawn_blocking(move || {
                        cache_for_put.put(None, blob::from_file(&staging_for_put).as_ref())
                    })
                    .await
                    .map_err(|e| BuildError::Io(io::Error::other(e)))?;
                    let _ = std::fs::remove_file(&staging);
                    let cached = cached?;

                    if cached.layer_digest != digest {
                        return Err(BuildError::LayerConflict(format!(
                            "pulled blob {} cached under digest {}",
                            digest, cached.layer_digest
                        )));
                    }
                    events.step_completed(format!("pull base layer {}", digest));
                    Ok(cached)
                }
                .boxed()
            })
            .await
    }

    /// Push one layer to the target registry. A `HEAD` hit costs nothing;
    /// a base layer living on the same registry is cross-repo mounted; only
    /// then are bytes uploaded, pulling them into the cache first when they
    /// are not local.
    pub async fn push_layer(
        &self,
        target: &Arc<RegistryClient>,
        base_client: Option<&Arc<RegistryClient>>,
        layer: &Layer,
        allocation: Arc<Allocation>,
    ) -> Result<()> {
        let descriptor = layer.descriptor()?;
        let digest = &descriptor.digest;

        if target.blob_exists(digest, true).await?.is_some() {
            self.events
                .debug(format!("layer {} already at target", digest));
            self.events.progress(&allocation, allocation.units());
            return Ok(());
        }

        // Cross-repository mount when the blob lives on the same registry.
        let mut session: Option<String> = None;
        if layer.cached_path().is_none() {
            if let Some(base_client) = base_client {
                if base_client.registry() == target.registry() {
                    match target
                        .mount_blob(digest, base_client.repository())
                        .await?
                    {
                        BlobMount::Mounted => {
                            self.events.debug(format!(
                                "layer {} mounted from {}",
                                digest,
                                base_client.repository()
                            ));
                            self.events.progress(&allocation, allocation.units());
                            return Ok(());
                        }
                        BlobMount::Session(url) => session = Some(url),
                    }
                }
            }
        }

        // Bytes are needed now; make sure they are local.
        let cached = match layer.cached_path() {
            Some(path) => CachedLayer {
                layer_digest: digest.clone(),
                diff_id: layer.diff_id()?,
                size: descriptor.size,
                path: path.to_path_buf(),
            },
            None => {
                let base_client = base_client.ok_or_else(|| {
                    BuildError::InvalidConfiguration(format!(
                        "layer {} is not cached and no base registry is available",
                        digest
                    ))
                })?;
                let pull_allocation = allocation.child("pull before push", descriptor.size.max(1));
                self.pull_and_cache_base_layer(base_client, &descriptor, pull_allocation)
                    .await?
            }
        };

        let session = match session {
            Some(url) => url,
            None => target.start_blob_upload().await?,
        };
        self.events
            .step_started(format!("push layer {}", digest));
        target
            .upload_blob(&session, digest, &cached.path, Some(&allocation))
            .await?;
        self.events.progress(&allocation, allocation.units());
        self.events
            .step_completed(format!("push layer {}", digest));
        Ok(())
    }

    /// Push the container config blob.
    pub async fn push_config(
        &self,
        target: &Arc<RegistryClient>,
        config_bytes: Vec<u8>,
        digest: &crate::digest::Digest,
        allocation: Arc<Allocation>,
    ) -> Result<()> {
        if target.blob_exists(digest, true).await?.is_some() {
            self.events.progress(&allocation, allocation.units());
            return Ok(());
        }
        let session = target.start_blob_upload().await?;
        target.upload_blob_data(&session, digest, config_bytes).await?;
        self.events.progress(&allocation, allocation.units());
        Ok(())
    }

    /// Descriptor for one finished layer as it will appear in the manifest.
    /// Base layers keep their original media type; new layers use the
    /// output format's.
    pub fn manifest_descriptor(&self, layer: &Layer, format: OutputFormat) -> Result<DescriptorTemplate> {
        let descriptor = layer.descriptor()?;
        Ok(DescriptorTemplate {
            media_type: descriptor
                .media_type
                .unwrap_or_else(|| format.layer_media_type().to_string()),
            size: descriptor.size,
            digest: descriptor.digest,
        })
    }

    /// Build a registry client for one image reference.
    pub async fn registry_client(
        &self,
        reference: &ImageReference,
    ) -> Result<Arc<RegistryClient>> {
        let credential = crate::credentials::resolve_credential(
            &self.config.credential_retrievers,
            reference.registry(),
        )
        .await?;
        let client = RegistryClient::builder(reference.registry(), reference.repository())
            .with_credential(credential)
            .with_retrievers_tried(self.config.credential_retrievers.len())
            .with_allow_insecure(self.config.allow_insecure_registries)
            .with_send_credentials_over_http(self.config.send_credentials_over_http)
            .with_timeout(self.config.http_timeout)
            .with_events(self.events.clone())
            .with_cancel_token(self.executor.cancel_token())
            .build()?;
        Ok(Arc::new(client))
    }
}
