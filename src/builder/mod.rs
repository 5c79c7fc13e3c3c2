//! The build pipeline: dependency-ordered steps from plan to published image
//!
//! A [`Containerizer`] owns every piece of state a build needs: the
//! configuration, the shared step executor, the event dispatcher, and the
//! two layer caches. `containerize` runs the step graph
//!
//! ```text
//! credentials ─► base manifest ─► pull base layers ∥ build app layers
//!                                        │
//!                                        └─► push blobs ─► push manifest
//! ```
//!
//! against one of three sinks: a remote registry, a local daemon, or a
//! tarball on disk.

pub mod daemon;
pub mod plan;
pub mod steps;

use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use uuid::Uuid;

use crate::cache::{Cache, CachedLayer};
use crate::config::BuildConfiguration;
use crate::digest::Digest;
use crate::error::{BuildError, Result};
use crate::executor::StepExecutor;
use crate::image::archive;
use crate::image::config::HistoryTemplate;
use crate::image::layer::Layer;
use crate::image::manifest::{DescriptorTemplate, ImageManifestTemplate, RawManifest};
use crate::image::reference::{DOCKER_HUB_LIBRARY, DOCKER_HUB_REGISTRY, ImageReference};
use crate::image::{Image, format_timestamp};
use crate::progress::{Allocation, EventDispatcher};
use crate::registry::RegistryClient;

use daemon::DockerClient;
use plan::ContainerBuildPlan;
use steps::{BaseImage, BuildSession, OutputFormat};

/// Where the finished image goes.
pub enum Sink {
    /// Push to the configured target registry.
    Registry,
    /// Load into a local daemon through its CLI.
    DockerDaemon(DockerClient),
    /// Write the daemon-format archive to a file.
    Tarball(PathBuf),
}

/// What a successful build produced.
#[derive(Debug, Clone)]
pub struct BuildResult {
    /// Digest of the manifest bytes; the image's identity.
    pub image_digest: Digest,
    /// Digest of the container configuration.
    pub image_id: Digest,
    /// Every tag the image was published under.
    pub tags: Vec<String>,
}

/// Owns all build state; no globals anywhere.
pub struct Containerizer {
    session: BuildSession,
}

impl Containerizer {
    pub fn new(config: BuildConfiguration) -> Result<Self> {
        config.validate()?;
        let base_cache = Arc::new(Cache::new(&config.base_image_layers_cache_dir)?);
        let app_cache = Arc::new(Cache::new(&config.application_layers_cache_dir)?);
        Ok(Containerizer {
            session: BuildSession {
                config,
                executor: Arc::new(StepExecutor::default()),
                events: EventDispatcher::new(),
                base_cache,
                app_cache,
            },
        })
    }

    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.session.events = events;
        self
    }

    pub fn with_executor(mut self, executor: Arc<StepExecutor>) -> Self {
        self.session.executor = executor;
        self
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.session.events
    }

    /// Cooperatively cancel the running build; outstanding steps abort at
    /// their next await or chunk boundary.
    pub fn cancel(&self) {
        self.session.executor.cancel();
    }

    /// Run the whole pipeline for one plan and sink.
    pub async fn containerize(&self, plan: &ContainerBuildPlan, sink: &Sink) -> Result<BuildResult> {
        let session = &self.session;
        session.config.validate()?;
        if matches!(sink, Sink::Registry | Sink::DockerDaemon(_)) {
            session.config.require_target_image()?;
        }

        let modification_time = session.config.files_modification_time.resolve();
        let creation_time = session.config.creation_time.resolve();

        // Credentials and the base manifest come first; everything layer-
        // shaped fans out from here.
        let base_client = if session.config.base_image.is_scratch() {
            None
        } else {
            Some(session.registry_client(&session.config.base_image).await?)
        };
        let base = match &base_client {
            Some(client) => session.pull_base_image(client).await?,
            None => BaseImage::scratch(),
        };
        let format: OutputFormat = base.format;

        // One unit per bounded step: every layer is resolved/built once and,
        // for a registry push, pushed once; config and manifest pushes and
        // the archive write own a unit each.
        let layer_count = base.layers.len() + plan.layers.len();
        let total_units = match sink {
            Sink::Registry => (2 * layer_count + 2) as u64,
            _ => (layer_count + 1) as u64,
        };
        let root = Allocation::root("containerize", total_units);

        // Base layers that lack a diff-id (or that a local sink needs on
        // disk) are pulled and cached; the rest stay references.
        let require_local = !matches!(sink, Sink::Registry);
        let base_layers = self
            .resolve_base_layers(&base_client, base.layers, &root, require_local)
            .await?;

        // Application layers build in parallel with the base pulls above
        // only in the sense that both are bounded by the same executor;
        // their inputs are independent.
        let app_futures = plan
            .layers
            .iter()
            .map(|spec| {
                let allocation = root.child(format!("layer '{}'", spec.name), 1);
                async move {
                    session
                        .executor
                        .run(session.build_application_layer(spec, modification_time, allocation))
                        .await
                }
                .boxed()
            })
            .collect();
        let app_layers: Vec<CachedLayer> = session.executor.join_steps(app_futures).await?;

        // Assemble the image value and its configuration.
        let mut image = Image::new(
            session.config.platform.architecture.clone(),
            session.config.platform.os.clone(),
        );
        if let Some(configuration) = &base.configuration {
            image.absorb_base_configuration(configuration);
        }
        self.apply_plan(&mut image, plan);
        image.created = Some(creation_time);
        for layer in &base_layers {
            image.add_layer(layer.clone());
        }
        for (spec, cached) in plan.layers.iter().zip(&app_layers) {
            image.add_layer(Layer::Cached(cached.clone()));
            image.history.push(HistoryTemplate {
                created: Some(format_timestamp(creation_time)),
                created_by: Some("containerizer".to_string()),
                comment: Some(spec.name.clone()),
                empty_layer: spec.entries.is_empty().then_some(true),
                ..Default::default()
            });
        }

        let config_bytes = image.to_configuration()?.to_bytes()?;
        let config_digest = Digest::of_bytes(&config_bytes);

        let manifest = ImageManifestTemplate::assemble(
            format.manifest_media_type(),
            DescriptorTemplate {
                media_type: format.config_media_type().to_string(),
                size: config_bytes.len() as u64,
                digest: config_digest.clone(),
            },
            image
                .layers
                .iter()
                .map(|layer| session.manifest_descriptor(layer, format))
                .collect::<Result<Vec<_>>>()?,
        );
        let raw_manifest = manifest.to_raw()?;

        let result = match sink {
            Sink::Registry => {
                self.publish_to_registry(
                    &image,
                    &base_client,
                    config_bytes,
                    &config_digest,
                    &raw_manifest,
                    &root,
                )
                .await?
            }
            Sink::DockerDaemon(client) => {
                self.publish_to_daemon(
                    client,
                    &image,
                    &config_bytes,
                    &config_digest,
                    &raw_manifest,
                    &root,
                )
                .await?
            }
            Sink::Tarball(path) => {
                self.publish_to_tarball(
                    path,
                    &image,
                    &config_bytes,
                    &config_digest,
                    &raw_manifest,
                    &root,
                )
                .await?
            }
        };

        session.app_cache.clean_tmp()?;
        session.base_cache.clean_tmp()?;
        session.events.info(format!(
            "built image {} (id {})",
            result.image_digest, result.image_id
        ));
        Ok(result)
    }

    /// Pull base layers that must become local cache entries, leaving the
    /// others as remote references. Runs per-layer steps in parallel.
    async fn resolve_base_layers(
        &self,
        base_client: &Option<Arc<RegistryClient>>,
        layers: Vec<Layer>,
        root: &Arc<Allocation>,
        require_local: bool,
    ) -> Result<Vec<Layer>> {
        let session = &self.session;
        let futures = layers
            .into_iter()
            .map(|layer| {
                let needs_pull = match &layer {
                    Layer::ReferenceNoDiffId { .. } => true,
                    Layer::Reference { .. } => require_local,
                    _ => false,
                };
                if !needs_pull {
                    let allocation = root.child("base layer (referenced)", 1);
                    session.events.progress(&allocation, 1);
                    return async move { Ok(layer) }.boxed();
                }
                let client = match base_client {
                    Some(client) => client.clone(),
                    None => {
                        return async {
                            Err(BuildError::InvalidConfiguration(
                                "base layers cannot be pulled without a base registry".to_string(),
                            ))
                        }
                        .boxed();
                    }
                };
                let descriptor = match layer.descriptor() {
                    Ok(descriptor) => descriptor,
                    Err(e) => return async move { Err(e) }.boxed(),
                };
                let allocation =
                    root.child(format!("pull {}", descriptor.digest), descriptor.size.max(1));
                async move {
                    let cached = session
                        .executor
                        .run(session.pull_and_cache_base_layer(&client, &descriptor, allocation))
                        .await?;
                    Ok(Layer::Cached(cached))
                }
                .boxed()
            })
            .collect();
        session.executor.join_steps(futures).await
    }

    fn apply_plan(&self, image: &mut Image, plan: &ContainerBuildPlan) {
        image.environment.extend(plan.environment.clone());
        image.labels.extend(plan.labels.clone());
        image.exposed_ports.extend(plan.exposed_ports.iter().cloned());
        image.volumes.extend(plan.volumes.iter().cloned());
        if plan.entrypoint.is_some() {
            image.entrypoint = plan.entrypoint.clone();
        }
        if plan.cmd.is_some() {
            image.cmd = plan.cmd.clone();
        }
        if plan.user.is_some() {
            image.user = plan.user.clone();
        }
        if plan.working_dir.is_some() {
            image.working_dir = plan.working_dir.clone();
        }
        if plan.healthcheck.is_some() {
            image.healthcheck = plan.healthcheck.clone();
        }
    }

    /// Push every blob the target does not already have, then commit the
    /// manifest under each requested tag. The manifest PUT is sequenced
    /// strictly after all blob uploads succeed.
    async fn publish_to_registry(
        &self,
        image: &Image,
        base_client: &Option<Arc<RegistryClient>>,
        config_bytes: Vec<u8>,
        config_digest: &Digest,
        raw_manifest: &RawManifest,
        root: &Arc<Allocation>,
    ) -> Result<BuildResult> {
        let session = &self.session;
        let target_reference = session.config.require_target_image()?.clone();
        let target = session.registry_client(&target_reference).await?;

        let mut push_futures: Vec<futures::future::BoxFuture<'_, Result<()>>> = image
            .layers
            .iter()
            .map(|layer| {
                let target = target.clone();
                let allocation = root.child(
                    "push layer",
                    layer.descriptor().map(|d| d.size).unwrap_or(1).max(1),
                );
                async move {
                    session
                        .executor
                        .run(session.push_layer(&target, base_client.as_ref(), layer, allocation))
                        .await
                }
                .boxed()
            })
            .collect();

        let config_allocation = root.child("push config", 1);
        let target_for_config = target.clone();
        let config_digest_owned = config_digest.clone();
        push_futures.push(
            async move {
                session
                    .executor
                    .run(session.push_config(
                        &target_for_config,
                        config_bytes,
                        &config_digest_owned,
                        config_allocation,
                    ))
                    .await
            }
            .boxed(),
        );

        session.executor.join_steps(push_futures).await?;

        // All blobs are in place; commit the manifest for every tag.
        let mut tags = vec![target_reference.reference()];
        tags.extend(session.config.additional_tags.iter().cloned());
        for tag in &tags {
            session.events.step_started(format!("push manifest for '{}'", tag));
            target.push_manifest(raw_manifest, tag).await?;
            session.events.step_completed(format!("push manifest for '{}'", tag));
        }
        let manifest_allocation = root.child("push manifest", 1);
        session.events.progress(&manifest_allocation, 1);

        Ok(BuildResult {
            image_digest: raw_manifest.digest.clone(),
            image_id: config_digest.clone(),
            tags,
        })
    }

    fn repo_tags(&self) -> Vec<String> {
        let Some(target) = &self.session.config.target_image else {
            return Vec::new();
        };
        let tag = target.tag().unwrap_or("latest");
        let name = friendly_name(target);
        let mut tags = vec![format!("{}:{}", name, tag)];
        for extra in &self.session.config.additional_tags {
            tags.push(format!("{}:{}", name, extra));
        }
        tags
    }

    /// Stage the archive under the application cache's scratch space and
    /// stream it into the daemon.
    async fn publish_to_daemon(
        &self,
        client: &DockerClient,
        image: &Image,
        config_bytes: &[u8],
        config_digest: &Digest,
        raw_manifest: &RawManifest,
        root: &Arc<Allocation>,
    ) -> Result<BuildResult> {
        let session = &self.session;
        let staging = session
            .app_cache
            .root()
            .join("tmp")
            .join(format!("{}.tar", Uuid::new_v4()));

        let result = async {
            self.write_archive_file(&staging, image, config_bytes, config_digest)
                .await?;
            client.load(&staging, &session.events).await
        }
        .await;
        let _ = std::fs::remove_file(&staging);
        result?;

        let allocation = root.child("archive", 1);
        session.events.progress(&allocation, 1);

        Ok(BuildResult {
            image_digest: raw_manifest.digest.clone(),
            image_id: config_digest.clone(),
            tags: self.repo_tags(),
        })
    }

    async fn publish_to_tarball(
        &self,
        path: &std::path::Path,
        image: &Image,
        config_bytes: &[u8],
        config_digest: &Digest,
        raw_manifest: &RawManifest,
        root: &Arc<Allocation>,
    ) -> Result<BuildResult> {
        self.write_archive_file(path, image, config_bytes, config_digest)
            .await?;
        let allocation = root.child("archive", 1);
        self.session.events.progress(&allocation, 1);
        self.session
            .events
            .info(format!("wrote image tarball to {}", path.display()));
        Ok(BuildResult {
            image_digest: raw_manifest.digest.clone(),
            image_id: config_digest.clone(),
            tags: self.repo_tags(),
        })
    }

    async fn write_archive_file(
        &self,
        path: &std::path::Path,
        image: &Image,
        config_bytes: &[u8],
        config_digest: &Digest,
    ) -> Result<()> {
        let cached_layers: Vec<CachedLayer> = image
            .layers
            .iter()
            .map(|layer| match layer {
                Layer::Cached(cached) => Ok(cached.clone()),
                other => Err(BuildError::InvalidConfiguration(format!(
                    "{:?} must be cached locally before archiving",
                    other
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        let repo_tags = self.repo_tags();
        let config_bytes = config_bytes.to_vec();
        let config_digest = config_digest.clone();
        let path = path.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::File::create(&path)?;
            let mut writer = std::io::BufWriter::new(file);
            archive::write_archive(
                &mut writer,
                &config_bytes,
                &config_digest,
                &repo_tags,
                &cached_layers,
            )?;
            use std::io::Write;
            writer.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| BuildError::Io(std::io::Error::other(e)))?
    }
}

/// Display name for daemon tags: Docker Hub images drop the registry and
/// the `library/` namespace, everything else keeps its registry prefix.
fn friendly_name(reference: &ImageReference) -> String {
    if reference.registry() == DOCKER_HUB_REGISTRY {
        let repository = reference.repository();
        repository
            .strip_prefix(&format!("{}/", DOCKER_HUB_LIBRARY))
            .unwrap_or(repository)
            .to_string()
    } else {
        format!("{}/{}", reference.registry(), reference.repository())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimestampSpec;
    use crate::tar_builder::LayerEntry;
    use super::plan::LayerSpec;

    fn configuration(
        base: &str,
        dirs: &tempfile::TempDir,
    ) -> BuildConfiguration {
        BuildConfiguration::new(ImageReference::parse(base).unwrap())
            .with_application_layers_cache_dir(dirs.path().join("app"))
            .with_base_image_layers_cache_dir(dirs.path().join("base"))
    }

    #[tokio::test]
    async fn scratch_build_to_tarball_round_trips() {
        let dirs = tempfile::tempdir().unwrap();
        let src = dirs.path().join("Main.class");
        std::fs::write(&src, b"\xca\xfe\xba\xbe\x00\x00").unwrap();

        let config = configuration("scratch", &dirs).with_target_image(
            ImageReference::parse("registry.example/my/app:latest").unwrap(),
        );
        let containerizer = Containerizer::new(config).unwrap();

        let plan = ContainerBuildPlan::new()
            .with_layer(LayerSpec::new(
                "classes",
                vec![LayerEntry::new(&src, "/app/classes/Main.class")],
            ))
            .with_entrypoint(vec!["java".to_string(), "Main".to_string()])
            .with_environment_variable("LANG", "C.UTF-8")
            .with_exposed_port("8080/tcp")
            .with_label("build", "test");

        let out = dirs.path().join("image.tar");
        let result = containerizer
            .containerize(&plan, &Sink::Tarball(out.clone()))
            .await
            .unwrap();

        assert!(out.is_file());
        assert_eq!(result.tags, vec!["registry.example/my/app:latest"]);

        // The archive holds a parseable manifest.json whose config file
        // matches the reported image id.
        let mut archive = tar::Archive::new(std::fs::File::open(&out).unwrap());
        let mut manifest_bytes = Vec::new();
        let mut config_bytes = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            use std::io::Read;
            if path == "manifest.json" {
                entry.read_to_end(&mut manifest_bytes).unwrap();
            } else if path.ends_with(".json") {
                entry.read_to_end(&mut config_bytes).unwrap();
            }
        }
        let entries: Vec<archive::ArchiveManifestEntry> =
            serde_json::from_slice(&manifest_bytes).unwrap();
        assert_eq!(entries[0].config, format!("{}.json", result.image_id.hex()));
        assert_eq!(entries[0].layers.len(), 1);
        assert_eq!(Digest::of_bytes(&config_bytes), result.image_id);

        // Plan parameters land in the config.
        let parsed =
            crate::image::config::ContainerConfigurationTemplate::parse(&config_bytes).unwrap();
        let execution = parsed.config.unwrap();
        assert_eq!(
            execution.entrypoint,
            Some(vec!["java".to_string(), "Main".to_string()])
        );
        assert!(execution.env.unwrap().contains(&"LANG=C.UTF-8".to_string()));
        assert!(execution.exposed_ports.unwrap().contains_key("8080/tcp"));
        assert_eq!(parsed.rootfs.diff_ids.len(), 1);
        assert_eq!(parsed.created.as_deref(), Some("1970-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn identical_builds_are_reproducible_and_cache_hit() {
        let dirs = tempfile::tempdir().unwrap();
        let src = dirs.path().join("app.bin");
        std::fs::write(&src, b"identical input bytes").unwrap();

        let run = |out: PathBuf| {
            let dirs_path = dirs.path().to_path_buf();
            let src = src.clone();
            async move {
                let config = BuildConfiguration::new(ImageReference::scratch())
                    .with_application_layers_cache_dir(dirs_path.join("app"))
                    .with_base_image_layers_cache_dir(dirs_path.join("base"))
                    .with_creation_time(TimestampSpec::epoch());
                let containerizer = Containerizer::new(config).unwrap();
                let plan = ContainerBuildPlan::new().with_layer(LayerSpec::new(
                    "app",
                    vec![LayerEntry::new(&src, "/app/app.bin")],
                ));
                containerizer
                    .containerize(&plan, &Sink::Tarball(out))
                    .await
                    .unwrap()
            }
        };

        let first = run(dirs.path().join("one.tar")).await;
        let second = run(dirs.path().join("two.tar")).await;

        assert_eq!(first.image_digest, second.image_digest);
        assert_eq!(first.image_id, second.image_id);
        assert_eq!(
            std::fs::read(dirs.path().join("one.tar")).unwrap(),
            std::fs::read(dirs.path().join("two.tar")).unwrap()
        );

        // Exactly one layer entry exists despite two builds.
        let layer_dirs: Vec<_> = std::fs::read_dir(dirs.path().join("app/layers"))
            .unwrap()
            .collect();
        assert_eq!(layer_dirs.len(), 1);
        // And the scratch space is empty after success.
        assert_eq!(
            std::fs::read_dir(dirs.path().join("app/tmp")).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn empty_layer_list_yields_a_valid_image() {
        let dirs = tempfile::tempdir().unwrap();
        let config = configuration("scratch", &dirs);
        let containerizer = Containerizer::new(config).unwrap();
        let plan = ContainerBuildPlan::new();

        let out = dirs.path().join("empty.tar");
        let result = containerizer
            .containerize(&plan, &Sink::Tarball(out.clone()))
            .await
            .unwrap();

        let mut archive = tar::Archive::new(std::fs::File::open(&out).unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                format!("{}.json", result.image_id.hex()),
                "manifest.json".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn empty_entry_layer_is_marked_in_history() {
        let dirs = tempfile::tempdir().unwrap();
        let src = dirs.path().join("app.bin");
        std::fs::write(&src, b"payload").unwrap();

        let containerizer = Containerizer::new(configuration("scratch", &dirs)).unwrap();
        let plan = ContainerBuildPlan::new()
            .with_layer(LayerSpec::new("app", vec![LayerEntry::new(&src, "/app/app.bin")]))
            .with_layer(LayerSpec::new("placeholder", Vec::new()));

        let out = dirs.path().join("image.tar");
        containerizer
            .containerize(&plan, &Sink::Tarball(out.clone()))
            .await
            .unwrap();

        let mut archive = tar::Archive::new(std::fs::File::open(&out).unwrap());
        let mut config_bytes = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            use std::io::Read;
            if path.ends_with(".json") && path != "manifest.json" {
                entry.read_to_end(&mut config_bytes).unwrap();
            }
        }
        let parsed =
            crate::image::config::ContainerConfigurationTemplate::parse(&config_bytes).unwrap();
        assert_eq!(parsed.history.len(), 2);
        assert_eq!(parsed.history[0].comment.as_deref(), Some("app"));
        assert_eq!(parsed.history[0].empty_layer, None);
        assert_eq!(parsed.history[1].comment.as_deref(), Some("placeholder"));
        assert_eq!(parsed.history[1].empty_layer, Some(true));
    }

    #[tokio::test]
    async fn daemon_and_registry_sinks_require_a_target() {
        let dirs = tempfile::tempdir().unwrap();
        let containerizer = Containerizer::new(configuration("scratch", &dirs)).unwrap();
        let plan = ContainerBuildPlan::new();

        let err = containerizer
            .containerize(&plan, &Sink::Registry)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidConfiguration(_)));
    }

    #[test]
    fn hub_references_get_friendly_names() {
        let hub = ImageReference::parse("busybox:latest").unwrap();
        assert_eq!(friendly_name(&hub), "busybox");
        let private = ImageReference::parse("gcr.io/my/app:v1").unwrap();
        assert_eq!(friendly_name(&private), "gcr.io/my/app");
    }
}
