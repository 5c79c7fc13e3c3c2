//! End-to-end pipeline behaviour that needs no live registry

use std::time::{Duration, UNIX_EPOCH};

use containerizer::builder::plan::{ContainerBuildPlan, LayerSpec};
use containerizer::builder::{Containerizer, Sink};
use containerizer::cache::Cache;
use containerizer::config::BuildConfiguration;
use containerizer::image::reference::ImageReference;
use containerizer::tar_builder::{LayerEntry, TarLayerBuilder};

fn scratch_configuration(root: &std::path::Path) -> BuildConfiguration {
    BuildConfiguration::new(ImageReference::scratch())
        .with_application_layers_cache_dir(root.join("app-cache"))
        .with_base_image_layers_cache_dir(root.join("base-cache"))
}

/// Identical inputs must produce identical layer digests, independent of
/// the cache directory standing in for "a different machine".
#[test]
fn reproducible_classes_layer() {
    let workspace = tempfile::tempdir().unwrap();
    let class_file = workspace.path().join("Main.class");
    std::fs::write(&class_file, b"\xca\xfe\xba\xbe\x00\x00\x00\x37").unwrap();

    let entry = LayerEntry::new(&class_file, "/app/classes/Main.class")
        .with_mode(0o644)
        .with_modification_time(UNIX_EPOCH + Duration::from_secs(1));

    let build_on = |machine: &str| {
        let cache = Cache::new(workspace.path().join(machine)).unwrap();
        let mut builder = TarLayerBuilder::new();
        builder.add_entry(entry.clone());
        cache
            .put(None, builder.to_compressed_blob().as_ref())
            .unwrap()
    };

    let first = build_on("machine-a");
    let second = build_on("machine-b");
    assert_eq!(first.layer_digest, second.layer_digest);
    assert_eq!(first.diff_id, second.diff_id);
}

/// A populated selector lets a rebuild skip tar construction entirely:
/// the lookup stages nothing under tmp/.
#[test]
fn cache_hit_skips_work() {
    let workspace = tempfile::tempdir().unwrap();
    let artifact = workspace.path().join("app.jar");
    std::fs::write(&artifact, b"jarjarjar").unwrap();

    let cache = Cache::new(workspace.path().join("cache")).unwrap();
    let mut builder = TarLayerBuilder::new();
    builder.add_entry(LayerEntry::new(&artifact, "/app/app.jar"));
    let selector = builder.selector().unwrap();

    let stored = cache
        .put(Some(&selector), builder.to_compressed_blob().as_ref())
        .unwrap();
    cache.clean_tmp().unwrap();

    // Same entries hash to the same selector; the hit reads no blobs and
    // writes nothing.
    let mut rebuilt = TarLayerBuilder::new();
    rebuilt.add_entry(LayerEntry::new(&artifact, "/app/app.jar"));
    let hit = cache
        .get_by_selector(&rebuilt.selector().unwrap())
        .unwrap()
        .expect("selector must resolve to the stored layer");
    assert_eq!(hit.layer_digest, stored.layer_digest);

    let tmp_entries = std::fs::read_dir(workspace.path().join("cache/tmp"))
        .unwrap()
        .count();
    assert_eq!(tmp_entries, 0, "a cache hit must not touch tmp/");
}

/// A process killed between staging and publication leaves debris only in
/// tmp/: the next build misses the cache, succeeds anyway, and ends with a
/// clean scratch space.
#[tokio::test]
async fn crash_mid_cache_write_recovers() {
    let workspace = tempfile::tempdir().unwrap();
    let source = workspace.path().join("data.bin");
    std::fs::write(&source, b"layer payload").unwrap();

    let config = scratch_configuration(workspace.path());
    let app_tmp = workspace.path().join("app-cache/tmp");

    // First build populates the cache and tells us the real layer digest.
    let containerizer = Containerizer::new(config.clone()).unwrap();
    let plan = ContainerBuildPlan::new().with_layer(LayerSpec::new(
        "data",
        vec![LayerEntry::new(&source, "/data/data.bin")],
    ));
    let baseline = containerizer
        .containerize(&plan, &Sink::Tarball(workspace.path().join("a.tar")))
        .await
        .unwrap();

    // Simulate the crash: torn bytes staged but never renamed into place,
    // and the published entry gone.
    std::fs::remove_dir_all(workspace.path().join("app-cache/layers")).unwrap();
    std::fs::create_dir_all(workspace.path().join("app-cache/layers")).unwrap();
    std::fs::create_dir_all(app_tmp.join("interrupted")).unwrap();
    std::fs::write(app_tmp.join("interrupted/layer.partial"), b"torn").unwrap();

    let containerizer = Containerizer::new(config).unwrap();
    let rebuilt = containerizer
        .containerize(&plan, &Sink::Tarball(workspace.path().join("b.tar")))
        .await
        .unwrap();

    assert_eq!(rebuilt.image_digest, baseline.image_digest);
    assert_eq!(
        std::fs::read_dir(&app_tmp).unwrap().count(),
        0,
        "no files may remain in tmp/ after a successful build"
    );
}

/// Two concurrent builds over one shared cache produce exactly one
/// on-disk entry for the shared layer.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_builds_share_one_cache_entry() {
    let workspace = tempfile::tempdir().unwrap();
    let source = workspace.path().join("shared.bin");
    std::fs::write(&source, b"contended layer content").unwrap();

    let config = scratch_configuration(workspace.path());
    let plan = ContainerBuildPlan::new().with_layer(LayerSpec::new(
        "shared",
        vec![LayerEntry::new(&source, "/opt/shared.bin")],
    ));

    // One Containerizer, two simultaneous builds: the per-digest future
    // map coalesces the shared layer onto a single cache write.
    let containerizer = Containerizer::new(config).unwrap();
    let run = |n: usize| {
        let plan = plan.clone();
        let out = workspace.path().join(format!("out-{}.tar", n));
        let containerizer = &containerizer;
        async move {
            containerizer
                .containerize(&plan, &Sink::Tarball(out))
                .await
                .unwrap()
        }
    };

    let (a, b) = tokio::join!(run(1), run(2));
    assert_eq!(a.image_digest, b.image_digest);

    let layer_dirs = std::fs::read_dir(workspace.path().join("app-cache/layers"))
        .unwrap()
        .count();
    assert_eq!(layer_dirs, 1);
}
