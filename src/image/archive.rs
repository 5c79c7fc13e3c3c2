//! The `docker load` archive format
//!
//! A single tar containing the container config named by its digest, one
//! gzip-compressed layer file per layer named by its layer digest, and a
//! `manifest.json` tying them to repo tags. The same archive serves the
//! daemon sink (streamed into `docker load`) and the tarball sink (written
//! to a path); entries are emitted in a fixed order with pinned header
//! fields so the output is reproducible.

use std::fs::File;
use std::io::Write;

use serde::{Deserialize, Serialize};
use tar::{EntryType, Header};

use crate::cache::CachedLayer;
use crate::digest::Digest;
use crate::error::Result;

/// The single element of the archive's `manifest.json` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveManifestEntry {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags")]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

fn config_file_name(digest: &Digest) -> String {
    format!("{}.json", digest.hex())
}

fn layer_file_name(digest: &Digest) -> String {
    format!("{}.tar.gz", digest.hex())
}

fn entry_header(size: u64) -> Header {
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

/// Write the archive: config first, then layers in apply order, then
/// `manifest.json`.
pub fn write_archive<W: Write>(
    out: W,
    config_bytes: &[u8],
    config_digest: &Digest,
    repo_tags: &[String],
    layers: &[CachedLayer],
) -> Result<()> {
    let mut builder = tar::Builder::new(out);

    let config_name = config_file_name(config_digest);
    let mut header = entry_header(config_bytes.len() as u64);
    header.set_path(&config_name)?;
    header.set_cksum();
    builder.append(&header, config_bytes)?;

    let mut layer_names = Vec::with_capacity(layers.len());
    for layer in layers {
        let name = layer_file_name(&layer.layer_digest);
        let mut header = entry_header(layer.size);
        header.set_path(&name)?;
        header.set_cksum();
        let mut file = File::open(&layer.path)?;
        builder.append(&header, &mut file)?;
        layer_names.push(name);
    }

    let manifest = vec![ArchiveManifestEntry {
        config: config_name,
        repo_tags: repo_tags.to_vec(),
        layers: layer_names,
    }];
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let mut header = entry_header(manifest_bytes.len() as u64);
    header.set_path("manifest.json")?;
    header.set_cksum();
    builder.append(&header, manifest_bytes.as_slice())?;

    let mut out = builder.into_inner()?;
    out.flush()?;
    Ok(())
}
