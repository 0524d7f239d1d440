//! Per-job manifest merge. Scans a job's package directory for
//! `*.mmpack-manifest` YAML documents and merges them into one.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::errors::{JobResult, SchedulerError};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    name: String,
    source: String,
    version: String,
    binpkgs: BTreeMap<String, Value>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

/// Scans `pkgdir` for `*.mmpack-manifest` files and merges them into a
/// single document, writing it to `<pkgdir>/<name>_<version>.mmpack-manifest`
/// and returning that path.
///
/// The first-seen manifest (directory iteration order) seeds the merged
/// document; every subsequent manifest's `(name, source, version)` must
/// match the seed's, or the merge fails with
/// `SchedulerError::ManifestInconsistency`. `binpkgs` mappings are merged
/// by key union, later values overwriting earlier ones on duplicate keys.
pub fn merge_manifests(pkgdir: &Path) -> JobResult<String> {
    let mut entries: Vec<_> = fs::read_dir(pkgdir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "mmpack-manifest").unwrap_or(false))
        .collect();
    entries.sort();

    let mut merged: Option<Manifest> = None;
    for path in &entries {
        let text = fs::read_to_string(path)?;
        let elt: Manifest = serde_yaml::from_str(&text)?;

        match &mut merged {
            None => merged = Some(elt),
            Some(seed) => {
                if (seed.name.as_str(), seed.source.as_str(), seed.version.as_str())
                    != (elt.name.as_str(), elt.source.as_str(), elt.version.as_str())
                {
                    return Err(SchedulerError::ManifestInconsistency);
                }
                for (arch, pkg) in elt.binpkgs {
                    seed.binpkgs.insert(arch, pkg);
                }
            }
        }
    }

    let merged = merged.ok_or_else(|| SchedulerError::new("no manifest found in package directory"))?;

    let filename = pkgdir.join(format!("{}_{}.mmpack-manifest", merged.name, merged.version));
    let text = serde_yaml::to_string(&merged)?;
    fs::write(&filename, text.replace("\r\n", "\n"))?;

    Ok(filename.to_string_lossy().into_owned())
}
