//! `tar.gz` packing and unpacking of a single collection.
//!
//! Archive entries are laid out as `<collection>/<id>.json`.

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{StoreError, StoreResult};
use crate::file_store::{validate_key, RECORD_EXTENSION};

/// Pack the given record ids of `collection` (stored in `dir`) into `archive_path`.
pub(crate) fn write_collection(
    archive_path: &Path,
    collection: &str,
    dir: &Path,
    ids: &[String],
) -> StoreResult<()> {
    let file = File::create(archive_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for id in ids {
        let name = format!("{id}.{RECORD_EXTENSION}");
        builder.append_path_with_name(dir.join(&name), Path::new(collection).join(&name))?;
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(())
}

/// Read every record of `collection` from `archive_path`.
///
/// Fails on any entry that is not a regular `<collection>/<id>.json` file.
pub(crate) fn read_collection(
    archive_path: &Path,
    collection: &str,
) -> StoreResult<Vec<(String, Vec<u8>)>> {
    let file = File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut records = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            continue;
        }
        if !entry_type.is_file() {
            return Err(StoreError::Archive(format!(
                "unsupported entry type {:?}",
                entry_type
            )));
        }

        let path = entry.path()?.into_owned();
        let id = record_id_for(&path, collection)?;
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        records.push((id, bytes));
    }

    records.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(records)
}

fn record_id_for(path: &Path, collection: &str) -> StoreResult<String> {
    let parts: Vec<&str> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();
    let clean = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));

    let (dir, file) = match parts.as_slice() {
        [dir, file] if clean => (*dir, *file),
        _ => {
            return Err(StoreError::Archive(format!(
                "unexpected entry path {}",
                path.display()
            )))
        }
    };
    if dir != collection {
        return Err(StoreError::Archive(format!(
            "entry {} does not belong to collection '{collection}'",
            path.display()
        )));
    }

    let id = file
        .strip_suffix(&format!(".{RECORD_EXTENSION}"))
        .ok_or_else(|| StoreError::Archive(format!("entry {file} is not a record")))?;
    validate_key(id).map_err(|e| StoreError::Archive(e.to_string()))?;
    Ok(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_for_accepts_layout() {
        let id = record_id_for(Path::new("patterns/abc.json"), "patterns").unwrap();
        assert_eq!(id, "abc");
    }

    #[test]
    fn test_record_id_for_rejects_other_collection() {
        let err = record_id_for(Path::new("fixes/abc.json"), "patterns").unwrap_err();
        assert!(matches!(err, StoreError::Archive(_)));
    }

    #[test]
    fn test_record_id_for_rejects_traversal_and_depth() {
        assert!(record_id_for(Path::new("../patterns/abc.json"), "patterns").is_err());
        assert!(record_id_for(Path::new("patterns/x/abc.json"), "patterns").is_err());
        assert!(record_id_for(Path::new("patterns/abc.txt"), "patterns").is_err());
    }

    #[test]
    fn test_pack_unpack() {
        let dir = tempfile::tempdir().unwrap();
        let col = dir.path().join("patterns");
        std::fs::create_dir_all(&col).unwrap();
        std::fs::write(col.join("a.json"), b"{\"v\":1}").unwrap();
        std::fs::write(col.join("b.json"), b"{\"v\":2}").unwrap();

        let archive = dir.path().join("out.tar.gz");
        write_collection(
            &archive,
            "patterns",
            &col,
            &["a".to_string(), "b".to_string()],
        )
        .unwrap();

        let records = read_collection(&archive, "patterns").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, "a");
        assert_eq!(records[1].1, b"{\"v\":2}");
    }
}
