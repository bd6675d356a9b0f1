//! Zip-container backup and restore. A backup bundles a manifest of volume
//! specifications, each volume's current pages (the volume file already
//! holds them in ascending address order, so a verbatim copy satisfies that
//! requirement directly), and the journal generation files needed to replay
//! whatever transactions were still live when the backup was taken.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::config::EngineConfig;
use crate::db::engine::Engine;
use crate::error::{Error, Result};

/// Flags matching the CLI's `backup` task: `-z` (compress), `-c` (checksum),
/// `-y` (concurrent — do not checkpoint first, accept an in-flight-consistent
/// rather than point-in-time-consistent snapshot).
#[derive(Clone, Copy, Debug, Default)]
pub struct BackupOptions {
    pub compress: bool,
    pub checksum: bool,
    pub concurrent: bool,
}

/// Flags for [`restore`]: `-y` mirrors the backup-side flag and is accepted
/// for symmetry but has no effect on restore itself, which is always a cold
/// reconstruction into an empty data directory.
#[derive(Clone, Copy, Debug, Default)]
pub struct RestoreOptions {
    pub checksum: bool,
}

#[derive(Serialize, Deserialize)]
struct Manifest {
    volumes: Vec<ManifestVolume>,
    /// CRC32 over every volume's bytes, concatenated in manifest order, when
    /// `-c` was requested.
    checksum: Option<u32>,
}

#[derive(Serialize, Deserialize)]
struct ManifestVolume {
    name: String,
    file_entry: String,
    page_size: u32,
    initial_pages: u64,
    maximum_pages: u64,
    extension_pages: u64,
}

/// Writes a backup of every volume currently open on `engine` to `dest`.
pub fn backup(engine: &Engine, dest: &Path, options: BackupOptions) -> Result<()> {
    if !options.concurrent {
        engine.checkpoint()?;
    }

    let file = File::create(dest)?;
    let method = if options.compress {
        CompressionMethod::Deflated
    } else {
        CompressionMethod::Stored
    };
    let file_options: FileOptions<()> = FileOptions::default().compression_method(method);
    let mut zip = ZipWriter::new(file);

    let mut manifest = Manifest { volumes: Vec::new(), checksum: None };
    let mut digest = crc32fast::Hasher::new();

    for volume_id in engine.volume_ids() {
        let spec = engine.volume_spec(volume_id)?;
        let path = engine.volume_path(volume_id)?;
        let entry = format!("volumes/{}.vol", spec.name);
        let bytes = fs::read(&path)?;
        if options.checksum {
            digest.update(&bytes);
        }
        zip_write(&mut zip, &entry, file_options, &bytes)?;
        manifest.volumes.push(ManifestVolume {
            name: spec.name.clone(),
            file_entry: entry,
            page_size: spec.page_size,
            initial_pages: spec.initial_pages,
            maximum_pages: spec.maximum_pages,
            extension_pages: spec.extension_pages,
        });
    }

    if options.checksum {
        manifest.checksum = Some(digest.finalize());
    }

    for (entry_name, bytes) in journal_tail(engine)? {
        zip_write(&mut zip, &format!("journal/{entry_name}"), file_options, &bytes)?;
    }

    let manifest_bytes = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| Error::Fatal(format!("backup manifest encode failed: {e}")))?;
    zip_write(&mut zip, "manifest.json", file_options, &manifest_bytes)?;

    zip.finish().map_err(zip_err)?;
    info!(path = %dest.display(), volumes = manifest.volumes.len(), "backup.complete");
    Ok(())
}

fn zip_write(
    zip: &mut ZipWriter<File>,
    name: &str,
    options: FileOptions<()>,
    bytes: &[u8],
) -> Result<()> {
    zip.start_file(name, options).map_err(zip_err)?;
    zip.write_all(bytes)?;
    Ok(())
}

fn zip_err(err: zip::result::ZipError) -> Error {
    Error::Fatal(format!("zip container error: {err}"))
}

fn journal_tail(engine: &Engine) -> Result<Vec<(String, Vec<u8>)>> {
    let dir = engine.journal_dir();
    let prefix = &engine.config().journal_prefix;
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return Ok(out);
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(prefix.as_str()) {
            continue;
        }
        out.push((name.to_string(), fs::read(entry.path())?));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Reconstructs volumes and journal files from `archive` into `data_path` and
/// `journal_path`, returning an `EngineConfig` ready to be handed to
/// [`Engine::open`]. The destination directories must be empty; restore never
/// merges into an existing database.
pub fn restore(
    archive: &Path,
    data_path: &Path,
    journal_path: &Path,
    options: RestoreOptions,
) -> Result<EngineConfig> {
    fs::create_dir_all(data_path)?;
    fs::create_dir_all(journal_path)?;

    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(file).map_err(zip_err)?;

    let manifest: Manifest = {
        let mut entry = zip.by_name("manifest.json").map_err(zip_err)?;
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        serde_json::from_slice(&bytes).map_err(|e| Error::CorruptVolume(format!("backup manifest decode failed: {e}")))?
    };

    let mut digest = crc32fast::Hasher::new();
    let mut volume_specs = Vec::new();

    for volume in &manifest.volumes {
        let mut entry = zip.by_name(&volume.file_entry).map_err(zip_err)?;
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        if options.checksum {
            digest.update(&bytes);
        }
        let dest = data_path.join(format!("{}.vol", volume.name));
        fs::write(&dest, &bytes)?;

        let initial_bytes = volume.initial_pages * volume.page_size as u64;
        let maximum_bytes = volume.maximum_pages * volume.page_size as u64;
        let extension_bytes = volume.extension_pages * volume.page_size as u64;
        volume_specs.push(format!(
            "{},name:{},pageSize:{},initialSize:{},maximumSize:{},extensionSize:{}",
            dest.display(),
            volume.name,
            volume.page_size,
            initial_bytes,
            maximum_bytes,
            extension_bytes,
        ));
    }

    if options.checksum {
        let expected = manifest.checksum.ok_or_else(|| {
            Error::CorruptVolume("backup requested checksum verification but manifest has none".into())
        })?;
        if digest.finalize() != expected {
            return Err(Error::CorruptVolume("backup checksum mismatch".into()));
        }
    }

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(zip_err)?;
        let name = entry.name().to_string();
        let Some(file_name) = name.strip_prefix("journal/") else { continue };
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        fs::write(journal_path.join(file_name), bytes)?;
    }

    Ok(EngineConfig {
        data_path: data_path.to_path_buf(),
        journal_path: journal_path.to_path_buf(),
        volume_specs,
        ..EngineConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{Key, Segment};
    use crate::db::transaction::Transaction;
    use tempfile::tempdir;

    fn test_engine(dir: &Path) -> std::sync::Arc<Engine> {
        let volume_path = dir.join("vtest.v01");
        let mut config = EngineConfig::durable();
        config.data_path = dir.to_path_buf();
        config.journal_path = dir.join("journal");
        config.volume_specs = vec![format!("{},create,pageSize:4096", volume_path.display())];
        Engine::open(config).unwrap()
    }

    #[test]
    fn backup_then_restore_preserves_committed_keys() {
        let src_dir = tempdir().unwrap();
        let engine = test_engine(src_dir.path());
        let volume = engine.volume_ids()[0];

        let txn = Transaction::begin(engine.clone(), volume).unwrap();
        let ex = txn.exchange("widgets", true).unwrap();
        ex.store(Key::encode(&[Segment::Str("a".into())]), b"1".to_vec()).unwrap();
        ex.store(Key::encode(&[Segment::Str("b".into())]), b"2".to_vec()).unwrap();
        txn.commit().unwrap();

        let archive_path = src_dir.path().join("out.zip");
        backup(&engine, &archive_path, BackupOptions { compress: true, checksum: true, concurrent: false }).unwrap();
        engine.shutdown();

        let dest_dir = tempdir().unwrap();
        let restored_config = restore(
            &archive_path,
            &dest_dir.path().join("data"),
            &dest_dir.path().join("journal"),
            RestoreOptions { checksum: true },
        )
        .unwrap();

        let restored = Engine::open(restored_config).unwrap();
        let restored_volume = restored.volume_ids()[0];
        let txn2 = Transaction::begin(restored.clone(), restored_volume).unwrap();
        let ex2 = txn2.exchange("widgets", false).unwrap();
        assert_eq!(ex2.fetch(&Key::encode(&[Segment::Str("a".into())])).unwrap(), Some(b"1".to_vec()));
        assert_eq!(ex2.fetch(&Key::encode(&[Segment::Str("b".into())])).unwrap(), Some(b"2".to_vec()));
        txn2.commit().unwrap();
    }
}
