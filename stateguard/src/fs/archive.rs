//! zstd-compressed tar archives for volume and configuration artifacts.
//!
//! Archives are written to a `.partial` sibling and renamed into place only
//! once complete, so an interrupted run never leaves a truncated artifact
//! under its final name. Long-running jobs take an optional
//! [`CancellationToken`]; once it fires they stop between entries and never
//! publish their output.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const ZSTD_LEVEL: i32 = 3;

/// Scratch directory used inside a volume while it is being restored; never archived.
pub const STAGING_DIR: &str = ".stateguard-restore";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    /// Allow-listed entries that were archived
    pub included: Vec<PathBuf>,
    /// Allow-listed entries that did not exist and were skipped
    pub skipped: Vec<PathBuf>,
}

/// Archive the whole contents of `root` (not the directory itself).
pub fn archive_directory(root: &Path, dest: &Path, cancel: Option<&CancellationToken>) -> io::Result<()> {
    if !root.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", root.display()),
        ));
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(root)? {
        let name = entry?.file_name();
        if name.to_str() != Some(STAGING_DIR) {
            entries.push(PathBuf::from(name));
        }
    }
    entries.sort();
    write_paths(root, &entries, dest, cancel).map(|_| ())
}

/// Archive only the listed paths (relative to `root`). Missing entries are
/// skipped and reported, not fatal.
pub fn archive_paths(root: &Path, entries: &[PathBuf], dest: &Path) -> io::Result<ArchiveStats> {
    write_paths(root, entries, dest, None)
}

fn write_paths(
    root: &Path,
    entries: &[PathBuf],
    dest: &Path,
    cancel: Option<&CancellationToken>,
) -> io::Result<ArchiveStats> {
    let mut stats = ArchiveStats::default();

    write_atomically(dest, cancel, |builder| {
        for rel in entries {
            abandoned(cancel)?;
            let abs = root.join(rel);
            let metadata = match fs::symlink_metadata(&abs) {
                Ok(m) => m,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("Skipping missing path {}", abs.display());
                    stats.skipped.push(rel.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };

            if metadata.is_dir() {
                builder.append_dir_all(rel, &abs)?;
            } else {
                builder.append_path_with_name(&abs, rel)?;
            }
            stats.included.push(rel.clone());
        }
        Ok(())
    })?;

    Ok(stats)
}

/// Unpack an archive under `dest`. Entries that would land outside `dest`
/// are refused by the tar reader.
pub fn extract_archive(archive: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    let decoder = zstd::stream::read::Decoder::new(BufReader::new(File::open(archive)?))?;
    let mut reader = tar::Archive::new(decoder);
    reader.set_preserve_permissions(true);
    reader.set_overwrite(true);
    reader.unpack(dest)
}

/// Top-level path of every entry in the archive, normalised without `./`.
pub fn list_entries(archive: &Path) -> io::Result<Vec<PathBuf>> {
    let decoder = zstd::stream::read::Decoder::new(BufReader::new(File::open(archive)?))?;
    let mut reader = tar::Archive::new(decoder);
    let mut paths = Vec::new();
    for entry in reader.entries()? {
        let entry = entry?;
        let path: PathBuf = entry
            .path()?
            .components()
            .filter(|c| !matches!(c, std::path::Component::CurDir))
            .collect();
        if !path.as_os_str().is_empty() {
            paths.push(path);
        }
    }
    Ok(paths)
}

/// Compress a plain file with zstd. The source is removed afterwards,
/// whether or not the compressed file was published.
pub fn compress_file(src: &Path, dest: &Path, cancel: Option<&CancellationToken>) -> io::Result<()> {
    let partial = partial_path(dest);
    let result = (|| -> io::Result<()> {
        let mut input = BufReader::new(File::open(src)?);
        let output = BufWriter::new(File::create(&partial)?);
        let mut encoder = zstd::stream::write::Encoder::new(output, ZSTD_LEVEL)?;
        io::copy(&mut input, &mut encoder)?;
        let mut output = encoder.finish()?;
        output.flush()?;
        output.get_ref().sync_all()?;
        Ok(())
    })();
    let published = finish(result, &partial, dest, cancel);
    let removed = fs::remove_file(src);
    published.and(removed)
}

/// Decompress a zstd file to `dest`.
pub fn decompress_file(src: &Path, dest: &Path) -> io::Result<()> {
    let mut decoder = zstd::stream::read::Decoder::new(BufReader::new(File::open(src)?))?;
    let mut output = BufWriter::new(File::create(dest)?);
    io::copy(&mut decoder, &mut output)?;
    output.flush()
}

fn write_atomically<F>(dest: &Path, cancel: Option<&CancellationToken>, fill: F) -> io::Result<()>
where
    F: FnOnce(&mut tar::Builder<zstd::stream::write::Encoder<'static, BufWriter<File>>>) -> io::Result<()>,
{
    let partial = partial_path(dest);
    let result = (|| -> io::Result<()> {
        let file = BufWriter::new(File::create(&partial)?);
        let encoder = zstd::stream::write::Encoder::new(file, ZSTD_LEVEL)?;
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        fill(&mut builder)?;
        let encoder = builder.into_inner()?;
        let mut file = encoder.finish()?;
        file.flush()?;
        file.get_ref().sync_all()?;
        Ok(())
    })();
    finish(result, &partial, dest, cancel)
}

fn finish(
    result: io::Result<()>,
    partial: &Path,
    dest: &Path,
    cancel: Option<&CancellationToken>,
) -> io::Result<()> {
    if let Err(e) = result.and_then(|()| abandoned(cancel)) {
        let _ = fs::remove_file(partial);
        return Err(e);
    }
    fs::rename(partial, dest)?;
    // A cancel that raced the rename still must not leave the output behind
    if let Err(e) = abandoned(cancel) {
        let _ = fs::remove_file(dest);
        return Err(e);
    }
    Ok(())
}

fn abandoned(cancel: Option<&CancellationToken>) -> io::Result<()> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "archive job abandoned",
        )),
        _ => Ok(()),
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_archive_paths_skips_missing_and_excludes_unlisted() -> io::Result<()> {
        let temp = TempDir::new()?;
        let root = temp.path().join("app");
        fs::create_dir_all(root.join("nginx/conf.d"))?;
        fs::write(root.join("docker-compose.yml"), b"services: {}")?;
        fs::write(root.join("nginx/conf.d/site.conf"), b"server {}")?;
        fs::write(root.join(".env"), b"SECRET=1")?;

        let dest = temp.path().join("config.tar.zst");
        let stats = archive_paths(
            &root,
            &[
                PathBuf::from("docker-compose.yml"),
                PathBuf::from("nginx"),
                PathBuf::from("traefik.yml"),
            ],
            &dest,
        )?;

        assert_eq!(stats.skipped, vec![PathBuf::from("traefik.yml")]);
        assert_eq!(stats.included.len(), 2);
        assert!(!partial_path(&dest).exists());

        let entries = list_entries(&dest)?;
        assert!(entries.contains(&PathBuf::from("docker-compose.yml")));
        assert!(entries.contains(&PathBuf::from("nginx/conf.d/site.conf")));
        assert!(!entries.iter().any(|p| p.ends_with(".env")));
        Ok(())
    }

    #[test]
    fn test_directory_archive_extracts_identically() -> io::Result<()> {
        let temp = TempDir::new()?;
        let volume = temp.path().join("volume");
        fs::create_dir_all(volume.join("uploads/2026"))?;
        fs::write(volume.join("uploads/2026/cert.pdf"), vec![9u8; 4096])?;
        fs::write(volume.join("index.html"), b"<html/>")?;

        let dest = temp.path().join("files.tar.zst");
        archive_directory(&volume, &dest, None)?;

        let out = temp.path().join("restored");
        extract_archive(&dest, &out)?;
        assert_eq!(fs::read(out.join("uploads/2026/cert.pdf"))?, vec![9u8; 4096]);
        assert_eq!(fs::read(out.join("index.html"))?, b"<html/>");
        Ok(())
    }

    #[test]
    fn test_archive_of_missing_directory_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("files.tar.zst");
        assert!(archive_directory(&temp.path().join("absent"), &dest, None).is_err());
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn test_cancelled_jobs_publish_nothing() -> io::Result<()> {
        let temp = TempDir::new()?;
        let volume = temp.path().join("volume");
        fs::create_dir_all(&volume)?;
        fs::write(volume.join("a.txt"), b"data")?;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let dest = temp.path().join("files.tar.zst");
        let err = archive_directory(&volume, &dest, Some(&cancel)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());

        let raw = temp.path().join("files.tar");
        fs::write(&raw, vec![3u8; 512])?;
        assert!(compress_file(&raw, &dest, Some(&cancel)).is_err());
        assert!(!dest.exists());
        assert!(!raw.exists());
        Ok(())
    }

    #[test]
    fn test_compress_roundtrip_removes_source() -> io::Result<()> {
        let temp = TempDir::new()?;
        let raw = temp.path().join("files.tar");
        fs::write(&raw, vec![1u8; 10_000])?;

        let packed = temp.path().join("files.tar.zst");
        compress_file(&raw, &packed, None)?;
        assert!(!raw.exists());

        let unpacked = temp.path().join("out.tar");
        decompress_file(&packed, &unpacked)?;
        assert_eq!(fs::read(unpacked)?, vec![1u8; 10_000]);
        Ok(())
    }
}
