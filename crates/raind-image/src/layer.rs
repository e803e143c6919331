//! Layer verification and extraction.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use raind_common::{RaindError, RaindResult};
use sha2::{Digest, Sha256};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// `sha256:<hex>` digest of `data`.
#[must_use]
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Fail unless `actual` equals `expected`.
///
/// # Errors
///
/// Returns [`RaindError::DigestMismatch`] on mismatch.
pub fn verify_digest(expected: &str, actual: &str) -> RaindResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(RaindError::DigestMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

/// Apply a layer tarball (plain, gzip or zstd) on top of `rootfs`.
///
/// Whiteout entries delete the path they shadow; opaque whiteouts clear the
/// directory before the layer's own entries are written.
///
/// # Errors
///
/// Returns I/O errors from decompression or unpacking.
pub fn apply_layer(blob: &Path, rootfs: &Path) -> RaindResult<()> {
    tracing::debug!(blob = %blob.display(), rootfs = %rootfs.display(), "Applying layer");
    fs::create_dir_all(rootfs)?;

    let mut magic = [0u8; 4];
    let read = fs::File::open(blob)?.read(&mut magic)?;
    let file = fs::File::open(blob)?;

    // Detect compression
    let reader: Box<dyn Read> = if read >= 2 && magic.starts_with(&[0x1f, 0x8b]) {
        Box::new(flate2::read::GzDecoder::new(file))
    } else if read == 4 && magic == [0x28, 0xb5, 0x2f, 0xfd] {
        Box::new(zstd::stream::read::Decoder::new(file)?)
    } else {
        Box::new(file)
    };

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(relative) = sanitize(&path) else {
            tracing::warn!(path = %path.display(), "Skipping layer entry outside rootfs");
            continue;
        };

        let file_name = relative
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parent = rootfs.join(relative.parent().unwrap_or_else(|| Path::new("")));

        if file_name == OPAQUE_WHITEOUT {
            clear_dir(&parent)?;
            continue;
        }
        if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            remove_path(&parent.join(hidden))?;
            continue;
        }

        entry.unpack_in(rootfs)?;
    }
    Ok(())
}

fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

fn clear_dir(dir: &Path) -> RaindResult<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        remove_path(&entry?.path())?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> RaindResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    fn tarball(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn digest_helpers() {
        let digest = sha256_digest(b"hello");
        assert_eq!(
            digest,
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(verify_digest(&digest, &digest).is_ok());
        assert!(matches!(
            verify_digest(&digest, "sha256:00"),
            Err(RaindError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn layers_stack_with_whiteouts() {
        let temp = tempfile::tempdir().unwrap();
        let rootfs = temp.path().join("rootfs");

        let base = temp.path().join("base.tar.gz");
        fs::write(
            &base,
            gzip(&tarball(&[
                ("etc/os-release", b"base"),
                ("etc/motd", b"hi"),
                ("var/cache/a", b"a"),
            ])),
        )
        .unwrap();
        let top = temp.path().join("top.tar");
        fs::write(
            &top,
            tarball(&[
                ("etc/.wh.motd", b""),
                ("var/cache/.wh..wh..opq", b""),
                ("etc/os-release", b"top"),
            ]),
        )
        .unwrap();

        apply_layer(&base, &rootfs).unwrap();
        apply_layer(&top, &rootfs).unwrap();

        assert_eq!(fs::read(rootfs.join("etc/os-release")).unwrap(), b"top");
        assert!(!rootfs.join("etc/motd").exists());
        assert!(!rootfs.join("var/cache/a").exists());
        assert!(rootfs.join("var/cache").exists());
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert_eq!(sanitize(Path::new("./a/b")), Some(PathBuf::from("a/b")));
        assert_eq!(sanitize(Path::new("../etc/passwd")), None);
    }
}
