//! Image layer extraction.
//!
//! Layers are applied one directory per layer so the snapshotter can stack
//! them with overlayfs. OCI whiteouts are therefore converted to their
//! overlayfs form instead of being applied by deleting files.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use imgvol_common::{Digest, ImgvolError, ImgvolResult};
use sha2::{Digest as _, Sha256};

/// Prefix OCI uses to mark a deleted path.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Marker file OCI uses for an opaque directory.
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

/// Layer blob compression, detected from magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Plain tar.
    None,
    /// gzip (`1f 8b`).
    Gzip,
    /// zstd (`28 b5 2f fd`).
    Zstd,
}

impl Compression {
    /// Detect compression from the first bytes of a blob.
    #[must_use]
    pub fn detect(header: &[u8]) -> Self {
        if header.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if header.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Self::Zstd
        } else {
            Self::None
        }
    }
}

/// Reader that hashes everything read through it.
struct DigestReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> DigestReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Drain the rest of the stream and return its digest.
    fn finish(mut self) -> io::Result<Digest> {
        io::copy(&mut self, &mut io::sink())?;
        Ok(Digest::from_sha256_bytes(&self.hasher.finalize()))
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Open a layer blob as an uncompressed tar stream.
///
/// # Errors
///
/// Returns an error if the blob cannot be opened or its decoder fails to start.
pub fn open_layer(blob: &Path) -> ImgvolResult<Box<dyn Read + Send>> {
    let mut header = [0u8; 4];
    let mut file = File::open(blob)?;
    let n = read_up_to(&mut file, &mut header)?;
    let file = File::open(blob)?;

    let reader: Box<dyn Read + Send> = match Compression::detect(&header[..n]) {
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(file)?),
        Compression::None => Box::new(file),
    };
    Ok(reader)
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Extract a layer blob into `dest`, verifying its uncompressed digest.
///
/// `dest` should be a fresh directory: on a digest mismatch its contents are
/// left for the caller to discard.
///
/// # Errors
///
/// Returns [`ImgvolError::DigestMismatch`] if the uncompressed stream does not
/// hash to `diff_id`, or an I/O error if extraction fails.
pub fn extract_layer(blob: &Path, dest: &Path, diff_id: &Digest) -> ImgvolResult<()> {
    tracing::debug!(blob = %blob.display(), dest = %dest.display(), %diff_id, "Extracting layer");

    fs::create_dir_all(dest)?;

    let mut archive = tar::Archive::new(DigestReader::new(open_layer(blob)?));
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(true);
    archive.set_overwrite(true);

    let mut whiteouts = 0usize;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        match path.file_name().and_then(|n| n.to_str()) {
            Some(WHITEOUT_OPAQUE) => {
                let dir = dir_beneath(dest, path.parent().unwrap_or_else(|| Path::new("")))?;
                mark_opaque(&dir)?;
                whiteouts += 1;
            }
            Some(name) if name.starts_with(WHITEOUT_PREFIX) => {
                let hidden = &name[WHITEOUT_PREFIX.len()..];
                if matches!(hidden, "" | "." | "..") {
                    return Err(invalid_entry(&path, "names no file"));
                }
                let parent = dir_beneath(dest, path.parent().unwrap_or_else(|| Path::new("")))?;
                make_whiteout(&parent.join(hidden))?;
                whiteouts += 1;
            }
            _ => {
                if !entry.unpack_in(dest)? {
                    return Err(invalid_entry(&path, "escapes the layer root"));
                }
            }
        }
    }

    let actual = archive.into_inner().finish()?;
    if &actual != diff_id {
        return Err(ImgvolError::DigestMismatch {
            expected: diff_id.to_string(),
            actual: actual.to_string(),
        });
    }

    tracing::debug!(dest = %dest.display(), whiteouts, "Layer extracted");
    Ok(())
}

/// Resolve the directory `path` beneath `root` one component at a time,
/// creating what is missing.
///
/// Earlier entries of the same layer may have planted symlinks, so every
/// component must be a real directory; nothing outside `root` is touched.
fn dir_beneath(root: &Path, path: &Path) -> ImgvolResult<PathBuf> {
    let mut dir = root.to_path_buf();
    for component in path.components() {
        match component {
            Component::Normal(part) => dir.push(part),
            Component::CurDir => continue,
            _ => return Err(invalid_entry(path, "escapes the layer root")),
        }
        match fs::symlink_metadata(&dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(invalid_entry(path, "passes through a symlink"));
            }
            Ok(_) => return Err(invalid_entry(path, "passes through a non-directory")),
            Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir(&dir)?,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(dir)
}

fn invalid_entry(path: &Path, reason: &str) -> ImgvolError {
    ImgvolError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("layer entry {} {reason}", path.display()),
    ))
}

/// Represent a deleted path as an overlayfs whiteout (a 0/0 character device).
#[cfg(target_os = "linux")]
fn make_whiteout(path: &Path) -> ImgvolResult<()> {
    use rustix::fs::{CWD, FileType, Mode, makedev, mknodat};

    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    mknodat(CWD, path, FileType::CharacterDevice, Mode::empty(), makedev(0, 0))
        .map_err(|e| ImgvolError::Io(e.into()))
}

#[cfg(not(target_os = "linux"))]
fn make_whiteout(_path: &Path) -> ImgvolResult<()> {
    Err(ImgvolError::Unsupported {
        feature: "overlay whiteouts".to_string(),
    })
}

/// Mark a directory opaque so lower layers do not show through it.
#[cfg(target_os = "linux")]
fn mark_opaque(dir: &Path) -> ImgvolResult<()> {
    use rustix::fs::{XattrFlags, setxattr};

    setxattr(dir, "trusted.overlay.opaque", b"y", XattrFlags::empty())
        .map_err(|e| ImgvolError::Io(e.into()))
}

#[cfg(not(target_os = "linux"))]
fn mark_opaque(_dir: &Path) -> ImgvolResult<()> {
    Err(ImgvolError::Unsupported {
        feature: "overlay opaque directories".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tar_with(files: &[(&str, &[u8])]) -> Vec<u8> {
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

    fn sha256(data: &[u8]) -> Digest {
        Digest::from_sha256_bytes(&Sha256::digest(data))
    }

    #[test]
    fn compression_detection() {
        assert_eq!(Compression::detect(&[0x1f, 0x8b, 0x08]), Compression::Gzip);
        assert_eq!(
            Compression::detect(&[0x28, 0xb5, 0x2f, 0xfd]),
            Compression::Zstd
        );
        assert_eq!(Compression::detect(b"usta"), Compression::None);
        assert_eq!(Compression::detect(&[]), Compression::None);
    }

    #[test]
    fn extracts_plain_tar() {
        let temp = tempfile::tempdir().unwrap();
        let tar = tar_with(&[("etc/hostname", b"pause\n")]);
        let blob = temp.path().join("blob");
        fs::write(&blob, &tar).unwrap();

        let dest = temp.path().join("layer");
        extract_layer(&blob, &dest, &sha256(&tar)).unwrap();

        assert_eq!(fs::read(dest.join("etc/hostname")).unwrap(), b"pause\n");
    }

    #[test]
    fn extracts_gzip_tar() {
        use flate2::{Compression as Level, write::GzEncoder};
        use std::io::Write;

        let temp = tempfile::tempdir().unwrap();
        let tar = tar_with(&[("bin/tool", b"#!/bin/sh\n")]);
        let mut encoder = GzEncoder::new(Vec::new(), Level::default());
        encoder.write_all(&tar).unwrap();
        let blob = temp.path().join("blob.gz");
        fs::write(&blob, encoder.finish().unwrap()).unwrap();

        let dest = temp.path().join("layer");
        extract_layer(&blob, &dest, &sha256(&tar)).unwrap();

        assert!(dest.join("bin/tool").is_file());
    }

    #[test]
    fn rejects_wrong_diff_id() {
        let temp = tempfile::tempdir().unwrap();
        let tar = tar_with(&[("a", b"a")]);
        let blob = temp.path().join("blob");
        fs::write(&blob, &tar).unwrap();

        let err = extract_layer(&blob, &temp.path().join("layer"), &sha256(b"other")).unwrap_err();
        assert!(matches!(err, ImgvolError::DigestMismatch { .. }));
    }

    #[test]
    fn dir_beneath_creates_and_refuses_escapes() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("layer");
        fs::create_dir(&root).unwrap();

        let dir = dir_beneath(&root, Path::new("./usr/share")).unwrap();
        assert_eq!(dir, root.join("usr/share"));
        assert!(dir.is_dir());

        fs::write(root.join("file"), b"x").unwrap();
        assert!(dir_beneath(&root, Path::new("file/sub")).is_err());
        assert!(dir_beneath(&root, Path::new("../escape")).is_err());
        assert!(dir_beneath(&root, Path::new("/abs")).is_err());
    }

    #[cfg(unix)]
    fn tar_with_symlink(link: &str, target: &Path, marker: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder.append_link(&mut header, link, target).unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{link}/{marker}"), io::empty())
            .unwrap();
        builder.into_inner().unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn whiteout_does_not_follow_symlinks_out_of_the_layer() {
        let temp = tempfile::tempdir().unwrap();
        let outside = temp.path().join("outside");
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("victim"), b"keep me").unwrap();

        let tar = tar_with_symlink("link", &outside, ".wh.victim");
        let blob = temp.path().join("blob");
        fs::write(&blob, &tar).unwrap();

        let err = extract_layer(&blob, &temp.path().join("layer"), &sha256(&tar)).unwrap_err();
        assert!(err.to_string().contains("symlink"), "{err}");
        assert_eq!(fs::read(outside.join("victim")).unwrap(), b"keep me");
    }

    #[cfg(unix)]
    #[test]
    fn opaque_marker_does_not_follow_symlinks_out_of_the_layer() {
        let temp = tempfile::tempdir().unwrap();
        let outside = temp.path().join("outside");
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("kept"), b"keep me").unwrap();

        let tar = tar_with_symlink("link", &outside, WHITEOUT_OPAQUE);
        let blob = temp.path().join("blob");
        fs::write(&blob, &tar).unwrap();

        let err = extract_layer(&blob, &temp.path().join("layer"), &sha256(&tar)).unwrap_err();
        assert!(err.to_string().contains("symlink"), "{err}");
        assert_eq!(fs::read_dir(&outside).unwrap().count(), 1);
        assert_eq!(fs::read(outside.join("kept")).unwrap(), b"keep me");
    }

    #[test]
    fn whiteout_without_a_name_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let tar = tar_with(&[("etc/.wh..", b"")]);
        let blob = temp.path().join("blob");
        fs::write(&blob, &tar).unwrap();

        let err = extract_layer(&blob, &temp.path().join("layer"), &sha256(&tar)).unwrap_err();
        assert!(err.to_string().contains("names no file"), "{err}");
    }
}
