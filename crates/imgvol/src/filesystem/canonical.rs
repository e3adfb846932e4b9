//! Canonical path forms.
//!
//! Image volume targets double as lease ids and snapshot keys, so every
//! spelling of a target must reduce to the same string before it is used
//! as a key.

use std::path::{Component, Path, PathBuf};

use imgvol_common::ImgvolResult;

/// Lexically clean a path: drop `.` components and collapse `..` against
/// the preceding component. Never touches the filesystem.
#[must_use]
pub fn clean(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            _ => out.push(component),
        }
    }

    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}

/// Reduce `path` to its canonical form.
///
/// On Windows this also resolves short (8.3) names to their long form and
/// strips the verbatim `\\?\` prefix. The deepest existing ancestor is
/// resolved and the rest is joined back on, so a target gets the same form
/// before and after its directory is created.
///
/// # Errors
///
/// Returns an error if an existing ancestor cannot be resolved.
#[cfg(windows)]
pub fn canonicalize(path: &Path) -> ImgvolResult<PathBuf> {
    resolve_existing_prefix(&clean(path), |p| {
        std::fs::canonicalize(p).map(|resolved| strip_verbatim(&resolved))
    })
}

/// Resolve the longest prefix of `path` that `resolve` accepts, then append
/// the remaining components unchanged.
#[cfg(any(windows, test))]
fn resolve_existing_prefix(
    path: &Path,
    resolve: impl Fn(&Path) -> std::io::Result<PathBuf>,
) -> ImgvolResult<PathBuf> {
    let mut missing = Vec::new();
    let mut prefix = path;
    loop {
        match resolve(prefix) {
            Ok(resolved) => {
                return Ok(missing
                    .iter()
                    .rev()
                    .fold(resolved, |acc: PathBuf, part| acc.join(part)));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match (prefix.parent(), prefix.file_name()) {
                    (Some(parent), Some(name)) => {
                        missing.push(name.to_os_string());
                        prefix = parent;
                    }
                    _ => return Ok(path.to_path_buf()),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(windows)]
fn strip_verbatim(path: &Path) -> PathBuf {
    let s = path.display().to_string();
    if let Some(unc) = s.strip_prefix(r"\\?\UNC\") {
        PathBuf::from(format!(r"\\{unc}"))
    } else if let Some(local) = s.strip_prefix(r"\\?\") {
        PathBuf::from(local)
    } else {
        path.to_path_buf()
    }
}

/// Reduce `path` to its canonical form.
///
/// # Errors
///
/// Infallible on this platform; the signature matches the Windows variant.
#[cfg(not(windows))]
#[allow(clippy::unnecessary_wraps)]
pub fn canonicalize(path: &Path) -> ImgvolResult<PathBuf> {
    Ok(clean(path))
}
