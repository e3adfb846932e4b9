//! Read-only layer views.

use std::path::{Path, PathBuf};

use crate::filesystem::Mount;

/// Read-only view over a stack of unpacked layers.
#[derive(Debug, Clone)]
pub struct LayerView {
    /// Layer directories, top layer first.
    pub lower_dirs: Vec<PathBuf>,
}

impl LayerView {
    /// Create a view from layer directories ordered top layer first.
    #[must_use]
    pub fn new(lower_dirs: Vec<PathBuf>) -> Self {
        Self { lower_dirs }
    }

    /// Mounts presenting the view.
    ///
    /// A single layer is bind mounted read-only. Several layers become an
    /// overlay with only `lowerdir` set, which overlayfs always mounts
    /// read-only.
    #[must_use]
    pub fn mounts(&self) -> Vec<Mount> {
        match self.lower_dirs.as_slice() {
            [] => Vec::new(),
            [single] => vec![Mount::bind(single, true)],
            _ => vec![Mount {
                fstype: "overlay".to_string(),
                source: PathBuf::from("overlay"),
                options: vec![self.lowerdir_option()],
            }],
        }
    }

    /// The `lowerdir=` option string.
    #[must_use]
    pub fn lowerdir_option(&self) -> String {
        let lower = self
            .lower_dirs
            .iter()
            .map(|p| escape(p))
            .collect::<Vec<_>>()
            .join(":");

        format!("lowerdir={lower}")
    }
}

/// Escape characters overlayfs treats as separators inside `lowerdir`.
fn escape(path: &Path) -> String {
    let path = path.display().to_string();
    path.replace('\\', "\\\\").replace(':', "\\:").replace(',', "\\,")
}
