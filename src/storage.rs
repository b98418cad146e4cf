use std::path::{Path, PathBuf};

use crate::namaste::Category;

#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub assets_dir: PathBuf,
    pub namaste_index_root: PathBuf,
}

impl StoragePaths {
    pub fn new(data_dir: impl Into<PathBuf>, assets_dir: impl Into<PathBuf>) -> Self {
        let data_dir: PathBuf = data_dir.into();

        Self {
            assets_dir: assets_dir.into(),
            namaste_index_root: data_dir.join("index").join("namaste"),
        }
    }

    pub fn category_csv(&self, category: Category) -> PathBuf {
        self.assets_dir.join(format!("{}.csv", category.as_str()))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.namaste_index_root)?;
        Ok(())
    }
}

pub fn file_present_nonempty(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(m) => m.is_file() && m.len() > 0,
        Err(_) => false,
    }
}

/// Writes `contents` next to `dest` and renames it into place.
pub fn write_atomic(dest: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = tmp_path(dest);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, dest)
}

fn tmp_path(dest: &Path) -> PathBuf {
    let fname = dest
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("pointer");
    dest.with_file_name(format!("{fname}.tmp"))
}
