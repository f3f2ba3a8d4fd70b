//! Installed kernels of one device within one execution plan

use dashmap::DashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::backend::{DeviceBackend, KernelHandle};
use crate::config::RuntimeConfig;
use crate::diagnostics::{Bailout, Result};

/// Cache key of a compiled unit: `<compilation-id>-<entry-point>`
pub fn cache_key(id: &str, entry_point: &str) -> String {
    format!("{}-{}", id, entry_point)
}

#[derive(Debug)]
pub struct InstalledKernel {
    pub key: String,
    pub entry_point: String,
    pub binary: Vec<u8>,
    /// Where the binary was staged or read from
    pub source_path: Option<PathBuf>,
    pub handle: KernelHandle,
}

#[derive(Debug)]
pub struct CodeCache {
    device: usize,
    backend: Arc<dyn DeviceBackend>,
    stage_to_disk: bool,
    staging_dir: PathBuf,
    entries: DashMap<String, Arc<InstalledKernel>>,
}

impl CodeCache {
    pub fn new(device: usize, backend: Arc<dyn DeviceBackend>, config: &RuntimeConfig) -> Self {
        Self {
            device,
            backend,
            stage_to_disk: config.stage_to_disk,
            staging_dir: config.staging_dir.clone(),
            entries: DashMap::new(),
        }
    }

    /// Install `binary` under `<id>-<entry_point>`
    ///
    /// The cache does not deduplicate; callers check [`CodeCache::is_cached`]
    /// first. A later install under the same key replaces the earlier entry.
    pub fn install(&self, id: &str, entry_point: &str, binary: &[u8]) -> Result<Arc<InstalledKernel>> {
        let key = cache_key(id, entry_point);
        if binary.is_empty() {
            tracing::warn!(%key, "refusing to install an empty binary");
            return Err(Bailout::EmptyBinary { key }.into());
        }

        let staged = if self.stage_to_disk {
            Some(self.stage(id, entry_point, binary)?)
        } else {
            None
        };
        self.install_key(key, entry_point, binary.to_vec(), staged)
    }

    /// Install a binary previously staged at `path`
    pub fn install_from_path(&self, id: &str, entry_point: &str, path: &Path) -> Result<Arc<InstalledKernel>> {
        let binary = fs::read(path).map_err(|source| Bailout::Staging {
            path: path.to_path_buf(),
            source,
        })?;
        let key = cache_key(id, entry_point);
        if binary.is_empty() {
            tracing::warn!(%key, path = %path.display(), "staged binary is empty");
            return Err(Bailout::EmptyBinary { key }.into());
        }
        self.install_key(key, entry_point, binary, Some(path.to_path_buf()))
    }

    fn install_key(
        &self,
        key: String,
        entry_point: &str,
        binary: Vec<u8>,
        source_path: Option<PathBuf>,
    ) -> Result<Arc<InstalledKernel>> {
        tracing::debug!(%key, bytes = binary.len(), device = self.device, "installing binary");
        let handle = match self.backend.install_binary(&binary, entry_point) {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(%key, "device rejected binary: {}", err);
                return Err(err);
            }
        };

        let kernel = Arc::new(InstalledKernel {
            key: key.clone(),
            entry_point: entry_point.to_string(),
            binary,
            source_path,
            handle,
        });
        if let Some(previous) = self.entries.insert(key.clone(), Arc::clone(&kernel)) {
            self.backend.release_kernel(previous.handle)?;
        }
        tracing::info!(%key, device = self.device, "module installed");
        Ok(kernel)
    }

    /// Write `<dir>/<nanos>-<id><entry>.spv`, creating the directory if needed
    fn stage(&self, id: &str, entry_point: &str, binary: &[u8]) -> Result<PathBuf> {
        fs::create_dir_all(&self.staging_dir).map_err(|source| Bailout::Staging {
            path: self.staging_dir.clone(),
            source,
        })?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let path = self
            .staging_dir
            .join(format!("{}-{}{}.spv", nanos, id, entry_point));
        if let Err(source) = fs::write(&path, binary) {
            return Err(Bailout::Staging { path, source }.into());
        }
        tracing::debug!(path = %path.display(), "staged binary");
        Ok(path)
    }

    pub fn is_cached(&self, id: &str, entry_point: &str) -> bool {
        self.entries.contains_key(&cache_key(id, entry_point))
    }

    pub fn get(&self, id: &str, entry_point: &str) -> Option<Arc<InstalledKernel>> {
        self.get_key(&cache_key(id, entry_point))
    }

    pub fn get_key(&self, key: &str) -> Option<Arc<InstalledKernel>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Release and forget every installed kernel
    pub fn reset(&self) -> Result<()> {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, kernel)) = self.entries.remove(&key) {
                self.backend.release_kernel(kernel.handle)?;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key() {
        assert_eq!(cache_key("s0.t0", "saxpy"), "s0.t0-saxpy");
    }
}
