use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::Model;
use crate::types::{DataType, Layout};

/// A model file found under the models directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    /// Path relative to the models directory, `/`-separated.
    pub relative_path: String,
    pub channel: usize,
    pub data_type: DataType,
    pub layout: Layout,
    /// `false` when the path did not encode channel/type/layout and defaults were assumed.
    pub formatted: bool,
}

impl ModelEntry {
    fn from_relative_path(relative_path: String) -> Self {
        let (model, formatted) = match Model::from_formatted_path(&relative_path) {
            Ok(model) => (model, true),
            Err(e) => {
                debug!(path = %relative_path, error = %e, "Model path is not formatted; using defaults");
                (Model::from_url(&relative_path), false)
            }
        };

        Self {
            name: model.name,
            relative_path,
            channel: model.channel,
            data_type: model.data_type,
            layout: model.layout,
            formatted,
        }
    }
}

pub struct ModelRegistry {
    models_dir: PathBuf,
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: Vec::new(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Walk the models directory and register every `.onnx` file not yet known.
    pub fn discover(&mut self) -> Result<()> {
        if !self.models_dir.exists() {
            return Ok(());
        }

        let mut found = Vec::new();
        collect_onnx_files(&self.models_dir, &self.models_dir, &mut found)?;
        found.sort();

        for relative_path in found {
            if self.entries.iter().any(|e| e.relative_path == relative_path) {
                continue;
            }
            let entry = ModelEntry::from_relative_path(relative_path);
            info!(
                name = %entry.name,
                path = %entry.relative_path,
                formatted = entry.formatted,
                "Discovered ONNX model"
            );
            self.entries.push(entry);
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn model_path(&self, entry: &ModelEntry) -> PathBuf {
        self.models_dir.join(&entry.relative_path)
    }

    /// Resolve a registry name or a file path into a [`Model`] pointing at an absolute location.
    pub fn resolve(&self, name_or_path: &str) -> Result<Model> {
        if let Some(entry) = self.get(name_or_path) {
            let path = self.model_path(entry);
            return Ok(Model {
                name: entry.name.clone(),
                url: path.to_string_lossy().into_owned(),
                channel: entry.channel,
                data_type: entry.data_type,
                layout: entry.layout,
                tile_size: None,
            });
        }

        let path = Path::new(name_or_path);
        if !path.is_file() {
            anyhow::bail!(
                "Model '{name_or_path}' is neither a registered name nor an existing file under {}",
                self.models_dir.display()
            );
        }
        Ok(Model::from_formatted_path(name_or_path).unwrap_or_else(|_| Model::from_url(name_or_path)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.entries).context("Failed to serialize model list")
    }
}

fn collect_onnx_files(root: &Path, dir: &Path, found: &mut Vec<String>) -> Result<()> {
    let read_dir =
        fs::read_dir(dir).with_context(|| format!("Failed to read models directory: {}", dir.display()))?;

    for entry in read_dir {
        let path = entry?.path();
        if path.is_dir() {
            collect_onnx_files(root, &path, found)?;
            continue;
        }

        let is_onnx = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("onnx"))
            .unwrap_or(false);
        if !is_onnx {
            continue;
        }

        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        found.push(relative);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().expect("parent")).unwrap();
        fs::write(path, b"onnx").unwrap();
    }

    #[test]
    fn test_discover_formatted_and_plain_models() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "3/float16/NHWC/anime-x2.onnx");
        touch(dir.path(), "plain.onnx");
        touch(dir.path(), "notes/readme.txt");

        let mut reg = ModelRegistry::new(dir.path().to_path_buf());
        reg.discover().unwrap();
        assert_eq!(reg.list().len(), 2);

        let anime = reg.get("anime-x2").unwrap();
        assert!(anime.formatted);
        assert_eq!(anime.data_type, DataType::Float16);
        assert_eq!(anime.layout, Layout::NHWC);
        assert_eq!(anime.relative_path, "3/float16/NHWC/anime-x2.onnx");

        let plain = reg.get("plain").unwrap();
        assert!(!plain.formatted);
        assert_eq!(plain.channel, 3);
        assert_eq!(plain.data_type, DataType::Float32);
        assert_eq!(plain.layout, Layout::NCHW);
    }

    #[test]
    fn test_discover_twice_keeps_entries_unique() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.onnx");
        let mut reg = ModelRegistry::new(dir.path().to_path_buf());
        reg.discover().unwrap();
        reg.discover().unwrap();
        assert_eq!(reg.list().len(), 1);
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = ModelRegistry::new(dir.path().join("missing"));
        reg.discover().unwrap();
        assert!(reg.list().is_empty());
    }

    #[test]
    fn test_resolve_by_name_and_path() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "4/uint8/NCHW/rgba.onnx");
        let mut reg = ModelRegistry::new(dir.path().to_path_buf());
        reg.discover().unwrap();

        let model = reg.resolve("rgba").unwrap();
        assert_eq!(model.channel, 4);
        assert_eq!(model.data_type, DataType::Uint8);
        assert!(Path::new(&model.url).is_file());

        let by_path = dir.path().join("4/uint8/NCHW/rgba.onnx");
        let model = reg.resolve(by_path.to_str().unwrap()).unwrap();
        assert_eq!(model.name, "rgba");

        assert!(reg.resolve("nope").is_err());
    }

    #[test]
    fn test_to_json_lists_entries() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "3/float32/NCHW/x4.onnx");
        let mut reg = ModelRegistry::new(dir.path().to_path_buf());
        reg.discover().unwrap();

        let json = reg.to_json().unwrap();
        let parsed: Vec<ModelEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, reg.list());
    }
}
