use std::{
    fs::{create_dir_all, read_to_string, rename, write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};

/// A JSON document on disk mirrored by an in-memory value.
pub struct FileBackedValue<T> {
    value: T,
    path: PathBuf,
}
impl<T: Serialize + DeserializeOwned> FileBackedValue<T> {
    pub fn new(path: PathBuf, default: impl FnOnce() -> T) -> anyhow::Result<FileBackedValue<T>> {
        let value = if path.exists() {
            let text = read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {:?}", path))?
        } else {
            if let Some(parent) = path.parent() {
                create_dir_all(parent)?;
            }
            default()
        };
        Ok(FileBackedValue { value, path })
    }
    pub fn get(&self) -> &T {
        &self.value
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn exists_on_disk(&self) -> bool {
        self.path.exists()
    }
    pub fn save(&self) -> anyhow::Result<()> {
        let temporary = self.path.with_extension("json.tmp");
        write(&temporary, serde_json::to_string_pretty(&self.value)?)?;
        rename(&temporary, &self.path).with_context(|| format!("replacing {:?}", self.path))?;
        Ok(())
    }
    pub fn mutate<R>(&mut self, f: impl FnOnce(&mut T) -> anyhow::Result<R>) -> anyhow::Result<R> {
        let result = f(&mut self.value)?;
        self.save()?;
        Ok(result)
    }
    pub fn set(&mut self, value: T) -> anyhow::Result<()> {
        self.mutate(|inner| {
            *inner = value;
            Ok(())
        })
    }
}
