use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use log::debug;

use crate::error::Result;
use crate::file_handler::{FileOptions, OpenMode};
use crate::segments::FileWithSegments;

/// Shared handle to an open segmented file.
pub type SharedFiler = Rc<RefCell<FileWithSegments>>;

/// Maps entity names to the file that records them, so every component
/// recording for the same entity shares one file handler.
#[derive(Debug, Default)]
pub struct FilerRegistry {
    filers: HashMap<String, SharedFiler>,
}

impl FilerRegistry {
    pub fn new() -> Self {
        FilerRegistry::default()
    }

    /// The filer for `entity`, opening `path` on first use.
    pub fn find_or_open(
        &mut self,
        entity: &str,
        path: impl AsRef<Path>,
        mode: OpenMode,
        options: FileOptions,
    ) -> Result<SharedFiler> {
        if let Some(filer) = self.filers.get(entity) {
            return Ok(filer.clone());
        }
        let filer = Rc::new(RefCell::new(FileWithSegments::open_with(path, mode, options)?));
        debug!("registry: opened filer for {}", entity);
        self.filers.insert(entity.to_string(), filer.clone());
        Ok(filer)
    }

    pub fn get(&self, entity: &str) -> Option<SharedFiler> {
        self.filers.get(entity).cloned()
    }

    /// Forget the filer for `entity`; the file closes once the last shared
    /// handle is dropped.
    pub fn remove(&mut self, entity: &str) -> Option<SharedFiler> {
        self.filers.remove(entity)
    }

    pub fn len(&self) -> usize {
        self.filers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_same_entity_shares_filer() {
        let dir = TempDir::new().unwrap();
        let mut registry = FilerRegistry::new();
        let path = dir.path().join("vehicle.ddff");
        let a = registry
            .find_or_open("vehicle", &path, OpenMode::New, FileOptions::default())
            .unwrap();
        // a second open in New mode would fail; the registry returns the existing filer
        let b = registry
            .find_or_open("vehicle", &path, OpenMode::New, FileOptions::default())
            .unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove("vehicle").is_some());
        assert!(registry.get("vehicle").is_none());
        assert!(registry.is_empty());
    }
}
