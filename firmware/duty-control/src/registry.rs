//! Registration of the control endpoint in a named namespace.
//!
//! Registration happens in three steps, each with its own revert: reserve a
//! region number, create a class that groups nodes, then create the named
//! node bound to an operation table.

use crate::endpoint::{FileOperations, SessionHandle};
use crate::error::RegistrationError;
use log::debug;
use std::collections::HashMap;
use std::io;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

pub trait Registry {
    fn alloc_region(&self, name: &str) -> Result<RegionId, RegistrationError>;

    fn release_region(&self, region: RegionId) -> Result<(), RegistrationError>;

    fn create_class(&self, name: &str) -> Result<ClassId, RegistrationError>;

    fn destroy_class(&self, class: ClassId) -> Result<(), RegistrationError>;

    fn create_node(
        &self,
        class: ClassId,
        region: RegionId,
        name: &str,
        ops: Arc<dyn FileOperations>,
    ) -> Result<NodeId, RegistrationError>;

    fn destroy_node(&self, node: NodeId) -> Result<(), RegistrationError>;
}

impl<R: Registry + ?Sized> Registry for Arc<R> {
    fn alloc_region(&self, name: &str) -> Result<RegionId, RegistrationError> {
        (**self).alloc_region(name)
    }

    fn release_region(&self, region: RegionId) -> Result<(), RegistrationError> {
        (**self).release_region(region)
    }

    fn create_class(&self, name: &str) -> Result<ClassId, RegistrationError> {
        (**self).create_class(name)
    }

    fn destroy_class(&self, class: ClassId) -> Result<(), RegistrationError> {
        (**self).destroy_class(class)
    }

    fn create_node(
        &self,
        class: ClassId,
        region: RegionId,
        name: &str,
        ops: Arc<dyn FileOperations>,
    ) -> Result<NodeId, RegistrationError> {
        (**self).create_node(class, region, name, ops)
    }

    fn destroy_node(&self, node: NodeId) -> Result<(), RegistrationError> {
        (**self).destroy_node(node)
    }
}

/// Region numbers handed out dynamically.
pub const DYNAMIC_REGIONS: RangeInclusive<u32> = 234..=254;

struct Node {
    name: String,
    class: ClassId,
    region: RegionId,
    ops: Arc<dyn FileOperations>,
}

#[derive(Default)]
struct Tables {
    next_id: u32,
    regions: HashMap<RegionId, String>,
    classes: HashMap<ClassId, String>,
    nodes: HashMap<NodeId, Node>,
}

/// In-process namespace. Nodes can be opened by name.
#[derive(Default)]
pub struct MemoryRegistry {
    tables: Mutex<Tables>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the node called `name`, if registered.
    pub fn open(&self, name: &str) -> Option<NodeFile> {
        let ops = self
            .lock()
            .nodes
            .values()
            .find(|node| node.name == name)
            .map(|node| Arc::clone(&node.ops))?;
        let session = ops.open();
        Some(NodeFile { ops, session })
    }

    pub fn contains_node(&self, name: &str) -> bool {
        self.lock().nodes.values().any(|node| node.name == name)
    }

    pub fn node_name(&self, node: NodeId) -> Option<String> {
        self.lock().nodes.get(&node).map(|n| n.name.clone())
    }

    pub fn region_count(&self) -> usize {
        self.lock().regions.len()
    }

    pub fn class_count(&self) -> usize {
        self.lock().classes.len()
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        let tables = self.lock();
        tables.regions.is_empty() && tables.classes.is_empty() && tables.nodes.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Tables {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

impl Registry for MemoryRegistry {
    fn alloc_region(&self, name: &str) -> Result<RegionId, RegistrationError> {
        let mut tables = self.lock();
        let region = DYNAMIC_REGIONS
            .rev()
            .map(RegionId)
            .find(|id| !tables.regions.contains_key(id))
            .ok_or_else(|| RegistrationError::RegionUnavailable(name.to_string()))?;
        tables.regions.insert(region, name.to_string());
        debug!("region {} allocated for {}", region.0, name);
        Ok(region)
    }

    fn release_region(&self, region: RegionId) -> Result<(), RegistrationError> {
        let mut tables = self.lock();
        if tables.nodes.values().any(|node| node.region == region) {
            return Err(RegistrationError::Failed(format!("region {} in use", region.0)));
        }
        tables
            .regions
            .remove(&region)
            .map(|_| ())
            .ok_or_else(|| RegistrationError::Unknown(format!("region {}", region.0)))
    }

    fn create_class(&self, name: &str) -> Result<ClassId, RegistrationError> {
        let mut tables = self.lock();
        if tables.classes.values().any(|existing| existing == name) {
            return Err(RegistrationError::AlreadyExists(name.to_string()));
        }
        let class = ClassId(tables.next_id());
        tables.classes.insert(class, name.to_string());
        Ok(class)
    }

    fn destroy_class(&self, class: ClassId) -> Result<(), RegistrationError> {
        let mut tables = self.lock();
        if tables.nodes.values().any(|node| node.class == class) {
            return Err(RegistrationError::Failed(format!("class {} in use", class.0)));
        }
        tables
            .classes
            .remove(&class)
            .map(|_| ())
            .ok_or_else(|| RegistrationError::Unknown(format!("class {}", class.0)))
    }

    fn create_node(
        &self,
        class: ClassId,
        region: RegionId,
        name: &str,
        ops: Arc<dyn FileOperations>,
    ) -> Result<NodeId, RegistrationError> {
        let mut tables = self.lock();
        if !tables.classes.contains_key(&class) {
            return Err(RegistrationError::Unknown(format!("class {}", class.0)));
        }
        if !tables.regions.contains_key(&region) {
            return Err(RegistrationError::Unknown(format!("region {}", region.0)));
        }
        if tables.nodes.values().any(|node| node.name == name) {
            return Err(RegistrationError::AlreadyExists(name.to_string()));
        }
        let node = NodeId(tables.next_id());
        tables.nodes.insert(
            node,
            Node {
                name: name.to_string(),
                class,
                region,
                ops,
            },
        );
        debug!("node {} registered", name);
        Ok(node)
    }

    fn destroy_node(&self, node: NodeId) -> Result<(), RegistrationError> {
        self.lock()
            .nodes
            .remove(&node)
            .map(|_| ())
            .ok_or_else(|| RegistrationError::Unknown(format!("node {}", node.0)))
    }
}

/// An open node. Closes its session on drop.
pub struct NodeFile {
    ops: Arc<dyn FileOperations>,
    session: SessionHandle,
}

impl NodeFile {
    pub fn session(&self) -> SessionHandle {
        self.session
    }
}

impl io::Write for NodeFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.ops.write(self.session, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for NodeFile {
    fn drop(&mut self) {
        self.ops.close(self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WriteError;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    impl FileOperations for Recorder {
        fn open(&self) -> SessionHandle {
            SessionHandle::new(self.opened.fetch_add(1, Ordering::SeqCst) as u32)
        }

        fn close(&self, _session: SessionHandle) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn write(&self, _session: SessionHandle, buf: &[u8]) -> Result<usize, WriteError> {
            if buf == b"bad" {
                return Err(WriteError::InvalidFormat);
            }
            Ok(buf.len().min(4))
        }
    }

    #[test]
    fn test_regions_allocated_from_top() {
        let registry = MemoryRegistry::new();
        assert_eq!(registry.alloc_region("a").unwrap(), RegionId(254));
        assert_eq!(registry.alloc_region("b").unwrap(), RegionId(253));
        registry.release_region(RegionId(254)).unwrap();
        assert_eq!(registry.alloc_region("c").unwrap(), RegionId(254));
    }

    #[test]
    fn test_region_pool_exhausted() {
        let registry = MemoryRegistry::new();
        for _ in DYNAMIC_REGIONS {
            registry.alloc_region("x").unwrap();
        }
        assert_eq!(
            registry.alloc_region("y"),
            Err(RegistrationError::RegionUnavailable("y".into()))
        );
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let registry = MemoryRegistry::new();
        let region = registry.alloc_region("r").unwrap();
        let class = registry.create_class("pwm").unwrap();
        assert!(registry.create_class("pwm").is_err());

        let ops: Arc<dyn FileOperations> = Arc::new(Recorder::default());
        registry.create_node(class, region, "pwm0", ops.clone()).unwrap();
        assert_eq!(
            registry.create_node(class, region, "pwm0", ops).err(),
            Some(RegistrationError::AlreadyExists("pwm0".into()))
        );
    }

    #[test]
    fn test_in_use_class_and_region_kept() {
        let registry = MemoryRegistry::new();
        let region = registry.alloc_region("r").unwrap();
        let class = registry.create_class("pwm").unwrap();
        let node = registry
            .create_node(class, region, "pwm0", Arc::new(Recorder::default()))
            .unwrap();

        assert!(registry.destroy_class(class).is_err());
        assert!(registry.release_region(region).is_err());
        assert_eq!(registry.region_count(), 1);
        assert_eq!(registry.node_count(), 1);
        assert_eq!(registry.node_name(node).as_deref(), Some("pwm0"));

        registry.destroy_node(node).unwrap();
        assert_eq!(registry.node_name(node), None);
        registry.destroy_class(class).unwrap();
        registry.release_region(region).unwrap();
        assert!(registry.is_empty());
        assert!(registry.destroy_node(node).is_err());
    }

    #[test]
    fn test_node_requires_class_and_region() {
        let registry = MemoryRegistry::new();
        let ops: Arc<dyn FileOperations> = Arc::new(Recorder::default());
        assert!(registry.create_node(ClassId(9), RegionId(254), "n", ops).is_err());
    }

    #[test]
    fn test_open_write_close() {
        let registry = MemoryRegistry::new();
        let recorder = Arc::new(Recorder::default());
        let region = registry.alloc_region("r").unwrap();
        let class = registry.create_class("pwm").unwrap();
        registry.create_node(class, region, "pwm0", recorder.clone()).unwrap();

        assert!(registry.open("missing").is_none());
        {
            let mut file = registry.open("pwm0").unwrap();
            assert_eq!(file.session(), SessionHandle::new(0));
            assert_eq!(file.write(b"abcdef").unwrap(), 4);
            let err = file.write(b"bad").unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        }
        assert_eq!(recorder.opened.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
    }
}
