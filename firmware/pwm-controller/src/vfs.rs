use duty_control::{
    ClassId, FileOperations, MemoryRegistry, NodeId, RegionId, Registry, RegistrationError,
    SessionHandle,
};
use esp_idf_sys::{esp, EspError};
use log::{info, warn};
use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CString};
use std::sync::{Arc, Mutex, PoisonError};

// newlib errno accessor (not in esp-idf-sys bindings)
extern "C" {
    fn __errno() -> *mut c_int;
}

const DEV_PREFIX: &str = "/dev";

/// VFS local fds are 15-bit.
const LOCAL_FD_MASK: u32 = 0x7fff;

type Ops = Arc<dyn FileOperations>;

struct Mount {
    path: CString,
    ctx: *mut Ops,
}

// The context pointer is only dereferenced by VFS callbacks; `Ops` is Send + Sync.
unsafe impl Send for Mount {}

/// Registry that exposes nodes as ESP-IDF VFS files under `/dev`.
///
/// Regions and classes are bookkeeping only; each node becomes its own
/// VFS mount whose open/close/write dispatch to the node's operations.
pub struct VfsRegistry {
    inner: MemoryRegistry,
    mounts: Mutex<HashMap<NodeId, Mount>>,
}

impl VfsRegistry {
    pub fn new() -> Self {
        Self {
            inner: MemoryRegistry::new(),
            mounts: Mutex::new(HashMap::new()),
        }
    }

    fn mount(path: &CString, ctx: *mut Ops) -> Result<(), EspError> {
        let vfs = esp_idf_sys::esp_vfs_t {
            flags: esp_idf_sys::ESP_VFS_FLAG_CONTEXT_PTR as c_int,
            __bindgen_anon_1: esp_idf_sys::esp_vfs_t__bindgen_ty_1 {
                write_p: Some(vfs_write),
            },
            __bindgen_anon_6: esp_idf_sys::esp_vfs_t__bindgen_ty_6 {
                open_p: Some(vfs_open),
            },
            __bindgen_anon_8: esp_idf_sys::esp_vfs_t__bindgen_ty_8 {
                close_p: Some(vfs_close),
            },
            ..Default::default()
        };
        // esp_vfs_register copies the table.
        esp!(unsafe { esp_idf_sys::esp_vfs_register(path.as_ptr(), &vfs, ctx as *mut c_void) })
    }
}

impl Default for VfsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry for VfsRegistry {
    fn alloc_region(&self, name: &str) -> Result<RegionId, RegistrationError> {
        self.inner.alloc_region(name)
    }

    fn release_region(&self, region: RegionId) -> Result<(), RegistrationError> {
        self.inner.release_region(region)
    }

    fn create_class(&self, name: &str) -> Result<ClassId, RegistrationError> {
        self.inner.create_class(name)
    }

    fn destroy_class(&self, class: ClassId) -> Result<(), RegistrationError> {
        self.inner.destroy_class(class)
    }

    fn create_node(
        &self,
        class: ClassId,
        region: RegionId,
        name: &str,
        ops: Ops,
    ) -> Result<NodeId, RegistrationError> {
        let path = CString::new(format!("{}/{}", DEV_PREFIX, name))
            .map_err(|_| RegistrationError::Failed(format!("bad node name {:?}", name)))?;
        let node = self.inner.create_node(class, region, name, Arc::clone(&ops))?;

        let ctx = Box::into_raw(Box::new(ops));
        if let Err(e) = Self::mount(&path, ctx) {
            drop(unsafe { Box::from_raw(ctx) });
            if let Err(revert) = self.inner.destroy_node(node) {
                warn!("revert node {}: {}", name, revert);
            }
            return Err(RegistrationError::Failed(format!("esp_vfs_register: {}", e)));
        }

        info!("Registered {:?}", path);
        self.mounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node, Mount { path, ctx });
        Ok(node)
    }

    fn destroy_node(&self, node: NodeId) -> Result<(), RegistrationError> {
        let mut mounts = self.mounts.lock().unwrap_or_else(PoisonError::into_inner);
        let mount = mounts
            .remove(&node)
            .ok_or_else(|| RegistrationError::Unknown(format!("node {}", node.0)))?;

        if let Err(e) = esp!(unsafe { esp_idf_sys::esp_vfs_unregister(mount.path.as_ptr()) }) {
            // Still mounted: the context must stay alive.
            mounts.insert(node, mount);
            return Err(RegistrationError::Failed(format!("esp_vfs_unregister: {}", e)));
        }
        drop(mounts);

        drop(unsafe { Box::from_raw(mount.ctx) });
        info!("Unregistered {:?}", mount.path);
        self.inner.destroy_node(node)
    }
}

unsafe fn ops<'a>(ctx: *mut c_void) -> &'a Ops {
    &*(ctx as *const Ops)
}

unsafe extern "C" fn vfs_open(
    ctx: *mut c_void,
    _path: *const c_char,
    _flags: c_int,
    _mode: c_int,
) -> c_int {
    let session = ops(ctx).open();
    (session.id() & LOCAL_FD_MASK) as c_int
}

unsafe extern "C" fn vfs_close(ctx: *mut c_void, fd: c_int) -> c_int {
    ops(ctx).close(SessionHandle::new(fd as u32));
    0
}

unsafe extern "C" fn vfs_write(
    ctx: *mut c_void,
    fd: c_int,
    data: *const c_void,
    size: usize,
) -> esp_idf_sys::ssize_t {
    let buf = if data.is_null() || size == 0 {
        &[][..]
    } else {
        std::slice::from_raw_parts(data as *const u8, size)
    };
    match ops(ctx).write(SessionHandle::new(fd as u32), buf) {
        Ok(consumed) => consumed as esp_idf_sys::ssize_t,
        Err(e) => {
            *__errno() = e.errno();
            -1
        }
    }
}
