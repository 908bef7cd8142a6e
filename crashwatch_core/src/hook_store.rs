use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

#[cfg(windows)]
pub use registry::RegistryHookStore;

/// Registry type of a plain string value.
pub const REG_SZ: u32 = 1;
/// Registry type of a string with unexpanded environment references.
pub const REG_EXPAND_SZ: u32 = 2;

/// Address of one OS-wide configuration value: a location (registry key)
/// and a value name within it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookKey {
    pub location: String,
    pub name: String,
}

impl HookKey {
    pub fn new(location: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for HookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\\{}", self.location, self.name)
    }
}

/// A stored value as the OS holds it: registry type plus raw bytes.
///
/// Values read from a store are written back unchanged on restore, whatever
/// their type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookValue {
    pub kind: u32,
    pub data: Vec<u8>,
}

impl HookValue {
    /// A `REG_SZ` value, stored as NUL-terminated UTF-16LE.
    pub fn string(text: &str) -> Self {
        let data = text
            .encode_utf16()
            .chain(std::iter::once(0))
            .flat_map(u16::to_le_bytes)
            .collect();
        Self { kind: REG_SZ, data }
    }

    /// The text of a string-typed value, without its terminator.
    pub fn as_text(&self) -> Option<String> {
        if !matches!(self.kind, REG_SZ | REG_EXPAND_SZ) {
            return None;
        }
        let units: Vec<u16> = self
            .data
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
        String::from_utf16(&units[..end]).ok()
    }
}

impl From<&str> for HookValue {
    fn from(text: &str) -> Self {
        Self::string(text)
    }
}

impl fmt::Display for HookValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => write!(f, "{text:?}"),
            None => write!(f, "<type {}, {} bytes>", self.kind, self.data.len()),
        }
    }
}

#[derive(Error, Debug)]
pub enum HookStoreError {
    #[error("access to {0} denied")]
    Denied(HookKey),
    #[error("{0} is not under HKLM or HKCU")]
    UnsupportedRoot(HookKey),
    #[error("registry {op} of {key} failed: {source}")]
    Os {
        op: &'static str,
        key: HookKey,
        #[source]
        source: io::Error,
    },
}

/// Capability over the host's debug-hook configuration.
///
/// `read` distinguishes an absent value (`Ok(None)`) from one that could not
/// be read (`Err`).
pub trait HookStore {
    fn read(&self, key: &HookKey) -> Result<Option<HookValue>, HookStoreError>;
    fn write(&mut self, key: &HookKey, value: &HookValue) -> Result<(), HookStoreError>;
    fn remove(&mut self, key: &HookKey) -> Result<(), HookStoreError>;
}

impl<S: HookStore + ?Sized> HookStore for Box<S> {
    fn read(&self, key: &HookKey) -> Result<Option<HookValue>, HookStoreError> {
        (**self).read(key)
    }
    fn write(&mut self, key: &HookKey, value: &HookValue) -> Result<(), HookStoreError> {
        (**self).write(key, value)
    }
    fn remove(&mut self, key: &HookKey) -> Result<(), HookStoreError> {
        (**self).remove(key)
    }
}

/// A mutation recorded by [`MemoryHookStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Write(HookKey, HookValue),
    Remove(HookKey),
}

#[derive(Debug, Default)]
struct MemoryState {
    values: BTreeMap<HookKey, HookValue>,
    unreadable: BTreeSet<HookKey>,
    read_only: BTreeSet<HookKey>,
    journal: Vec<StoreOp>,
}

/// In-memory hook configuration with a journal of every mutation.
///
/// Clones share state, so a caller can keep a handle while the installer owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct MemoryHookStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryHookStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(self, key: HookKey, value: impl Into<HookValue>) -> Self {
        self.state.lock().values.insert(key, value.into());
        self
    }

    /// Makes reads of `key` fail.
    pub fn deny_reads(self, key: HookKey) -> Self {
        self.state.lock().unreadable.insert(key);
        self
    }

    /// Makes writes and removals of `key` fail.
    pub fn deny_writes(self, key: HookKey) -> Self {
        self.state.lock().read_only.insert(key);
        self
    }

    pub fn allow_writes(&self, key: &HookKey) {
        self.state.lock().read_only.remove(key);
    }

    pub fn values(&self) -> BTreeMap<HookKey, HookValue> {
        self.state.lock().values.clone()
    }

    pub fn journal(&self) -> Vec<StoreOp> {
        self.state.lock().journal.clone()
    }
}

impl HookStore for MemoryHookStore {
    fn read(&self, key: &HookKey) -> Result<Option<HookValue>, HookStoreError> {
        let state = self.state.lock();
        if state.unreadable.contains(key) {
            return Err(HookStoreError::Denied(key.clone()));
        }
        Ok(state.values.get(key).cloned())
    }

    fn write(&mut self, key: &HookKey, value: &HookValue) -> Result<(), HookStoreError> {
        let mut state = self.state.lock();
        if state.read_only.contains(key) {
            return Err(HookStoreError::Denied(key.clone()));
        }
        state.values.insert(key.clone(), value.clone());
        state.journal.push(StoreOp::Write(key.clone(), value.clone()));
        Ok(())
    }

    fn remove(&mut self, key: &HookKey) -> Result<(), HookStoreError> {
        let mut state = self.state.lock();
        if state.read_only.contains(key) {
            return Err(HookStoreError::Denied(key.clone()));
        }
        state.values.remove(key);
        state.journal.push(StoreOp::Remove(key.clone()));
        Ok(())
    }
}

#[cfg(windows)]
mod registry {
    use super::{HookKey, HookStore, HookStoreError, HookValue};
    use std::io;
    use std::ptr;
    use windows_sys::Win32::Foundation::{
        ERROR_FILE_NOT_FOUND, ERROR_MORE_DATA, ERROR_SUCCESS, WIN32_ERROR,
    };
    use windows_sys::Win32::System::Registry::{
        HKEY, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, KEY_QUERY_VALUE, KEY_SET_VALUE,
        REG_SAM_FLAGS, RegCloseKey, RegDeleteValueW, RegOpenKeyExW, RegQueryValueExW,
        RegSetValueExW,
    };

    /// Hook configuration in the Windows registry. Values keep their
    /// registry type and bytes across a read and a later write.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct RegistryHookStore;

    impl RegistryHookStore {
        pub fn new() -> Self {
            Self
        }
    }

    struct OpenKey(HKEY);

    impl Drop for OpenKey {
        fn drop(&mut self) {
            // SAFETY: the handle came from a successful RegOpenKeyExW and is
            // closed exactly once.
            unsafe { RegCloseKey(self.0) };
        }
    }

    fn wide(text: &str) -> Vec<u16> {
        text.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn os_error(op: &'static str, key: &HookKey, status: WIN32_ERROR) -> HookStoreError {
        HookStoreError::Os {
            op,
            key: key.clone(),
            source: io::Error::from_raw_os_error(status as i32),
        }
    }

    /// Opens the key that holds `key`; `Ok(None)` if the key does not exist.
    fn open(key: &HookKey, access: REG_SAM_FLAGS) -> Result<Option<OpenKey>, HookStoreError> {
        let (root, path) = match key.location.split_once('\\') {
            Some(("HKLM" | "HKEY_LOCAL_MACHINE", path)) => (HKEY_LOCAL_MACHINE, path),
            Some(("HKCU" | "HKEY_CURRENT_USER", path)) => (HKEY_CURRENT_USER, path),
            _ => return Err(HookStoreError::UnsupportedRoot(key.clone())),
        };
        let path = wide(path);
        let mut handle: HKEY = ptr::null_mut();
        // SAFETY: `path` is NUL-terminated and outlives the call, `handle` is
        // a valid out pointer.
        let status = unsafe { RegOpenKeyExW(root, path.as_ptr(), 0, access, &mut handle) };
        match status {
            ERROR_SUCCESS => Ok(Some(OpenKey(handle))),
            ERROR_FILE_NOT_FOUND => Ok(None),
            other => Err(os_error("open", key, other)),
        }
    }

    impl HookStore for RegistryHookStore {
        fn read(&self, key: &HookKey) -> Result<Option<HookValue>, HookStoreError> {
            let Some(open_key) = open(key, KEY_QUERY_VALUE)? else {
                return Ok(None);
            };
            let name = wide(&key.name);
            let mut data: Vec<u8> = Vec::new();
            loop {
                let mut kind = 0u32;
                let mut len = u32::try_from(data.len()).unwrap_or(u32::MAX);
                let buffer = if data.is_empty() {
                    ptr::null_mut()
                } else {
                    data.as_mut_ptr()
                };
                // SAFETY: `buffer` is null or points to `len` writable bytes;
                // `name` is NUL-terminated; the out pointers are valid.
                let status = unsafe {
                    RegQueryValueExW(
                        open_key.0,
                        name.as_ptr(),
                        ptr::null(),
                        &mut kind,
                        buffer,
                        &mut len,
                    )
                };
                match status {
                    ERROR_FILE_NOT_FOUND => return Ok(None),
                    // Size query, or the value grew since the last call.
                    ERROR_MORE_DATA => data.resize(len as usize, 0),
                    ERROR_SUCCESS if buffer.is_null() && len > 0 => {
                        data.resize(len as usize, 0)
                    }
                    ERROR_SUCCESS => {
                        data.truncate(len as usize);
                        return Ok(Some(HookValue { kind, data }));
                    }
                    other => return Err(os_error("query", key, other)),
                }
            }
        }

        fn write(&mut self, key: &HookKey, value: &HookValue) -> Result<(), HookStoreError> {
            let open_key = open(key, KEY_SET_VALUE)?
                .ok_or_else(|| os_error("open", key, ERROR_FILE_NOT_FOUND))?;
            let name = wide(&key.name);
            let len = u32::try_from(value.data.len()).map_err(|_| HookStoreError::Os {
                op: "set",
                key: key.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "value too large"),
            })?;
            // SAFETY: `value.data` holds `len` readable bytes and `name` is
            // NUL-terminated.
            let status = unsafe {
                RegSetValueExW(
                    open_key.0,
                    name.as_ptr(),
                    0,
                    value.kind,
                    value.data.as_ptr(),
                    len,
                )
            };
            match status {
                ERROR_SUCCESS => Ok(()),
                other => Err(os_error("set", key, other)),
            }
        }

        fn remove(&mut self, key: &HookKey) -> Result<(), HookStoreError> {
            let Some(open_key) = open(key, KEY_SET_VALUE)? else {
                return Ok(());
            };
            let name = wide(&key.name);
            // SAFETY: `name` is NUL-terminated and the handle is open.
            let status = unsafe { RegDeleteValueW(open_key.0, name.as_ptr()) };
            match status {
                ERROR_SUCCESS | ERROR_FILE_NOT_FOUND => Ok(()),
                other => Err(os_error("delete", key, other)),
            }
        }
    }
}
