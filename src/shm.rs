//! Named POSIX shared-memory segments mapped for both host and device access.

use std::ffi::CString;
use std::fmt::{self, Debug};
use std::io;
use std::ptr::null_mut;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::common::error::{P2pError, Result};
use crate::runtime::{DevicePtr, DeviceRuntime};

const SHM_PREFIX: &str = "nccl-";
const NAME_LEN: usize = 6;
const CREATE_ATTEMPTS: usize = 8;

/// Six alphanumerics plus a terminating NUL, as carried in the connect slot.
#[derive(Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShmName(pub [u8; NAME_LEN + 1]);

impl ShmName {
    fn generate() -> ShmName {
        let mut raw = [0u8; NAME_LEN + 1];
        let mut rng = rand::thread_rng();
        for b in raw.iter_mut().take(NAME_LEN) {
            *b = rng.sample(Alphanumeric);
        }
        ShmName(raw)
    }

    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }

    /// Object name as understood by `shm_open`.
    fn object_name(&self) -> Result<CString> {
        CString::new(format!("/{}{}", SHM_PREFIX, self.as_str()))
            .map_err(|e| P2pError::System(io::Error::new(io::ErrorKind::InvalidInput, e)))
    }

    pub fn path(&self) -> String {
        format!("/dev/shm/{}{}", SHM_PREFIX, self.as_str())
    }
}

impl Debug for ShmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub struct ShmSegment {
    name: ShmName,
    size: usize,
    host: *mut u8,
    dev: DevicePtr,
}
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a fresh zeroed segment under a generated name.
    pub fn create(runtime: &dyn DeviceRuntime, size: usize) -> Result<ShmSegment> {
        for _ in 0..CREATE_ATTEMPTS {
            let name = ShmName::generate();
            match Self::map(runtime, name, size, true) {
                Err(P2pError::System(e)) if e.raw_os_error() == Some(libc::EEXIST) => continue,
                other => return other,
            }
        }
        Err(P2pError::System(io::Error::from_raw_os_error(libc::EEXIST)))
    }

    /// Open a segment another endpoint created.
    pub fn open(runtime: &dyn DeviceRuntime, name: ShmName, size: usize) -> Result<ShmSegment> {
        Self::map(runtime, name, size, false)
    }

    fn map(runtime: &dyn DeviceRuntime, name: ShmName, size: usize, create: bool) -> Result<ShmSegment> {
        let object = name.object_name()?;
        let flags = if create {
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR
        } else {
            libc::O_RDWR
        };
        let fd = unsafe { libc::shm_open(object.as_ptr(), flags, 0o600) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if create && unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(object.as_ptr());
            }
            return Err(err.into());
        }
        let host = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        let map_err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        if host == libc::MAP_FAILED {
            if create {
                unsafe { libc::shm_unlink(object.as_ptr()) };
            }
            return Err(map_err.into());
        }
        let host = host as *mut u8;
        let dev = match runtime.host_register(host, size) {
            Ok(dev) => dev,
            Err(e) => {
                unsafe {
                    libc::munmap(host as *mut libc::c_void, size);
                    if create {
                        libc::shm_unlink(object.as_ptr());
                    }
                }
                return Err(e);
            }
        };
        log::trace!("{} shm segment {} size {}", if create { "created" } else { "opened" }, name.path(), size);
        Ok(ShmSegment { name, size, host, dev })
    }

    /// Remove the name; the mapping lives on until every holder closes it.
    pub fn unlink(&self) -> Result<()> {
        let object = self.name.object_name()?;
        if unsafe { libc::shm_unlink(object.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn close(self, runtime: &dyn DeviceRuntime) -> Result<()> {
        let unregistered = runtime.host_unregister(self.host);
        let ret = unsafe { libc::munmap(self.host as *mut libc::c_void, self.size) };
        unregistered?;
        if ret != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn name(&self) -> ShmName {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn host_ptr(&self) -> *mut u8 {
        self.host
    }

    pub fn dev_ptr(&self) -> DevicePtr {
        self.dev
    }
}
