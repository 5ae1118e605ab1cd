//! Thin wrappers over the bpf(2) syscall.
//!
//! Only the five commands the driver needs: map create, program load,
//! object pin/get and map lookup. Each attr struct mirrors the kernel's
//! `union bpf_attr` layout for its command; the kernel accepts shorter
//! sizes as long as the fields it reads are present.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::elf::MapSpec;

const BPF_MAP_CREATE: libc::c_long = 0;
const BPF_MAP_LOOKUP_ELEM: libc::c_long = 1;
const BPF_PROG_LOAD: libc::c_long = 5;
const BPF_OBJ_PIN: libc::c_long = 6;
const BPF_OBJ_GET: libc::c_long = 7;

#[repr(C)]
#[derive(Default)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    inner_map_fd: u32,
    numa_node: u32,
    map_name: [u8; 16],
}

#[repr(C)]
#[derive(Default)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

#[repr(C)]
struct ProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
    prog_name: [u8; 16],
}

#[repr(C)]
#[derive(Default)]
struct ObjAttr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

fn sys_bpf<T>(cmd: libc::c_long, attr: &mut T) -> io::Result<RawFd> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *mut T as *mut libc::c_void,
            mem::size_of::<T>() as u32,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as RawFd)
    }
}

/// Object names the kernel accepts: at most 15 bytes of `[A-Za-z0-9_.]`,
/// NUL-terminated.
fn obj_name(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (dst, c) in out[..15].iter_mut().zip(name.bytes()) {
        *dst = if c.is_ascii_alphanumeric() || c == b'_' || c == b'.' {
            c
        } else {
            b'_'
        };
    }
    out
}

fn path_cstr(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}

pub fn create_map(spec: &MapSpec) -> io::Result<OwnedFd> {
    let mut attr = MapCreateAttr {
        map_type: spec.map_type,
        key_size: spec.key_size,
        value_size: spec.value_size,
        max_entries: spec.max_entries,
        map_flags: spec.map_flags,
        map_name: obj_name(&spec.name),
        ..MapCreateAttr::default()
    };
    let fd = sys_bpf(BPF_MAP_CREATE, &mut attr)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Load an encoded program. With a non-zero `log_level` the kernel writes
/// its diagnostic into `log_buf`, on success as well as on failure; an
/// undersized buffer fails with `ENOSPC`.
pub fn load_program(
    prog_type: u32,
    name: &str,
    insns: &[u8],
    license: &str,
    log_level: u32,
    log_buf: &mut [u8],
) -> io::Result<OwnedFd> {
    let license = CString::new(license)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "license contains a NUL byte"))?;

    let mut attr = ProgLoadAttr {
        prog_type,
        insn_cnt: (insns.len() / 8) as u32,
        insns: insns.as_ptr() as u64,
        license: license.as_ptr() as u64,
        log_level: 0,
        log_size: 0,
        log_buf: 0,
        kern_version: 0,
        prog_flags: 0,
        prog_name: obj_name(name),
    };

    if log_level > 0 && !log_buf.is_empty() {
        attr.log_level = log_level;
        attr.log_size = log_buf.len() as u32;
        attr.log_buf = log_buf.as_mut_ptr() as u64;
    }

    let fd = sys_bpf(BPF_PROG_LOAD, &mut attr)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// The NUL-terminated text the kernel left in a log buffer.
pub fn log_text(buf: &[u8]) -> String {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

pub fn pin(fd: &impl AsRawFd, path: &Path) -> io::Result<()> {
    let pathname = path_cstr(path)?;
    let mut attr = ObjAttr {
        pathname: pathname.as_ptr() as u64,
        bpf_fd: fd.as_raw_fd() as u32,
        ..ObjAttr::default()
    };
    sys_bpf(BPF_OBJ_PIN, &mut attr).map(|_| ())
}

pub fn obj_get(path: &Path) -> io::Result<OwnedFd> {
    let pathname = path_cstr(path)?;
    let mut attr = ObjAttr {
        pathname: pathname.as_ptr() as u64,
        ..ObjAttr::default()
    };
    let fd = sys_bpf(BPF_OBJ_GET, &mut attr)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn map_lookup(fd: &impl AsRawFd, key: &[u8], value: &mut [u8]) -> io::Result<()> {
    let mut attr = MapElemAttr {
        map_fd: fd.as_raw_fd() as u32,
        key: key.as_ptr() as u64,
        value: value.as_mut_ptr() as u64,
        ..MapElemAttr::default()
    };
    sys_bpf(BPF_MAP_LOOKUP_ELEM, &mut attr).map(|_| ())
}
