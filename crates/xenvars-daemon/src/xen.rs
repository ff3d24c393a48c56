//! Xen control-device glue: the production [`Host`] implementation.
//!
//! Talks to `/dev/xen/privcmd` (device-model operations, foreign memory)
//! and `/dev/xen/evtchn` (event channels). Ioctl numbers and structure
//! layouts follow the kernel uapi headers (`xen/privcmd.h`, `xen/evtchn.h`)
//! and the hypervisor's `dm_op`/`ioreq` ABI.
//!
//! Everything above this module is ordinary safe code; the unsafe surface
//! is confined to the ioctls and the shared-page mappings.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;

use log::{debug, info};

use xenvars_efi::{IO_PORT_ADDR, IO_PORT_SIZE, PAGE_SIZE, SHMEM_PAGES, SHMEM_SIZE};

use crate::pump::{ring, Event, Host, Ioreq, IOREQ_SIZE};

const EVTCHN_DEV: &str = "/dev/xen/evtchn";
const PRIVCMD_DEV: &str = "/dev/xen/privcmd";

// _IOC(_IOC_NONE, type, nr, size)
const fn ioc_none(ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    ((size as libc::c_ulong) << 16) | ((ty as libc::c_ulong) << 8) | nr as libc::c_ulong
}

const IOCTL_EVTCHN_BIND_INTERDOMAIN: libc::c_ulong = ioc_none(b'E', 0, 8);
const IOCTL_EVTCHN_UNBIND: libc::c_ulong = ioc_none(b'E', 2, 4);
const IOCTL_EVTCHN_NOTIFY: libc::c_ulong = ioc_none(b'E', 4, 4);

const IOCTL_PRIVCMD_MMAPBATCH_V2: libc::c_ulong = ioc_none(b'P', 4, 32);
const IOCTL_PRIVCMD_DM_OP: libc::c_ulong = ioc_none(b'P', 5, 16);
const IOCTL_PRIVCMD_MMAP_RESOURCE: libc::c_ulong = ioc_none(b'P', 7, 32);

// Device-model operations.
const XEN_DMOP_CREATE_IOREQ_SERVER: u32 = 1;
const XEN_DMOP_GET_IOREQ_SERVER_INFO: u32 = 2;
const XEN_DMOP_MAP_IO_RANGE_TO_IOREQ_SERVER: u32 = 3;
const XEN_DMOP_SET_IOREQ_SERVER_STATE: u32 = 5;
const XEN_DMOP_DESTROY_IOREQ_SERVER: u32 = 6;

const XEN_DMOP_IO_RANGE_PORT: u32 = 0;
const HVM_IOREQSRV_BUFIOREQ_LEGACY: u8 = 1;
const XENMEM_RESOURCE_IOREQ_SERVER: u32 = 0;

#[repr(C)]
struct EvtchnBindInterdomain {
    remote_domain: u32,
    remote_port: u32,
}

#[repr(C)]
struct EvtchnPort {
    port: u32,
}

#[repr(C)]
struct PrivcmdMmapBatchV2 {
    num: u32,
    dom: u16,
    _pad: u16,
    addr: u64,
    arr: *const u64,
    err: *mut libc::c_int,
}

#[repr(C)]
struct PrivcmdMmapResource {
    dom: u16,
    _pad: u16,
    typ: u32,
    id: u32,
    idx: u32,
    num: u64,
    addr: u64,
}

#[repr(C)]
struct PrivcmdDmOpBuf {
    uptr: *mut libc::c_void,
    size: u64,
}

#[repr(C)]
struct PrivcmdDmOp {
    dom: u16,
    num: u16,
    _pad: u32,
    ubufs: *const PrivcmdDmOpBuf,
}

fn ioctl<T>(file: &File, request: libc::c_ulong, arg: &mut T) -> io::Result<libc::c_int> {
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request, arg as *mut T) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

/// A `mmap`ed region released on drop.
struct Mapping {
    ptr: *mut u8,
    len: usize,
}

impl Mapping {
    fn as_mut_slice(&mut self) -> &mut [u8] {
        // Owned mapping, exclusive access through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr.cast(), self.len) };
    }
}

/// The live connection to the hypervisor for one guest domain.
pub struct XenBridge {
    evtchn: File,
    privcmd: File,
    domid: u16,
    ioservid: u16,
    /// Pages 0 and 1 of the ioreq-server resource: buffered ring, then the
    /// per-vCPU synchronous slots.
    iopages: Mapping,
    /// Local event-channel ports, one per vCPU.
    vcpu_ports: Vec<u32>,
    bufioreq_port: u32,
}

impl XenBridge {
    /// Registers an ioreq server for `domid`, maps its pages, claims the
    /// XenVariable port range and binds the event channels.
    pub fn open(domid: u16) -> io::Result<XenBridge> {
        let privcmd = OpenOptions::new().read(true).write(true).open(PRIVCMD_DEV)?;
        let evtchn = OpenOptions::new().read(true).write(true).open(EVTCHN_DEV)?;

        let mut bridge = XenBridge {
            evtchn,
            privcmd,
            domid,
            ioservid: 0,
            iopages: Self::anonymous_mapping(2 * PAGE_SIZE)?,
            vcpu_ports: Vec::new(),
            bufioreq_port: 0,
        };

        bridge.ioservid = bridge.create_ioreq_server()?;
        bridge.iopages = bridge.map_ioreq_pages()?;
        bridge.map_port_range()?;
        bridge.set_server_state(true)?;

        let remote_bufioreq = bridge.server_bufioreq_port()?;
        bridge.bufioreq_port = bridge.bind_interdomain(remote_bufioreq)?;

        // Each populated slot carries the guest-side port for its vCPU.
        let eports = bridge.vcpu_eports();
        for (vcpu, eport) in eports.iter().enumerate() {
            let local = bridge.bind_interdomain(*eport)?;
            debug!("vcpu {vcpu}: evtchn {eport} -> {local}");
            bridge.vcpu_ports.push(local);
        }
        info!(
            "ioreq server {} up for domain {domid}, {} vCPU(s), port {IO_PORT_ADDR:#x}",
            bridge.ioservid,
            bridge.vcpu_ports.len()
        );

        Ok(bridge)
    }

    fn anonymous_mapping(len: usize) -> io::Result<Mapping> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Mapping {
            ptr: ptr.cast(),
            len,
        })
    }

    /// One device-model operation. `body` is the op-specific payload and
    /// is updated in place for out parameters.
    fn dm_op(&self, op: u32, body: &mut [u8]) -> io::Result<()> {
        let mut packet = Vec::with_capacity(8 + body.len());
        packet.extend_from_slice(&op.to_le_bytes());
        packet.extend_from_slice(&0u32.to_le_bytes());
        packet.extend_from_slice(body);

        let buf = PrivcmdDmOpBuf {
            uptr: packet.as_mut_ptr().cast(),
            size: packet.len() as u64,
        };
        let mut arg = PrivcmdDmOp {
            dom: self.domid,
            num: 1,
            _pad: 0,
            ubufs: &buf,
        };
        ioctl(&self.privcmd, IOCTL_PRIVCMD_DM_OP, &mut arg)?;

        body.copy_from_slice(&packet[8..]);
        Ok(())
    }

    fn create_ioreq_server(&self) -> io::Result<u16> {
        // { handle_bufioreq u8, pad[3], id u16 (out) }
        let mut body = [0u8; 8];
        body[0] = HVM_IOREQSRV_BUFIOREQ_LEGACY;
        self.dm_op(XEN_DMOP_CREATE_IOREQ_SERVER, &mut body)?;
        Ok(u16::from_le_bytes([body[4], body[5]]))
    }

    fn server_bufioreq_port(&self) -> io::Result<u32> {
        // { id u16, flags u16, ioreq_gfn u64, bufioreq_gfn u64, port u32 }
        let mut body = [0u8; 32];
        body[0..2].copy_from_slice(&self.ioservid.to_le_bytes());
        self.dm_op(XEN_DMOP_GET_IOREQ_SERVER_INFO, &mut body)?;
        Ok(u32::from_le_bytes([body[24], body[25], body[26], body[27]]))
    }

    fn map_port_range(&self) -> io::Result<()> {
        // { id u16, pad u16, type u32, start u64, end u64 }
        let mut body = [0u8; 24];
        body[0..2].copy_from_slice(&self.ioservid.to_le_bytes());
        body[4..8].copy_from_slice(&XEN_DMOP_IO_RANGE_PORT.to_le_bytes());
        body[8..16].copy_from_slice(&IO_PORT_ADDR.to_le_bytes());
        body[16..24].copy_from_slice(&(IO_PORT_ADDR + IO_PORT_SIZE - 1).to_le_bytes());
        self.dm_op(XEN_DMOP_MAP_IO_RANGE_TO_IOREQ_SERVER, &mut body)
    }

    fn set_server_state(&self, enabled: bool) -> io::Result<()> {
        // { id u16, enabled u8, pad u8 }
        let mut body = [0u8; 4];
        body[0..2].copy_from_slice(&self.ioservid.to_le_bytes());
        body[2] = enabled as u8;
        self.dm_op(XEN_DMOP_SET_IOREQ_SERVER_STATE, &mut body)
    }

    fn map_ioreq_pages(&self) -> io::Result<Mapping> {
        let len = 2 * PAGE_SIZE;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.privcmd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let mut arg = PrivcmdMmapResource {
            dom: self.domid,
            _pad: 0,
            typ: XENMEM_RESOURCE_IOREQ_SERVER,
            id: self.ioservid as u32,
            idx: 0,
            num: 2,
            addr: ptr as u64,
        };
        if let Err(err) = ioctl(&self.privcmd, IOCTL_PRIVCMD_MMAP_RESOURCE, &mut arg) {
            unsafe { libc::munmap(ptr, len) };
            return Err(err);
        }

        Ok(Mapping {
            ptr: ptr.cast(),
            len,
        })
    }

    fn bind_interdomain(&self, remote_port: u32) -> io::Result<u32> {
        let mut arg = EvtchnBindInterdomain {
            remote_domain: self.domid as u32,
            remote_port,
        };
        let local = ioctl(&self.evtchn, IOCTL_EVTCHN_BIND_INTERDOMAIN, &mut arg)?;
        Ok(local as u32)
    }

    fn unbind(&self, port: u32) {
        let mut arg = EvtchnPort { port };
        let _ = ioctl(&self.evtchn, IOCTL_EVTCHN_UNBIND, &mut arg);
    }

    /// Guest-side event ports advertised in the populated vCPU slots.
    fn vcpu_eports(&mut self) -> Vec<u32> {
        let shared = self.shared_page();
        let mut eports = Vec::new();
        for slot in shared.chunks_exact(IOREQ_SIZE) {
            match Ioreq::decode(slot) {
                Some(ioreq) if ioreq.vp_eport != 0 => eports.push(ioreq.vp_eport),
                _ => break,
            }
        }
        eports
    }

    fn buffered_page(&mut self) -> &mut [u8] {
        &mut self.iopages.as_mut_slice()[..PAGE_SIZE]
    }

    fn shared_page(&mut self) -> &mut [u8] {
        &mut self.iopages.as_mut_slice()[PAGE_SIZE..]
    }
}

impl Host for XenBridge {
    fn wait_event(&mut self) -> io::Result<Event> {
        let mut raw = [0u8; 4];
        (&self.evtchn).read_exact(&mut raw)?;
        let port = u32::from_le_bytes(raw);

        // Unmask before servicing, as the event device requires.
        (&self.evtchn).write_all(&raw)?;

        if port == self.bufioreq_port {
            return Ok(Event::Buffered);
        }
        match self.vcpu_ports.iter().position(|p| *p == port) {
            Some(vcpu) => Ok(Event::Vcpu(vcpu)),
            None => Ok(Event::Spurious(port)),
        }
    }

    fn read_vcpu_slot(&mut self, vcpu: usize) -> io::Result<Ioreq> {
        let offset = vcpu * IOREQ_SIZE;
        let shared = self.shared_page();
        shared
            .get(offset..offset + IOREQ_SIZE)
            .and_then(Ioreq::decode)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "vcpu slot out of range"))
    }

    fn write_vcpu_state(&mut self, vcpu: usize, state: u8) -> io::Result<()> {
        let offset = vcpu * IOREQ_SIZE;
        let shared = self.shared_page();
        let slot = shared
            .get_mut(offset..offset + IOREQ_SIZE)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "vcpu slot out of range"))?;
        Ioreq::write_state(slot, state);
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn drain_buffered(&mut self, sink: &mut dyn FnMut(Ioreq)) -> io::Result<usize> {
        Ok(ring::drain(self.buffered_page(), sink))
    }

    fn with_guest_pages(
        &mut self,
        gfn: u64,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> io::Result<()> {
        let len = SHMEM_SIZE;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.privcmd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let mut mapping = Mapping {
            ptr: ptr.cast(),
            len,
        };

        let frames: Vec<u64> = (0..SHMEM_PAGES as u64).map(|i| gfn + i).collect();
        let mut errs = vec![0 as libc::c_int; SHMEM_PAGES];
        let mut arg = PrivcmdMmapBatchV2 {
            num: SHMEM_PAGES as u32,
            dom: self.domid,
            _pad: 0,
            addr: ptr as u64,
            arr: frames.as_ptr(),
            err: errs.as_mut_ptr(),
        };
        ioctl(&self.privcmd, IOCTL_PRIVCMD_MMAPBATCH_V2, &mut arg)?;
        if let Some(errno) = errs.iter().find(|e| **e != 0) {
            return Err(io::Error::from_raw_os_error(errno.unsigned_abs() as i32));
        }

        f(mapping.as_mut_slice());
        Ok(())
    }

    fn notify_vcpu(&mut self, vcpu: usize) -> io::Result<()> {
        let port = *self
            .vcpu_ports
            .get(vcpu)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no such vcpu"))?;
        let mut arg = EvtchnPort { port };
        ioctl(&self.evtchn, IOCTL_EVTCHN_NOTIFY, &mut arg)?;
        Ok(())
    }
}

impl Drop for XenBridge {
    fn drop(&mut self) {
        for port in self.vcpu_ports.clone() {
            self.unbind(port);
        }
        self.unbind(self.bufioreq_port);
        let _ = self.set_server_state(false);
        let mut body = [0u8; 4];
        body[0..2].copy_from_slice(&self.ioservid.to_le_bytes());
        let _ = self.dm_op(XEN_DMOP_DESTROY_IOREQ_SERVER, &mut body);
    }
}
