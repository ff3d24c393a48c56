//! The I/O pump.
//!
//! Adapts host I/O events into `Service::handle` calls: one 4-byte port
//! write at the XenVariable port carries a guest frame number; the pump
//! maps the 16-page window there, runs the request, and completes the
//! ioreq slot.
//!
//! The slot state machine is READY → INPROCESS → RESPONSE_READY with a
//! barrier before and after the final transition, and the guest is
//! notified only after it. Buffered requests are drained in ring order
//! with a single `read_pointer` publish per batch.
//!
//! Everything host-specific sits behind the [`Host`] trait; the pump
//! itself is plain logic and is tested against an in-memory host.

use std::io;
use std::sync::atomic::{fence, Ordering};
use std::time::Duration;

use log::{debug, error};

use xenvars_core::Service;
use xenvars_efi::{IO_PORT_ADDR, IO_PORT_SIZE};

/// Ioreq wire constants, from the hypervisor's public ABI.
pub const IOREQ_TYPE_PIO: u8 = 0;
pub const IOREQ_WRITE: u8 = 0;
pub const IOREQ_READ: u8 = 1;

pub const STATE_IOREQ_NONE: u8 = 0;
pub const STATE_IOREQ_READY: u8 = 1;
pub const STATE_IOREQ_INPROCESS: u8 = 2;
pub const STATE_IORESP_READY: u8 = 3;

/// Size of one ioreq slot in the shared io page.
pub const IOREQ_SIZE: usize = 32;

/// One decoded I/O request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ioreq {
    pub addr: u64,
    pub data: u64,
    pub count: u32,
    pub size: u32,
    pub vp_eport: u32,
    pub state: u8,
    pub data_is_ptr: u8,
    pub dir: u8,
    pub df: u8,
    pub typ: u8,
}

impl Ioreq {
    /// Decodes one shared-iopage slot. Layout:
    /// `addr u64 | data u64 | count u32 | size u32 | vp_eport u32 | pad u16 |
    /// state:4 data_is_ptr:1 dir:1 df:1 | type u8`.
    pub fn decode(raw: &[u8]) -> Option<Ioreq> {
        if raw.len() < IOREQ_SIZE {
            return None;
        }
        let u64_at = |o: usize| u64::from_le_bytes(raw[o..o + 8].try_into().unwrap());
        let u32_at = |o: usize| u32::from_le_bytes(raw[o..o + 4].try_into().unwrap());

        let flags = raw[30];
        Some(Ioreq {
            addr: u64_at(0),
            data: u64_at(8),
            count: u32_at(16),
            size: u32_at(20),
            vp_eport: u32_at(24),
            state: flags & 0x0f,
            data_is_ptr: (flags >> 4) & 1,
            dir: (flags >> 5) & 1,
            df: (flags >> 6) & 1,
            typ: raw[31],
        })
    }

    /// Inverse of [`decode`], used by the slot writers and the tests.
    ///
    /// [`decode`]: Ioreq::decode
    pub fn encode(&self) -> [u8; IOREQ_SIZE] {
        let mut raw = [0u8; IOREQ_SIZE];
        raw[0..8].copy_from_slice(&self.addr.to_le_bytes());
        raw[8..16].copy_from_slice(&self.data.to_le_bytes());
        raw[16..20].copy_from_slice(&self.count.to_le_bytes());
        raw[20..24].copy_from_slice(&self.size.to_le_bytes());
        raw[24..28].copy_from_slice(&self.vp_eport.to_le_bytes());
        raw[30] = (self.state & 0x0f)
            | ((self.data_is_ptr & 1) << 4)
            | ((self.dir & 1) << 5)
            | ((self.df & 1) << 6);
        raw[31] = self.typ;
        raw
    }

    /// Patches only the state nibble of a raw slot.
    pub fn write_state(raw: &mut [u8], state: u8) {
        if let Some(flags) = raw.get_mut(30) {
            *flags = (*flags & 0xf0) | (state & 0x0f);
        }
    }
}

/// The buffered-ioreq ring (one shared page).
pub mod ring {
    use super::*;

    /// Slots in the ring; 8 bytes each behind the two ring pointers.
    pub const SLOT_COUNT: u32 = 511;

    const HEADER: usize = 8;
    const SLOT_SIZE: usize = 8;
    const PAGE_MIN: usize = HEADER + SLOT_COUNT as usize * SLOT_SIZE;

    fn slot_offset(index: u32) -> usize {
        HEADER + (index % SLOT_COUNT) as usize * SLOT_SIZE
    }

    fn read_u32(page: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(page[offset..offset + 4].try_into().unwrap())
    }

    /// Drains every pending buffered request in ring order.
    ///
    /// A slot packs `type:8 | pad:1 | dir:1 | size:2 | addr:20` and a
    /// 32-bit data word; size code 3 means the following slot carries the
    /// upper data half. `read_pointer` is published once per batch with a
    /// barrier, matching the producer's expectations.
    pub fn drain(page: &mut [u8], mut sink: impl FnMut(Ioreq)) -> usize {
        if page.len() < PAGE_MIN {
            return 0;
        }

        let mut handled = 0;
        loop {
            let mut rp = read_u32(page, 0);
            let wp = read_u32(page, 4);
            if rp == wp {
                break;
            }

            while rp != wp {
                let off = slot_offset(rp);
                let word = read_u32(page, off);
                let mut data = read_u32(page, off + 4) as u64;
                rp = rp.wrapping_add(1);

                let size_code = (word >> 10) & 0x3;
                if size_code == 3 {
                    // The second slot holds the upper 32 bits.
                    let off = slot_offset(rp);
                    data |= (read_u32(page, off + 4) as u64) << 32;
                    rp = rp.wrapping_add(1);
                }

                let ioreq = Ioreq {
                    addr: (word >> 12) as u64,
                    data,
                    count: 1,
                    size: 1 << size_code,
                    state: STATE_IOREQ_READY,
                    dir: ((word >> 9) & 1) as u8,
                    df: 1,
                    typ: (word & 0xff) as u8,
                    ..Ioreq::default()
                };

                sink(ioreq);
                handled += 1;
                fence(Ordering::SeqCst);
            }

            page[0..4].copy_from_slice(&rp.to_le_bytes());
            fence(Ordering::SeqCst);
        }
        handled
    }
}

/// What an event wait produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The synchronous slot of this vCPU fired.
    Vcpu(usize),
    /// The buffered ring fired.
    Buffered,
    /// A port this backend never bound; logged and dropped.
    Spurious(u32),
}

/// The hypervisor seam. The production implementation wraps the Xen
/// control devices; tests drive the pump with an in-memory host.
pub trait Host {
    /// Blocks until the host signals an event.
    fn wait_event(&mut self) -> io::Result<Event>;

    /// Reads this vCPU's ioreq slot.
    fn read_vcpu_slot(&mut self, vcpu: usize) -> io::Result<Ioreq>;

    /// Publishes a slot state transition, with the barrier the producer
    /// expects.
    fn write_vcpu_state(&mut self, vcpu: usize, state: u8) -> io::Result<()>;

    /// Drains the buffered ring into `sink`.
    fn drain_buffered(&mut self, sink: &mut dyn FnMut(Ioreq)) -> io::Result<usize>;

    /// Maps the 16-page guest window at `gfn` read/write for the duration
    /// of the callback.
    fn with_guest_pages(
        &mut self,
        gfn: u64,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> io::Result<()>;

    /// Notifies the guest that this vCPU's response is ready.
    fn notify_vcpu(&mut self, vcpu: usize) -> io::Result<()>;
}

/// The event pump: one host, one service, strictly sequential.
pub struct Pump<H: Host> {
    host: H,
    service: Service,
}

impl<H: Host> Pump<H> {
    pub fn new(host: H, service: Service) -> Self {
        Pump { host, service }
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Runs until `should_stop` yields a signal. The check sits at the
    /// only safe point, the event-wait boundary.
    pub fn run(&mut self, should_stop: impl Fn() -> Option<i32>) -> io::Result<i32> {
        loop {
            if let Some(sig) = should_stop() {
                return Ok(sig);
            }
            match self.poll_once() {
                Ok(()) => {}
                // A signal interrupted the wait; the next iteration
                // observes the flag.
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    error!("event wait failed: {err}; retrying");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    /// Waits for one event and services it completely.
    pub fn poll_once(&mut self) -> io::Result<()> {
        match self.host.wait_event()? {
            Event::Vcpu(vcpu) => self.service_vcpu(vcpu),
            Event::Buffered => {
                let mut batch = Vec::new();
                self.host.drain_buffered(&mut |ioreq| batch.push(ioreq))?;
                for ioreq in batch {
                    self.dispatch(&ioreq);
                }
                Ok(())
            }
            Event::Spurious(port) => {
                debug!("event on unknown port {port}, dropped");
                Ok(())
            }
        }
    }

    /// The per-slot state machine.
    fn service_vcpu(&mut self, vcpu: usize) -> io::Result<()> {
        let ioreq = self.host.read_vcpu_slot(vcpu)?;

        if ioreq.typ > 8 {
            error!("vcpu {vcpu}: unknown ioreq type {:#x}", ioreq.typ);
            return Ok(());
        }

        // Not yet ready: common shortly after ioreq-server setup. The
        // host will signal again.
        if ioreq.state != STATE_IOREQ_READY {
            return Ok(());
        }

        // Reads of the port are acknowledged without processing.
        if ioreq.dir == IOREQ_READ {
            debug!("vcpu {vcpu}: port read ignored");
            return Ok(());
        }

        self.host.write_vcpu_state(vcpu, STATE_IOREQ_INPROCESS)?;
        self.dispatch(&ioreq);
        fence(Ordering::SeqCst);

        self.host.write_vcpu_state(vcpu, STATE_IORESP_READY)?;
        fence(Ordering::SeqCst);

        self.host.notify_vcpu(vcpu)
    }

    /// Filters one request and runs it against the service.
    fn dispatch(&mut self, ioreq: &Ioreq) {
        if ioreq.typ != IOREQ_TYPE_PIO {
            return;
        }

        if ioreq.addr < IO_PORT_ADDR || ioreq.addr >= IO_PORT_ADDR + IO_PORT_SIZE {
            error!(
                "port {:#x} outside {:#x}..{:#x}",
                ioreq.addr,
                IO_PORT_ADDR,
                IO_PORT_ADDR + IO_PORT_SIZE
            );
            return;
        }

        if ioreq.size != 4 {
            error!("expected a 4-byte port write, got {}", ioreq.size);
            return;
        }

        if ioreq.dir != IOREQ_WRITE {
            return;
        }

        let gfn = ioreq.data;
        let service = &mut self.service;
        if let Err(err) = self
            .host
            .with_guest_pages(gfn, &mut |page| service.handle(page))
        {
            error!("mapping guest frame {gfn:#x} failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use xenvars_core::{Config, VarStore};
    use xenvars_efi::SHMEM_SIZE;

    /// In-memory host: scripted events, one vCPU slot, one guest window.
    struct MockHost {
        events: VecDeque<Event>,
        slot: [u8; IOREQ_SIZE],
        guest: Vec<u8>,
        buffered: Vec<u8>,
        transitions: Vec<u8>,
        notifies: usize,
        maps: usize,
    }

    impl MockHost {
        fn new() -> Self {
            MockHost {
                events: VecDeque::new(),
                slot: [0; IOREQ_SIZE],
                guest: vec![0; SHMEM_SIZE],
                buffered: vec![0; 4096],
                transitions: Vec::new(),
                notifies: 0,
                maps: 0,
            }
        }

        fn script(&mut self, ioreq: Ioreq) {
            self.slot = ioreq.encode();
            self.events.push_back(Event::Vcpu(0));
        }
    }

    impl Host for MockHost {
        fn wait_event(&mut self) -> io::Result<Event> {
            self.events
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no events"))
        }

        fn read_vcpu_slot(&mut self, _vcpu: usize) -> io::Result<Ioreq> {
            Ok(Ioreq::decode(&self.slot).unwrap())
        }

        fn write_vcpu_state(&mut self, _vcpu: usize, state: u8) -> io::Result<()> {
            Ioreq::write_state(&mut self.slot, state);
            self.transitions.push(state);
            Ok(())
        }

        fn drain_buffered(&mut self, sink: &mut dyn FnMut(Ioreq)) -> io::Result<usize> {
            Ok(ring::drain(&mut self.buffered, sink))
        }

        fn with_guest_pages(
            &mut self,
            _gfn: u64,
            f: &mut dyn FnMut(&mut [u8]),
        ) -> io::Result<()> {
            self.maps += 1;
            f(&mut self.guest);
            Ok(())
        }

        fn notify_vcpu(&mut self, _vcpu: usize) -> io::Result<()> {
            self.notifies += 1;
            Ok(())
        }
    }

    fn port_write() -> Ioreq {
        Ioreq {
            addr: IO_PORT_ADDR,
            data: 0x1234,
            count: 1,
            size: 4,
            state: STATE_IOREQ_READY,
            dir: IOREQ_WRITE,
            typ: IOREQ_TYPE_PIO,
            ..Ioreq::default()
        }
    }

    fn pump(host: MockHost) -> Pump<MockHost> {
        Pump::new(host, Service::new(Config::default(), VarStore::new()))
    }

    #[test]
    fn ioreq_codec_round_trip() {
        let ioreq = Ioreq {
            addr: 0x100,
            data: 0xdead_beef_cafe,
            count: 1,
            size: 4,
            vp_eport: 9,
            state: STATE_IOREQ_READY,
            data_is_ptr: 0,
            dir: IOREQ_READ,
            df: 1,
            typ: IOREQ_TYPE_PIO,
        };
        assert_eq!(Ioreq::decode(&ioreq.encode()), Some(ioreq));
        assert_eq!(Ioreq::decode(&[0u8; 8]), None);
    }

    #[test]
    fn state_patch_preserves_flags() {
        let mut raw = Ioreq {
            state: STATE_IOREQ_READY,
            dir: IOREQ_READ,
            df: 1,
            ..port_write()
        }
        .encode();

        Ioreq::write_state(&mut raw, STATE_IORESP_READY);
        let decoded = Ioreq::decode(&raw).unwrap();
        assert_eq!(decoded.state, STATE_IORESP_READY);
        assert_eq!(decoded.dir, IOREQ_READ);
        assert_eq!(decoded.df, 1);
    }

    #[test]
    fn completes_a_ready_write() {
        let mut host = MockHost::new();
        host.script(port_write());

        let mut pump = pump(host);
        pump.poll_once().unwrap();

        assert_eq!(
            pump.host.transitions,
            vec![STATE_IOREQ_INPROCESS, STATE_IORESP_READY]
        );
        assert_eq!(pump.host.notifies, 1);
        assert_eq!(pump.host.maps, 1);
        // The service wrote a reply (an error status: the page was all
        // zeroes, i.e. version 0).
        assert_ne!(&pump.host.guest[..8], &[0u8; 8]);
    }

    #[test]
    fn skips_slot_not_ready() {
        let mut host = MockHost::new();
        host.script(Ioreq {
            state: STATE_IOREQ_NONE,
            ..port_write()
        });

        let mut pump = pump(host);
        pump.poll_once().unwrap();
        assert!(pump.host.transitions.is_empty());
        assert_eq!(pump.host.notifies, 0);
    }

    #[test]
    fn ignores_port_reads_without_completing() {
        let mut host = MockHost::new();
        host.script(Ioreq {
            dir: IOREQ_READ,
            ..port_write()
        });

        let mut pump = pump(host);
        pump.poll_once().unwrap();
        assert!(pump.host.transitions.is_empty());
        assert_eq!(pump.host.maps, 0);
    }

    #[test]
    fn filters_wrong_port_and_width() {
        for bad in [
            Ioreq {
                addr: 0x80,
                ..port_write()
            },
            Ioreq {
                addr: IO_PORT_ADDR + IO_PORT_SIZE,
                ..port_write()
            },
            Ioreq {
                size: 2,
                ..port_write()
            },
            Ioreq {
                typ: 3,
                ..port_write()
            },
        ] {
            let mut host = MockHost::new();
            host.script(bad);
            let mut pump = pump(host);
            pump.poll_once().unwrap();
            // Dropped before mapping, but the slot still completes.
            assert_eq!(pump.host.maps, 0, "{bad:?}");
            assert_eq!(pump.host.notifies, 1, "{bad:?}");
        }
    }

    #[test]
    fn spurious_event_is_dropped() {
        let mut host = MockHost::new();
        host.events.push_back(Event::Spurious(999));
        let mut pump = pump(host);
        pump.poll_once().unwrap();
        assert_eq!(pump.host.maps, 0);
    }

    fn buf_slot(typ: u8, dir: u8, size_code: u32, addr: u32, data: u32) -> [u8; 8] {
        let word =
            typ as u32 | ((dir as u32) << 9) | (size_code << 10) | ((addr & 0xfffff) << 12);
        let mut out = [0u8; 8];
        out[0..4].copy_from_slice(&word.to_le_bytes());
        out[4..8].copy_from_slice(&data.to_le_bytes());
        out
    }

    fn put_slot(page: &mut [u8], index: u32, slot: [u8; 8]) {
        let off = 8 + (index % ring::SLOT_COUNT) as usize * 8;
        page[off..off + 8].copy_from_slice(&slot);
    }

    fn set_pointers(page: &mut [u8], rp: u32, wp: u32) {
        page[0..4].copy_from_slice(&rp.to_le_bytes());
        page[4..8].copy_from_slice(&wp.to_le_bytes());
    }

    #[test]
    fn buffered_ring_drains_in_order() {
        let mut page = vec![0u8; 4096];
        put_slot(&mut page, 0, buf_slot(IOREQ_TYPE_PIO, IOREQ_WRITE, 2, 0x100, 0xaaaa));
        put_slot(&mut page, 1, buf_slot(IOREQ_TYPE_PIO, IOREQ_WRITE, 2, 0x100, 0xbbbb));
        set_pointers(&mut page, 0, 2);

        let mut seen = Vec::new();
        let handled = ring::drain(&mut page, |ioreq| seen.push(ioreq));

        assert_eq!(handled, 2);
        assert_eq!(seen[0].data, 0xaaaa);
        assert_eq!(seen[1].data, 0xbbbb);
        assert_eq!(seen[0].addr, 0x100);
        assert_eq!(seen[0].size, 4);
        assert_eq!(seen[0].state, STATE_IOREQ_READY);
        // read_pointer caught up with write_pointer.
        assert_eq!(&page[0..4], &2u32.to_le_bytes());
    }

    #[test]
    fn buffered_ring_merges_two_slot_requests() {
        let mut page = vec![0u8; 4096];
        put_slot(
            &mut page,
            0,
            buf_slot(IOREQ_TYPE_PIO, IOREQ_WRITE, 3, 0x100, 0x9999_0000),
        );
        put_slot(&mut page, 1, buf_slot(0, 0, 0, 0, 0x0000_0042));
        set_pointers(&mut page, 0, 2);

        let mut seen = Vec::new();
        ring::drain(&mut page, |ioreq| seen.push(ioreq));

        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].size, 8);
        assert_eq!(seen[0].data, 0x0000_0042_9999_0000);
    }

    #[test]
    fn buffered_ring_wraps_modulo_slot_count() {
        let mut page = vec![0u8; 4096];
        let last = ring::SLOT_COUNT - 1;
        put_slot(&mut page, last, buf_slot(IOREQ_TYPE_PIO, IOREQ_WRITE, 2, 0x100, 1));
        put_slot(&mut page, last + 1, buf_slot(IOREQ_TYPE_PIO, IOREQ_WRITE, 2, 0x100, 2));
        set_pointers(&mut page, last, last + 2);

        let mut seen = Vec::new();
        ring::drain(&mut page, |ioreq| seen.push(ioreq));
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].data, 1);
        assert_eq!(seen[1].data, 2);
    }

    #[test]
    fn empty_ring_is_a_noop() {
        let mut page = vec![0u8; 4096];
        set_pointers(&mut page, 7, 7);
        assert_eq!(ring::drain(&mut page, |_| panic!("no requests")), 0);

        // Undersized page: refused outright.
        let mut short = vec![0u8; 64];
        assert_eq!(ring::drain(&mut short, |_| ()), 0);
    }

    #[test]
    fn run_stops_at_the_wait_boundary() {
        let host = MockHost::new();
        let mut pump = pump(host);
        let sig = pump.run(|| Some(libc::SIGTERM)).unwrap();
        assert_eq!(sig, libc::SIGTERM);
    }
}
