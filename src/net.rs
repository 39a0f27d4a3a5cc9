//! Socket configuration and timestamped I/O
//!
//! Non-blocking UDP sockets tuned for the packet path (large buffers,
//! busy polling, CPU steering), SO_TIMESTAMPING enablement with a
//! software fallback when the NIC lacks hardware support, control
//! message parsing for receive timestamps, error-queue draining for
//! kernel transmit timestamps, and batched sends via sendmmsg.

use crate::constants::{BUSY_POLL_US, CMSG_BUFFER_SIZE, MAX_SOCKET_BUFFER, SOCKET_PRIORITY};
use anyhow::{Context, Result};
use log::{debug, warn};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::unix::io::RawFd;

// Constants from linux/net_tstamp.h and linux/errqueue.h that the
// libc crate does not export.
const SO_TIMESTAMPING_NEW: libc::c_int = 65;
const SCM_TIMESTAMPING_NEW: libc::c_int = 65;
const SCM_TIMESTAMPING_OLD: libc::c_int = 37;
const SOF_TIMESTAMPING_TX_SOFTWARE: u32 = 1 << 1;
const SOF_TIMESTAMPING_RX_HARDWARE: u32 = 1 << 2;
const SOF_TIMESTAMPING_RX_SOFTWARE: u32 = 1 << 3;
const SOF_TIMESTAMPING_SOFTWARE: u32 = 1 << 4;
const SOF_TIMESTAMPING_RAW_HARDWARE: u32 = 1 << 6;
const SO_BUSY_POLL: libc::c_int = 46;
const SO_INCOMING_CPU: libc::c_int = 49;
const SO_ZEROCOPY: libc::c_int = 60;
const SO_EE_ORIGIN_TIMESTAMPING: u8 = 4;
const SIOCSHWTSTAMP: libc::c_ulong = 0x89b0;
const HWTSTAMP_TX_OFF: libc::c_int = 0;
const HWTSTAMP_FILTER_ALL: libc::c_int = 1;

/// Timespec layout carried by SCM_TIMESTAMPING_NEW control messages.
#[repr(C)]
#[derive(Clone, Copy)]
struct KernelTimespec {
    tv_sec: i64,
    tv_nsec: i64,
}

/// scm_timestamping64: [0] = software/kernel, [1] = legacy,
/// [2] = raw hardware.
#[repr(C)]
#[derive(Clone, Copy)]
struct ScmTimestamping {
    ts: [KernelTimespec; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SockExtendedErr {
    ee_errno: u32,
    ee_origin: u8,
    ee_type: u8,
    ee_code: u8,
    ee_pad: u8,
    ee_info: u32,
    ee_data: u32,
}

/// hwtstamp_config passed through the SIOCSHWTSTAMP ioctl.
#[repr(C)]
struct HwtstampConfig {
    flags: libc::c_int,
    tx_type: libc::c_int,
    rx_filter: libc::c_int,
}

fn ts_to_ns(ts: KernelTimespec) -> u64 {
    if ts.tv_sec == 0 && ts.tv_nsec == 0 {
        return 0;
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Create a non-blocking UDP socket bound to `addr`.
pub fn bound_udp_socket(addr: SocketAddrV4) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).with_context(|| format!("Failed to bind UDP socket to {addr}"))?;
    socket
        .set_nonblocking(true)
        .context("Failed to set socket non-blocking")?;
    Ok(socket)
}

fn set_opt_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Socket tuning knobs for the packet path.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketTuning {
    /// CPU to which the kernel should steer receive processing.
    pub incoming_cpu: Option<usize>,
    /// Request best-effort zero-copy transmission.
    pub zero_copy: bool,
}

/// Apply packet-path tuning. Nothing here is fatal: each knob that
/// cannot be set is logged and the run continues.
pub fn tune_socket(fd: RawFd, tuning: &SocketTuning) {
    if let Err(e) = set_opt_int(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, MAX_SOCKET_BUFFER as libc::c_int) {
        warn!("Could not set send buffer size: {e}");
    }
    if let Err(e) = set_opt_int(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, MAX_SOCKET_BUFFER as libc::c_int) {
        warn!("Could not set receive buffer size: {e}");
    }
    if let Err(e) = set_opt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1) {
        warn!("Could not set SO_REUSEADDR: {e}");
    }
    if let Err(e) = set_opt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1) {
        warn!("Could not set SO_REUSEPORT: {e}");
    }
    if let Err(e) = set_opt_int(fd, libc::SOL_SOCKET, libc::SO_PRIORITY, SOCKET_PRIORITY as libc::c_int) {
        warn!("Could not set socket priority: {e}");
    }
    if let Some(cpu) = tuning.incoming_cpu {
        if let Err(e) = set_opt_int(fd, libc::SOL_SOCKET, SO_INCOMING_CPU, cpu as libc::c_int) {
            warn!("Could not set incoming CPU: {e}");
        } else {
            debug!("Socket receive processing steered to CPU {cpu}");
        }
    }
    if let Err(e) = set_opt_int(fd, libc::SOL_SOCKET, SO_BUSY_POLL, BUSY_POLL_US as libc::c_int) {
        warn!("Could not enable busy polling: {e}");
    } else {
        debug!("Busy polling enabled ({BUSY_POLL_US} us)");
    }
    if tuning.zero_copy {
        if let Err(e) = set_opt_int(fd, libc::SOL_SOCKET, SO_ZEROCOPY, 1) {
            warn!("Could not enable zero-copy (kernel may not support it): {e}");
        } else {
            debug!("Zero-copy transmission enabled");
        }
    }
}

/// Bind the socket to a network interface.
pub fn bind_to_device(fd: RawFd, iface: &str) -> Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            iface.as_ptr() as *const libc::c_void,
            iface.len() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error()).with_context(|| format!("Failed to bind socket to interface {iface}"));
    }
    Ok(())
}

/// Enable hardware and software receive timestamping. Hardware
/// enablement on the interface is best-effort: when the NIC refuses,
/// the run degrades to software timestamps with a warning. Returns
/// whether hardware timestamps are active.
pub fn enable_rx_timestamping(fd: RawFd, iface: Option<&str>) -> Result<bool> {
    let mut hardware = false;
    if let Some(iface) = iface {
        match enable_hw_timestamping(fd, iface) {
            Ok(()) => {
                debug!("Hardware timestamping enabled on {iface}");
                hardware = true;
            }
            Err(e) => {
                warn!("Hardware timestamping not supported on {iface}: {e}");
                warn!("Continuing with software timestamping only");
            }
        }
    }

    let flags = SOF_TIMESTAMPING_RX_HARDWARE
        | SOF_TIMESTAMPING_RX_SOFTWARE
        | SOF_TIMESTAMPING_RAW_HARDWARE
        | SOF_TIMESTAMPING_SOFTWARE;
    set_opt_int(fd, libc::SOL_SOCKET, SO_TIMESTAMPING_NEW, flags as libc::c_int)
        .context("SO_TIMESTAMPING_NEW failed for receive timestamps")?;
    Ok(hardware)
}

/// Enable software transmit timestamping so kernel send times are
/// later retrievable from the socket error queue.
pub fn enable_tx_timestamping(fd: RawFd) -> Result<()> {
    let flags = SOF_TIMESTAMPING_TX_SOFTWARE | SOF_TIMESTAMPING_SOFTWARE;
    set_opt_int(fd, libc::SOL_SOCKET, SO_TIMESTAMPING_NEW, flags as libc::c_int)
        .context("SO_TIMESTAMPING_NEW failed for transmit timestamps")?;
    set_opt_int(fd, libc::SOL_IP, libc::IP_RECVERR, 1).context("IP_RECVERR failed")?;
    Ok(())
}

fn enable_hw_timestamping(fd: RawFd, iface: &str) -> io::Result<()> {
    let mut config = HwtstampConfig {
        flags: 0,
        tx_type: HWTSTAMP_TX_OFF,
        rx_filter: HWTSTAMP_FILTER_ALL,
    };
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    let name_bytes = iface.as_bytes();
    let max = ifr.ifr_name.len() - 1;
    for (i, &b) in name_bytes.iter().take(max).enumerate() {
        ifr.ifr_name[i] = b as libc::c_char;
    }
    ifr.ifr_ifru.ifru_data = &mut config as *mut HwtstampConfig as *mut libc::c_char;

    let rc = unsafe { libc::ioctl(fd, SIOCSHWTSTAMP, &mut ifr) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn sockaddr_from(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(*addr.ip()).to_be(),
        },
        sin_zero: [0; 8],
    }
}

fn sockaddr_to(addr: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
        u16::from_be(addr.sin_port),
    )
}

/// One received packet with its kernel-provided timestamps.
#[derive(Debug, Clone, Copy)]
pub struct RxPacket {
    pub len: usize,
    /// NIC clock receive timestamp, 0 when absent.
    pub hw_rx_ns: u64,
    /// Kernel receive timestamp, 0 when absent.
    pub ker_rx_ns: u64,
    pub peer: SocketAddrV4,
}

/// Non-blocking receive with timestamp control messages. Returns
/// `Ok(None)` when no packet is waiting.
pub fn recv_with_timestamps(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<RxPacket>> {
    let mut cbuf = [0u8; CMSG_BUFFER_SIZE];
    let mut src: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut src as *mut libc::sockaddr_in as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cbuf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cbuf.len();

    let ret = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_DONTWAIT) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }

    let (hw_rx_ns, ker_rx_ns) = unsafe { parse_timestamp_cmsgs(&msg) };
    Ok(Some(RxPacket {
        len: ret as usize,
        hw_rx_ns,
        ker_rx_ns,
        peer: sockaddr_to(&src),
    }))
}

unsafe fn parse_timestamp_cmsgs(msg: &libc::msghdr) -> (u64, u64) {
    let mut hw = 0u64;
    let mut ker = 0u64;
    let msg_ptr = msg as *const libc::msghdr as *mut libc::msghdr;
    let mut cmsg = libc::CMSG_FIRSTHDR(msg_ptr);
    while !cmsg.is_null() {
        let hdr = &*cmsg;
        if hdr.cmsg_level == libc::SOL_SOCKET
            && (hdr.cmsg_type == SCM_TIMESTAMPING_NEW || hdr.cmsg_type == SCM_TIMESTAMPING_OLD)
        {
            let ts: ScmTimestamping = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const ScmTimestamping);
            ker = ts_to_ns(ts.ts[0]);
            hw = ts_to_ns(ts.ts[2]);
        }
        cmsg = libc::CMSG_NXTHDR(msg_ptr, cmsg);
    }
    (hw, ker)
}

/// One kernel transmit-timestamp notification drained from the
/// error queue.
#[derive(Debug, Clone, Copy)]
pub struct TxRecord {
    /// Sequence number recovered from the echoed payload, when the
    /// echoed data was long enough to carry one.
    pub payload_seq: Option<u32>,
    /// Kernel-assigned identifier for the notification.
    pub kernel_seq: u32,
    /// Kernel transmit timestamp, 0 when the control message was
    /// missing.
    pub ker_tx_ns: u64,
}

/// Drain up to `max` entries from the transmit error queue. The
/// sequence number is taken from the echoed payload at the start of
/// the UDP data (offset 42 when the queue returns the full IP+UDP
/// frame, offset 0 for a bare payload), falling back to the kernel's
/// notification identifier for short echoes.
pub fn drain_errqueue(fd: RawFd, out: &mut Vec<TxRecord>, max: usize) -> usize {
    let mut drained = 0;
    let mut buf = [0u8; 2048];
    let mut cbuf = [0u8; CMSG_BUFFER_SIZE];

    while drained < max {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cbuf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cbuf.len();

        let ret = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT) };
        if ret < 0 {
            break;
        }
        let len = ret as usize;

        let mut ker_tx_ns = 0u64;
        let mut kernel_seq = 0u32;
        unsafe {
            let msg_ptr = &msg as *const libc::msghdr as *mut libc::msghdr;
            let mut cmsg = libc::CMSG_FIRSTHDR(msg_ptr);
            while !cmsg.is_null() {
                let hdr = &*cmsg;
                if hdr.cmsg_level == libc::SOL_SOCKET
                    && (hdr.cmsg_type == SCM_TIMESTAMPING_NEW || hdr.cmsg_type == SCM_TIMESTAMPING_OLD)
                {
                    let ts: ScmTimestamping =
                        std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const ScmTimestamping);
                    ker_tx_ns = ts_to_ns(ts.ts[0]);
                } else if hdr.cmsg_level == libc::SOL_IP && hdr.cmsg_type == libc::IP_RECVERR {
                    let serr: SockExtendedErr =
                        std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const SockExtendedErr);
                    if serr.ee_origin == SO_EE_ORIGIN_TIMESTAMPING {
                        kernel_seq = serr.ee_data;
                    }
                }
                cmsg = libc::CMSG_NXTHDR(msg_ptr, cmsg);
            }
        }

        // The queue may echo the full IP+UDP frame or just the
        // payload, depending on the path the packet took.
        let payload_seq = if len >= 46 {
            Some(u32::from_be_bytes([buf[42], buf[43], buf[44], buf[45]]))
        } else if len >= 4 {
            Some(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
        } else {
            None
        };

        out.push(TxRecord {
            payload_seq,
            kernel_seq,
            ker_tx_ns,
        });
        drained += 1;
    }
    drained
}

/// Whether the socket reports error-queue pressure (ENOBUFS pending).
pub fn errqueue_overflowed(fd: RawFd) -> bool {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    rc == 0 && err == libc::ENOBUFS
}

/// Reusable sendmmsg batcher. Holds its iovec/mmsghdr arrays across
/// calls so the hot path performs no allocation per send.
pub struct BatchSender {
    iovs: Vec<libc::iovec>,
    msgs: Vec<libc::mmsghdr>,
    addrs: Vec<libc::sockaddr_in>,
}

impl BatchSender {
    pub fn new(max_batch: usize) -> Self {
        Self {
            iovs: Vec::with_capacity(max_batch),
            msgs: Vec::with_capacity(max_batch),
            addrs: Vec::with_capacity(max_batch),
        }
    }

    fn submit(&mut self, fd: RawFd) -> io::Result<usize> {
        let ret = unsafe {
            libc::sendmmsg(
                fd,
                self.msgs.as_mut_ptr(),
                self.msgs.len() as libc::c_uint,
                libc::MSG_DONTWAIT,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(ret as usize)
    }

    /// Batched non-blocking send on a connected socket. Returns the
    /// number of packets handed to the kernel; 0 on WouldBlock.
    pub fn send<T: AsRef<[u8]>>(&mut self, fd: RawFd, packets: &[T]) -> io::Result<usize> {
        if packets.is_empty() {
            return Ok(0);
        }
        self.iovs.clear();
        self.msgs.clear();
        for p in packets {
            let p = p.as_ref();
            self.iovs.push(libc::iovec {
                iov_base: p.as_ptr() as *mut libc::c_void,
                iov_len: p.len(),
            });
        }
        for iov in self.iovs.iter_mut() {
            let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
            hdr.msg_iov = iov;
            hdr.msg_iovlen = 1;
            self.msgs.push(libc::mmsghdr {
                msg_hdr: hdr,
                msg_len: 0,
            });
        }
        self.submit(fd)
    }

    /// Batched non-blocking send with a destination per packet.
    pub fn send_addressed<T: AsRef<[u8]>>(
        &mut self,
        fd: RawFd,
        packets: &[(T, SocketAddrV4)],
    ) -> io::Result<usize> {
        if packets.is_empty() {
            return Ok(0);
        }
        self.iovs.clear();
        self.msgs.clear();
        self.addrs.clear();
        for (p, dest) in packets {
            let p = p.as_ref();
            self.iovs.push(libc::iovec {
                iov_base: p.as_ptr() as *mut libc::c_void,
                iov_len: p.len(),
            });
            self.addrs.push(sockaddr_from(*dest));
        }
        for (iov, addr) in self.iovs.iter_mut().zip(self.addrs.iter_mut()) {
            let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
            hdr.msg_iov = iov;
            hdr.msg_iovlen = 1;
            hdr.msg_name = addr as *mut libc::sockaddr_in as *mut libc::c_void;
            hdr.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            self.msgs.push(libc::mmsghdr {
                msg_hdr: hdr,
                msg_len: 0,
            });
        }
        self.submit(fd)
    }
}

/// Single non-blocking sendto. Returns false on WouldBlock.
pub fn send_one(fd: RawFd, packet: &[u8], dest: SocketAddrV4) -> io::Result<bool> {
    let addr = sockaddr_from(dest);
    let ret = unsafe {
        libc::sendto(
            fd,
            packet.as_ptr() as *const libc::c_void,
            packet.len(),
            libc::MSG_DONTWAIT,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 4791);
        let raw = sockaddr_from(addr);
        assert_eq!(sockaddr_to(&raw), addr);
    }

    #[test]
    fn zero_timespec_is_absent() {
        assert_eq!(ts_to_ns(KernelTimespec { tv_sec: 0, tv_nsec: 0 }), 0);
        assert_eq!(
            ts_to_ns(KernelTimespec {
                tv_sec: 2,
                tv_nsec: 5
            }),
            2_000_000_005
        );
    }

    #[test]
    fn loopback_send_and_receive() {
        let rx = bound_udp_socket(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let tx = bound_udp_socket(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let rx_port = match rx.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a.port(),
            _ => panic!("expected v4"),
        };
        use std::os::unix::io::AsRawFd;
        // Timestamping may be refused in sandboxes; the receive path
        // must still work without it.
        let _ = enable_rx_timestamping(rx.as_raw_fd(), None);

        let dest = SocketAddrV4::new(Ipv4Addr::LOCALHOST, rx_port);
        let payload = 7u32.to_be_bytes();
        assert!(send_one(tx.as_raw_fd(), &payload, dest).unwrap());

        let mut buf = [0u8; 64];
        let mut got = None;
        for _ in 0..1000 {
            if let Some(pkt) = recv_with_timestamps(rx.as_raw_fd(), &mut buf).unwrap() {
                got = Some(pkt);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let pkt = got.expect("no packet received on loopback");
        assert_eq!(pkt.len, 4);
        assert_eq!(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]), 7);
    }
}
