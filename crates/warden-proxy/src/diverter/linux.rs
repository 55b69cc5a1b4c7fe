//! Linux netfilter backend: nft NAT redirect rules, `SO_ORIGINAL_DST`
//! recovery, and `/proc` process attribution.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::process::{Command, Stdio};

use tokio::net::TcpStream;

use crate::error::{ProxyError, Result};

const NFT_TABLE: &str = "warden";

/// `getsockopt` names for the conntrack original destination.
const SO_ORIGINAL_DST: libc::c_int = 80;
const IP6T_SO_ORIGINAL_DST: libc::c_int = 80;

/// Installed nft redirect rules; removed on `remove()` or drop.
#[derive(Debug)]
pub struct NftRedirect {
    removed: bool,
}

impl NftRedirect {
    /// Installs the NAT output chain. Sockets carrying `mark` escape the
    /// redirect, as does loopback traffic.
    pub fn install(http_port: u16, https_port: u16, mark: u32) -> Result<Self> {
        let ruleset = format!(
            "add table ip {NFT_TABLE}\n\
             add chain ip {NFT_TABLE} output {{ type nat hook output priority -100 ; policy accept ; }}\n\
             add rule ip {NFT_TABLE} output meta mark {mark} return\n\
             add rule ip {NFT_TABLE} output ip daddr 127.0.0.0/8 return\n\
             add rule ip {NFT_TABLE} output tcp dport 80 redirect to :{http_port}\n\
             add rule ip {NFT_TABLE} output tcp dport 443 redirect to :{https_port}\n"
        );
        nft(&ruleset)?;
        Ok(Self { removed: false })
    }

    /// Tears the table down.
    pub fn remove(mut self) {
        self.remove_rules();
        self.removed = true;
    }

    fn remove_rules(&mut self) {
        if self.removed {
            return;
        }
        if let Err(err) = nft(&format!("delete table ip {NFT_TABLE}\n")) {
            tracing::warn!("failed to remove nft rules: {err}");
        }
        self.removed = true;
    }
}

impl Drop for NftRedirect {
    fn drop(&mut self) {
        self.remove_rules();
    }
}

/// Feeds a ruleset to `nft -f -`.
fn nft(ruleset: &str) -> Result<()> {
    tracing::debug!(%ruleset, "applying nft ruleset");
    let mut child = Command::new("nft")
        .args(["-f", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ProxyError::DiversionUnavailable(format!("spawning nft: {e}")))?;

    if let Some(stdin) = child.stdin.as_mut() {
        stdin
            .write_all(ruleset.as_bytes())
            .map_err(|e| ProxyError::DiversionUnavailable(format!("writing nft rules: {e}")))?;
    }
    let output = child
        .wait_with_output()
        .map_err(|e| ProxyError::DiversionUnavailable(format!("waiting for nft: {e}")))?;
    if !output.status.success() {
        return Err(ProxyError::DiversionUnavailable(format!(
            "nft exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Recovers the pre-NAT destination of a redirected connection.
pub fn original_destination(stream: &TcpStream) -> Result<SocketAddr> {
    let fd = stream.as_raw_fd();

    // IPv4 first; redirected v4 flows are the common case.
    let mut v4: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut v4 as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret == 0 {
        let ip = Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr));
        let port = u16::from_be(v4.sin_port);
        return Ok(SocketAddr::new(IpAddr::V4(ip), port));
    }

    let mut v6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IPV6,
            IP6T_SO_ORIGINAL_DST,
            &mut v6 as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret == 0 {
        let ip = Ipv6Addr::from(v6.sin6_addr.s6_addr);
        let port = u16::from_be(v6.sin6_port);
        return Ok(SocketAddr::new(IpAddr::V6(ip), port));
    }

    Err(ProxyError::UnknownFlow(
        stream.peer_addr().map(|a| a.port()).unwrap_or(0),
    ))
}

/// Best-effort attribution of a connection's source port to a process:
/// `/proc/net/tcp*` gives the socket inode, `/proc/*/fd` gives the owner.
pub fn process_for_peer(peer: SocketAddr) -> (Option<u32>, Option<String>) {
    let inode = match socket_inode(peer) {
        Some(inode) => inode,
        None => return (None, None),
    };
    match pid_for_inode(inode) {
        Some(pid) => {
            let exe = std::fs::read_link(format!("/proc/{pid}/exe"))
                .ok()
                .map(|p| p.to_string_lossy().into_owned());
            (Some(pid), exe)
        }
        None => (None, None),
    }
}

fn socket_inode(peer: SocketAddr) -> Option<u64> {
    let path = if peer.is_ipv4() {
        "/proc/net/tcp"
    } else {
        "/proc/net/tcp6"
    };
    let content = std::fs::read_to_string(path).ok()?;
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        if let Some(local) = parse_proc_addr(fields[1]) {
            if local.port() == peer.port() && local.ip() == peer.ip() {
                return fields[9].parse().ok();
            }
        }
    }
    None
}

/// Parses a `/proc/net/tcp` address column: hex IP (per-word little endian)
/// and hex port, joined by `:`.
fn parse_proc_addr(field: &str) -> Option<SocketAddr> {
    let (ip_hex, port_hex) = field.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    match ip_hex.len() {
        8 => {
            let raw = u32::from_str_radix(ip_hex, 16).ok()?;
            // The kernel prints the in_addr as a native-endian word.
            let ip = Ipv4Addr::from(raw.swap_bytes());
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        32 => {
            let mut bytes = [0u8; 16];
            // Four little-endian 32-bit words.
            for (word_idx, chunk) in bytes.chunks_mut(4).enumerate() {
                let word =
                    u32::from_str_radix(&ip_hex[word_idx * 8..word_idx * 8 + 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(bytes)), port))
        }
        _ => None,
    }
}

fn pid_for_inode(inode: u64) -> Option<u32> {
    let target = format!("socket:[{inode}]");
    let proc_dir = std::fs::read_dir("/proc").ok()?;
    for entry in proc_dir.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };
        let fd_dir = match std::fs::read_dir(format!("/proc/{pid}/fd")) {
            Ok(dir) => dir,
            Err(_) => continue,
        };
        for fd in fd_dir.flatten() {
            if let Ok(link) = std::fs::read_link(fd.path()) {
                if link.to_string_lossy() == target {
                    return Some(pid);
                }
            }
        }
    }
    None
}
