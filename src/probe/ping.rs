//! ICMP echo prober with native sockets and an optional command fallback.
//!
//! Everything in this file blocks. The engines call it through
//! [`super::run_probe`], which moves the work onto the blocking pool.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};

use super::{OutcomeKind, ProbeError, Prober, Target};

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// The process cannot open ICMP sockets
    Unavailable,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter shared by every probe in the process
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Generate a unique (identifier, sequence) pair for one echo request.
fn generate_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // RAW needs CAP_NET_RAW or root
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // DGRAM works unprivileged on Linux with ping_group_range set, or macOS
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::warn!("Ping probe: native ICMP unavailable for this process");
    IcmpCapability::Unavailable
}

/// Prober sending one ICMP Echo Request per call.
#[derive(Debug, Clone, Default)]
pub struct IcmpProber {
    command_fallback: bool,
}

impl IcmpProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the system `ping` command when ICMP sockets cannot be opened,
    /// instead of reporting [`OutcomeKind::PermissionDenied`].
    pub fn with_command_fallback(mut self, enabled: bool) -> Self {
        self.command_fallback = enabled;
        self
    }

    /// Ping `address` once and return the round-trip time in milliseconds.
    pub fn ping(&self, address: &str, timeout: Duration) -> Result<f64, ProbeError> {
        let ip = resolve_address(address)?;
        let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

        if capability == IcmpCapability::Unavailable {
            if self.command_fallback {
                return run_ping_command(ip, timeout);
            }
            return Err(ProbeError::Permission(
                "ICMP ping requires administrator privileges".to_string(),
            ));
        }

        match run_blocking_ping(ip, timeout) {
            Err(ProbeError::Permission(detail)) if self.command_fallback => {
                tracing::warn!(
                    "Native ping failed with permission error for {}, falling back to command: {}",
                    address,
                    detail
                );
                run_ping_command(ip, timeout)
            }
            other => other,
        }
    }
}

impl Prober for IcmpProber {
    fn probe(&self, target: &Target, timeout: Duration) -> OutcomeKind {
        match self.ping(target.as_str(), timeout) {
            Ok(latency_ms) => OutcomeKind::Success { latency_ms },
            Err(e) => {
                tracing::debug!("Ping probe for {} failed: {}", target, e);
                e.into()
            }
        }
    }
}

/// Round a latency to one decimal place, never reporting zero.
fn round_latency(ms: f64) -> f64 {
    ((ms * 10.0).round() / 10.0).max(0.1)
}

fn elapsed_ms(elapsed: Duration) -> f64 {
    round_latency(elapsed.as_secs_f64() * 1000.0)
}

/// Resolve a hostname or literal address to a single IP.
fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    validate_host_syntax(address)?;

    let mut addrs = (address, 0)
        .to_socket_addrs()
        .map_err(|e| ProbeError::Resolve(format!("{}: {}", address, e)))?;

    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Resolve(format!("no addresses found for {}", address)))
}

/// Reject strings that can never name a host.
fn validate_host_syntax(host: &str) -> Result<(), ProbeError> {
    let invalid = |why: &str| Err(ProbeError::InvalidAddress(format!("{:?}: {}", host, why)));

    if host.is_empty() {
        return invalid("empty address");
    }
    if host.len() > 253 {
        return invalid("name longer than 253 bytes");
    }
    if host.contains(':') {
        return invalid("malformed IPv6 address");
    }

    let name = host.strip_suffix('.').unwrap_or(host);
    let numeric = name
        .split('.')
        .all(|label| !label.is_empty() && label.bytes().all(|b| b.is_ascii_digit()));
    if numeric && name.contains('.') {
        return invalid("malformed IPv4 address");
    }

    for label in name.split('.') {
        if label.is_empty() {
            return invalid("empty label");
        }
        if label.len() > 63 {
            return invalid("label longer than 63 bytes");
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return invalid("illegal character");
        }
    }

    Ok(())
}

/// Open a RAW ICMP socket, falling back to an unprivileged DGRAM one.
///
/// Returns the socket and whether it is RAW.
fn open_icmp_socket(domain: Domain, protocol: Protocol) -> Result<(Socket, bool), ProbeError> {
    if let Ok(socket) = Socket::new(domain, Type::RAW, Some(protocol)) {
        return Ok((socket, true));
    }

    Socket::new(domain, Type::DGRAM, Some(protocol))
        .map(|socket| (socket, false))
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                ProbeError::Permission(format!("cannot open ICMP socket: {}", e))
            } else {
                ProbeError::Network(format!("failed to create ICMP socket: {}", e))
            }
        })
}

/// Send one echo request and wait for its reply.
fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };
    let (socket, raw) = open_icmp_socket(domain, protocol)?;

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let (identifier, sequence) = generate_ping_id();
    let packet = match ip {
        IpAddr::V4(_) => build_icmp_echo_request(identifier, sequence),
        IpAddr::V6(_) => build_icmpv6_echo_request(identifier, sequence),
    };

    let start = Instant::now();

    socket
        .send(&packet)
        .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

    let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
    loop {
        // Unrelated packets must not stretch the wait past the timeout
        let remaining = timeout
            .checked_sub(start.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or(ProbeError::Timeout(timeout))?;
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;

        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("failed to receive: {}", e))
            }
        })?;
        let elapsed = start.elapsed();

        // SAFETY: recv initialized the first `len` bytes
        let reply: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        let matched = match ip {
            IpAddr::V4(_) => is_echo_reply_v4(reply, identifier, sequence, raw),
            IpAddr::V6(_) => is_echo_reply_v6(reply, identifier, sequence, raw),
        };
        if matched {
            return Ok(elapsed_ms(elapsed));
        }
    }
}

/// Check an IPv4 datagram for our Echo Reply (type 0).
///
/// RAW sockets (and DGRAM on macOS) deliver the IP header, whose length is
/// taken from IHL. On Linux DGRAM sockets the kernel rewrites the identifier,
/// so only the sequence is compared there.
fn is_echo_reply_v4(reply: &[u8], identifier: u16, sequence: u16, raw: bool) -> bool {
    let offset = match reply.first() {
        Some(b) if b >> 4 == 4 => usize::from(b & 0x0f) * 4,
        _ => 0,
    };
    match_echo_reply(reply.get(offset..), 0, identifier, sequence, raw)
}

/// Check an ICMPv6 message for our Echo Reply (type 129).
fn is_echo_reply_v6(reply: &[u8], identifier: u16, sequence: u16, raw: bool) -> bool {
    match_echo_reply(Some(reply), 129, identifier, sequence, raw)
}

fn match_echo_reply(icmp: Option<&[u8]>, reply_type: u8, identifier: u16, sequence: u16, check_id: bool) -> bool {
    let Some(icmp) = icmp.filter(|icmp| icmp.len() >= 8) else {
        return false;
    };
    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);

    icmp[0] == reply_type && (!check_id || reply_id == identifier) && reply_seq == sequence
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = echo_request(8, identifier, sequence);

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
///
/// The checksum is left zero; the kernel fills it in for ICMPv6.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    echo_request(128, identifier, sequence)
}

fn echo_request(icmp_type: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = icmp_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [odd] = chunks.remainder() {
        sum += (*odd as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run ping via the system command.
fn run_ping_command(ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), &ip.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Operation not permitted") || stderr.contains("Permission denied") {
            return Err(ProbeError::Permission(stderr.trim().to_string()));
        }
        if stderr.contains("timeout")
            || stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
        {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping failed: {}", stdout.trim())));
    }

    parse_ping_output(&stdout)
}

/// Parse ping command output for latency in milliseconds.
fn parse_ping_output(output: &str) -> Result<f64, ProbeError> {
    // Per-packet line "time=X.XXX ms" (Linux, some macOS)
    static PER_PACKET: OnceLock<Regex> = OnceLock::new();
    let per_packet = PER_PACKET.get_or_init(|| {
        Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").expect("static regex")
    });

    if let Some(ms) = per_packet
        .captures(output)
        .and_then(|caps| caps.name("val"))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Ok(round_latency(ms));
    }

    // Summary line, macOS "round-trip min/avg/max/stddev" or Linux "rtt min/avg/max/mdev"
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:round-trip|rtt)\s+min/avg/max/(?:stddev|mdev)\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)")
            .expect("static regex")
    });

    if let Some(ms) = summary
        .captures(output)
        .and_then(|caps| caps.get(2))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Ok(round_latency(ms));
    }

    Err(ProbeError::Command(format!(
        "failed to parse ping output: {}",
        output
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icmp_checksum() {
        let mut packet = vec![0u8; 8];
        packet[0] = 8;
        packet[4] = 0x12;
        packet[5] = 0x34;
        packet[7] = 0x01;

        let checksum = icmp_checksum(&packet);
        // 0x0800 + 0x1234 + 0x0001 = 0x1a35, complemented
        assert_eq!(checksum, !0x1a35u16);

        // A packet carrying its own checksum sums to zero
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_icmp_checksum_odd_length() {
        assert_eq!(icmp_checksum(&[0x01]), !0x0100u16);
    }

    #[test]
    fn test_build_icmp_packet() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(packet[4..6], [0x12, 0x34]);
        assert_eq!(packet[6..8], [0x00, 0x01]);
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_build_icmpv6_packet() {
        let packet = build_icmpv6_echo_request(0xabcd, 7);
        assert_eq!(packet[0], 128);
        assert_eq!(packet[2..4], [0, 0]);
        assert_eq!(packet[6..8], [0x00, 0x07]);
    }

    #[test]
    fn test_echo_reply_matching_v4() {
        let mut icmp = vec![0u8; 8];
        icmp[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        icmp[6..8].copy_from_slice(&9u16.to_be_bytes());

        // DGRAM on Linux: bare ICMP, identifier rewritten by the kernel
        assert!(is_echo_reply_v4(&icmp, 0x9999, 9, false));
        assert!(!is_echo_reply_v4(&icmp, 0x1234, 10, false));

        // RAW: 20-byte IP header in front
        let mut datagram = vec![0x45u8];
        datagram.extend_from_slice(&[0u8; 19]);
        datagram.extend_from_slice(&icmp);
        assert!(is_echo_reply_v4(&datagram, 0x1234, 9, true));
        assert!(!is_echo_reply_v4(&datagram, 0x9999, 9, true));

        // Our own echo request looped back is not a reply
        datagram[20] = 8;
        assert!(!is_echo_reply_v4(&datagram, 0x1234, 9, true));

        // Truncated
        assert!(!is_echo_reply_v4(&datagram[..24], 0x1234, 9, true));
    }

    #[test]
    fn test_echo_reply_matching_v6() {
        let mut icmp = vec![0u8; 8];
        icmp[0] = 129;
        icmp[4..6].copy_from_slice(&0x0102u16.to_be_bytes());
        icmp[6..8].copy_from_slice(&3u16.to_be_bytes());
        assert!(is_echo_reply_v6(&icmp, 0x0102, 3, true));
        assert!(!is_echo_reply_v6(&icmp, 0x0102, 4, true));
    }

    #[test]
    fn test_round_latency() {
        assert_eq!(round_latency(23.44), 23.4);
        assert_eq!(round_latency(23.45001), 23.5);
        assert_eq!(round_latency(0.01), 0.1);
        assert_eq!(elapsed_ms(Duration::from_micros(12_340)), 12.3);
    }

    #[test]
    fn test_validate_host_syntax() {
        assert!(validate_host_syntax("example.com").is_ok());
        assert!(validate_host_syntax("example.com.").is_ok());
        assert!(validate_host_syntax("my-host_1").is_ok());

        for bad in ["", "999.1.1.1", "1.2.3", "bad host", "a..b", "fe80::zz", "x/y"] {
            assert!(
                matches!(validate_host_syntax(bad), Err(ProbeError::InvalidAddress(_))),
                "{:?} should be invalid",
                bad
            );
        }

        let long_label = "a".repeat(64);
        assert!(validate_host_syntax(&long_label).is_err());
    }

    #[test]
    fn test_probe_classifies_address_errors() {
        let prober = IcmpProber::new();
        let timeout = Duration::from_millis(200);

        assert_eq!(prober.probe(&Target::from("300.1.1.1"), timeout), OutcomeKind::InvalidAddress);
        assert_eq!(prober.probe(&Target::from(""), timeout), OutcomeKind::InvalidAddress);
        assert_eq!(
            prober.probe(&Target::from("no-such-host.invalid"), timeout),
            OutcomeKind::NameResolutionFailed
        );
    }

    #[test]
    fn test_parse_ping_output_linux() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        let latency = parse_ping_output(output).unwrap();
        assert!((latency - 12.3).abs() < 1e-9);
    }

    #[test]
    fn test_parse_ping_output_macos_summary() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes

--- google.com ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        let latency = parse_ping_output(output).unwrap();
        assert!((latency - 17.9).abs() < 1e-9);
    }

    #[test]
    fn test_parse_ping_output_linux_summary_only() {
        let output = "rtt min/avg/max/mdev = 12.300/12.340/12.400/0.000 ms";
        let latency = parse_ping_output(output).unwrap();
        assert!((latency - 12.3).abs() < 1e-9);
    }

    #[test]
    fn test_parse_ping_output_garbage() {
        assert!(matches!(parse_ping_output("nothing here"), Err(ProbeError::Command(_))));
    }
}
