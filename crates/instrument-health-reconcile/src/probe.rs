//! Liveness and activity capabilities, and the built-in probes.

use std::fmt;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use instrument_health_core::SessionIdentity;

/// Reports whether the backend of a session can be reached.
///
/// Probes block; the reconciler runs them on the blocking pool.
pub trait LivenessProbe: Send + Sync + 'static {
    /// Whether the backend of `identity` is reachable right now.
    fn probe(&self, identity: &SessionIdentity) -> bool;

    /// Short description used in the recorded error.
    fn describe(&self) -> String {
        "liveness probe".to_string()
    }
}

/// Transport activity as seen by a session's own I/O layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivitySignal {
    /// Traffic flows normally
    Ok,
    /// Traffic flows with errors or stalls
    Degraded,
    /// The transport is gone
    Unreachable,
}

impl fmt::Display for ActivitySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActivitySignal::Ok => "ok",
            ActivitySignal::Degraded => "degraded",
            ActivitySignal::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// Source of [`ActivitySignal`]s for a session.
pub trait ActivitySource: Send + Sync + 'static {
    /// Current signal for `identity`.
    fn activity_signal(&self, identity: &SessionIdentity) -> ActivitySignal;
}

/// Reachable when every port on `host` accepts a TCP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpPortProbe {
    host: String,
    ports: Vec<u16>,
    timeout: Duration,
}

impl TcpPortProbe {
    /// Default host.
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";

    /// Default connect timeout per port.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);

    /// Probe `ports` on `host`.
    pub fn new(host: impl Into<String>, ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            host: host.into(),
            ports: ports.into_iter().collect(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Probe `ports` on the local host.
    pub fn local(ports: impl IntoIterator<Item = u16>) -> Self {
        Self::new(Self::DEFAULT_HOST, ports)
    }

    /// Command ports of a local MantisCam backend.
    pub fn mantiscam() -> Self {
        Self::local([60000, 60001])
    }

    /// Set the per-port connect timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Host probed.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Ports probed.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    fn accepts(&self, port: u16) -> bool {
        let addrs: Vec<SocketAddr> = match (self.host.as_str(), port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                debug!(host = %self.host, port, "Cannot resolve probe host: {}", e);
                return false;
            }
        };
        addrs
            .iter()
            .any(|addr| TcpStream::connect_timeout(addr, self.timeout).is_ok())
    }
}

impl LivenessProbe for TcpPortProbe {
    fn probe(&self, _identity: &SessionIdentity) -> bool {
        !self.ports.is_empty() && self.ports.iter().all(|&port| self.accepts(port))
    }

    fn describe(&self) -> String {
        format!("{} is not reachable on ports {:?}", self.host, self.ports)
    }
}

/// Tells whether the process that wrote a record is still running.
pub trait OwnerLiveness: Send + Sync + 'static {
    /// Whether `process_id` is alive.
    fn is_alive(&self, process_id: u32) -> bool;
}

/// Operating-system process check.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLiveness;

impl OwnerLiveness for ProcessLiveness {
    #[cfg(unix)]
    fn is_alive(&self, process_id: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(process_id) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // Signal 0 only checks for existence; EPERM means it exists under
        // another user.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(windows)]
    fn is_alive(&self, process_id: u32) -> bool {
        use std::process::Command;

        if process_id == 0 {
            return false;
        }
        let filter = format!("PID eq {process_id}");
        match Command::new("tasklist")
            .args(["/FI", &filter, "/NH", "/FO", "CSV"])
            .output()
        {
            Ok(output) => String::from_utf8_lossy(&output.stdout)
                .contains(&format!("\"{process_id}\"")),
            Err(e) => {
                debug!(process_id, "tasklist failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn identity() -> SessionIdentity {
        SessionIdentity::resolved("MantisCam", "MC-01").unwrap()
    }

    #[test]
    fn test_tcp_probe_needs_every_port() {
        let open = TcpListener::bind("127.0.0.1:0").unwrap();
        let open_port = open.local_addr().unwrap().port();
        let closed_port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        assert!(TcpPortProbe::local([open_port]).probe(&identity()));
        assert!(!TcpPortProbe::local([open_port, closed_port]).probe(&identity()));
        assert!(!TcpPortProbe::local([]).probe(&identity()));
    }

    #[test]
    fn test_mantiscam_defaults() {
        let probe = TcpPortProbe::mantiscam();
        assert_eq!(probe.host(), "127.0.0.1");
        assert_eq!(probe.ports(), &[60000, 60001]);
        assert!(probe.describe().contains("[60000, 60001]"));
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(ProcessLiveness.is_alive(std::process::id()));
        assert!(!ProcessLiveness.is_alive(0));
    }
}
