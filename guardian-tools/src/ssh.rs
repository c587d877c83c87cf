use crate::error::ExecutionError;
use crate::hosts::HostDescriptor;
use ssh2::Session;
use std::io::{ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::{Duration, Instant};

const IDLE_POLL: Duration = Duration::from_millis(20);

/// Connection parameters for one SSH host, owned so they can cross into a
/// blocking task.
#[derive(Debug, Clone)]
pub(crate) struct SshTarget {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub user: String,
    pub key_path: Option<PathBuf>,
}

impl SshTarget {
    pub(crate) fn from_descriptor(host: &HostDescriptor) -> Result<Self, ExecutionError> {
        let missing = |what: &str| ExecutionError::ConnectionFailed {
            host: host.name.clone(),
            reason: format!("host has no {what} configured"),
        };
        Ok(Self {
            name: host.name.clone(),
            address: host.ip.clone().ok_or_else(|| missing("ip"))?,
            port: host.port,
            user: host.user.clone().ok_or_else(|| missing("user"))?,
            key_path: host.key_path.clone(),
        })
    }
}

/// Disconnects the session on every exit path.
struct SessionGuard(Session);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let _ = self.0.disconnect(None, "guardian: done", None);
    }
}

/// Open a fresh session, run `command`, and tear the session down.
///
/// Blocking; callers run it on the blocking pool.
pub(crate) fn exec_blocking(
    target: &SshTarget,
    command: &str,
    connect_timeout: Duration,
    command_timeout: Duration,
) -> Result<String, ExecutionError> {
    let session = SessionGuard(connect(target, connect_timeout)?);
    session.0.set_timeout(millis(command_timeout));

    let fail = |e: ssh2::Error| connection_failed(target, e);
    let mut channel = session.0.channel_session().map_err(fail)?;
    channel.exec(command).map_err(fail)?;

    let mut stdout = channel.stream(0);
    let mut stderr = channel.stderr();
    session.0.set_blocking(false);
    let drained = drain_alternating(
        &mut stdout,
        &mut stderr,
        || channel.eof(),
        Instant::now() + command_timeout,
    );
    session.0.set_blocking(true);
    let (stdout, stderr) = drained.map_err(|e| match e {
        DrainError::Deadline => ExecutionError::TimedOut(command_timeout.as_secs()),
        DrainError::Io(e) => ExecutionError::Io(e.to_string()),
    })?;
    channel.wait_close().map_err(fail)?;
    let status = channel.exit_status().map_err(fail)?;

    tracing::debug!(host = %target.name, status, bytes = stdout.len(), "ssh command finished");
    if status != 0 {
        return Err(ExecutionError::CommandFailed {
            status,
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&stdout).trim().to_string())
}

#[derive(Debug)]
enum DrainError {
    Deadline,
    Io(std::io::Error),
}

/// Read both streams in turn until each reports end of file, so a chatty
/// stderr cannot stall stdout behind a full window. `remote_done` is the
/// channel's EOF flag; once it is set a pass with no data also ends the read.
fn drain_alternating<O: Read, E: Read>(
    stdout: &mut O,
    stderr: &mut E,
    mut remote_done: impl FnMut() -> bool,
    deadline: Instant,
) -> Result<(Vec<u8>, Vec<u8>), DrainError> {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut out_open = true;
    let mut err_open = true;
    let mut buf = [0u8; 8192];

    while out_open || err_open {
        let mut progressed = false;
        if out_open {
            match read_chunk(stdout, &mut buf, &mut out)? {
                Some(0) => out_open = false,
                Some(_) => progressed = true,
                None => {}
            }
        }
        if err_open {
            match read_chunk(stderr, &mut buf, &mut err)? {
                Some(0) => err_open = false,
                Some(_) => progressed = true,
                None => {}
            }
        }
        if progressed {
            continue;
        }
        if remote_done() {
            break;
        }
        if Instant::now() >= deadline {
            return Err(DrainError::Deadline);
        }
        std::thread::sleep(IDLE_POLL);
    }
    Ok((out, err))
}

/// `None` when the stream has nothing yet.
fn read_chunk<R: Read>(
    stream: &mut R,
    buf: &mut [u8],
    sink: &mut Vec<u8>,
) -> Result<Option<usize>, DrainError> {
    match stream.read(buf) {
        Ok(n) => {
            sink.extend_from_slice(&buf[..n]);
            Ok(Some(n))
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
            Ok(None)
        }
        Err(e) => Err(DrainError::Io(e)),
    }
}

fn connect(target: &SshTarget, timeout: Duration) -> Result<Session, ExecutionError> {
    let addr = (target.address.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| ExecutionError::ConnectionFailed {
            host: target.name.clone(),
            reason: format!("resolve {}: {e}", target.address),
        })?
        .next()
        .ok_or_else(|| ExecutionError::ConnectionFailed {
            host: target.name.clone(),
            reason: format!("no address for {}", target.address),
        })?;

    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
        ExecutionError::ConnectionFailed {
            host: target.name.clone(),
            reason: e.to_string(),
        }
    })?;
    tcp.set_read_timeout(Some(timeout)).ok();
    tcp.set_write_timeout(Some(timeout)).ok();

    let mut session = Session::new().map_err(|e| connection_failed(target, e))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(millis(timeout));
    session
        .handshake()
        .map_err(|e| connection_failed(target, e))?;

    // Unknown host keys are accepted; hosts are operator-curated.
    match target.key_path.as_deref() {
        Some(key) => session
            .userauth_pubkey_file(&target.user, None, key, None)
            .map_err(|e| connection_failed(target, e))?,
        None => session
            .userauth_agent(&target.user)
            .map_err(|e| connection_failed(target, e))?,
    }
    if !session.authenticated() {
        return Err(ExecutionError::ConnectionFailed {
            host: target.name.clone(),
            reason: "authentication failed".to_string(),
        });
    }
    Ok(session)
}

fn connection_failed(target: &SshTarget, err: ssh2::Error) -> ExecutionError {
    let io_err: std::io::Error = err.into();
    ExecutionError::ConnectionFailed {
        host: target.name.clone(),
        reason: io_err.to_string(),
    }
}

fn millis(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::HostKind;
    use std::collections::VecDeque;
    use std::io;

    /// Serves scripted chunks; an empty script is end of file.
    struct Scripted(VecDeque<io::Result<Vec<u8>>>);

    impl Scripted {
        fn new(steps: Vec<io::Result<Vec<u8>>>) -> Self {
            Self(steps.into())
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                None => Ok(0),
                Some(Err(e)) => Err(e),
                Some(Ok(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
            }
        }
    }

    fn pending() -> io::Result<Vec<u8>> {
        Err(io::Error::from(ErrorKind::WouldBlock))
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    fn descriptor(ip: Option<&str>, user: Option<&str>) -> HostDescriptor {
        HostDescriptor {
            name: "web-01".to_string(),
            kind: HostKind::Ssh,
            ip: ip.map(str::to_string),
            port: 22,
            user: user.map(str::to_string),
            key_path: None,
            description: String::new(),
        }
    }

    #[test]
    fn target_requires_ip_and_user() {
        assert!(SshTarget::from_descriptor(&descriptor(Some("10.0.0.5"), Some("admin"))).is_ok());
        let err = SshTarget::from_descriptor(&descriptor(None, Some("admin")))
            .expect_err("ip is required");
        assert!(err.to_string().contains("no ip configured"));
    }

    #[test]
    fn both_streams_are_collected_while_one_is_idle() {
        let mut stdout = Scripted::new(vec![
            pending(),
            pending(),
            pending(),
            Ok(b"Filesystem Use%\n".to_vec()),
        ]);
        let mut stderr = Scripted::new(vec![
            Ok(vec![b'w'; 4096]),
            Ok(vec![b'w'; 4096]),
            Ok(vec![b'w'; 4096]),
            pending(),
        ]);
        let (out, err) =
            drain_alternating(&mut stdout, &mut stderr, || false, later()).expect("drained");
        assert_eq!(out, b"Filesystem Use%\n");
        assert_eq!(err.len(), 3 * 4096);
    }

    #[test]
    fn non_utf8_output_is_kept_lossily() {
        let mut stdout = Scripted::new(vec![Ok(b"caf\xe9 ok".to_vec())]);
        let mut stderr = Scripted::new(vec![]);
        let (out, _) =
            drain_alternating(&mut stdout, &mut stderr, || false, later()).expect("drained");
        assert_eq!(String::from_utf8_lossy(&out), "caf\u{fffd} ok");
    }

    #[test]
    fn remote_eof_ends_an_idle_read() {
        let mut stdout = Scripted::new(vec![Ok(b"up 3 days".to_vec()), pending()]);
        let mut stderr = Scripted::new(vec![pending(), pending()]);
        let (out, err) =
            drain_alternating(&mut stdout, &mut stderr, || true, later()).expect("drained");
        assert_eq!(out, b"up 3 days");
        assert!(err.is_empty());
    }

    #[test]
    fn silent_command_hits_the_deadline() {
        let mut stdout = Scripted::new(vec![pending(), pending(), pending()]);
        let mut stderr = Scripted::new(vec![pending(), pending(), pending()]);
        let err = drain_alternating(&mut stdout, &mut stderr, || false, Instant::now())
            .expect_err("nothing arrives");
        assert!(matches!(err, DrainError::Deadline));
    }

    #[test]
    fn read_errors_surface() {
        let mut stdout = Scripted::new(vec![Err(io::Error::from(ErrorKind::ConnectionReset))]);
        let mut stderr = Scripted::new(vec![]);
        let err = drain_alternating(&mut stdout, &mut stderr, || false, later())
            .expect_err("reset");
        assert!(matches!(err, DrainError::Io(e) if e.kind() == ErrorKind::ConnectionReset));
    }

    #[test]
    fn unreachable_host_is_a_connection_failure() {
        let target = SshTarget::from_descriptor(&descriptor(Some("127.0.0.1"), Some("nobody")))
            .map(|mut t| {
                // Port 1 is reserved and closed on any sane test machine.
                t.port = 1;
                t
            })
            .expect("target");
        let err = exec_blocking(
            &target,
            "uptime",
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .expect_err("nothing listens on port 1");
        assert!(matches!(err, ExecutionError::ConnectionFailed { .. }));
        assert!(err.to_string().starts_with("Error: SSH connection to web-01 failed"));
    }
}
