use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::{StreamPipe, StreamPipeConfig};

/// Unix domain socket endpoint that hands out [`StreamPipe`]s.
///
/// Stands in for a serial line when two multiplexers run on the same host.
/// The socket file is removed on drop unless it was replaced meanwhile.
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    created_inode: (u64, u64),
    pipe_config: StreamPipeConfig,
}

impl UnixDomainSocket {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// `sockaddr_un.sun_path` is 108 bytes on Linux, 104 elsewhere.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on `path`, replacing a stale socket file.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        Self::check_path_len(&path)?;

        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(|e| TransportError::Bind {
                path: path.clone(),
                source: e,
            })?;
            if !metadata.file_type().is_socket() {
                return Err(TransportError::Bind {
                    path,
                    source: std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                });
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(|e| TransportError::Bind {
                path: path.clone(),
                source: e,
            })?;
        }

        let bind_err = |source| TransportError::Bind {
            path: path.clone(),
            source,
        };
        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(
            &path,
            std::fs::Permissions::from_mode(Self::DEFAULT_SOCKET_MODE),
        )
        .map_err(bind_err)?;
        let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            listener,
            created_inode: (metadata.dev(), metadata.ino()),
            path,
            pipe_config: StreamPipeConfig::default(),
        })
    }

    /// Override the configuration of accepted pipes.
    pub fn with_pipe_config(mut self, config: StreamPipeConfig) -> Self {
        self.pipe_config = config;
        self
    }

    /// Accept the next connection (blocking). The returned pipe is closed.
    pub fn accept(&self) -> Result<StreamPipe> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted connection");
        Ok(StreamPipe::with_config(stream, self.pipe_config.clone()))
    }

    /// Connect to a listening socket (blocking). The returned pipe is closed.
    pub fn connect(path: impl AsRef<Path>) -> Result<StreamPipe> {
        let path = path.as_ref();
        Self::check_path_len(path)?;
        let stream = UnixStream::connect(path).map_err(|e| TransportError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(?path, "connected to unix domain socket");
        Ok(StreamPipe::unix(stream))
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_path_len(path: &Path) -> Result<()> {
        let len = path.as_os_str().len();
        if len >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path: path.to_path_buf(),
                len,
                max: Self::MAX_PATH_LEN,
            });
        }
        Ok(())
    }
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        let (expected_dev, expected_ino) = self.created_inode;
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::traits::{ModemPipe, PipeEvent};

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cmux-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn accept_and_connect_yield_working_pipes() {
        let dir = temp_dir("uds");
        let sock_path = dir.join("link.sock");
        let listener = UnixDomainSocket::bind(&sock_path).unwrap();

        let path = sock_path.clone();
        let client = std::thread::spawn(move || {
            let pipe = UnixDomainSocket::connect(&path).unwrap();
            pipe.open(Duration::from_secs(1)).unwrap();
            pipe.transmit(b"AT\r\n").unwrap();
            pipe
        });

        let server = listener.accept().unwrap();
        let (tx, rx) = mpsc::channel();
        server.attach(Arc::new(move |event| {
            let _ = tx.send(event);
        }));
        server.open(Duration::from_secs(1)).unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 8];
        while received.len() < 4 {
            let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            if event == PipeEvent::ReceiveReady {
                let n = server.receive(&mut buf).unwrap();
                received.extend_from_slice(&buf[..n]);
            }
        }
        assert_eq!(received, b"AT\r\n");

        drop(client.join().unwrap());
        drop(listener);
        assert!(!sock_path.exists(), "socket file should be removed on drop");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn path_too_long_rejected() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        assert!(matches!(
            UnixDomainSocket::bind(&long_path),
            Err(TransportError::PathTooLong { .. })
        ));
    }

    #[test]
    fn socket_permissions_are_restricted() {
        let dir = temp_dir("uds-perms");
        let sock_path = dir.join("perm.sock");
        let listener = UnixDomainSocket::bind(&sock_path).unwrap();

        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bind_refuses_to_replace_regular_file() {
        let dir = temp_dir("uds-file");
        let sock_path = dir.join("not-a-socket.sock");
        std::fs::write(&sock_path, b"regular-file").unwrap();

        assert!(matches!(
            UnixDomainSocket::bind(&sock_path),
            Err(TransportError::Bind { .. })
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
