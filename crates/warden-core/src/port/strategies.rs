//! Probe strategies, cheapest and most precise first.

use super::{mentions_port, run_tool, Detection};
use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

/// One way of finding out whether a port is bound.
///
/// `Ok` is a definitive answer, positive or negative. `Err` means this
/// strategy cannot answer here and the next one should be tried.
#[async_trait]
pub trait ProbeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn detect(&self, port: u16) -> io::Result<Detection>;
}

/// Connect to `127.0.0.1:port`.
///
/// An accepted connection means the port is bound; a refusal or a timeout
/// means it is not.
#[derive(Debug, Clone)]
pub struct TcpConnectProbe {
    timeout: Duration,
}

impl TcpConnectProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ProbeStrategy for TcpConnectProbe {
    fn name(&self) -> &'static str {
        "tcp-connect"
    }

    async fn detect(&self, port: u16) -> io::Result<Detection> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(Detection::bound(None)),
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                ) =>
            {
                Ok(Detection::free())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(Detection::free()),
        }
    }
}

/// Enumerate the OS listening-socket table, which also yields the owner PID.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenerTableProbe;

#[async_trait]
impl ProbeStrategy for ListenerTableProbe {
    fn name(&self) -> &'static str {
        "listener-table"
    }

    async fn detect(&self, port: u16) -> io::Result<Detection> {
        let owner = tokio::task::spawn_blocking(move || {
            listeners::get_all()
                .map(|all| {
                    all.into_iter()
                        .find(|listener| listener.socket.port() == port)
                        .map(|listener| listener.process.pid)
                })
                .map_err(|e| e.to_string())
        })
        .await
        .map_err(io::Error::other)?
        .map_err(io::Error::other)?;

        Ok(match owner {
            Some(pid) => Detection::bound(Some(pid)),
            None => Detection::free(),
        })
    }
}

/// Parse the listing of a socket statistics tool.
#[derive(Debug, Clone)]
pub struct SocketToolProbe {
    program: &'static str,
    args: &'static [&'static str],
    timeout: Duration,
}

impl SocketToolProbe {
    /// `ss -tuln`
    pub fn ss(timeout: Duration) -> Self {
        Self {
            program: "ss",
            args: &["-tuln"],
            timeout,
        }
    }

    /// `netstat -tuln`
    pub fn netstat(timeout: Duration) -> Self {
        Self {
            program: "netstat",
            args: &["-tuln"],
            timeout,
        }
    }
}

#[async_trait]
impl ProbeStrategy for SocketToolProbe {
    fn name(&self) -> &'static str {
        self.program
    }

    async fn detect(&self, port: u16) -> io::Result<Detection> {
        let listing = run_tool(self.program, self.args, self.timeout).await?;
        Ok(if mentions_port(&listing, port) {
            Detection::bound(None)
        } else {
            Detection::free()
        })
    }
}
