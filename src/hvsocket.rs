//! HvSocket (AF_HYPERV) transport for the out-of-band guest channel
//!
//! Provides host↔guest communication without networking using Hyper-V sockets.
//! The host listens on (VM runtime id, service id); the guest agent dials in.

use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::Result;

/// Well-known HvSocket service GUIDs
pub mod service_ids {
    /// Wildcard - matches any VM
    pub const WILDCARD: &str = "00000000-0000-0000-0000-000000000000";
    /// Parent partition (host)
    pub const PARENT: &str = "a42e7cda-d03f-480c-9cc2-a4de20abb878";
    /// Windows guest compute service bridge
    pub const WINDOWS_GCS: &str = "ae8da506-a019-4553-a52b-902bc0fa0411";
}

/// HvSocket address of a listener or peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HvSocketAddr {
    /// VM runtime GUID (from the HCS compute system)
    pub vm_id: String,
    /// Service GUID
    pub service_id: String,
}

impl HvSocketAddr {
    pub fn new(vm_id: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            vm_id: vm_id.into(),
            service_id: service_id.into(),
        }
    }

    /// Address the guest compute service connects to for `vm_id`
    pub fn gcs(vm_id: impl Into<String>) -> Self {
        Self::new(vm_id, service_ids::WINDOWS_GCS)
    }
}

impl fmt::Display for HvSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vm_id, self.service_id)
    }
}

/// A connected hypervisor socket
pub trait GuestStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> GuestStream for T {}

/// Binds listening hypervisor sockets
#[async_trait]
pub trait HvSocketBinder: Send + Sync {
    async fn bind(&self, addr: &HvSocketAddr) -> Result<Box<dyn HvSocketAcceptor>>;
}

/// A bound, listening hypervisor socket
#[async_trait]
pub trait HvSocketAcceptor: Send {
    async fn accept(&mut self) -> Result<Box<dyn GuestStream>>;
}

/// Listener for guest-initiated connections.
///
/// Accepting runs on its own task; connections are handed out through
/// [`GuestChannelListener::next_connection`]. Closing aborts the accept task and
/// drops the bound socket.
pub struct GuestChannelListener {
    addr: HvSocketAddr,
    accept_task: Option<JoinHandle<()>>,
    connections: mpsc::Receiver<Box<dyn GuestStream>>,
}

impl GuestChannelListener {
    /// Start accepting on an already bound socket. Must be called inside a tokio runtime.
    pub fn spawn(addr: HvSocketAddr, mut acceptor: Box<dyn HvSocketAcceptor>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let task_addr = addr.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match acceptor.accept().await {
                    Ok(conn) => {
                        tracing::debug!(addr = %task_addr, "Accepted guest connection");
                        if tx.send(conn).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(addr = %task_addr, error = %e, "Guest channel accept failed");
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            accept_task: Some(accept_task),
            connections: rx,
        }
    }

    pub fn addr(&self) -> &HvSocketAddr {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.accept_task.is_none()
    }

    /// Wait for the next guest connection. Returns `None` once the listener is closed.
    pub async fn next_connection(&mut self) -> Option<Box<dyn GuestStream>> {
        self.connections.recv().await
    }

    pub fn close(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            self.connections.close();
            tracing::debug!(addr = %self.addr, "Closed guest channel listener");
        }
    }
}

impl Drop for GuestChannelListener {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for GuestChannelListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestChannelListener")
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(windows)]
pub use self::windows_impl::WinHvSocketBinder;

#[cfg(windows)]
mod windows_impl {
    use std::os::windows::io::FromRawSocket;

    use async_trait::async_trait;
    use windows::core::GUID;
    use windows::Win32::Networking::WinSock::*;

    use super::{GuestStream, HvSocketAcceptor, HvSocketAddr, HvSocketBinder};
    use crate::{Error, Result};

    const AF_HYPERV: u16 = 34;
    const HV_PROTOCOL_RAW: i32 = 1;

    #[repr(C)]
    struct SockaddrHv {
        family: u16,
        reserved: u16,
        vm_id: GUID,
        service_id: GUID,
    }

    fn parse_guid(s: &str) -> Result<GUID> {
        let id = uuid::Uuid::parse_str(s)
            .map_err(|e| Error::GuestChannel(format!("invalid GUID '{}': {}", s, e)))?;
        Ok(GUID::from_u128(id.as_u128()))
    }

    fn last_error(context: &str) -> Error {
        let code = unsafe { WSAGetLastError() };
        Error::GuestChannel(format!("{}: WSA error {}", context, code.0))
    }

    /// Binds AF_HYPERV listening sockets through WinSock
    #[derive(Debug, Default, Clone)]
    pub struct WinHvSocketBinder;

    struct WinAcceptor {
        socket: SOCKET,
    }

    // SAFETY: the listening SOCKET is only used by one accept call at a time.
    unsafe impl Send for WinAcceptor {}

    #[async_trait]
    impl HvSocketBinder for WinHvSocketBinder {
        async fn bind(&self, addr: &HvSocketAddr) -> Result<Box<dyn HvSocketAcceptor>> {
            let sockaddr = SockaddrHv {
                family: AF_HYPERV,
                reserved: 0,
                vm_id: parse_guid(&addr.vm_id)?,
                service_id: parse_guid(&addr.service_id)?,
            };

            unsafe {
                let socket = socket(AF_HYPERV as i32, SOCK_STREAM, HV_PROTOCOL_RAW)?;
                if socket == INVALID_SOCKET {
                    return Err(last_error("socket(AF_HYPERV)"));
                }
                let rc = bind(
                    socket,
                    &sockaddr as *const SockaddrHv as *const SOCKADDR,
                    std::mem::size_of::<SockaddrHv>() as i32,
                );
                if rc != 0 {
                    let err = last_error("bind");
                    closesocket(socket);
                    return Err(err);
                }
                if listen(socket, SOMAXCONN as i32) != 0 {
                    let err = last_error("listen");
                    closesocket(socket);
                    return Err(err);
                }
                Ok(Box::new(WinAcceptor { socket }))
            }
        }
    }

    #[async_trait]
    impl HvSocketAcceptor for WinAcceptor {
        async fn accept(&mut self) -> Result<Box<dyn GuestStream>> {
            let listener = self.socket.0;
            let raw = tokio::task::spawn_blocking(move || unsafe {
                let conn = accept(SOCKET(listener), None, None)?;
                if conn == INVALID_SOCKET {
                    return Err(last_error("accept"));
                }
                Ok(conn.0 as u64)
            })
            .await
            .map_err(|e| Error::GuestChannel(format!("accept did not complete: {}", e)))??;

            let std_stream = unsafe { std::net::TcpStream::from_raw_socket(raw) };
            std_stream.set_nonblocking(true)?;
            let stream = tokio::net::TcpStream::from_std(std_stream)?;
            Ok(Box::new(stream))
        }
    }

    impl Drop for WinAcceptor {
        fn drop(&mut self) {
            unsafe {
                closesocket(self.socket);
            }
        }
    }
}
