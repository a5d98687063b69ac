//! Socket abstraction for descriptors.
//!
//! Descriptors talk to the network through this trait so the same state
//! machine drives a real `mio` TCP stream in production and an in-memory mock
//! in tests.

use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

/// A non-blocking byte stream that can be registered with a poll instance.
pub trait Socket: Read + Write + Send {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest)
        -> io::Result<()>;

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>;

    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Pending socket error (`SO_ERROR`), used to complete a connect.
    fn take_error(&self) -> io::Result<Option<io::Error>>;

    /// Shuts down both directions before the socket is dropped.
    fn shutdown(&self) -> io::Result<()> {
        Ok(())
    }
}

impl Socket for mio::net::TcpStream {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.register(self, token, interest)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.reregister(self, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::peer_addr(self)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        mio::net::TcpStream::take_error(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        match mio::net::TcpStream::shutdown(self, Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Connects a non-blocking TCP stream; completion is signalled by a writable
/// event.
pub fn connect(address: SocketAddr) -> io::Result<mio::net::TcpStream> {
    let stream = mio::net::TcpStream::connect(address)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory socket for descriptor tests.

    use super::Socket;
    use mio::{Interest, Registry, Token};
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub struct MockState {
        /// Chunks returned by successive reads; empty means WouldBlock
        pub input: VecDeque<Vec<u8>>,
        /// Read returns 0 once `input` is exhausted
        pub eof: bool,
        pub read_error: Option<io::ErrorKind>,
        /// Interrupt the next read/write once
        pub interrupt_once: bool,
        pub written: Vec<u8>,
        /// Bytes the socket still accepts; `None` is unlimited
        pub write_budget: Option<usize>,
        pub write_error: Option<io::ErrorKind>,
        pub write_calls: usize,
        pub shutdown_error: Option<io::ErrorKind>,
        pub shutdowns: usize,
    }

    #[derive(Debug, Clone, Default)]
    pub struct MockSocket {
        pub state: Arc<Mutex<MockState>>,
    }

    impl MockSocket {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_input(&self, data: &[u8]) {
            self.state.lock().unwrap().input.push_back(data.to_vec());
        }

        pub fn written(&self) -> Vec<u8> {
            self.state.lock().unwrap().written.clone()
        }

        pub fn set_write_budget(&self, budget: Option<usize>) {
            self.state.lock().unwrap().write_budget = budget;
        }

        pub fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
            f(&mut self.state.lock().unwrap())
        }
    }

    impl Read for MockSocket {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut state = self.state.lock().unwrap();
            if state.interrupt_once {
                state.interrupt_once = false;
                return Err(io::ErrorKind::Interrupted.into());
            }
            if let Some(kind) = state.read_error {
                return Err(kind.into());
            }
            match state.input.pop_front() {
                Some(mut chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        chunk.drain(..n);
                        state.input.push_front(chunk);
                    }
                    Ok(n)
                }
                None if state.eof => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for MockSocket {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut state = self.state.lock().unwrap();
            state.write_calls += 1;
            if let Some(kind) = state.write_error {
                return Err(kind.into());
            }
            let n = match state.write_budget {
                Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
                Some(budget) => budget.min(buf.len()),
                None => buf.len(),
            };
            if let Some(budget) = state.write_budget.as_mut() {
                *budget -= n;
            }
            state.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Socket for MockSocket {
        fn register(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
            Ok(())
        }

        fn reregister(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
            Ok(())
        }

        fn deregister(&mut self, _: &Registry) -> io::Result<()> {
            Ok(())
        }

        fn peer_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 3306)))
        }

        fn take_error(&self) -> io::Result<Option<io::Error>> {
            Ok(None)
        }

        fn shutdown(&self) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.shutdowns += 1;
            match state.shutdown_error {
                Some(kind) => Err(kind.into()),
                None => Ok(()),
            }
        }
    }
}
