use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use futures_util::StreamExt;
use log::{debug, warn};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;

use crate::connection::{Connection, InboundHandler, PendingGauge};
use crate::error::{CompletionStatus, Result, SystemException};
use crate::orb::OrbOptions;

/// Server-side listener. Binding and serving are split so the bound port is
/// known before the dispatcher that serves it exists.
pub struct Acceptor {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    shutdown: watch::Sender<bool>,
    connections: Arc<Mutex<Vec<Weak<Connection>>>>,
}

impl Acceptor {
    pub async fn bind(host: &str, port: u16) -> Result<Acceptor> {
        let listener = TcpListener::bind((host, port)).await.map_err(|e| {
            SystemException::initialize(0, CompletionStatus::No)
                .into_error(format!("cannot bind {host}:{port}: {e}"))
        })?;
        let local_addr = listener.local_addr().map_err(|e| {
            SystemException::initialize(0, CompletionStatus::No).into_error(e.to_string())
        })?;
        Ok(Acceptor {
            local_addr,
            listener: Mutex::new(Some(listener)),
            shutdown: watch::channel(false).0,
            connections: Arc::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts the accept loop; every accepted socket becomes a `Connection`
    /// feeding the handler.
    pub fn start(
        &self,
        options: Arc<OrbOptions>,
        gauge: Arc<PendingGauge>,
        handler: Arc<dyn InboundHandler>,
    ) {
        let Some(listener) = self.listener.lock().unwrap().take() else {
            return;
        };
        let local_addr = self.local_addr;
        let mut shutdown_rx = self.shutdown.subscribe();
        let connections = self.connections.clone();
        tokio::spawn(async move {
            let mut incoming = TcpListenerStream::new(listener);
            debug!("acceptor listening on {local_addr}");
            loop {
                select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    stream = incoming.next() => {
                        match stream {
                            Some(Ok(stream)) => {
                                let conn = Connection::accept(
                                    stream,
                                    options.clone(),
                                    gauge.clone(),
                                    handler.clone(),
                                );
                                let mut connections = connections.lock().unwrap();
                                connections.retain(|weak| weak.strong_count() > 0);
                                connections.push(Arc::downgrade(&conn));
                            }
                            Some(Err(e)) => warn!("accept failed on {local_addr}: {e}"),
                            None => break,
                        }
                    }
                }
            }
            debug!("acceptor on {local_addr} stopped");
        });
    }

    /// Stops accepting and announces orderly close on every live inbound
    /// connection.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let live: Vec<Arc<Connection>> = {
            let connections = self.connections.lock().unwrap();
            connections.iter().filter_map(Weak::upgrade).collect()
        };
        for conn in live {
            let _ = conn.send_close_connection().await;
            conn.close().await;
        }
    }
}
