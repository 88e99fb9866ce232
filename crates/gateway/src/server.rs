//! Accept loop shared by the HTTP and WebSocket servers.

use std::{net::SocketAddr, sync::Arc};

use {
    axum::Router,
    tokio::{net::TcpListener, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info},
};

use crate::{error::GatewayError, lifecycle::ServiceFlags};

/// Router plus the shutdown token its connection tasks watch.
pub(crate) struct PreparedServer {
    pub router: Router,
    pub shutdown: CancellationToken,
}

/// A bound, serving listener. Dropping it signals shutdown.
pub(crate) struct RunningServer {
    name: &'static str,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RunningServer {
    /// Bind `host:port` and serve `prepared.router` on a new task.
    ///
    /// `started` is flipped on only once the bind succeeded, and back off
    /// when the accept loop ends for any reason.
    pub async fn spawn(
        name: &'static str,
        host: &str,
        port: u16,
        prepared: PreparedServer,
        flags: Arc<ServiceFlags>,
    ) -> Result<Self, GatewayError> {
        let addr = format!("{host}:{port}");
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|source| GatewayError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| GatewayError::Bind {
            addr: addr.clone(),
            source,
        })?;

        let PreparedServer { router, shutdown } = prepared;
        flags.set_started(true);

        let signal = shutdown.clone().cancelled_owned();
        let task = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(signal)
            .await;
            if let Err(e) = served {
                error!(server = name, error = %e, "accept loop failed");
            }
            flags.set_started(false);
            debug!(server = name, "accept loop exited");
        });

        info!(server = name, addr = %local_addr, "listening");
        Ok(Self {
            name,
            local_addr,
            shutdown,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the accept loop to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            error!(server = self.name, error = %e, "accept loop task failed");
        }
        info!(server = self.name, "stopped");
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
