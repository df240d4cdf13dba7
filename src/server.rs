//! Edge node server
//!
//! [Server::bind] opens the listeners, [Server::run] wires the HTTP surface
//! and the control channel together and runs until one of them fails.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::TcpListener;

use crate::app_data::AppData;
use crate::cluster::membership_protocol::master::MasterControl;
use crate::cluster::membership_protocol::peer::PeerClient;
use crate::config::{NodeConfig, Role};
use crate::errors::ServerError;
use crate::http;

type ServerResult<T> = Result<T, ServerError>;

/// Listeners opened by [Server::bind]
pub struct Listeners {
    pub http: TcpListener,
    /// Control channel, master only
    pub control: Option<TcpListener>,
}

impl Listeners {
    pub fn http_addr(&self) -> ServerResult<SocketAddr> {
        try_local_addr(&self.http)
    }

    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }
}

fn try_local_addr(listener: &TcpListener) -> ServerResult<SocketAddr> {
    listener.local_addr().map_err(|err| {
        let err = err.to_string();
        error!("{}", err);
        ServerError::Bind(err)
    })
}

async fn bind(address: &str) -> ServerResult<TcpListener> {
    TcpListener::bind(address).await.map_err(|err| {
        let err = format!("{}: {}", address, err);
        error!("{}", err);
        ServerError::Bind(err)
    })
}

/// A master or a peer, depending on its [NodeConfig]
pub struct Server {
    config: NodeConfig,
    app_data: Arc<AppData>,
}

impl Server {
    /// Validates `config` and builds the node's [AppData]
    pub fn new(config: NodeConfig) -> ServerResult<Server> {
        config.validate()?;
        let app_data = Arc::new(AppData::new(&config)?);
        Ok(Server { config, app_data })
    }

    /// Same as [Server::new], with a prebuilt context
    pub fn with_app_data(config: NodeConfig, app_data: Arc<AppData>) -> ServerResult<Server> {
        config.validate()?;
        Ok(Server { config, app_data })
    }

    pub fn app_data(&self) -> Arc<AppData> {
        self.app_data.clone()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub async fn bind(&self) -> ServerResult<Listeners> {
        let http = bind(&self.config.address).await?;
        let control = match self.config.role() {
            Role::Master => Some(bind(&self.config.control_address).await?),
            Role::Peer => None,
        };
        Ok(Listeners { http, control })
    }

    /// Runs the node until the HTTP server or the control channel fails
    ///
    /// A peer logs in before serving anything, a failed first login is a
    /// startup error. Once the node is closing, the end of the control
    /// channel does not stop the HTTP server, so in-flight requests drain.
    pub async fn run(&self, listeners: Listeners) -> ServerResult<()> {
        let http_addr = listeners.http_addr()?;
        let role = self.config.role();

        let mut control_task = match (role, listeners.control) {
            (Role::Master, Some(control)) => {
                let master = MasterControl::new(
                    self.app_data.registry.clone(),
                    self.app_data.ring.clone(),
                    self.config.token.clone(),
                    self.config.mirror.clone().unwrap_or_default(),
                    self.app_data.log_sink.clone(),
                );
                tokio::spawn(async move { master.serve(control).await })
            }
            (Role::Master, None) => {
                return Err(ServerError::Bind(
                    "the master needs a control listener".to_string(),
                ))
            }
            (Role::Peer, _) => {
                let client = self.peer_client(http_addr.port());
                let session = client.join().await?;
                let _ = self.app_data.peer.set(client.clone());
                tokio::spawn(async move { client.run(session).await })
            }
        };

        let router = http::router(self.app_data.clone());
        let mut http_task = tokio::spawn(async move {
            axum::serve(
                listeners.http,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
        });
        info!(role:? = role; "Listening on `{}`", http_addr);

        tokio::select! {
            http_result = &mut http_task => {
                http_result
                    .map_err(|err| {
                        error!("http: JoinHandle error: {}", err.to_string());
                        ServerError::Run
                    })?
                    .map_err(|err| {
                        error!("http: {}", err);
                        ServerError::Run
                    })?;
                warn!("HTTP server finished first");
            }
            control_result = &mut control_task => {
                control_result
                    .map_err(|err| {
                        error!("control channel: JoinHandle error: {}", err.to_string());
                        ServerError::Run
                    })?
                    .map_err(ServerError::Membership)?;
                if self.app_data.state.is_closed() {
                    // keep serving while the drain completes
                    let _ = http_task.await;
                }
                warn!("Control channel finished first");
            }
        }
        info!("Server stopped");
        Ok(())
    }

    fn peer_client(&self, port: u16) -> PeerClient {
        PeerClient::new(
            self.config.upstream.clone().unwrap_or_default(),
            self.config.token.clone(),
            port,
            self.app_data.ring.clone(),
            self.app_data.mirror.clone(),
            self.app_data.send_queue.clone(),
            self.app_data.state.clone(),
        )
        .with_reconnect_interval(self.config.reconnect_interval)
        .with_login_timeout(self.config.login_timeout)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::NodeConfigBuilder;
    use crate::errors::{ConfigError, MembershipError};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn new_validates_the_config() -> TestResult {
        let config = NodeConfigBuilder::default().build()?;
        assert!(matches!(
            Server::new(config),
            Err(ServerError::Config(ConfigError::MissingMirror))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn master_binds_both_listeners() -> TestResult {
        let config = NodeConfigBuilder::default()
            .address("127.0.0.1:0")
            .control_address("127.0.0.1:0")
            .mirror("http://origin.example/")
            .log_file("-")
            .build()?;
        let server = Server::new(config)?;
        let listeners = server.bind().await?;
        assert!(listeners.http_addr()?.port() > 0);
        assert!(listeners.control_addr().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn peer_without_master_fails_to_start() -> TestResult {
        // nothing listens on a port we just released
        let released = std::net::TcpListener::bind("127.0.0.1:0")?;
        let upstream = released.local_addr()?.to_string();
        drop(released);

        let config = NodeConfigBuilder::default()
            .address("127.0.0.1:0")
            .upstream(upstream)
            .build()?;
        let server = Server::new(config)?;
        let listeners = server.bind().await?;
        assert!(listeners.control.is_none());
        assert!(matches!(
            server.run(listeners).await,
            Err(ServerError::Membership(MembershipError::ControlChannelLost(_)))
        ));
        Ok(())
    }
}
