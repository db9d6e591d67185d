//! Waymesh Node - the main application entry point.
//!
//! Architecture:
//! - Single daemon process with shared RocksDB storage (seed + address book)
//! - UDP/TCP overlay for peer traffic
//! - HTTP + WebSocket API for the local client

use crate::api::{self, ApiState};
use crate::collaborators::{MemoryHost, Rendezvous, RendezvousEvent};
use crate::error::{Error, Result};
use crate::mesh::{MeshConfig, MeshNode};
use crate::storage::Storage;
use crate::terrain::HttpTerrain;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use waymesh_peers::{Address, NodeIdentity};
use waymesh_transfer::{Overlay, UdpConfig, UdpOverlay};

/// Configuration for a Waymesh node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Data directory for storage
    pub data_dir: PathBuf,

    /// Overlay listen address (UDP datagrams and TCP sessions)
    pub bind: SocketAddr,

    /// Socket address advertised in our overlay address
    pub advertise: Option<SocketAddr>,

    /// HTTP API listen address
    pub api_addr: SocketAddr,

    /// Well-known relay overlay address
    pub relay: Option<String>,

    /// Display name announced to peers
    pub alias: Option<String>,

    /// Elevation service endpoint
    pub terrain_url: Option<String>,

    /// Elevation dataset name
    pub terrain_dataset: String,

    /// Overlay addresses probed at startup
    pub bootstrap: Vec<String>,
}

impl NodeConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let socket = |key: &str, default: &str| -> Result<SocketAddr> {
            let raw = non_empty(key).unwrap_or_else(|| default.to_string());
            raw.parse()
                .map_err(|_| Error::Config(format!("Invalid {}: {}", key, raw)))
        };

        let advertise = match non_empty("WAYMESH_ADVERTISE") {
            Some(raw) => Some(
                raw.parse()
                    .map_err(|_| Error::Config(format!("Invalid WAYMESH_ADVERTISE: {}", raw)))?,
            ),
            None => None,
        };

        let relay = non_empty("WAYMESH_RELAY");
        if let Some(relay) = &relay {
            Address::parse(relay)
                .map_err(|_| Error::Config(format!("Invalid WAYMESH_RELAY: {}", relay)))?;
        }

        let bootstrap = non_empty("WAYMESH_BOOTSTRAP")
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            data_dir: PathBuf::from(
                non_empty("WAYMESH_DATA_DIR").unwrap_or_else(|| "./waymesh-data".to_string()),
            ),
            bind: socket("WAYMESH_BIND", "0.0.0.0:7400")?,
            advertise,
            api_addr: socket("WAYMESH_API_ADDR", "127.0.0.1:7480")?,
            relay,
            alias: non_empty("WAYMESH_ALIAS"),
            terrain_url: non_empty("WAYMESH_TERRAIN_URL"),
            terrain_dataset: non_empty("WAYMESH_TERRAIN_DATASET")
                .unwrap_or_else(|| "mapzen".to_string()),
            bootstrap,
        })
    }

    /// Mesh settings derived from this config.
    pub fn mesh(&self) -> MeshConfig {
        let mut mesh = MeshConfig::default().with_bootstrap(self.bootstrap.clone());
        if let Some(relay) = &self.relay {
            mesh = mesh.with_relay(relay.clone());
        }
        if let Some(alias) = &self.alias {
            mesh = mesh.with_alias(alias.clone());
        }
        mesh
    }
}

/// A rendezvous client together with the events it produces.
type RendezvousBridge = (Arc<dyn Rendezvous>, mpsc::Receiver<RendezvousEvent>);

/// A Waymesh node instance.
pub struct WaymeshNode {
    config: NodeConfig,
    storage: Arc<Storage>,
    rendezvous: Option<RendezvousBridge>,
}

impl WaymeshNode {
    /// Open storage for a new node.
    pub fn new(config: NodeConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let storage = Arc::new(Storage::open(&config.data_dir)?);
        Ok(Self {
            config,
            storage,
            rendezvous: None,
        })
    }

    /// Attach a rendezvous client. Its events feed the mesh loop.
    pub fn with_rendezvous(
        mut self,
        client: Arc<dyn Rendezvous>,
        events: mpsc::Receiver<RendezvousEvent>,
    ) -> Self {
        self.rendezvous = Some((client, events));
        self
    }

    /// Assemble the mesh on top of `overlay`.
    fn build_mesh(
        &mut self,
        identity: NodeIdentity,
        overlay: Arc<dyn Overlay>,
        host: Arc<MemoryHost>,
    ) -> Result<(MeshNode, Option<mpsc::Receiver<RendezvousEvent>>)> {
        let mut mesh = MeshNode::new(identity, self.config.mesh(), overlay, self.storage.clone())
            .with_host(host);
        if let Some(url) = &self.config.terrain_url {
            let terrain = HttpTerrain::new(url.clone(), self.config.terrain_dataset.clone())?;
            mesh = mesh.with_terrain(Arc::new(terrain));
            info!("  Terrain: {}", url);
        }
        let events = match self.rendezvous.take() {
            Some((client, events)) => {
                mesh = mesh.with_rendezvous(client);
                info!("  Rendezvous: attached");
                Some(events)
            }
            None => None,
        };
        Ok((mesh, events))
    }

    /// Run the node (binds the overlay, starts the mesh and the HTTP server).
    pub async fn run(mut self) -> Result<()> {
        info!("Waymesh node starting");
        info!("  Overlay: {}", self.config.bind);
        info!("  API: http://{}", self.config.api_addr);
        info!("  Data: {:?}", self.config.data_dir);

        let seed = self.storage.get_or_create_seed()?;
        let provisional = NodeIdentity::from_seed(&seed, "pose");
        let udp = UdpConfig {
            bind: self.config.bind,
            advertise: self.config.advertise,
            ..UdpConfig::default()
        };
        let (overlay, inbound) = UdpOverlay::bind(udp, provisional.key())
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        // The overlay decides the advertised identifier.
        let local = overlay.local_address();
        let identifier = Address::parse(&local)
            .map_err(|e| Error::Config(e.to_string()))?
            .identifier
            .unwrap_or_else(|| "pose".to_string());
        let identity = NodeIdentity::from_seed(&seed, &identifier);

        let host = Arc::new(MemoryHost::new());
        let (mesh, rendezvous_events) = self.build_mesh(identity, Arc::new(overlay), host.clone())?;
        let mesh = Arc::new(mesh);
        info!("  Address: {}", mesh.address());

        let mesh_clone = Arc::clone(&mesh);
        let mesh_task =
            tokio::spawn(async move { mesh_clone.run(inbound, rendezvous_events).await });

        let app = api::build_router(ApiState {
            mesh: Arc::clone(&mesh),
            host,
        });
        let listener = tokio::net::TcpListener::bind(self.config.api_addr).await?;
        info!("HTTP server listening on {}", self.config.api_addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
        mesh_task.abort();
        mesh.shutdown().await;
        Ok(())
    }
}
