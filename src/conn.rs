//! Gestor de conexões: aceitador, mapas de peers de entrada/saída e envio

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use shared::{CoreError, Result};

use crate::config::NetSection;
use crate::node::Node;
use crate::peer::{addr_to_id, read_loop, Peer};

pub struct ConnectionManager {
    pub listening_address: String,
    pub listening_port: u16,
    inbound_limit: usize,
    outbound_limit: usize,
    inbound: Mutex<HashMap<String, Arc<Peer>>>,
    outbound: Mutex<HashMap<String, Arc<Peer>>>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(net: &NetSection) -> Self {
        Self {
            listening_address: net.address.clone(),
            listening_port: net.port,
            inbound_limit: net.inbound_peers_limit,
            outbound_limit: net.outbound_peers_limit,
            inbound: Mutex::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
        }
    }

    /// Aceita conexões de entrada e inicia um laço de leitura por peer
    ///
    /// # Errors
    ///
    /// Retorna erro se o socket de escuta não puder ser aberto
    pub async fn listen(self: Arc<Self>, node: Arc<Node>) -> Result<()> {
        let listener = TcpListener::bind((self.listening_address.as_str(), self.listening_port))
            .await
            .map_err(|e| CoreError::NetworkError(e.to_string()))?;
        info!(
            address = %self.listening_address,
            port = self.listening_port,
            "escutando conexões de peers"
        );

        loop {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| CoreError::NetworkError(e.to_string()))?;

            let Ok((peer, read_half)) = Peer::new(stream) else {
                continue;
            };

            if !self.add_to_inbound(&peer) {
                debug!("limite de peers de entrada atingido, conexão recusada");
                continue;
            }

            let manager = Arc::clone(&self);
            let node = Arc::clone(&node);
            tokio::spawn(async move {
                let id = peer.id();
                if let Err(e) = read_loop(Arc::clone(&peer), read_half, node).await {
                    debug!(peer = %peer.id(), error = %e, "conexão de entrada encerrada");
                }
                // o ID pode ter mudado com o anúncio de endereço de escuta
                manager.remove_inbound(&id);
                manager.remove_inbound(&peer.id());
            });
        }
    }

    /// Abre uma conexão de saída e inicia seu laço de leitura
    ///
    /// # Errors
    ///
    /// Retorna erro se a conexão falhar
    pub fn connect_to_peer<'a>(
        &'a self,
        address: &'a str,
        port: u16,
        node: &'a Arc<Node>,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<Peer>>> + Send + 'a>> {
        Box::pin(async move {
            let stream = TcpStream::connect((address, port))
                .await
                .map_err(|e| CoreError::NetworkError(e.to_string()))?;

            let (peer, read_half) = Peer::new(stream)?;
            // conexões de saída são identificadas pelo endereço discado
            peer.update_addr_info(address, port);
            self.add_to_outbound(&peer);

            let node = Arc::clone(node);
            let spawned = Arc::clone(&peer);
            tokio::spawn(async move {
                let manager = Arc::clone(&node.conn);
                if let Err(e) = read_loop(Arc::clone(&spawned), read_half, node).await {
                    debug!(peer = %spawned.id(), error = %e, "conexão de saída encerrada");
                }
                manager.remove_outbound(&spawned.id());
            });

            Ok(peer)
        })
    }

    /// Envia para o peer dado, conectando antes se preciso
    ///
    /// # Errors
    ///
    /// Retorna erro se a conexão ou a escrita falharem
    pub async fn send_to_peer(
        &self,
        address: &str,
        port: u16,
        frame: &[u8],
        node: &Arc<Node>,
    ) -> Result<()> {
        let id = addr_to_id(address, port);

        let existing = self
            .inbound
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .or_else(|| self.outbound.lock().unwrap().get(&id).cloned());

        let peer = match existing {
            Some(peer) => peer,
            None => self.connect_to_peer(address, port, node).await?,
        };
        peer.send(frame).await
    }

    /// Difunde um quadro para todos os peers conectados
    pub async fn broadcast(&self, frame: Vec<u8>) {
        for peer in self.all_peers() {
            let frame = frame.clone();
            tokio::spawn(async move {
                if let Err(e) = peer.send(&frame).await {
                    warn!(peer = %peer.id(), error = %e, "falha no broadcast");
                }
            });
        }
    }

    fn all_peers(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<Arc<Peer>> = self.inbound.lock().unwrap().values().cloned().collect();
        peers.extend(self.outbound.lock().unwrap().values().cloned());
        peers
    }

    /// Endereços de escuta de todos os peers conhecidos
    #[must_use]
    pub fn collect_peers(&self) -> Vec<(String, u16)> {
        self.all_peers()
            .iter()
            .map(|p| p.listening_addr())
            .collect()
    }

    #[must_use]
    pub fn outbound_full(&self) -> bool {
        self.outbound.lock().unwrap().len() >= self.outbound_limit
    }

    #[must_use]
    pub fn peer_exists(&self, address: &str, port: u16) -> bool {
        let id = addr_to_id(address, port);
        self.inbound.lock().unwrap().contains_key(&id)
            || self.outbound.lock().unwrap().contains_key(&id)
    }

    /// Qualquer peer de saída, para eleger o peer de sincronização
    #[must_use]
    pub fn get_one_outbound(&self) -> Option<Arc<Peer>> {
        self.outbound.lock().unwrap().values().next().cloned()
    }

    /// Re-registra um peer de entrada sob o endereço de escuta anunciado
    pub fn update_inbound_addr(&self, peer_id: &str, address: &str, port: u16) {
        let mut inbound = self.inbound.lock().unwrap();
        let Some(peer) = inbound.remove(peer_id) else {
            return;
        };
        peer.update_addr_info(address, port);
        inbound.insert(peer.id(), peer);
    }

    fn add_to_inbound(&self, peer: &Arc<Peer>) -> bool {
        let mut inbound = self.inbound.lock().unwrap();
        if inbound.len() >= self.inbound_limit {
            return false;
        }
        inbound.insert(peer.id(), Arc::clone(peer));
        true
    }

    fn add_to_outbound(&self, peer: &Arc<Peer>) {
        let mut outbound = self.outbound.lock().unwrap();
        if outbound.len() >= self.outbound_limit {
            return;
        }
        outbound.insert(peer.id(), Arc::clone(peer));
    }

    fn remove_inbound(&self, peer_id: &str) {
        self.inbound.lock().unwrap().remove(peer_id);
    }

    fn remove_outbound(&self, peer_id: &str) {
        self.outbound.lock().unwrap().remove(peer_id);
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inbound.lock().unwrap().len() + self.outbound.lock().unwrap().len()
    }
}
