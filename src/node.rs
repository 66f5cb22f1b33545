//! Nó: estado de sincronização, manipuladores de gossip e laço de mineração
//!
//! Máquina de gossip para blocos, transações e computações: `Inv` responde
//! `Get` quando o objeto é desconhecido; `Get` responde `Info` quando o
//! objeto existe; `Info` aceita o objeto e, na primeira aceitação, difunde o
//! `Inv` correspondente a todos os peers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use shared::{CoreError, Hash256, Result};
use veil_core::{
    Block, ChainManager, Computation, ComputationFactory, ComputationRegistry, FheFactory,
    Transaction, Wallet,
};

use crate::config::{self, BootstrapPeer};
use crate::conn::ConnectionManager;
use crate::message::Message;
use crate::peer::Peer;
use crate::rpc::{STATUS_BAD_REQUEST, STATUS_INTERNAL, STATUS_NOT_FOUND, STATUS_OK, STATUS_PAYMENT_REQUIRED};

struct SyncState {
    synced: bool,
    peer: Option<Arc<Peer>>,
}

pub struct Node {
    pub conn: Arc<ConnectionManager>,
    pub chain_manager: Arc<ChainManager>,
    pub registry: Arc<ComputationRegistry>,
    pub fhe_factory: Arc<FheFactory>,
    pub wallet: Arc<Wallet>,
    pub stop_flag: Arc<AtomicBool>,
    rt: tokio::runtime::Handle,
    sync: Mutex<SyncState>,
    sync_cv: Condvar,
}

impl Node {
    #[must_use]
    pub fn new(
        conn: Arc<ConnectionManager>,
        chain_manager: Arc<ChainManager>,
        registry: Arc<ComputationRegistry>,
        fhe_factory: Arc<FheFactory>,
        wallet: Arc<Wallet>,
        stop_flag: Arc<AtomicBool>,
        rt: tokio::runtime::Handle,
    ) -> Self {
        Self {
            conn,
            chain_manager,
            registry,
            fhe_factory,
            wallet,
            stop_flag,
            rt,
            sync: Mutex::new(SyncState {
                synced: false,
                peer: None,
            }),
            sync_cv: Condvar::new(),
        }
    }

    async fn broadcast(&self, msg: &Message) -> Result<()> {
        self.conn.broadcast(msg.encode()?).await;
        Ok(())
    }

    /// Apresenta-se aos peers de arranque pedindo as listas de endereços
    pub async fn bootstrap(self: Arc<Self>, peers: &[BootstrapPeer]) {
        let msg = Message::GetAddr {
            address: self.conn.listening_address.clone(),
            port: self.conn.listening_port,
        };
        let Ok(frame) = msg.encode() else { return };

        for peer in peers {
            match self
                .conn
                .send_to_peer(&peer.address, peer.port, &frame, &self)
                .await
            {
                Ok(()) => info!(address = %peer.address, port = peer.port, "peer de arranque contatado"),
                Err(e) => warn!(
                    address = %peer.address,
                    port = peer.port,
                    error = %e,
                    "falha ao contatar peer de arranque"
                ),
            }
        }
    }

    // ======================
    // Sincronização inicial
    // ======================

    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.sync.lock().unwrap().synced
    }

    fn set_synced(&self) {
        let mut sync = self.sync.lock().unwrap();
        sync.synced = true;
        self.sync_cv.notify_all();
    }

    /// Bloqueia a thread chamadora até o nó sincronizar (laço de mineração)
    pub fn wait_until_synced(&self) {
        let mut sync = self.sync.lock().unwrap();
        while !sync.synced {
            sync = self.sync_cv.wait(sync).unwrap();
        }
    }

    fn sync_peer(&self) -> Option<Arc<Peer>> {
        self.sync.lock().unwrap().peer.clone()
    }

    /// Elege um peer de saída e pede o bloco de altura 1
    ///
    /// Sem peers de saída o nó se considera sincronizado de imediato.
    pub async fn start_sync(&self) -> Result<()> {
        let Some(peer) = self.conn.get_one_outbound() else {
            info!("sem peers de saída, nó considerado sincronizado");
            self.set_synced();
            return Ok(());
        };

        info!(peer = %peer.id(), "sincronização inicial iniciada");
        self.sync.lock().unwrap().peer = Some(Arc::clone(&peer));

        peer.send(&Message::SyncBlock { height: 1 }.encode()?).await
    }

    /// Pede a lista de transações do mempool ao peer de sincronização
    async fn sync_mempool(&self) -> Result<()> {
        if let Some(peer) = self.sync_peer() {
            peer.send(&Message::SyncTransactions.encode()?).await?;
        }
        Ok(())
    }

    // ======================
    // Gossip: blocos
    // ======================

    pub fn handle_hello(&self, greet: &str, id: u32) -> Option<Message> {
        debug!(greet, id, "hello recebido");
        Some(Message::Invalid)
    }

    /// GetAddr: atualiza a identidade divulgável do peer e responde com os
    /// endereços conhecidos
    pub fn handle_get_peer_addrs(&self, address: &str, port: u16, peer_id: &str) -> Option<Message> {
        self.conn.update_inbound_addr(peer_id, address, port);
        Some(Message::Addr {
            peers: self.conn.collect_peers(),
        })
    }

    /// Addr: conecta aos peers desconhecidos até encher o mapa de saída
    pub async fn handle_addr(self: Arc<Self>, peers: Vec<(String, u16)>) {
        let msg = Message::GetAddr {
            address: self.conn.listening_address.clone(),
            port: self.conn.listening_port,
        };
        let Ok(frame) = msg.encode() else { return };

        for (address, port) in peers {
            if self.conn.outbound_full() {
                break;
            }
            if address == self.conn.listening_address && port == self.conn.listening_port {
                continue;
            }
            if self.conn.peer_exists(&address, port) {
                continue;
            }
            if let Err(e) = self.conn.send_to_peer(&address, port, &frame, &self).await {
                warn!(%address, port, error = %e, "falha ao conectar a peer anunciado");
            }
        }
    }

    pub fn handle_inv_block(&self, block_hash: Hash256) -> Option<Message> {
        if self.chain_manager.block_exists(&block_hash) {
            return None;
        }
        Some(Message::GetBlock { block_hash })
    }

    pub fn handle_get_block(&self, block_hash: Hash256) -> Option<Message> {
        let block = self.chain_manager.get_block(&block_hash)?;
        Some(Message::InfoBlock {
            out_of_range: false,
            block: Some((*block).clone()),
        })
    }

    /// Info de bloco fora da sincronização inicial
    ///
    /// Aceitação dispara o stop flag (a rodada de mineração corrente compete
    /// com o bloco recebido) e o Inv é difundido a todos os peers.
    pub async fn handle_info_block(&self, block: Block) -> Result<()> {
        let hash = block.hash()?;

        // o flooding pode entregar o mesmo bloco mais de uma vez
        if self.chain_manager.block_exists(&hash) {
            return Ok(());
        }

        let added = self.chain_manager.add_block(block, false)?;
        info!(added, block = %hash, "bloco recebido da rede");

        if added {
            self.stop_flag.store(true, Ordering::SeqCst);
            self.broadcast(&Message::InvBlock { block_hash: hash }).await?;
        }
        Ok(())
    }

    /// Info de bloco durante a sincronização inicial
    pub async fn handle_info_block_sync(
        &self,
        out_of_range: bool,
        block: Option<Block>,
    ) -> Result<()> {
        if out_of_range {
            info!(
                height = self.chain_manager.current_height(),
                "cadeia sincronizada"
            );
            self.set_synced();
            self.sync_mempool().await?;
            return Ok(());
        }

        let Some(block) = block else { return Ok(()) };
        let hash = block.hash()?;
        if self.chain_manager.block_exists(&hash) {
            return Ok(());
        }

        let added = self.chain_manager.add_block(block, false)?;
        debug!(added, block = %hash, "bloco de sincronização");

        if added {
            // ainda não sincronizado: pede o próximo
            let next = self.chain_manager.current_height() + 1;
            if let Some(peer) = self.sync_peer() {
                peer.send(&Message::SyncBlock { height: next }.encode()?)
                    .await?;
            }
        }
        Ok(())
    }

    /// SyncBlock: responde o bloco pedido da principal, ou fora-de-alcance
    pub fn handle_sync_block(&self, height: u32) -> Result<Option<Message>> {
        if height > self.chain_manager.current_height() {
            return Ok(Some(Message::InfoBlock {
                out_of_range: true,
                block: None,
            }));
        }

        let header = self
            .chain_manager
            .get_header(height as usize)
            .ok_or_else(|| CoreError::NotFound(format!("cabeçalho na altura {height}")))?;
        let block = self
            .chain_manager
            .get_block(&header.hash()?)
            .ok_or_else(|| CoreError::NotFound(format!("bloco na altura {height}")))?;

        Ok(Some(Message::InfoBlock {
            out_of_range: false,
            block: Some((*block).clone()),
        }))
    }

    /// Bloco minerado localmente: admite como válido e anuncia à rede
    pub async fn handle_mined_block(&self, block: Block) -> Result<()> {
        let hash = block.hash()?;
        let added = self.chain_manager.add_block(block, true)?;
        info!(added, block = %hash, "bloco minerado localmente");

        if added {
            self.broadcast(&Message::InvBlock { block_hash: hash }).await?;
        }
        Ok(())
    }

    // ======================
    // Gossip: transações
    // ======================

    pub fn handle_inv_tx(&self, txid: Hash256) -> Option<Message> {
        if self.chain_manager.tx_exists(&txid) {
            return None;
        }
        Some(Message::GetTransaction { txid })
    }

    pub fn handle_get_tx(&self, txid: Hash256) -> Option<Message> {
        let tx = self.chain_manager.get_tx(&txid)?;
        Some(Message::InfoTransaction {
            is_coinbase: false,
            tx,
        })
    }

    pub async fn handle_info_tx(&self, tx: Transaction) -> Result<()> {
        let txid = tx.txid()?;
        if self.chain_manager.tx_exists(&txid) {
            return Ok(());
        }

        let added = self.chain_manager.add_tx(tx)?;
        if added {
            debug!(%txid, "transação aceita no mempool, difundindo");
            self.broadcast(&Message::InvTransaction { txid }).await?;
        }
        Ok(())
    }

    /// SyncTransactions: devolve os TXIDs correntes do mempool
    pub fn handle_sync_transactions(&self) -> Option<Message> {
        Some(Message::ListTransactions {
            txids: self.chain_manager.mempool_list_txids(),
        })
    }

    /// ListTransactions: pede cada transação ainda desconhecida
    pub async fn handle_list_transactions(&self, txids: Vec<Hash256>) -> Result<()> {
        for txid in txids {
            if self.chain_manager.tx_exists(&txid) {
                continue;
            }
            self.broadcast(&Message::GetTransaction { txid }).await?;
        }
        Ok(())
    }

    // ======================
    // Gossip: computações
    // ======================

    pub fn handle_inv_computation(&self, comp_hash: Hash256) -> Option<Message> {
        if self.chain_manager.computation_exists(&comp_hash) {
            return None;
        }
        Some(Message::GetComputation { comp_hash })
    }

    pub fn handle_get_computation(&self, comp_hash: Hash256) -> Option<Message> {
        let comp = self.chain_manager.get_computation(&comp_hash)?;
        Some(Message::InfoComputation { comp })
    }

    pub async fn handle_info_computation(&self, comp: veil_core::SharedComputation) -> Result<()> {
        let comp_hash = comp.lock().unwrap().hash();
        if self.chain_manager.computation_exists(&comp_hash) {
            return Ok(());
        }

        if self.chain_manager.add_computation(comp) {
            debug!(%comp_hash, "computação aceita na loja, difundindo");
            self.broadcast(&Message::InvComputation { comp_hash }).await?;
        }
        Ok(())
    }

    // ======================
    // Laço de mineração
    // ======================

    /// Corre em uma thread dedicada; cada rodada rebaixa o stop flag, minera
    /// e publica o resultado quando houver
    pub fn mining_loop(&self) {
        self.wait_until_synced();
        info!("laço de mineração iniciado");

        loop {
            self.stop_flag.store(false, Ordering::SeqCst);

            if let Err(e) = self.chain_manager.start_mining() {
                error!(error = %e, "falha na rodada de mineração");
                std::thread::sleep(std::time::Duration::from_secs(3));
                continue;
            }

            if !self.chain_manager.have_mined_block() {
                debug!("mineração pausada");
                continue;
            }

            let Some(block) = self.chain_manager.get_mined_block() else {
                continue;
            };
            if let Err(e) = self.rt.block_on(self.handle_mined_block(block)) {
                error!(error = %e, "falha ao publicar bloco minerado");
            }
        }
    }

    // ======================
    // Manipuladores RPC
    // ======================

    pub async fn rpc_say_hello(&self) -> Value {
        let _ = self
            .broadcast(&Message::Hello {
                greet: "Hello".to_string(),
                id: 1312,
            })
            .await;
        json!({ "status": STATUS_OK })
    }

    /// Transaction: constrói, assina, admite no mempool e anuncia
    pub async fn rpc_transaction(&self, req: &Value) -> Value {
        let (Some(recipient), Some(amount), Some(fee)) = (
            req.get("recipient_public_key").and_then(Value::as_str),
            req.get("amount").and_then(Value::as_u64),
            req.get("fee").and_then(Value::as_u64),
        ) else {
            return json!({ "status": STATUS_BAD_REQUEST });
        };

        let Ok(recipient_key) = config::decode_pubkey(recipient) else {
            return json!({ "status": STATUS_BAD_REQUEST });
        };

        let tx = match self.wallet.new_transaction(&recipient_key, amount, fee) {
            Ok(tx) => tx,
            Err(CoreError::InsufficientFunds) => {
                return json!({ "status": STATUS_PAYMENT_REQUIRED })
            }
            Err(e) => {
                warn!(error = %e, "falha ao construir transação");
                return json!({ "status": STATUS_INTERNAL });
            }
        };

        let Ok(txid) = tx.txid() else {
            return json!({ "status": STATUS_INTERNAL });
        };

        // entra no mempool local antes do anúncio
        match self.chain_manager.add_tx(tx) {
            Ok(true) => {}
            _ => warn!(%txid, "transação local não admitida no mempool"),
        }
        let _ = self.broadcast(&Message::InvTransaction { txid }).await;

        json!({ "status": STATUS_OK })
    }

    /// Computation: monta a computação cifrada, guarda e anuncia
    pub async fn rpc_computation(&self, req: &Value) -> Value {
        let (Some(expression), Some(ciphertexts), Some(public_key), Some(timestamp)) = (
            req.get("expression").and_then(Value::as_str),
            req.get("ciphertexts").and_then(Value::as_array),
            req.get("public_key").and_then(Value::as_str),
            req.get("timestamp").and_then(Value::as_u64),
        ) else {
            return json!({ "status": STATUS_BAD_REQUEST });
        };

        let mut cipher_blobs = Vec::with_capacity(ciphertexts.len());
        for entry in ciphertexts {
            let Some(text) = entry.as_str() else {
                return json!({ "status": STATUS_BAD_REQUEST });
            };
            let Ok(blob) = config::decode_b64(text) else {
                return json!({ "status": STATUS_BAD_REQUEST });
            };
            cipher_blobs.push(blob);
        }

        let Ok(public_key) = config::decode_b64(public_key) else {
            return json!({ "status": STATUS_BAD_REQUEST });
        };
        let eval_mult_key = match req.get("eval_mult_key").and_then(Value::as_str) {
            Some(text) => match config::decode_b64(text) {
                Ok(bytes) => bytes,
                Err(_) => return json!({ "status": STATUS_BAD_REQUEST }),
            },
            None => Vec::new(),
        };

        let comp = match self.fhe_factory.create(
            expression.to_string(),
            cipher_blobs,
            public_key,
            eval_mult_key,
            timestamp,
        ) {
            Ok(comp) => comp,
            Err(e) => {
                warn!(error = %e, "computação rejeitada");
                return json!({ "status": STATUS_INTERNAL });
            }
        };

        let comp_hash = comp.lock().unwrap().hash();
        if self.chain_manager.add_computation(comp) {
            info!(%comp_hash, "computação admitida via RPC");
        }
        let _ = self.broadcast(&Message::InvComputation { comp_hash }).await;

        json!({ "status": STATUS_OK })
    }

    /// Output: resultado serializado de uma computação já encadeada
    pub fn rpc_output(&self, req: &Value) -> Value {
        let (Some(height), Some(index)) = (
            req.get("block_height").and_then(Value::as_u64),
            req.get("computation_index").and_then(Value::as_u64),
        ) else {
            return json!({ "status": STATUS_BAD_REQUEST });
        };

        let Some(comp) = self
            .chain_manager
            .computation_at(height as usize, index as usize)
        else {
            return json!({ "status": STATUS_NOT_FOUND });
        };

        match comp.lock().unwrap().output() {
            Ok(output) => json!({
                "status": STATUS_OK,
                "output": config::encode_b64(&output),
            }),
            Err(e) => {
                error!(error = %e, "falha ao obter saída da computação");
                json!({ "status": STATUS_INTERNAL })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetSection;
    use shared::codec;
    use shared::KeyPair;
    use std::sync::Mutex as StdMutex;
    use veil_core::{
        Block, BlockStore, ChainParams, Chainstate, CompStore, DevBackend, FheComputation,
        GenesisParams, MemPool, SharedComputation,
    };

    const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

    fn test_node() -> (Arc<Node>, KeyPair) {
        let genesis_keys = KeyPair::generate();
        let genesis =
            Block::genesis(&genesis_keys.public_key, 100, 3, GENESIS_TIMESTAMP).unwrap();

        let params = ChainParams {
            genesis: GenesisParams {
                public_key: genesis_keys.public_key,
                reward: 100,
                difficulty: 3,
                timestamp: GENESIS_TIMESTAMP,
                hash: genesis.hash().unwrap(),
            },
            blocks_per_epoch: 1000,
            seconds_per_block: 10,
            default_tx_per_block: 16,
        };

        let stop_flag = Arc::new(AtomicBool::new(false));
        let wallet = Arc::new(Wallet::new_random());
        let chain_manager = Arc::new(
            ChainManager::new(
                params,
                Arc::new(Chainstate::new()),
                Arc::new(BlockStore::new()),
                Arc::new(MemPool::new()),
                Arc::new(CompStore::new()),
                Arc::clone(&stop_flag),
                Arc::clone(&wallet),
            )
            .unwrap(),
        );

        let backend = Arc::new(DevBackend);
        let fhe_factory = Arc::new(FheFactory::new(backend));
        let mut registry = ComputationRegistry::new();
        registry.register(Arc::clone(&fhe_factory) as Arc<dyn ComputationFactory>);

        let net = NetSection {
            address: "127.0.0.1".to_string(),
            port: 0,
            rpc_address: "127.0.0.1".to_string(),
            rpc_port: 0,
            inbound_peers_limit: 4,
            outbound_peers_limit: 4,
            bootstrap: Vec::new(),
        };
        let conn = Arc::new(ConnectionManager::new(&net));

        let node = Arc::new(Node::new(
            conn,
            chain_manager,
            Arc::new(registry),
            fhe_factory,
            wallet,
            stop_flag,
            tokio::runtime::Handle::current(),
        ));
        (node, genesis_keys)
    }

    fn computation(salt: u8) -> SharedComputation {
        let expression = vec!["0"; 32].join("*");
        let comp = FheComputation::new(
            Arc::new(DevBackend),
            expression,
            vec![vec![salt; 16]],
            b"client".to_vec(),
            b"emk".to_vec(),
            GENESIS_TIMESTAMP,
        )
        .unwrap();
        Arc::new(StdMutex::new(comp))
    }

    fn build_block(node: &Node, height: u32, timestamp: u64, salt: u8) -> Block {
        let prev = node
            .chain_manager
            .get_header(height as usize - 1)
            .unwrap();
        let miner = KeyPair::generate();
        let coinbase = Transaction::coinbase(&miner.public_key, 100, height);

        let mut block =
            Block::new(prev.hash().unwrap(), 3, vec![computation(salt)], vec![coinbase]).unwrap();
        block.header.timestamp = timestamp;

        let preimage = block.header.serialize(false).unwrap();
        for (idx, comp) in block.header.computations.iter().enumerate() {
            let mut data = preimage.clone();
            codec::put_u64(&mut data, idx as u64);
            let mut guard = comp.lock().unwrap();
            guard.bind(&data).unwrap();
            guard.generate_proof().unwrap();
        }
        block
    }

    #[tokio::test]
    async fn test_initial_sync_state_machine() {
        let (node, _) = test_node();
        assert!(!node.is_synced());

        // blocos chegando em sequência durante a sincronização
        let b1 = build_block(&node, 1, GENESIS_TIMESTAMP + 10, 1);
        node.handle_info_block_sync(false, Some(b1.clone()))
            .await
            .unwrap();
        assert_eq!(node.chain_manager.current_height(), 1);
        assert!(!node.is_synced());

        // duplicata durante a sincronização é idempotente
        node.handle_info_block_sync(false, Some(b1)).await.unwrap();
        assert_eq!(node.chain_manager.current_height(), 1);

        let b2 = build_block(&node, 2, GENESIS_TIMESTAMP + 20, 2);
        node.handle_info_block_sync(false, Some(b2)).await.unwrap();
        assert_eq!(node.chain_manager.current_height(), 2);

        // fora de alcance encerra a sincronização
        node.handle_info_block_sync(true, None).await.unwrap();
        assert!(node.is_synced());
    }

    #[tokio::test]
    async fn test_sync_block_server_side() {
        let (node, _) = test_node();

        // altura além da ponta responde fora-de-alcance
        match node.handle_sync_block(1).unwrap() {
            Some(Message::InfoBlock {
                out_of_range,
                block,
            }) => {
                assert!(out_of_range);
                assert!(block.is_none());
            }
            _ => panic!("esperava InfoBlock"),
        }

        // a gênese é servida na altura 0
        match node.handle_sync_block(0).unwrap() {
            Some(Message::InfoBlock {
                out_of_range,
                block,
            }) => {
                assert!(!out_of_range);
                let genesis = node.chain_manager.get_header(0).unwrap();
                assert_eq!(
                    block.unwrap().hash().unwrap(),
                    genesis.hash().unwrap()
                );
            }
            _ => panic!("esperava InfoBlock"),
        }
    }

    #[tokio::test]
    async fn test_inv_replies_follow_local_knowledge() {
        let (node, _) = test_node();

        let unknown = Hash256::digest(b"desconhecido");
        assert!(matches!(
            node.handle_inv_block(unknown),
            Some(Message::GetBlock { block_hash }) if block_hash == unknown
        ));

        // a gênese já é conhecida: sem resposta
        let genesis_hash = node.chain_manager.get_header(0).unwrap().hash().unwrap();
        assert!(node.handle_inv_block(genesis_hash).is_none());

        assert!(matches!(
            node.handle_inv_tx(unknown),
            Some(Message::GetTransaction { .. })
        ));
        assert!(matches!(
            node.handle_inv_computation(unknown),
            Some(Message::GetComputation { .. })
        ));
    }

    #[tokio::test]
    async fn test_info_computation_accepts_and_lists() {
        let (node, _) = test_node();

        let comp = computation(9);
        let comp_hash = comp.lock().unwrap().hash();

        node.handle_info_computation(comp.clone()).await.unwrap();
        assert!(node.chain_manager.computation_exists(&comp_hash));

        // segunda entrega é descartada sem erro
        node.handle_info_computation(comp).await.unwrap();

        match node.handle_get_computation(comp_hash) {
            Some(Message::InfoComputation { comp }) => {
                assert_eq!(comp.lock().unwrap().hash(), comp_hash);
            }
            _ => panic!("esperava InfoComputation"),
        }
    }

    #[tokio::test]
    async fn test_rpc_output_not_found() {
        let (node, _) = test_node();
        let resp = node.rpc_output(&json!({
            "block_height": 5,
            "computation_index": 0,
        }));
        assert_eq!(resp["status"], STATUS_NOT_FOUND);

        let resp = node.rpc_output(&json!({ "block_height": 5 }));
        assert_eq!(resp["status"], STATUS_BAD_REQUEST);
    }
}
