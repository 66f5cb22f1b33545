//! Gestor de cadeia: ponto único de mutação do consenso
//!
//! Todo `add_block` passa por aqui, sob um único mutex: o despacho decide
//! entre anexar à principal, estender um fork conhecido, abrir um fork novo ou
//! descartar o órfão; quando um fork ultrapassa a dificuldade total da
//! principal, a reorganização roda inteira sob o mesmo lock e é atômica
//! perante qualquer outra admissão de bloco.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use shared::{CoreError, Hash256, Result};

use crate::block::{Block, BlockHeader};
use crate::blockstore::BlockStore;
use crate::chain::{Chain, ChainParams};
use crate::chainstate::Chainstate;
use crate::compstore::CompStore;
use crate::computation::SharedComputation;
use crate::fork::Fork;
use crate::mempool::MemPool;
use crate::miner::Miner;
use crate::transaction::Transaction;
use crate::wallet::Wallet;

struct ManagerInner {
    main: Chain,
    forks: Vec<Fork>,
}

pub struct ChainManager {
    inner: Mutex<ManagerInner>,
    params: ChainParams,
    chainstate: Arc<Chainstate>,
    block_store: Arc<BlockStore>,
    mem_pool: Arc<MemPool>,
    comp_store: Arc<CompStore>,
    wallet: Arc<Wallet>,
    miner: Mutex<Miner>,
}

impl ChainManager {
    /// # Errors
    ///
    /// Retorna erro se a gênese recomputada não bater com a configuração
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: ChainParams,
        chainstate: Arc<Chainstate>,
        block_store: Arc<BlockStore>,
        mem_pool: Arc<MemPool>,
        comp_store: Arc<CompStore>,
        stop_flag: Arc<AtomicBool>,
        wallet: Arc<Wallet>,
    ) -> Result<Self> {
        let main = Chain::new(
            params.clone(),
            Arc::clone(&chainstate),
            Arc::clone(&block_store),
            Arc::clone(&mem_pool),
            Arc::clone(&comp_store),
        )?;

        Ok(Self {
            inner: Mutex::new(ManagerInner {
                main,
                forks: Vec::new(),
            }),
            params,
            chainstate,
            block_store,
            mem_pool,
            comp_store,
            wallet,
            miner: Mutex::new(Miner::new(stop_flag)),
        })
    }

    /// Admite um bloco vindo da rede ou da mineração local
    ///
    /// Com `is_main_and_valid` o bloco vai direto para a principal sem
    /// revalidação (bloco minerado aqui). Caso contrário: principal se
    /// encaixar; fork existente (com reorganização se ele passar a pesar
    /// mais); fork novo se o pai estiver na principal; senão órfão,
    /// `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Propaga falhas internas de serialização/estado
    pub fn add_block(&self, block: Block, is_main_and_valid: bool) -> Result<bool> {
        let mut guard = self.inner.lock().unwrap();

        if is_main_and_valid {
            let added = guard.main.append_block(block.clone(), true)?;
            if added {
                self.wallet.filter_block(&block)?;
                self.wallet.spend_block(&block);
            }
            return Ok(added);
        }

        if guard.main.can_attach(&block.header)? {
            let added = guard.main.append_block(block.clone(), false)?;
            if added {
                self.wallet.filter_block(&block)?;
                self.wallet.spend_block(&block);
            }
            return Ok(added);
        }

        debug!("bloco não encaixa na principal, procurando fork");
        let inner = &mut *guard;
        for idx in 0..inner.forks.len() {
            if !inner.forks[idx].can_attach(&block.header)? {
                continue;
            }

            if !inner.forks[idx].append_block(block, &inner.main.headers)? {
                // ponto de encaixe encontrado, mas cabeçalho inválido
                return Ok(false);
            }

            if inner.forks[idx].total_difficulty > inner.main.total_difficulty {
                let fork = inner.forks.remove(idx);
                info!(
                    fork_difficulty = fork.total_difficulty,
                    main_difficulty = inner.main.total_difficulty,
                    "fork ultrapassou a principal, reorganizando"
                );
                self.reorg(inner, fork)?;
            }
            return Ok(true);
        }

        // nenhum fork conhecido: busca linear por um ponto de encaixe na
        // principal para abrir um fork novo
        let mut total_diff: u64 = 0;
        for i in 0..inner.main.size() {
            total_diff += u64::from(inner.main.headers[i].difficulty);
            if block.header.prev_hash != inner.main.headers[i].hash()? {
                continue;
            }

            let mut new_fork = Fork::new(
                self.params.clone(),
                Arc::clone(&self.block_store),
                i,
                inner.main.headers[i].clone(),
                total_diff,
            );
            if !new_fork.append_block(block, &inner.main.headers)? {
                return Ok(false);
            }
            inner.forks.push(new_fork);
            return Ok(true);
        }

        // órfão sem ancestral conhecido
        Ok(false)
    }

    /// Reorganização: troca o sufixo da principal pelo fork mais pesado
    ///
    /// Roda sob o lock do gestor, já adquirido por `add_block`. Uma falha de
    /// validação no meio do replay desfaz o desfazimento: a principal antiga
    /// é restaurada exata, a cauda inválida do fork é descartada e a
    /// contabilidade de dificuldade volta ao valor anterior.
    fn reorg(&self, inner: &mut ManagerInner, mut fork: Fork) -> Result<()> {
        let src = fork.chain_src;

        // fork sombra com o sufixo da principal que será substituído
        let mut old_main_fork = Fork::new(
            self.params.clone(),
            Arc::clone(&self.block_store),
            src,
            inner.main.headers[src].clone(),
            inner.main.total_difficulty,
        );
        old_main_fork
            .headers
            .extend(inner.main.headers[src + 1..].iter().cloned());

        self.rewind_main_to(&inner.main, src)?;

        let old_main_total = inner.main.total_difficulty;
        inner.main.headers.truncate(src + 1);

        // replay do fork com validação completa (ele só passou pela de
        // cabeçalho)
        let mut invalid_found = false;
        let mut replayed = 0usize;
        for header in &fork.headers {
            match self.replay_block(&mut inner.main, header) {
                Ok(true) => replayed += 1,
                Ok(false) => {
                    invalid_found = true;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "falha interna no replay do fork");
                    invalid_found = true;
                    break;
                }
            }
        }

        if invalid_found {
            warn!(replayed, "fork inválido no replay, restaurando principal");
            self.rewind_main_to(&inner.main, src)?;
            inner.main.headers.truncate(src + 1);

            for header in &old_main_fork.headers {
                // era válido antes da reorg, tem de voltar a anexar
                let restored = self.replay_block(&mut inner.main, header)?;
                assert!(restored, "principal antiga não reanexou no rollback");
            }

            for i in (replayed..fork.headers.len()).rev() {
                fork.total_difficulty -= u64::from(fork.headers[i].difficulty);
            }
            fork.headers.truncate(replayed);
            inner.main.total_difficulty = old_main_total;
            inner.forks.push(fork);
        } else {
            inner.main.total_difficulty = fork.total_difficulty;
            inner.forks.push(old_main_fork);
            info!(
                height = inner.main.current_height(),
                "reorganização concluída"
            );
        }

        // ingênuo e linear, mas suficiente aqui
        self.wallet.rescan(&inner.main.headers, &self.block_store)
    }

    /// Rebobina o chainstate do topo da principal até o índice `src`
    /// (exclusivo)
    fn rewind_main_to(&self, main: &Chain, src: usize) -> Result<()> {
        for i in ((src + 1)..main.size()).rev() {
            let hash = main.headers[i].hash()?;
            let block = self
                .block_store
                .get_block(&hash)
                .ok_or_else(|| CoreError::NotFound(format!("bloco {hash} fora da loja")))?;
            self.chainstate.rewind_block(&block)?;
        }
        Ok(())
    }

    /// Recupera o bloco de um cabeçalho na loja e anexa à principal com
    /// validação completa
    fn replay_block(&self, main: &mut Chain, header: &BlockHeader) -> Result<bool> {
        let hash = header.hash()?;
        let block = self
            .block_store
            .get_block(&hash)
            .ok_or_else(|| CoreError::NotFound(format!("bloco {hash} fora da loja")))?;
        main.append_block((*block).clone(), false)
    }

    /// Uma rodada de mineração: seleciona transações e computações e entrega
    /// ao minerador
    ///
    /// O stop flag deve ter sido rebaixado pelo chamador. Sem computações
    /// suficientes para cobrir a dificuldade, dorme brevemente e retorna (o
    /// laço de mineração tenta de novo).
    ///
    /// # Errors
    ///
    /// Propaga falhas internas do minerador
    pub fn start_mining(&self) -> Result<()> {
        let mut miner = self.miner.lock().unwrap();
        miner.reset();

        let (prev_header, next_height, difficulty, reward) = {
            let guard = self.inner.lock().unwrap();
            let next = guard.main.current_height() + 1;
            (
                guard.main.head_header().clone(),
                next,
                guard.main.get_difficulty_for_height(next),
                guard.main.reward_for_height(next),
            )
        };

        let txs = self.mem_pool.get_top(self.params.default_tx_per_block);
        if txs.is_empty() {
            debug!("nenhuma transação para o bloco em mineração");
        }

        let comps = self.comp_store.collect_computations(difficulty);
        if comps.is_empty() {
            debug!("sem computações para cobrir a dificuldade, aguardando");
            std::thread::sleep(std::time::Duration::from_secs(3));
            return Ok(());
        }

        miner.mine(
            &prev_header,
            next_height,
            difficulty,
            reward,
            txs,
            comps,
            self.wallet.public_key(),
        )
    }

    #[must_use]
    pub fn have_mined_block(&self) -> bool {
        self.miner.lock().unwrap().have_result
    }

    #[must_use]
    pub fn get_mined_block(&self) -> Option<Block> {
        self.miner.lock().unwrap().result.clone()
    }

    /// Valida uma transação contra o chainstate e a admite no mempool;
    /// somente para transações não-coinbase
    ///
    /// # Errors
    ///
    /// Propaga falhas internas do mempool
    pub fn add_tx(&self, mut tx: Transaction) -> Result<bool> {
        let mut pubkeys = Vec::with_capacity(tx.inputs.len());
        for input in &mut tx.inputs {
            let Some(record) = self.chainstate.record(&input.txid, input.vout) else {
                debug!(txid = %input.txid, "transação referencia UTXO desconhecido");
                return Ok(false);
            };
            input.set_utxo_info(record.amount, record.pubkey);
            pubkeys.push(record.pubkey);
        }

        if !tx.validate(&pubkeys) {
            return Ok(false);
        }

        self.mem_pool.add_valid_tx(tx)
    }

    pub fn add_computation(&self, comp: SharedComputation) -> bool {
        self.comp_store.store_computation(comp)
    }

    #[must_use]
    pub fn block_exists(&self, hash: &Hash256) -> bool {
        self.block_store.exists(hash)
    }

    #[must_use]
    pub fn get_block(&self, hash: &Hash256) -> Option<Arc<Block>> {
        self.block_store.get_block(hash)
    }

    #[must_use]
    pub fn tx_exists(&self, txid: &Hash256) -> bool {
        self.mem_pool.exists(txid)
    }

    #[must_use]
    pub fn get_tx(&self, txid: &Hash256) -> Option<Transaction> {
        self.mem_pool.get_tx(txid)
    }

    #[must_use]
    pub fn computation_exists(&self, hash: &Hash256) -> bool {
        self.comp_store.exists(hash)
    }

    #[must_use]
    pub fn get_computation(&self, hash: &Hash256) -> Option<SharedComputation> {
        self.comp_store.get_computation(hash)
    }

    #[must_use]
    pub fn mempool_list_txids(&self) -> Vec<Hash256> {
        self.mem_pool.list_txids()
    }

    #[must_use]
    pub fn compstore_list_hashes(&self) -> Vec<Hash256> {
        self.comp_store.list_comp_hashes()
    }

    #[must_use]
    pub fn current_height(&self) -> u32 {
        self.inner.lock().unwrap().main.current_height()
    }

    #[must_use]
    pub fn total_difficulty(&self) -> u64 {
        self.inner.lock().unwrap().main.total_difficulty
    }

    #[must_use]
    pub fn get_header(&self, idx: usize) -> Option<BlockHeader> {
        self.inner.lock().unwrap().main.get_header(idx).cloned()
    }

    #[must_use]
    pub fn head_header(&self) -> BlockHeader {
        self.inner.lock().unwrap().main.head_header().clone()
    }

    #[must_use]
    pub fn fork_count(&self) -> usize {
        self.inner.lock().unwrap().forks.len()
    }

    /// Computação no índice dado do cabeçalho de uma altura da principal
    #[must_use]
    pub fn computation_at(&self, height: usize, index: usize) -> Option<SharedComputation> {
        let guard = self.inner.lock().unwrap();
        guard
            .main
            .get_header(height)?
            .computations
            .get(index)
            .cloned()
    }
}
