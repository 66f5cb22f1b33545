//! Cadeia canônica: sequência de cabeçalhos com validação completa, agenda de
//! dificuldade/recompensa e gênese a partir da configuração

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use shared::codec;
use shared::{CoreError, Hash256, PublicKeyBytes, Result};

use crate::block::{Block, BlockHeader};
use crate::blockstore::BlockStore;
use crate::chainstate::{outpoint_key, Chainstate};
use crate::compstore::CompStore;
use crate::computation::Computation;
use crate::mempool::MemPool;
use crate::merkle;

/// Parâmetros do bloco gênese vindos da configuração
#[derive(Debug, Clone)]
pub struct GenesisParams {
    pub public_key: PublicKeyBytes,
    pub reward: u64,
    pub difficulty: u32,
    pub timestamp: u64,
    /// Hash esperado; o construtor recomputa a gênese e aborta se não bater
    pub hash: Hash256,
}

/// Parâmetros de consenso da rede
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub genesis: GenesisParams,
    pub blocks_per_epoch: u32,
    pub seconds_per_block: u64,
    pub default_tx_per_block: u64,
}

/// Dificuldade exigida na altura dada
///
/// A dificuldade da gênese é reescalada uma vez por época fechada `i`
/// (iterando `i` de 1 a `épocas`) pela razão entre a duração esperada e a
/// observada entre os cabeçalhos `(i-1)*bpe` e `i*bpe - 1`, presa a
/// `[0.25, 4.0]` e arredondada ao inteiro mais próximo. `timestamp_at` resolve
/// o timestamp do cabeçalho na posição pedida; posições ausentes encerram o
/// reescalonamento.
pub fn difficulty_for_height<F>(params: &ChainParams, height: u32, timestamp_at: F) -> u32
where
    F: Fn(usize) -> Option<u64>,
{
    let mut difficulty = params.genesis.difficulty;
    let epochs = height / params.blocks_per_epoch;
    let bpe = params.blocks_per_epoch as usize;

    for i in 1..=epochs as usize {
        let (Some(first), Some(last)) = (
            timestamp_at((i - 1) * bpe),
            timestamp_at(i * bpe - 1),
        ) else {
            break;
        };

        let actual = last.saturating_sub(first);
        let expected = params.seconds_per_block * params.blocks_per_epoch as u64;

        let ratio = (expected as f64 / actual as f64).clamp(0.25, 4.0);
        difficulty = (ratio * f64::from(difficulty)).round() as u32;
    }
    difficulty
}

/// Validação de cabeçalho: dificuldade correta, profundidade total suficiente
/// e provas válidas sob o preimage de vinculação
///
/// Para cada computação no índice `i`, o preimage é
/// `serialize(header, sem provas) ‖ u64_be(i)`; a computação é re-vinculada a
/// ele e a prova anexada deve verificar.
pub(crate) fn validate_header_against(header: &BlockHeader, required_difficulty: u32) -> bool {
    if header.difficulty != required_difficulty {
        debug!(
            header = header.difficulty,
            required_difficulty, "dificuldade incorreta para a altura"
        );
        return false;
    }

    if header.computations.is_empty() {
        debug!("cabeçalho sem computações");
        return false;
    }

    let total_depth: u32 = header
        .computations
        .iter()
        .map(|c| c.lock().unwrap().difficulty())
        .sum();
    if total_depth < required_difficulty {
        debug!(
            total_depth,
            required_difficulty, "profundidade total não cobre a dificuldade"
        );
        return false;
    }

    let Ok(preimage) = header.serialize(false) else {
        return false;
    };
    for (idx, comp) in header.computations.iter().enumerate() {
        let mut data = preimage.clone();
        codec::put_u64(&mut data, idx as u64);

        let mut guard = comp.lock().unwrap();
        if guard.bind(&data).is_err() {
            return false;
        }
        let Ok(proof) = guard.proof() else {
            debug!(idx, "computação sem prova");
            return false;
        };
        match guard.verify_proof(&proof) {
            Ok(true) => {}
            _ => {
                debug!(idx, "prova de computação inválida");
                return false;
            }
        }
    }
    true
}

/// Cadeia principal
pub struct Chain {
    params: ChainParams,
    pub headers: Vec<BlockHeader>,
    pub total_difficulty: u64,
    chainstate: Arc<Chainstate>,
    block_store: Arc<BlockStore>,
    mem_pool: Arc<MemPool>,
    comp_store: Arc<CompStore>,
}

impl Chain {
    /// Constrói a cadeia com o bloco gênese recomputado da configuração
    ///
    /// # Errors
    ///
    /// Retorna erro se o hash recomputado da gênese não bater com o
    /// configurado
    pub fn new(
        params: ChainParams,
        chainstate: Arc<Chainstate>,
        block_store: Arc<BlockStore>,
        mem_pool: Arc<MemPool>,
        comp_store: Arc<CompStore>,
    ) -> Result<Self> {
        let genesis = Block::genesis(
            &params.genesis.public_key,
            params.genesis.reward,
            params.genesis.difficulty,
            params.genesis.timestamp,
        )?;

        let hash = genesis.hash()?;
        if hash != params.genesis.hash {
            return Err(CoreError::ConfigError(format!(
                "hash da gênese não confere: esperado {}, recomputado {hash}",
                params.genesis.hash
            )));
        }

        let header = genesis.header.clone();
        let difficulty = u64::from(header.difficulty);

        chainstate.add_block(&genesis, 0)?;
        block_store.store_block(hash, Arc::new(genesis));

        Ok(Self {
            params,
            headers: vec![header],
            total_difficulty: difficulty,
            chainstate,
            block_store,
            mem_pool,
            comp_store,
        })
    }

    #[must_use]
    pub fn head_header(&self) -> &BlockHeader {
        self.headers.last().expect("gênese sempre presente")
    }

    /// Altura corrente; a gênese é o bloco 0
    #[must_use]
    pub fn current_height(&self) -> u32 {
        (self.headers.len() - 1) as u32
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.headers.len()
    }

    #[must_use]
    pub fn get_header(&self, idx: usize) -> Option<&BlockHeader> {
        self.headers.get(idx)
    }

    /// # Errors
    ///
    /// Retorna erro se a serialização do cabeçalho da ponta falhar
    pub fn can_attach(&self, header: &BlockHeader) -> Result<bool> {
        if self.headers.is_empty() {
            return Ok(true);
        }
        Ok(header.prev_hash == self.head_header().hash()?)
    }

    /// Anexa um bloco à ponta da cadeia
    ///
    /// Com `already_valid` a validação completa é pulada (caminho do bloco
    /// minerado localmente e do replay de reorg já validado). Em sucesso, o
    /// cabeçalho entra na cadeia, o chainstate aplica o bloco, a loja de
    /// blocos o guarda e mempool e loja de computações o gastam.
    ///
    /// # Errors
    ///
    /// Retorna [`CoreError::CannotAttach`] se o hash anterior não referenciar
    /// a ponta; o gestor de cadeia trata isso como sinal de fork, não de
    /// falha
    pub fn append_block(&mut self, mut block: Block, already_valid: bool) -> Result<bool> {
        let new_height = self.headers.len() as u32;
        let head_hash = self.head_header().hash()?;
        let head_timestamp = self.head_header().timestamp;

        if block.header.prev_hash != head_hash {
            return Err(CoreError::CannotAttach);
        }

        if !already_valid && !self.validate_block(&mut block, new_height) {
            warn!(height = new_height, "bloco inválido");
            return Ok(false);
        }

        // rejeita tentativas de encadear blocos iguais sem avanço de tempo
        if block.header.timestamp <= head_timestamp {
            warn!("timestamp do bloco não supera a ponta corrente");
            return Ok(false);
        }

        let hash = block.hash()?;
        self.headers.push(block.header.clone());

        let block = Arc::new(block);
        self.chainstate.add_block(&block, new_height)?;
        self.block_store.store_block(hash, Arc::clone(&block));
        self.mem_pool.spend_block(&block)?;
        self.comp_store.spend_block(&block);

        self.total_difficulty += u64::from(block.header.difficulty);
        Ok(true)
    }

    /// Validação completa de um bloco candidato à altura dada
    ///
    /// Anota em cada entrada o montante e a chave pública copiados do
    /// chainstate; por isso recebe o bloco mutável.
    #[must_use]
    pub fn validate_block(&self, block: &mut Block, height: u32) -> bool {
        if block.transactions.is_empty() {
            debug!("bloco sem transações");
            return false;
        }
        if !block.transactions[0].is_coinbase() || block.transactions[0].outputs.is_empty() {
            debug!("primeira transação não é coinbase");
            return false;
        }

        // saídas já gastas dentro do próprio bloco
        let mut block_spends: HashSet<Vec<u8>> = HashSet::new();

        let mut allowed_fee: u64 = 0;
        let mut txids = Vec::with_capacity(block.transactions.len());

        for (i, tx) in block.transactions.iter_mut().enumerate() {
            if i == 0 {
                match tx.txid() {
                    Ok(txid) => txids.push(txid),
                    Err(_) => return false,
                }
                continue;
            }

            let mut pubkeys = Vec::with_capacity(tx.inputs.len());
            for input in &mut tx.inputs {
                if !block_spends.insert(outpoint_key(&input.txid, input.vout)) {
                    debug!("UTXO gasto duas vezes no mesmo bloco");
                    return false;
                }

                let Some(record) = self.chainstate.record(&input.txid, input.vout) else {
                    debug!("entrada referencia UTXO fora do chainstate");
                    return false;
                };
                input.set_utxo_info(record.amount, record.pubkey);
                pubkeys.push(record.pubkey);
            }

            if !tx.validate(&pubkeys) {
                debug!("transação inválida contra as chaves referenciadas");
                return false;
            }

            let Ok(fee) = tx.fee() else { return false };
            allowed_fee += fee;

            match tx.txid() {
                Ok(txid) => txids.push(txid),
                Err(_) => return false,
            }
        }

        // a coinbase não pode cunhar além da agenda mais as taxas recolhidas
        let coinbase_amount = block.transactions[0].outputs[0].amount;
        if self.reward_for_height(height) + allowed_fee < coinbase_amount {
            warn!(
                coinbase_amount,
                allowed_fee, "recompensa de coinbase inválida"
            );
            return false;
        }

        let merkle_root = merkle::compute_root(txids);
        if merkle_root != block.header.merkle_root {
            warn!(
                actual = %merkle_root,
                declared = %block.header.merkle_root,
                "raiz de Merkle não confere"
            );
            return false;
        }

        validate_header_against(&block.header, self.get_difficulty_for_height(height))
    }

    #[must_use]
    pub fn get_epoch(&self, height: u32) -> u32 {
        height / self.params.blocks_per_epoch
    }

    #[must_use]
    pub fn get_current_epoch(&self) -> u32 {
        self.get_epoch(self.current_height())
    }

    /// Recompensa da altura: a recompensa inicial cai pela metade a cada época
    #[must_use]
    pub fn reward_for_height(&self, height: u32) -> u64 {
        self.params.genesis.reward >> self.get_epoch(height)
    }

    #[must_use]
    pub fn get_difficulty_for_height(&self, height: u32) -> u32 {
        difficulty_for_height(&self.params, height, |idx| {
            self.headers.get(idx).map(|h| h.timestamp)
        })
    }

    #[must_use]
    pub const fn params(&self) -> &ChainParams {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::KeyPair;

    fn params(kp: &KeyPair, reward: u64, difficulty: u32) -> ChainParams {
        let genesis = Block::genesis(&kp.public_key, reward, difficulty, 1_700_000_000).unwrap();
        ChainParams {
            genesis: GenesisParams {
                public_key: kp.public_key,
                reward,
                difficulty,
                timestamp: 1_700_000_000,
                hash: genesis.hash().unwrap(),
            },
            blocks_per_epoch: 4,
            seconds_per_block: 10,
            default_tx_per_block: 16,
        }
    }

    fn stores() -> (Arc<Chainstate>, Arc<BlockStore>, Arc<MemPool>, Arc<CompStore>) {
        (
            Arc::new(Chainstate::new()),
            Arc::new(BlockStore::new()),
            Arc::new(MemPool::new()),
            Arc::new(CompStore::new()),
        )
    }

    #[test]
    fn test_genesis_chain_state() {
        let kp = KeyPair::generate();
        let p = params(&kp, 100, 3);
        let (cs, bs, mp, comps) = stores();

        let chain = Chain::new(p.clone(), cs.clone(), bs.clone(), mp, comps).unwrap();
        assert_eq!(chain.current_height(), 0);
        assert_eq!(chain.total_difficulty, 3);
        assert!(bs.exists(&p.genesis.hash));
        assert_eq!(cs.utxo_count(), 1);
    }

    #[test]
    fn test_genesis_hash_mismatch_is_rejected() {
        let kp = KeyPair::generate();
        let mut p = params(&kp, 100, 3);
        p.genesis.hash = Hash256::digest(b"outro");
        let (cs, bs, mp, comps) = stores();

        assert!(Chain::new(p, cs, bs, mp, comps).is_err());
    }

    #[test]
    fn test_reward_halves_per_epoch() {
        let kp = KeyPair::generate();
        let p = params(&kp, 100, 3);
        let (cs, bs, mp, comps) = stores();
        let chain = Chain::new(p, cs, bs, mp, comps).unwrap();

        assert_eq!(chain.reward_for_height(0), 100);
        assert_eq!(chain.reward_for_height(3), 100);
        assert_eq!(chain.reward_for_height(4), 50);
        assert_eq!(chain.reward_for_height(8), 25);
        // monótona não crescente
        for h in 0..64 {
            assert!(chain.reward_for_height(h + 1) <= chain.reward_for_height(h));
        }
    }

    #[test]
    fn test_difficulty_schedule_scales_by_epoch_duration() {
        let kp = KeyPair::generate();
        let p = params(&kp, 100, 8); // esperado por época: 10s * 4 blocos = 40s

        // época 0 fechada em 20s: duas vezes mais rápida, dificuldade dobra
        let fast = [0u64, 5, 10, 20];
        let d = difficulty_for_height(&p, 4, |i| fast.get(i).copied());
        assert_eq!(d, 16);

        // época fechada em 160s: quatro vezes mais lenta, dificuldade cai a 1/4
        let slow = [0u64, 50, 100, 160];
        let d = difficulty_for_height(&p, 4, |i| slow.get(i).copied());
        assert_eq!(d, 2);

        // razão presa em 4x mesmo com época instantânea
        let instant = [0u64, 0, 0, 0];
        let d = difficulty_for_height(&p, 4, |i| instant.get(i).copied());
        assert_eq!(d, 32);

        // dentro da primeira época nada muda
        let d = difficulty_for_height(&p, 3, |i| fast.get(i).copied());
        assert_eq!(d, 8);
    }

    #[test]
    fn test_consecutive_epoch_difficulties_bounded() {
        let kp = KeyPair::generate();
        let p = params(&kp, 100, 8);

        for duration in [1u64, 10, 40, 200, 4000] {
            let ts = [0u64, duration / 3, duration / 2, duration];
            let d = difficulty_for_height(&p, 4, |i| ts.get(i).copied());
            assert!(d <= 32, "dificuldade {d} acima do fator 4");
            assert!(d >= 2, "dificuldade {d} abaixo do fator 1/4");
        }
    }

    #[test]
    fn test_cannot_attach_wrong_prev() {
        let kp = KeyPair::generate();
        let p = params(&kp, 100, 3);
        let (cs, bs, mp, comps) = stores();
        let mut chain = Chain::new(p, cs, bs, mp, comps).unwrap();

        let cb = crate::transaction::Transaction::coinbase(&kp.public_key, 100, 1);
        let block = Block::new(Hash256::digest(b"desconhecido"), 3, vec![], vec![cb]).unwrap();

        assert!(matches!(
            chain.append_block(block, true),
            Err(CoreError::CannotAttach)
        ));
    }
}
