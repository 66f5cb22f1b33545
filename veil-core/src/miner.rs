//! Minerador: sintetiza a coinbase, vincula as computações ao bloco e gera as
//! provas, cooperando com o stop flag compartilhado

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use shared::codec;
use shared::{CoreError, PublicKeyBytes, Result};

use crate::block::{Block, BlockHeader};
use crate::computation::{Computation, SharedComputation};
use crate::transaction::Transaction;

pub struct Miner {
    stop_flag: Arc<AtomicBool>,
    pub have_result: bool,
    pub result: Option<Block>,
}

impl Miner {
    #[must_use]
    pub const fn new(stop_flag: Arc<AtomicBool>) -> Self {
        Self {
            stop_flag,
            have_result: false,
            result: None,
        }
    }

    /// Limpa o estado da rodada anterior; o stop flag é rebaixado pelo
    /// chamador antes de cada rodada
    pub fn reset(&mut self) {
        self.have_result = false;
        self.result = None;
    }

    /// Monta e prova um bloco candidato
    ///
    /// A coinbase paga `reward` mais as taxas das transações selecionadas.
    /// Cada computação no índice `i` recebe o stop flag, é vinculada a
    /// `serialize(header, sem provas) ‖ u64_be(i)` e gera sua prova. Se o
    /// stop flag interromper qualquer prova, a rodada termina sem resultado:
    /// nunca há bloco parcial.
    ///
    /// # Errors
    ///
    /// Propaga falhas internas; cancelamento não é erro, apenas deixa
    /// `have_result = false`
    pub fn mine(
        &mut self,
        prev_header: &BlockHeader,
        height: u32,
        difficulty: u32,
        reward: u64,
        txs: Vec<Transaction>,
        comps: Vec<SharedComputation>,
        miner_pubkey: &PublicKeyBytes,
    ) -> Result<()> {
        let mut allowed_fee: u64 = 0;
        for tx in &txs {
            // montantes anotados quando a transação entrou no mempool
            allowed_fee += tx.fee()?;
        }
        debug!(allowed_fee, height, "taxas do bloco em mineração");

        let coinbase = Transaction::coinbase(miner_pubkey, reward + allowed_fee, height);

        let mut transactions = vec![coinbase];
        transactions.extend(txs);

        let block = Block::new(prev_header.hash()?, difficulty, comps, transactions)?;

        let preimage = block.header.serialize(false)?;
        for (idx, comp) in block.header.computations.iter().enumerate() {
            let mut data = preimage.clone();
            codec::put_u64(&mut data, idx as u64);

            let mut guard = comp.lock().unwrap();
            guard.set_stop_flag(Arc::clone(&self.stop_flag));
            guard.bind(&data)?;

            match guard.generate_proof() {
                Ok(()) => {}
                Err(CoreError::Cancelled) => {
                    info!("mineração interrompida pelo stop flag");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        // garante que o cabeçalho completo (provas e saídas) serializa
        let hash = block.hash()?;
        info!(height, %hash, "bloco minerado");

        self.have_result = true;
        self.result = Some(block);
        Ok(())
    }

    #[must_use]
    pub fn stopped(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }
}
