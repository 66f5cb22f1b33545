//! Estado UTXO (chainstate) com registro de gastos para rewind
//!
//! Chaveado por `TXID ‖ vout` big-endian. Cada remoção aceita é arquivada no
//! `SpentSet`, o que torna `rewind_block` uma inversa exata de `add_block`.

use std::collections::HashMap;
use std::sync::Mutex;

use shared::{CoreError, Hash256, PublicKeyBytes, Result};

use crate::block::Block;

/// Registro de uma saída não gasta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtxoRecord {
    pub height: u32,
    pub coinbase: bool,
    pub amount: u64,
    pub pubkey: PublicKeyBytes,
}

/// Chave de armazenamento de um outpoint: `TXID[32] ‖ vout u64 be`
#[must_use]
pub fn outpoint_key(txid: &Hash256, vout: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(txid.as_bytes());
    key.extend_from_slice(&vout.to_be_bytes());
    key
}

#[derive(Default)]
struct ChainstateInner {
    storage: HashMap<Vec<u8>, UtxoRecord>,
    spent: HashMap<Vec<u8>, UtxoRecord>,
}

impl ChainstateInner {
    fn add_utxo(&mut self, txid: &Hash256, vout: u64, record: UtxoRecord) -> bool {
        let key = outpoint_key(txid, vout);
        if self.storage.contains_key(&key) {
            return false;
        }
        self.storage.insert(key, record);
        true
    }

    fn remove_utxo(&mut self, txid: &Hash256, vout: u64, save_spent: bool) -> bool {
        let key = outpoint_key(txid, vout);
        let Some(record) = self.storage.remove(&key) else {
            return false;
        };
        if save_spent {
            self.spent.entry(key).or_insert(record);
        }
        true
    }
}

/// Conjunto UTXO em memória, reconstruído da rede a cada partida
#[derive(Default)]
pub struct Chainstate {
    inner: Mutex<ChainstateInner>,
}

impl Chainstate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn exists(&self, txid: &Hash256, vout: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.storage.contains_key(&outpoint_key(txid, vout))
    }

    /// Registro completo de um outpoint, se não gasto
    #[must_use]
    pub fn record(&self, txid: &Hash256, vout: u64) -> Option<UtxoRecord> {
        let inner = self.inner.lock().unwrap();
        inner.storage.get(&outpoint_key(txid, vout)).copied()
    }

    /// Registro arquivado de um outpoint já gasto
    #[must_use]
    pub fn spent_record(&self, txid: &Hash256, vout: u64) -> Option<UtxoRecord> {
        let inner = self.inner.lock().unwrap();
        inner.spent.get(&outpoint_key(txid, vout)).copied()
    }

    /// Aplica um bloco aceito: cria as saídas de cada transação na altura dada
    /// e remove (arquivando) as entradas não-coinbase
    ///
    /// Assume bloco já validado.
    ///
    /// # Errors
    ///
    /// Retorna erro se algum TXID não for computável ou uma entrada
    /// referenciar UTXO inexistente
    pub fn add_block(&self, block: &Block, height: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let mut is_cb = true;
        for tx in &block.transactions {
            let txid = tx.txid()?;
            for (vout, output) in tx.outputs.iter().enumerate() {
                inner.add_utxo(
                    &txid,
                    vout as u64,
                    UtxoRecord {
                        height,
                        coinbase: is_cb,
                        amount: output.amount,
                        pubkey: output.public_key,
                    },
                );
            }

            if is_cb {
                is_cb = false;
                continue;
            }
            for input in &tx.inputs {
                if !inner.remove_utxo(&input.txid, input.vout, true) {
                    return Err(CoreError::UtxoNotFound);
                }
            }
        }
        Ok(())
    }

    /// Desfaz um bloco aceito: remove as saídas criadas e restaura do
    /// `SpentSet` as entradas gastas
    ///
    /// # Errors
    ///
    /// Retorna erro se o registro arquivado de alguma entrada não existir
    pub fn rewind_block(&self, block: &Block) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let mut is_cb = true;
        for tx in &block.transactions {
            let txid = tx.txid()?;
            for vout in 0..tx.outputs.len() as u64 {
                inner.remove_utxo(&txid, vout, false);
            }

            if is_cb {
                is_cb = false;
                continue;
            }
            for input in &tx.inputs {
                let key = outpoint_key(&input.txid, input.vout);
                let record = inner
                    .spent
                    .remove(&key)
                    .ok_or(CoreError::UtxoNotFound)?;
                inner.storage.insert(key, record);
            }
        }
        Ok(())
    }

    /// Varre os registros pertencentes a uma chave pública; usado apenas pelo
    /// rescan da carteira
    #[must_use]
    pub fn filter_by_pubkey(&self, pubkey: &PublicKeyBytes) -> Vec<(Hash256, u64)> {
        let inner = self.inner.lock().unwrap();
        let mut res = Vec::new();
        for (key, record) in &inner.storage {
            if record.pubkey == *pubkey {
                let txid = Hash256::from_slice(&key[..32]).expect("chave de 40 bytes");
                let vout = u64::from_be_bytes(key[32..].try_into().expect("8 bytes"));
                res.push((txid, vout));
            }
        }
        res
    }

    #[must_use]
    pub fn utxo_count(&self) -> usize {
        self.inner.lock().unwrap().storage.len()
    }

    #[must_use]
    pub fn spent_count(&self) -> usize {
        self.inner.lock().unwrap().spent.len()
    }
}
