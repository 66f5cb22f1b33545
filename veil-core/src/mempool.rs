//! Mempool: conjunto ordenado por taxa com índice de referências a UTXO
//!
//! Três índices acoplados sob um único mutex:
//! - `storage`: TXID → transação (primário);
//! - `order`: chaves `taxa_be ‖ TXID` em um conjunto ordenado, iterado em
//!   reverso para seleção por taxa decrescente com desempate por TXID;
//! - `utxo_ref`: hash da saída referenciada → TXIDs das transações do pool
//!   que a gastariam. Quando um bloco aceita uma delas, todas as demais são
//!   conflitos de gasto duplo e são expulsas juntas.
//!
//! Contrato: `add_valid_tx` recebe transações já validadas (assinaturas
//! conferidas, entradas existentes no chainstate, montantes anotados).

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use shared::{CoreError, Hash256, Result};

use crate::block::Block;
use crate::transaction::Transaction;

#[derive(Default)]
struct MemPoolInner {
    storage: HashMap<Hash256, Transaction>,
    order: BTreeSet<Vec<u8>>,
    utxo_ref: HashMap<Hash256, Vec<Hash256>>,
}

/// Chave do índice de ordenação: concatenar `taxa_be ‖ TXID` faz a comparação
/// lexicográfica ordenar por taxa primeiro e TXID como desempate
fn order_key(fee: u64, txid: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + Hash256::LEN);
    key.extend_from_slice(&fee.to_be_bytes());
    key.extend_from_slice(txid.as_bytes());
    key
}

/// Hashes das saídas referenciadas pelas entradas da transação
fn ref_keys(tx: &Transaction) -> Result<Vec<Hash256>> {
    let mut keys = Vec::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        let key = input.referenced_output_hash().ok_or_else(|| {
            CoreError::InvalidTransaction("entrada sem anotação de UTXO no mempool".to_string())
        })?;
        keys.push(key);
    }
    Ok(keys)
}

impl MemPoolInner {
    fn unregister_refs(&mut self, tx: &Transaction, txid: &Hash256, skip: Option<&Hash256>) {
        let Ok(keys) = ref_keys(tx) else { return };
        for key in keys {
            if skip == Some(&key) {
                continue;
            }
            if let Some(bucket) = self.utxo_ref.get_mut(&key) {
                bucket.retain(|id| id != txid);
                if bucket.is_empty() {
                    self.utxo_ref.remove(&key);
                }
            }
        }
    }

    fn drop_tx(&mut self, txid: &Hash256) -> Option<Transaction> {
        let tx = self.storage.remove(txid)?;
        if let Ok(fee) = tx.fee() {
            self.order.remove(&order_key(fee, txid));
        }
        Some(tx)
    }
}

#[derive(Default)]
pub struct MemPool {
    inner: Mutex<MemPoolInner>,
}

impl MemPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admite uma transação já validada; TXIDs duplicados são rejeitados
    ///
    /// # Errors
    ///
    /// Retorna erro se a transação não tiver TXID computável ou vier sem as
    /// anotações de UTXO
    pub fn add_valid_tx(&self, tx: Transaction) -> Result<bool> {
        let txid = tx.txid()?;
        let fee = tx.fee()?;
        let keys = ref_keys(&tx)?;

        let mut inner = self.inner.lock().unwrap();
        if inner.storage.contains_key(&txid) {
            return Ok(false);
        }

        inner.order.insert(order_key(fee, &txid));
        for key in keys {
            inner.utxo_ref.entry(key).or_default().push(txid);
        }
        inner.storage.insert(txid, tx);
        Ok(true)
    }

    #[must_use]
    pub fn exists(&self, txid: &Hash256) -> bool {
        self.inner.lock().unwrap().storage.contains_key(txid)
    }

    #[must_use]
    pub fn get_tx(&self, txid: &Hash256) -> Option<Transaction> {
        self.inner.lock().unwrap().storage.get(txid).cloned()
    }

    /// Remove uma transação sem expulsar conflitos
    ///
    /// # Errors
    ///
    /// Retorna erro se a transação não tiver TXID computável
    pub fn remove_tx(&self, tx: &Transaction) -> Result<bool> {
        let txid = tx.txid()?;
        let mut inner = self.inner.lock().unwrap();

        let Some(removed) = inner.drop_tx(&txid) else {
            return Ok(false);
        };
        inner.unregister_refs(&removed, &txid, None);
        Ok(true)
    }

    /// Marca uma transação como gasta por um bloco aceito
    ///
    /// Além de removê-la, expulsa toda outra transação do pool que referencie
    /// alguma das mesmas saídas: são gastos duplos que não sobrevivem ao
    /// bloco.
    ///
    /// # Errors
    ///
    /// Retorna erro se a transação não tiver TXID computável
    pub fn spend_tx(&self, tx: &Transaction) -> Result<bool> {
        let txid = tx.txid()?;
        let keys = ref_keys(tx)?;

        let mut inner = self.inner.lock().unwrap();
        inner.drop_tx(&txid);

        for key in &keys {
            let Some(bucket) = inner.utxo_ref.remove(key) else {
                continue;
            };
            for other_txid in bucket {
                if other_txid == txid {
                    continue;
                }
                if let Some(other_tx) = inner.drop_tx(&other_txid) {
                    inner.unregister_refs(&other_tx, &other_txid, Some(key));
                }
            }
        }
        Ok(true)
    }

    /// Aplica um bloco aceito: gasta cada transação não-coinbase
    ///
    /// Transações do bloco que não estavam no pool ainda expulsam seus
    /// conflitos.
    ///
    /// # Errors
    ///
    /// Retorna erro se alguma transação for inconsistente
    pub fn spend_block(&self, block: &Block) -> Result<()> {
        for tx in block.transactions.iter().skip(1) {
            self.spend_tx(tx)?;
        }
        Ok(())
    }

    /// Readmite as transações não-coinbase de um bloco
    ///
    /// # Errors
    ///
    /// Retorna erro se alguma transação for inconsistente
    pub fn add_block(&self, block: &Block) -> Result<bool> {
        for tx in block.transactions.iter().skip(1) {
            if !self.add_valid_tx(tx.clone())? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Até `limit` transações por taxa decrescente
    ///
    /// Não revalida assinaturas nem existência de UTXO: a validação completa
    /// roda de novo na validação do bloco.
    #[must_use]
    pub fn get_top(&self, limit: u64) -> Vec<Transaction> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .rev()
            .take(limit as usize)
            .filter_map(|key| {
                let txid = Hash256::from_slice(&key[8..]).ok()?;
                inner.storage.get(&txid).cloned()
            })
            .collect()
    }

    #[must_use]
    pub fn list_txids(&self) -> Vec<Hash256> {
        self.inner.lock().unwrap().storage.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().storage.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
