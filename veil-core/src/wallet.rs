//! Carteira: par de chaves, rastreio de moedas próprias e construção de
//! transações assinadas

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use shared::{CoreError, Hash256, KeyPair, PublicKeyBytes, Result};

use crate::block::{Block, BlockHeader};
use crate::blockstore::BlockStore;
use crate::chainstate::outpoint_key;
use crate::transaction::{Transaction, TransactionInput};

pub struct Wallet {
    keypair: KeyPair,
    // moedas da carteira como entradas prontas, anotadas com o montante
    coins: Mutex<BTreeMap<Vec<u8>, TransactionInput>>,
}

impl Wallet {
    /// Carteira com chaves recém-geradas
    #[must_use]
    pub fn new_random() -> Self {
        let keypair = KeyPair::generate();
        info!(public_key = %hex_key(&keypair.public_key), "par de chaves da carteira gerado");
        Self {
            keypair,
            coins: Mutex::new(BTreeMap::new()),
        }
    }

    /// Carteira com chaves carregadas da configuração
    ///
    /// # Errors
    ///
    /// Retorna erro se as chaves não formarem um par válido
    pub fn from_keys(public_key: &[u8], secret_key: &[u8]) -> Result<Self> {
        let keypair = KeyPair::from_bytes(public_key, secret_key)?;
        info!(public_key = %hex_key(&keypair.public_key), "par de chaves da carteira carregado");
        Ok(Self {
            keypair,
            coins: Mutex::new(BTreeMap::new()),
        })
    }

    #[must_use]
    pub const fn public_key(&self) -> &PublicKeyBytes {
        &self.keypair.public_key
    }

    /// Monta e assina uma transação pagando `amount` ao destinatário com a
    /// taxa dada
    ///
    /// As moedas usadas não são removidas aqui: saem quando a transação entra
    /// na cadeia, junto com qualquer outra que referencie os mesmos UTXOs.
    ///
    /// # Errors
    ///
    /// Retorna [`CoreError::InsufficientFunds`] quando as moedas não cobrem
    /// `amount + fee`
    pub fn new_transaction(
        &self,
        recipient: &PublicKeyBytes,
        amount: u64,
        fee: u64,
    ) -> Result<Transaction> {
        let coins = self.coins.lock().unwrap();

        let needed = amount
            .checked_add(fee)
            .ok_or_else(|| CoreError::InvalidTransaction("overflow em amount + fee".to_string()))?;

        let mut inputs = Vec::new();
        let mut collected: u64 = 0;
        for coin in coins.values() {
            collected += coin.amount();
            inputs.push(coin.clone());
            debug!(amount = coin.amount(), "moeda selecionada");
            if collected >= needed {
                break;
            }
        }

        if collected < needed {
            return Err(CoreError::InsufficientFunds);
        }

        let mut tx = Transaction::build_payment(
            inputs,
            &self.keypair.public_key,
            recipient,
            amount,
            fee,
        )?;
        tx.sign(&self.keypair.public_key, &self.keypair)?;
        Ok(tx)
    }

    /// Saldo corrente (soma das moedas rastreadas)
    #[must_use]
    pub fn balance(&self) -> u64 {
        self.coins
            .lock()
            .unwrap()
            .values()
            .map(TransactionInput::amount)
            .sum()
    }

    #[must_use]
    pub fn coin_count(&self) -> usize {
        self.coins.lock().unwrap().len()
    }

    /// Incorpora as saídas de uma transação que pagam esta carteira
    ///
    /// # Errors
    ///
    /// Retorna erro se o TXID não for computável
    pub fn filter_transaction(&self, tx: &Transaction) -> Result<()> {
        let mut coins = self.coins.lock().unwrap();
        self.filter_unlocked(&mut coins, tx)
    }

    fn filter_unlocked(
        &self,
        coins: &mut BTreeMap<Vec<u8>, TransactionInput>,
        tx: &Transaction,
    ) -> Result<()> {
        let txid = tx.txid()?;
        for (vout, output) in tx.outputs.iter().enumerate() {
            if output.public_key != self.keypair.public_key {
                continue;
            }
            let mut coin = TransactionInput::new(txid, vout as u64);
            coin.set_utxo_info(output.amount, output.public_key);
            coins.insert(outpoint_key(&txid, vout as u64), coin);
            debug!(%txid, vout, amount = output.amount, "nova moeda da carteira");
        }
        Ok(())
    }

    /// Remove as moedas gastas pelas entradas de uma transação
    pub fn spend_transaction(&self, tx: &Transaction) {
        let mut coins = self.coins.lock().unwrap();
        Self::spend_unlocked(&mut coins, tx);
    }

    fn spend_unlocked(coins: &mut BTreeMap<Vec<u8>, TransactionInput>, tx: &Transaction) {
        for input in &tx.inputs {
            if coins.remove(&outpoint_key(&input.txid, input.vout)).is_some() {
                debug!(txid = %input.txid, vout = input.vout, "moeda da carteira gasta");
            }
        }
    }

    /// # Errors
    ///
    /// Retorna erro se algum TXID não for computável
    pub fn filter_block(&self, block: &Block) -> Result<()> {
        let mut coins = self.coins.lock().unwrap();
        for tx in &block.transactions {
            self.filter_unlocked(&mut coins, tx)?;
        }
        Ok(())
    }

    pub fn spend_block(&self, block: &Block) {
        let mut coins = self.coins.lock().unwrap();
        for tx in &block.transactions {
            Self::spend_unlocked(&mut coins, tx);
        }
    }

    /// Reconstrói as moedas varrendo a cadeia dada, do zero
    ///
    /// Usado após reorganizações; é ingênuo e linear, o que basta aqui.
    ///
    /// # Errors
    ///
    /// Retorna erro se algum bloco da cadeia não estiver na loja
    pub fn rescan(&self, headers: &[BlockHeader], block_store: &Arc<BlockStore>) -> Result<()> {
        self.coins.lock().unwrap().clear();

        for header in headers {
            let hash = header.hash()?;
            let block = block_store
                .get_block(&hash)
                .ok_or_else(|| CoreError::NotFound(format!("bloco {hash} fora da loja")))?;
            self.spend_block(&block);
            self.filter_block(&block)?;
        }
        Ok(())
    }

    /// Moedas correntes como pares (TXID, vout)
    #[must_use]
    pub fn list_coins(&self) -> Vec<(Hash256, u64)> {
        self.coins
            .lock()
            .unwrap()
            .values()
            .map(|c| (c.txid, c.vout))
            .collect()
    }
}

fn hex_key(key: &PublicKeyBytes) -> String {
    key.iter().map(|b| format!("{b:02x}")).collect()
}
