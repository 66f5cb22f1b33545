//! Fork: cadeia alternativa leve, presa a um índice da cadeia principal
//!
//! Só os cabeçalhos são validados ao anexar (dificuldade, profundidade e
//! provas); as transações serão validadas por inteiro se e quando o fork
//! virar principal numa reorganização. Os blocos completos ficam na loja.

use std::sync::Arc;

use tracing::warn;

use shared::{CoreError, Result};

use crate::block::{Block, BlockHeader};
use crate::blockstore::BlockStore;
use crate::chain::{difficulty_for_height, validate_header_against, ChainParams};

pub struct Fork {
    /// Índice na cadeia principal onde o fork se origina
    pub chain_src: usize,
    pub chain_src_header: BlockHeader,
    pub headers: Vec<BlockHeader>,
    pub total_difficulty: u64,
    params: ChainParams,
    block_store: Arc<BlockStore>,
}

impl Fork {
    #[must_use]
    pub const fn new(
        params: ChainParams,
        block_store: Arc<BlockStore>,
        chain_src: usize,
        chain_src_header: BlockHeader,
        total_difficulty: u64,
    ) -> Self {
        Self {
            chain_src,
            chain_src_header,
            headers: Vec::new(),
            total_difficulty,
            params,
            block_store,
        }
    }

    /// Altura da ponta do fork; assume ao menos a gênese na cadeia principal
    #[must_use]
    pub fn current_fork_height(&self) -> u32 {
        (self.chain_src + self.headers.len()) as u32
    }

    /// # Errors
    ///
    /// Retorna erro se a serialização do cabeçalho da ponta falhar
    pub fn can_attach(&self, header: &BlockHeader) -> Result<bool> {
        let head = self.headers.last().unwrap_or(&self.chain_src_header);
        Ok(header.prev_hash == head.hash()?)
    }

    /// Anexa um bloco validando apenas o cabeçalho
    ///
    /// `main_headers` é a cadeia principal corrente; o prefixo até
    /// `chain_src` fornece os timestamps das épocas fechadas para a agenda de
    /// dificuldade.
    ///
    /// # Errors
    ///
    /// Retorna [`CoreError::CannotAttach`] se o bloco não encaixar na ponta
    /// do fork
    pub fn append_block(&mut self, block: Block, main_headers: &[BlockHeader]) -> Result<bool> {
        let new_height = self.current_fork_height() + 1;

        if !self.can_attach(&block.header)? {
            return Err(CoreError::CannotAttach);
        }

        let required = difficulty_for_height(&self.params, new_height, |idx| {
            if idx <= self.chain_src {
                main_headers.get(idx).map(|h| h.timestamp)
            } else {
                self.headers.get(idx - self.chain_src - 1).map(|h| h.timestamp)
            }
        });

        if !validate_header_against(&block.header, required) {
            warn!(height = new_height, "cabeçalho inválido para o fork");
            return Ok(false);
        }

        let hash = block.hash()?;
        self.headers.push(block.header.clone());

        // mesmo sendo fork, o bloco fica na loja para a reorg recuperá-lo
        self.block_store.store_block(hash, Arc::new(block));

        self.total_difficulty += u64::from(self.headers.last().expect("recém inserido").difficulty);
        Ok(true)
    }
}
