//! Loja de computações endereçada por hash, com o seletor guloso que cobre a
//! dificuldade alvo de mineração

use std::collections::BTreeMap;
use std::sync::Mutex;

use shared::Hash256;

use crate::block::Block;
use crate::computation::{Computation, SharedComputation};

#[derive(Default)]
pub struct CompStore {
    storage: Mutex<BTreeMap<Hash256, SharedComputation>>,
}

impl CompStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Guarda uma computação sob seu próprio hash; duplicatas são rejeitadas
    pub fn store_computation(&self, comp: SharedComputation) -> bool {
        let hash = comp.lock().unwrap().hash();
        let mut storage = self.storage.lock().unwrap();
        if storage.contains_key(&hash) {
            return false;
        }
        storage.insert(hash, comp);
        true
    }

    #[must_use]
    pub fn get_computation(&self, hash: &Hash256) -> Option<SharedComputation> {
        self.storage.lock().unwrap().get(hash).cloned()
    }

    pub fn remove_computation(&self, hash: &Hash256) -> bool {
        self.storage.lock().unwrap().remove(hash).is_some()
    }

    #[must_use]
    pub fn exists(&self, hash: &Hash256) -> bool {
        self.storage.lock().unwrap().contains_key(hash)
    }

    /// Seleção gulosa: acumula computações até a soma das dificuldades cobrir
    /// o alvo; devolve vazio se a loja inteira não alcançar
    #[must_use]
    pub fn collect_computations(&self, target: u32) -> Vec<SharedComputation> {
        let storage = self.storage.lock().unwrap();

        let mut res = Vec::new();
        let mut total = 0u32;
        for comp in storage.values() {
            total += comp.lock().unwrap().difficulty();
            res.push(comp.clone());
            if total >= target {
                return res;
            }
        }

        Vec::new()
    }

    /// Remove as computações consumidas por um bloco aceito
    pub fn spend_block(&self, block: &Block) {
        for comp in &block.header.computations {
            let hash = comp.lock().unwrap().hash();
            self.remove_computation(&hash);
        }
    }

    #[must_use]
    pub fn list_comp_hashes(&self) -> Vec<Hash256> {
        self.storage.lock().unwrap().keys().copied().collect()
    }
}
