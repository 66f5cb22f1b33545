//! Loja de blocos endereçada por conteúdo

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use shared::Hash256;

use crate::block::Block;

#[derive(Default)]
pub struct BlockStore {
    storage: Mutex<HashMap<Hash256, Arc<Block>>>,
}

impl BlockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Guarda um bloco sob o hash dado; blocos já presentes não são
    /// sobrescritos
    pub fn store_block(&self, hash: Hash256, block: Arc<Block>) -> bool {
        let mut storage = self.storage.lock().unwrap();
        if storage.contains_key(&hash) {
            return false;
        }
        storage.insert(hash, block);
        true
    }

    #[must_use]
    pub fn get_block(&self, hash: &Hash256) -> Option<Arc<Block>> {
        self.storage.lock().unwrap().get(hash).cloned()
    }

    pub fn remove_block(&self, hash: &Hash256) -> bool {
        self.storage.lock().unwrap().remove(hash).is_some()
    }

    #[must_use]
    pub fn exists(&self, hash: &Hash256) -> bool {
        self.storage.lock().unwrap().contains_key(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::KeyPair;

    #[test]
    fn test_store_and_fetch() {
        let store = BlockStore::new();
        let kp = KeyPair::generate();
        let block = Block::genesis(&kp.public_key, 100, 3, 1_700_000_000).unwrap();
        let hash = block.hash().unwrap();

        assert!(store.store_block(hash, Arc::new(block)));
        assert!(store.exists(&hash));
        assert!(store.get_block(&hash).is_some());

        // não sobrescreve
        let kp2 = KeyPair::generate();
        let other = Block::genesis(&kp2.public_key, 1, 1, 1).unwrap();
        assert!(!store.store_block(hash, Arc::new(other)));
    }

    #[test]
    fn test_missing_block() {
        let store = BlockStore::new();
        assert!(!store.exists(&Hash256::digest(b"nada")));
        assert!(store.get_block(&Hash256::digest(b"nada")).is_none());
        assert!(!store.remove_block(&Hash256::digest(b"nada")));
    }
}
