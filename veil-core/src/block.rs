use chrono::Utc;

use shared::codec::{self, Reader};
use shared::{Hash256, PublicKeyBytes, Result};

use crate::computation::{Computation, ComputationRegistry, SharedComputation};
use crate::merkle;
use crate::transaction::Transaction;

/// Cabeçalho de bloco: vincula computações, raiz de Merkle, hash anterior,
/// timestamp e dificuldade
///
/// O hash anterior é a única fonte de verdade do encadeamento; headers são
/// resolvidos pela loja de blocos quando preciso, sem back-pointers.
#[derive(Clone)]
pub struct BlockHeader {
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u64,
    pub difficulty: u32,
    pub computations: Vec<SharedComputation>,
}

impl BlockHeader {
    #[must_use]
    pub const fn new(
        prev_hash: Hash256,
        merkle_root: Hash256,
        timestamp: u64,
        difficulty: u32,
        computations: Vec<SharedComputation>,
    ) -> Self {
        Self {
            prev_hash,
            merkle_root,
            timestamp,
            difficulty,
            computations,
        }
    }

    /// Serialização canônica do cabeçalho
    ///
    /// `prev_hash | merkle_root | timestamp u64 | difficulty u32 |
    /// comp_count u64 | {comp_size u64 | comp}* | [{proof_size u64 | proof}*]`
    ///
    /// Sem provas (`include_proofs = false`) obtém-se o preimage de
    /// vinculação: as computações serializam a forma não vinculada e sem
    /// saída, de modo que nada aqui muda quando as provas são anexadas.
    ///
    /// # Errors
    ///
    /// Com provas, retorna erro se alguma computação ainda não tiver prova
    pub fn serialize(&self, include_proofs: bool) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.prev_hash.as_bytes());
        buf.extend_from_slice(self.merkle_root.as_bytes());
        codec::put_u64(&mut buf, self.timestamp);
        codec::put_u32(&mut buf, self.difficulty);

        codec::put_u64(&mut buf, self.computations.len() as u64);
        for comp in &self.computations {
            let ser = comp.lock().unwrap().serialize(include_proofs)?;
            codec::put_bytes(&mut buf, &ser);
        }

        if include_proofs {
            for comp in &self.computations {
                let proof = comp.lock().unwrap().proof()?;
                codec::put_bytes(&mut buf, &proof);
            }
        }
        Ok(buf)
    }

    /// Hash do cabeçalho (e, por extensão, do bloco)
    ///
    /// # Errors
    ///
    /// Retorna erro se a serialização com provas falhar
    pub fn hash(&self) -> Result<Hash256> {
        Ok(Hash256::digest(&self.serialize(true)?))
    }

    /// Codificação de wire: como a canônica com provas, mas cada computação é
    /// precedida pela sua tag de tipo
    ///
    /// # Errors
    ///
    /// Retorna erro se alguma computação não tiver prova
    pub fn encode_wire(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(self.prev_hash.as_bytes());
        buf.extend_from_slice(self.merkle_root.as_bytes());
        codec::put_u64(buf, self.timestamp);
        codec::put_u32(buf, self.difficulty);

        codec::put_u64(buf, self.computations.len() as u64);
        for comp in &self.computations {
            let mut guard = comp.lock().unwrap();
            codec::put_u32(buf, guard.wire_tag());
            codec::put_bytes(buf, &guard.serialize(true)?);
        }
        for comp in &self.computations {
            let proof = comp.lock().unwrap().proof()?;
            codec::put_bytes(buf, &proof);
        }
        Ok(())
    }

    /// Decodifica um cabeçalho do wire
    ///
    /// # Errors
    ///
    /// Retorna erro para bytes malformados ou tags de computação
    /// desconhecidas
    pub fn decode_wire(reader: &mut Reader<'_>, registry: &ComputationRegistry) -> Result<Self> {
        let prev_hash = reader.read_hash()?;
        let merkle_root = reader.read_hash()?;
        let timestamp = reader.read_u64()?;
        let difficulty = reader.read_u32()?;

        let comp_count = reader.read_u64()?;
        let mut tagged: Vec<(u32, Vec<u8>)> = Vec::new();
        for _ in 0..comp_count {
            let tag = reader.read_u32()?;
            tagged.push((tag, reader.read_var_bytes()?.to_vec()));
        }

        let mut computations = Vec::new();
        for (tag, comp_bytes) in tagged {
            let proof = reader.read_var_bytes()?;
            computations.push(registry.decode(tag, &comp_bytes, proof)?);
        }

        Ok(Self {
            prev_hash,
            merkle_root,
            timestamp,
            difficulty,
            computations,
        })
    }
}

/// Bloco: cabeçalho mais transações ordenadas; a primeira é sempre a coinbase
#[derive(Clone)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Monta um bloco novo sobre `prev_hash` com timestamp corrente
    ///
    /// Assume a coinbase já incluída em `transactions`.
    ///
    /// # Errors
    ///
    /// Retorna erro se alguma transação não tiver TXID computável
    pub fn new(
        prev_hash: Hash256,
        difficulty: u32,
        computations: Vec<SharedComputation>,
        transactions: Vec<Transaction>,
    ) -> Result<Self> {
        let mut txids = Vec::with_capacity(transactions.len());
        for tx in &transactions {
            txids.push(tx.txid()?);
        }
        let merkle_root = merkle::compute_root(txids);

        Ok(Self {
            header: BlockHeader::new(
                prev_hash,
                merkle_root,
                Utc::now().timestamp() as u64,
                difficulty,
                computations,
            ),
            transactions,
        })
    }

    /// Constrói o bloco gênese a partir dos parâmetros de configuração
    ///
    /// # Errors
    ///
    /// Retorna erro se a coinbase gerada não tiver TXID computável
    pub fn genesis(
        pubkey: &PublicKeyBytes,
        reward: u64,
        difficulty: u32,
        timestamp: u64,
    ) -> Result<Self> {
        let coinbase = Transaction::coinbase(pubkey, reward, 0);
        let merkle_root = merkle::compute_root(vec![coinbase.txid()?]);

        Ok(Self {
            header: BlockHeader::new(Hash256::zero(), merkle_root, timestamp, difficulty, vec![]),
            transactions: vec![coinbase],
        })
    }

    /// Hash do bloco é o hash do cabeçalho
    ///
    /// # Errors
    ///
    /// Retorna erro se a serialização do cabeçalho falhar
    pub fn hash(&self) -> Result<Hash256> {
        self.header.hash()
    }

    /// Codificação de wire: `header | tx_count u64 | transações`
    ///
    /// # Errors
    ///
    /// Retorna erro se o cabeçalho não serializar
    pub fn encode_wire(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.header.encode_wire(&mut buf)?;
        codec::put_u64(&mut buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            buf.extend_from_slice(&tx.serialize());
        }
        Ok(buf)
    }

    /// Decodifica um bloco do wire; a primeira transação decodifica como
    /// coinbase
    ///
    /// # Errors
    ///
    /// Retorna erro para bytes malformados
    pub fn decode_wire(reader: &mut Reader<'_>, registry: &ComputationRegistry) -> Result<Self> {
        let header = BlockHeader::decode_wire(reader, registry)?;

        let tx_count = reader.read_u64()?;
        let mut transactions = Vec::new();
        for i in 0..tx_count {
            transactions.push(Transaction::decode(reader, i == 0)?);
        }

        Ok(Self {
            header,
            transactions,
        })
    }
}
