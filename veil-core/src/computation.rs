//! Interface polimórfica das computações que lastreiam o consenso
//!
//! O núcleo nunca faz downcast: blocos, lojas e minerador enxergam apenas o
//! conjunto de capacidades abaixo. Um novo tipo de computação entra no sistema
//! implementando o trait e registrando sua tag de wire na
//! [`ComputationRegistry`].

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use shared::codec;
use shared::{CoreError, Hash256, Result};

/// Computação compartilhada entre header, loja e minerador; o mutex interno
/// serializa bind/prova sobre o mesmo objeto
pub type SharedComputation = Arc<Mutex<dyn Computation>>;

/// Conjunto de capacidades de uma computação cifrada
pub trait Computation: Send {
    /// Tag que identifica o tipo concreto no wire
    fn wire_tag(&self) -> u32;

    /// Serialização canônica
    ///
    /// A forma serializada usa sempre os ciphertexts *não vinculados*
    /// (arquivados no primeiro `bind`), de modo que o hash é estável entre os
    /// estados vinculado e não vinculado. Com `include_output` o resultado
    /// serializado é prefixado; sem ele obtém-se a forma usada no preimage de
    /// vinculação.
    fn serialize(&mut self, include_output: bool) -> Result<Vec<u8>>;

    /// Identidade da computação: hash do conteúdo, excluindo prova e saída
    fn hash(&self) -> Hash256;

    /// Profundidade multiplicativa declarada pela expressão
    fn difficulty(&self) -> u32;

    /// Prova corrente
    ///
    /// # Errors
    ///
    /// Retorna [`CoreError::NotFound`] se nenhuma prova foi gerada/recebida
    fn proof(&self) -> Result<Vec<u8>>;

    /// Vincula a computação aos dados do bloco: perturbação determinística dos
    /// ciphertexts por cifras de zero semeadas por `contador ‖ data`
    ///
    /// Repetir o bind re-vincula a partir do arquivo não vinculado, nunca da
    /// forma já vinculada.
    fn bind(&mut self, data: &[u8]) -> Result<()>;

    /// Gera a prova de avaliação correta sobre a forma vinculada corrente
    ///
    /// # Errors
    ///
    /// Retorna [`CoreError::Cancelled`] se o stop flag for levantado durante o
    /// trabalho de prova
    fn generate_proof(&mut self) -> Result<()>;

    /// Verifica uma prova contra a forma vinculada corrente
    fn verify_proof(&mut self, proof: &[u8]) -> Result<bool>;

    /// Resultado serializado da avaliação
    fn output(&mut self) -> Result<Vec<u8>>;

    /// Instala o stop flag compartilhado consultado durante avaliação e prova
    fn set_stop_flag(&mut self, flag: Arc<AtomicBool>);
}

/// Codifica a computação para o wire: `tag u32 | comp_size u64 | comp(output
/// incluído) | proof_size u64 | proof`
///
/// # Errors
///
/// Propaga falhas de serialização
pub fn encode_wire(comp: &mut dyn Computation) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    codec::put_u32(&mut buf, comp.wire_tag());
    codec::put_bytes(&mut buf, &comp.serialize(true)?);
    codec::put_bytes(&mut buf, &comp.proof().unwrap_or_default());
    Ok(buf)
}

/// Decodificador de um tipo concreto de computação
pub trait ComputationFactory: Send + Sync {
    fn wire_tag(&self) -> u32;

    /// Reconstrói a computação a partir dos bytes canônicos e da prova
    ///
    /// # Errors
    ///
    /// Retorna erro para bytes malformados
    fn decode(&self, comp: &[u8], proof: &[u8]) -> Result<SharedComputation>;
}

/// Registro tag → fábrica usado na decodificação de headers e gossip
#[derive(Default)]
pub struct ComputationRegistry {
    factories: HashMap<u32, Arc<dyn ComputationFactory>>,
}

impl ComputationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn ComputationFactory>) {
        self.factories.insert(factory.wire_tag(), factory);
    }

    /// # Errors
    ///
    /// Retorna [`CoreError::Malformed`] para tags desconhecidas
    pub fn decode(&self, tag: u32, comp: &[u8], proof: &[u8]) -> Result<SharedComputation> {
        let factory = self
            .factories
            .get(&tag)
            .ok_or_else(|| CoreError::Malformed(format!("tag de computação desconhecida: {tag}")))?;
        factory.decode(comp, proof)
    }
}
