//! Computação homomórfica concreta sobre o motor FHE externo
//!
//! O núcleo não implementa aritmética de ciphertext nem o argumento SNARK; o
//! trait [`FheBackend`] é a superfície que o motor externo deve oferecer.
//! [`FheComputation`] cuida de tudo o que é consenso: serialização canônica,
//! identidade estável entre estados vinculado/não vinculado, vinculação
//! determinística, avaliação nivelada da expressão e o ciclo de prova.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use shared::codec::{self, Reader};
use shared::{CoreError, Hash256, Result};

use crate::computation::{Computation, ComputationFactory, SharedComputation};
use crate::expr::{ExprNode, ExprTree, Op};

/// Tag de wire da computação FHE
pub const FHE_WIRE_TAG: u32 = 1;

/// Ciphertext serializado, opaco para o núcleo
pub type CipherBlob = Vec<u8>;

/// Pedido de prova/verificação entregue ao motor externo
pub struct ProofRequest<'a> {
    /// Expressão avaliada
    pub expression: &'a str,
    /// Ciphertexts de entrada na forma vinculada corrente
    pub inputs: &'a [CipherBlob],
    /// Resultado serializado da avaliação
    pub output: &'a [u8],
}

/// Superfície do motor FHE + provador SNARK consumida pelo núcleo
pub trait FheBackend: Send + Sync {
    /// Cifra determinística de zero, semeada por `seed`
    ///
    /// # Errors
    ///
    /// Retorna erro se a chave pública for inválida para o motor
    fn encrypt_zero(&self, public_key: &[u8], seed: &[u8]) -> Result<CipherBlob>;

    /// # Errors
    ///
    /// Retorna erro para blobs incompatíveis
    fn add(&self, a: &CipherBlob, b: &CipherBlob) -> Result<CipherBlob>;

    /// # Errors
    ///
    /// Retorna erro para blobs incompatíveis
    fn sub(&self, a: &CipherBlob, b: &CipherBlob) -> Result<CipherBlob>;

    /// Multiplicação sem relinearização
    ///
    /// # Errors
    ///
    /// Retorna erro para blobs incompatíveis
    fn mult(&self, a: &CipherBlob, b: &CipherBlob) -> Result<CipherBlob>;

    /// # Errors
    ///
    /// Retorna erro para blobs incompatíveis
    fn relinearize(&self, c: &CipherBlob) -> Result<CipherBlob>;

    /// # Errors
    ///
    /// Retorna erro para blobs incompatíveis
    fn rescale(&self, c: &CipherBlob) -> Result<CipherBlob>;

    /// Gera o argumento de avaliação correta
    ///
    /// # Errors
    ///
    /// Retorna [`CoreError::Cancelled`] quando o stop flag é levantado em um
    /// ponto de cancelamento do provador
    fn prove(&self, request: &ProofRequest<'_>, stop: &AtomicBool) -> Result<Vec<u8>>;

    /// Verifica um argumento contra o pedido dado
    ///
    /// # Errors
    ///
    /// Retorna erro apenas para falhas internas do motor; prova inválida é
    /// `Ok(false)`
    fn verify(&self, request: &ProofRequest<'_>, proof: &[u8]) -> Result<bool>;
}

/// Computação FHE: expressão, ciphertexts de entrada, chave pública do
/// cliente e material de prova
pub struct FheComputation {
    expression: String,
    expr: ExprTree,
    public_key: Vec<u8>,
    eval_mult_key: Vec<u8>,
    timestamp: u64,
    ciphertexts: Vec<CipherBlob>,
    // arquivados no primeiro bind; serialização e hash partem sempre daqui
    unbound_archive: Vec<CipherBlob>,
    is_bound: bool,
    proof: Option<Vec<u8>>,
    output: Option<Vec<u8>>,
    stop_flag: Arc<AtomicBool>,
    backend: Arc<dyn FheBackend>,
}

impl FheComputation {
    /// Monta uma computação a partir das partes recebidas (RPC ou wire)
    ///
    /// # Errors
    ///
    /// Retorna erro se a expressão for inválida, não houver ciphertexts, um
    /// índice de folha estiver fora do alcance ou faltar `eval_mult_key` para
    /// expressões com multiplicação
    pub fn new(
        backend: Arc<dyn FheBackend>,
        expression: String,
        ciphertexts: Vec<CipherBlob>,
        public_key: Vec<u8>,
        eval_mult_key: Vec<u8>,
        timestamp: u64,
    ) -> Result<Self> {
        let expr = ExprTree::parse(&expression)?;

        if ciphertexts.is_empty() {
            return Err(CoreError::Malformed(
                "computação sem ciphertexts".to_string(),
            ));
        }
        if expression.contains('*') && eval_mult_key.is_empty() {
            return Err(CoreError::Malformed(
                "expressão com multiplicação requer eval_mult_key".to_string(),
            ));
        }

        let mut max_leaf = 0usize;
        max_leaf_index(expr.root(), &mut max_leaf);
        if max_leaf >= ciphertexts.len() {
            return Err(CoreError::Malformed(format!(
                "expressão referencia ciphertext {max_leaf}, apenas {} fornecidos",
                ciphertexts.len()
            )));
        }

        Ok(Self {
            expression,
            expr,
            public_key,
            eval_mult_key,
            timestamp,
            ciphertexts,
            unbound_archive: Vec::new(),
            is_bound: false,
            proof: None,
            output: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            backend,
        })
    }

    fn set_wire_state(&mut self, output: Option<Vec<u8>>, proof: Option<Vec<u8>>) {
        self.output = output;
        self.proof = proof;
    }

    /// Forma canônica não vinculada:
    /// `timestamp | expr | pubkey | eval_mult_key | count | ciphertexts`
    /// (campos variáveis prefixados por tamanho u64)
    fn serialize_unbound(&self) -> Vec<u8> {
        let ciphers = if self.is_bound {
            &self.unbound_archive
        } else {
            &self.ciphertexts
        };

        let mut buf = Vec::new();
        codec::put_u64(&mut buf, self.timestamp);
        codec::put_bytes(&mut buf, self.expression.as_bytes());
        codec::put_bytes(&mut buf, &self.public_key);
        codec::put_bytes(&mut buf, &self.eval_mult_key);
        codec::put_u64(&mut buf, ciphers.len() as u64);
        for cipher in ciphers {
            codec::put_bytes(&mut buf, cipher);
        }
        buf
    }

    fn check_stop(&self) -> Result<()> {
        if self.stop_flag.load(Ordering::SeqCst) {
            return Err(CoreError::Cancelled);
        }
        Ok(())
    }

    /// Avalia a expressão sobre os ciphertexts correntes
    ///
    /// Filhos de profundidades diferentes são nivelados com
    /// relinearização + rescale antes da operação do nó. O stop flag é
    /// consultado a cada nó.
    fn evaluate(&self, node: &ExprNode) -> Result<CipherBlob> {
        self.check_stop()?;

        match node {
            ExprNode::Leaf(idx) => Ok(self.ciphertexts[*idx].clone()),
            ExprNode::Branch {
                op, left, right, ..
            } => {
                let mut c_left = self.evaluate(left)?;
                let mut c_right = self.evaluate(right)?;

                let (shallow, levels) = if left.depth() >= right.depth() {
                    (&mut c_right, left.depth() - right.depth())
                } else {
                    (&mut c_left, right.depth() - left.depth())
                };
                for _ in 0..levels {
                    *shallow = self.backend.relinearize(shallow)?;
                    *shallow = self.backend.rescale(shallow)?;
                }

                match op {
                    Op::Add => self.backend.add(&c_left, &c_right),
                    Op::Sub => self.backend.sub(&c_left, &c_right),
                    Op::Mult => self.backend.mult(&c_left, &c_right),
                }
            }
        }
    }
}

fn max_leaf_index(node: &ExprNode, max: &mut usize) {
    match node {
        ExprNode::Leaf(idx) => *max = (*max).max(*idx),
        ExprNode::Branch { left, right, .. } => {
            max_leaf_index(left, max);
            max_leaf_index(right, max);
        }
    }
}

impl Computation for FheComputation {
    fn wire_tag(&self) -> u32 {
        FHE_WIRE_TAG
    }

    fn serialize(&mut self, include_output: bool) -> Result<Vec<u8>> {
        let inner = self.serialize_unbound();
        if !include_output {
            return Ok(inner);
        }

        let mut buf = Vec::new();
        codec::put_bytes(&mut buf, self.output.as_deref().unwrap_or_default());
        buf.extend_from_slice(&inner);
        Ok(buf)
    }

    fn hash(&self) -> Hash256 {
        Hash256::digest(&self.serialize_unbound())
    }

    fn difficulty(&self) -> u32 {
        self.expr.depth()
    }

    fn proof(&self) -> Result<Vec<u8>> {
        self.proof
            .clone()
            .ok_or_else(|| CoreError::NotFound("prova ausente na computação".to_string()))
    }

    fn bind(&mut self, data: &[u8]) -> Result<()> {
        if self.is_bound {
            // re-vinculação parte sempre do arquivo, nunca da forma vinculada
            self.ciphertexts = self.unbound_archive.clone();
        } else {
            self.unbound_archive = self.ciphertexts.clone();
            self.is_bound = true;
        }

        let mut seed = vec![0u8; 8 + data.len()];
        seed[8..].copy_from_slice(data);
        for (i, cipher) in self.ciphertexts.iter_mut().enumerate() {
            seed[..8].copy_from_slice(&(i as u64).to_be_bytes());
            let zero = self.backend.encrypt_zero(&self.public_key, &seed)?;
            *cipher = self.backend.add(&zero, cipher)?;
        }
        Ok(())
    }

    fn generate_proof(&mut self) -> Result<()> {
        let output = self.evaluate(self.expr.root())?;
        let request = ProofRequest {
            expression: &self.expression,
            inputs: &self.ciphertexts,
            output: &output,
        };
        let proof = self.backend.prove(&request, &self.stop_flag)?;

        self.output = Some(output);
        self.proof = Some(proof);
        Ok(())
    }

    fn verify_proof(&mut self, proof: &[u8]) -> Result<bool> {
        // reavalia a partir da forma vinculada corrente: a saída declarada no
        // wire não é confiada
        let output = self.evaluate(self.expr.root())?;
        if let Some(declared) = &self.output {
            if *declared != output {
                return Ok(false);
            }
        }

        let request = ProofRequest {
            expression: &self.expression,
            inputs: &self.ciphertexts,
            output: &output,
        };
        self.backend.verify(&request, proof)
    }

    fn output(&mut self) -> Result<Vec<u8>> {
        if let Some(out) = &self.output {
            return Ok(out.clone());
        }
        let out = self.evaluate(self.expr.root())?;
        self.output = Some(out.clone());
        Ok(out)
    }

    fn set_stop_flag(&mut self, flag: Arc<AtomicBool>) {
        self.stop_flag = flag;
    }
}

/// Fábrica da computação FHE: decodifica o wire e monta pedidos do RPC
pub struct FheFactory {
    backend: Arc<dyn FheBackend>,
}

impl FheFactory {
    #[must_use]
    pub fn new(backend: Arc<dyn FheBackend>) -> Self {
        Self { backend }
    }

    /// Monta uma computação nova a partir de um pedido de cliente
    ///
    /// # Errors
    ///
    /// Propaga os erros de [`FheComputation::new`]
    pub fn create(
        &self,
        expression: String,
        ciphertexts: Vec<CipherBlob>,
        public_key: Vec<u8>,
        eval_mult_key: Vec<u8>,
        timestamp: u64,
    ) -> Result<SharedComputation> {
        let comp = FheComputation::new(
            Arc::clone(&self.backend),
            expression,
            ciphertexts,
            public_key,
            eval_mult_key,
            timestamp,
        )?;
        Ok(Arc::new(Mutex::new(comp)))
    }
}

impl ComputationFactory for FheFactory {
    fn wire_tag(&self) -> u32 {
        FHE_WIRE_TAG
    }

    fn decode(&self, comp: &[u8], proof: &[u8]) -> Result<SharedComputation> {
        let mut reader = Reader::new(comp);

        let output = reader.read_var_bytes()?.to_vec();
        let timestamp = reader.read_u64()?;
        let expression = String::from_utf8(reader.read_var_bytes()?.to_vec())
            .map_err(|_| CoreError::Malformed("expressão não é UTF-8".to_string()))?;
        let public_key = reader.read_var_bytes()?.to_vec();
        let eval_mult_key = reader.read_var_bytes()?.to_vec();

        let count = reader.read_u64()?;
        let mut ciphertexts = Vec::new();
        for _ in 0..count {
            ciphertexts.push(reader.read_var_bytes()?.to_vec());
        }
        reader.expect_end()?;

        let mut computation = FheComputation::new(
            Arc::clone(&self.backend),
            expression,
            ciphertexts,
            public_key,
            eval_mult_key,
            timestamp,
        )?;
        computation.set_wire_state(
            (!output.is_empty()).then_some(output),
            (!proof.is_empty()).then(|| proof.to_vec()),
        );

        Ok(Arc::new(Mutex::new(computation)))
    }
}

/// Backend determinístico de desenvolvimento
///
/// Substitui o motor FHE e o provador externos por comprometimentos BLAKE2b:
/// cada operação devolve o hash de uma tag de domínio mais os operandos, e a
/// prova é o comprometimento de (expressão, entradas vinculadas, saída). Serve
/// ao nó em redes de teste e aos testes do núcleo; nada aqui é criptografia
/// homomórfica.
pub struct DevBackend;

impl DevBackend {
    fn tagged(tag: &[u8], parts: &[&[u8]]) -> CipherBlob {
        let mut buf = Vec::new();
        codec::put_bytes(&mut buf, tag);
        for part in parts {
            codec::put_bytes(&mut buf, part);
        }
        Hash256::digest(&buf).as_bytes().to_vec()
    }
}

impl FheBackend for DevBackend {
    fn encrypt_zero(&self, public_key: &[u8], seed: &[u8]) -> Result<CipherBlob> {
        Ok(Self::tagged(b"veil.dev.zero", &[public_key, seed]))
    }

    fn add(&self, a: &CipherBlob, b: &CipherBlob) -> Result<CipherBlob> {
        Ok(Self::tagged(b"veil.dev.add", &[a, b]))
    }

    fn sub(&self, a: &CipherBlob, b: &CipherBlob) -> Result<CipherBlob> {
        Ok(Self::tagged(b"veil.dev.sub", &[a, b]))
    }

    fn mult(&self, a: &CipherBlob, b: &CipherBlob) -> Result<CipherBlob> {
        Ok(Self::tagged(b"veil.dev.mult", &[a, b]))
    }

    fn relinearize(&self, c: &CipherBlob) -> Result<CipherBlob> {
        Ok(Self::tagged(b"veil.dev.relin", &[c]))
    }

    fn rescale(&self, c: &CipherBlob) -> Result<CipherBlob> {
        Ok(Self::tagged(b"veil.dev.rescale", &[c]))
    }

    fn prove(&self, request: &ProofRequest<'_>, stop: &AtomicBool) -> Result<Vec<u8>> {
        if stop.load(Ordering::SeqCst) {
            return Err(CoreError::Cancelled);
        }

        let mut parts: Vec<&[u8]> = vec![request.expression.as_bytes()];
        for input in request.inputs {
            parts.push(input);
        }
        parts.push(request.output);
        Ok(Self::tagged(b"veil.dev.proof", &parts))
    }

    fn verify(&self, request: &ProofRequest<'_>, proof: &[u8]) -> Result<bool> {
        let local = AtomicBool::new(false);
        Ok(self.prove(request, &local)? == proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FheComputation {
        FheComputation::new(
            Arc::new(DevBackend),
            "0*1+2".to_string(),
            vec![vec![1u8; 8], vec![2u8; 8], vec![3u8; 8]],
            b"client-pubkey".to_vec(),
            b"eval-mult-key".to_vec(),
            1_700_000_000,
        )
        .unwrap()
    }

    #[test]
    fn test_difficulty_from_expression() {
        assert_eq!(sample().difficulty(), 1);
    }

    #[test]
    fn test_requires_eval_mult_key_for_mult() {
        let res = FheComputation::new(
            Arc::new(DevBackend),
            "0*1".to_string(),
            vec![vec![1], vec![2]],
            vec![],
            vec![],
            0,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_rejects_leaf_out_of_range() {
        let res = FheComputation::new(
            Arc::new(DevBackend),
            "0+5".to_string(),
            vec![vec![1], vec![2]],
            vec![],
            vec![],
            0,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_hash_stable_across_binding() {
        let mut comp = sample();
        let before = comp.hash();
        comp.bind(b"contexto do bloco").unwrap();
        assert_eq!(comp.hash(), before);
        assert_eq!(comp.serialize(false).unwrap(), {
            let mut other = sample();
            other.serialize(false).unwrap()
        });
    }

    #[test]
    fn test_rebind_is_idempotent_on_archive() {
        let mut a = sample();
        let mut b = sample();

        a.bind(b"dados").unwrap();
        b.bind(b"outros dados").unwrap();
        // re-vincular com os mesmos dados parte do arquivo e converge
        b.bind(b"dados").unwrap();

        assert_eq!(a.ciphertexts, b.ciphertexts);
    }

    #[test]
    fn test_proof_verifies_under_same_binding() {
        let mut comp = sample();
        comp.bind(b"bloco-1").unwrap();
        comp.generate_proof().unwrap();

        let proof = comp.proof().unwrap();
        assert!(comp.verify_proof(&proof).unwrap());
    }

    #[test]
    fn test_proof_fails_under_different_binding() {
        let mut comp = sample();
        comp.bind(b"bloco-1").unwrap();
        comp.generate_proof().unwrap();
        let proof = comp.proof().unwrap();

        comp.bind(b"bloco-2").unwrap();
        assert!(!comp.verify_proof(&proof).unwrap());
    }

    #[test]
    fn test_stop_flag_cancels_proof() {
        let mut comp = sample();
        let flag = Arc::new(AtomicBool::new(true));
        comp.set_stop_flag(Arc::clone(&flag));
        comp.bind(b"bloco").unwrap();

        assert!(matches!(comp.generate_proof(), Err(CoreError::Cancelled)));
    }

    #[test]
    fn test_wire_roundtrip_preserves_hash_and_proof() {
        let mut comp = sample();
        comp.bind(b"bloco").unwrap();
        comp.generate_proof().unwrap();

        let wire = crate::computation::encode_wire(&mut comp).unwrap();
        let mut reader = Reader::new(&wire);
        let tag = reader.read_u32().unwrap();
        let comp_bytes = reader.read_var_bytes().unwrap().to_vec();
        let proof_bytes = reader.read_var_bytes().unwrap().to_vec();
        reader.expect_end().unwrap();

        let factory = FheFactory::new(Arc::new(DevBackend));
        assert_eq!(tag, FHE_WIRE_TAG);
        let decoded = factory.decode(&comp_bytes, &proof_bytes).unwrap();
        let mut decoded = decoded.lock().unwrap();

        assert_eq!(decoded.hash(), comp.hash());
        assert_eq!(decoded.proof().unwrap(), comp.proof().unwrap());
        assert_eq!(decoded.difficulty(), comp.difficulty());

        // a prova recebida verifica sob o mesmo preimage de vinculação
        decoded.bind(b"bloco").unwrap();
        let proof = decoded.proof().unwrap();
        assert!(decoded.verify_proof(&proof).unwrap());
    }

    #[test]
    fn test_declared_output_mismatch_fails_verification() {
        let mut comp = sample();
        comp.bind(b"bloco").unwrap();
        comp.generate_proof().unwrap();
        let proof = comp.proof().unwrap();

        comp.output = Some(b"saida adulterada".to_vec());
        assert!(!comp.verify_proof(&proof).unwrap());
    }
}
