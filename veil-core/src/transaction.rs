use shared::codec::{self, Reader};
use shared::crypto::{PUBLIC_KEY_BYTES, SIGNATURE_BYTES};
use shared::{CoreError, Hash256, KeyPair, PublicKeyBytes, Result};

/// Valor de `vout` reservado para a entrada de coinbase (serializa como oito
/// bytes 0xFF, preservado por compatibilidade de wire)
pub const COINBASE_VOUT: u64 = u64::MAX;

/// Tamanho do slot de assinatura enquanto carrega a altura do bloco (coinbase)
const COINBASE_SIG_BYTES: u32 = 4;

/// Entrada de transação: referência a um UTXO por (TXID, vout) mais o blob de
/// assinatura
///
/// Durante a validação, o montante e a chave pública do UTXO referenciado são
/// copiados do chainstate para cá; esses campos não entram na serialização.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInput {
    pub txid: Hash256,
    pub vout: u64,
    sig: Vec<u8>,
    sig_size: u32,
    signed: bool,
    amount: u64,
    utxo_pubkey: Option<PublicKeyBytes>,
}

impl TransactionInput {
    #[must_use]
    pub fn new(txid: Hash256, vout: u64) -> Self {
        Self {
            txid,
            vout,
            sig: Vec::new(),
            sig_size: SIGNATURE_BYTES as u32,
            signed: false,
            amount: 0,
            utxo_pubkey: None,
        }
    }

    /// Cria uma entrada já anotada com o montante do UTXO referenciado
    #[must_use]
    pub fn with_amount(txid: Hash256, vout: u64, amount: u64) -> Self {
        let mut input = Self::new(txid, vout);
        input.amount = amount;
        input
    }

    #[must_use]
    pub const fn is_signed(&self) -> bool {
        self.signed
    }

    #[must_use]
    pub const fn amount(&self) -> u64 {
        self.amount
    }

    pub fn set_amount(&mut self, amount: u64) {
        self.amount = amount;
    }

    #[must_use]
    pub const fn utxo_pubkey(&self) -> Option<PublicKeyBytes> {
        self.utxo_pubkey
    }

    /// Anota montante e chave pública do UTXO referenciado (validação)
    pub fn set_utxo_info(&mut self, amount: u64, pubkey: PublicKeyBytes) {
        self.amount = amount;
        self.utxo_pubkey = Some(pubkey);
    }

    #[must_use]
    pub fn signature(&self) -> &[u8] {
        &self.sig
    }

    /// Instala bytes no slot de assinatura
    ///
    /// Com `is_temp` o slot carrega a chave pública do assinante durante o
    /// protocolo de assinatura e a entrada não é marcada como assinada.
    pub fn set_signature(&mut self, sig: &[u8], is_temp: bool) {
        self.sig = sig[..self.sig_size as usize].to_vec();
        if !is_temp {
            self.signed = true;
        }
    }

    pub fn set_temp_sig_size(&mut self, size: u32) {
        self.sig_size = size;
    }

    pub fn revert_sig_size(&mut self) {
        self.sig_size = SIGNATURE_BYTES as u32;
    }

    pub fn clear_signature(&mut self) {
        self.sig = Vec::new();
        self.signed = false;
    }

    /// Marcador de entrada de coinbase: TXID zerado e vout máximo
    #[must_use]
    pub fn is_coinbase_marker(&self) -> bool {
        self.txid.is_zero() && self.vout == COINBASE_VOUT
    }

    /// Hash da saída referenciada por esta entrada, reconstruída a partir das
    /// anotações copiadas do chainstate; chave do índice `utxo_ref` do mempool
    #[must_use]
    pub fn referenced_output_hash(&self) -> Option<Hash256> {
        let pubkey = self.utxo_pubkey?;
        Some(TransactionOutput::new(self.amount, pubkey).hash())
    }

    /// Layout: `TXID[32] | vout u64 | sig_size u32 | sig[sig_size]`
    ///
    /// Slot vazio serializa como zeros do tamanho corrente, mantendo a
    /// serialização determinística entre assinante e verificador.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.txid.as_bytes());
        codec::put_u64(buf, self.vout);
        codec::put_u32(buf, self.sig_size);
        if self.sig.is_empty() {
            buf.extend(std::iter::repeat(0u8).take(self.sig_size as usize));
        } else {
            buf.extend_from_slice(&self.sig);
        }
    }

    /// Decodifica uma entrada do formato canônico
    ///
    /// # Errors
    ///
    /// Retorna erro se o buffer terminar cedo ou o tamanho de assinatura for
    /// incompatível com o tipo da entrada
    pub fn decode(reader: &mut Reader<'_>, is_coinbase: bool) -> Result<Self> {
        let txid = reader.read_hash()?;
        let vout = reader.read_u64()?;
        let sig_size = reader.read_u32()?;

        let expected = if is_coinbase {
            COINBASE_SIG_BYTES
        } else {
            SIGNATURE_BYTES as u32
        };
        if sig_size != expected {
            return Err(CoreError::Malformed(format!(
                "sig_size {sig_size} inválido para entrada"
            )));
        }

        let sig = reader.read_bytes(sig_size as usize)?.to_vec();

        let mut input = Self::new(txid, vout);
        input.sig_size = sig_size;
        input.sig = sig;
        input.signed = true;
        Ok(input)
    }
}

/// Saída de transação: (montante, chave pública do destinatário)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOutput {
    pub amount: u64,
    pub public_key: PublicKeyBytes,
}

impl TransactionOutput {
    #[must_use]
    pub const fn new(amount: u64, public_key: PublicKeyBytes) -> Self {
        Self { amount, public_key }
    }

    /// Layout: `amount u64 | pubkey[32]`
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        codec::put_u64(buf, self.amount);
        buf.extend_from_slice(&self.public_key);
    }

    /// Identidade da saída: hash da serialização canônica
    #[must_use]
    pub fn hash(&self) -> Hash256 {
        let mut buf = Vec::with_capacity(8 + PUBLIC_KEY_BYTES);
        self.serialize_into(&mut buf);
        Hash256::digest(&buf)
    }

    /// # Errors
    ///
    /// Retorna erro em caso de fim prematuro do buffer
    pub fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let amount = reader.read_u64()?;
        let pk_bytes = reader.read_bytes(PUBLIC_KEY_BYTES)?;
        let public_key: PublicKeyBytes = pk_bytes.try_into().expect("32 bytes");
        Ok(Self { amount, public_key })
    }
}

/// Transação: sequência ordenada de entradas e saídas
///
/// O TXID é o hash da serialização canônica e só pode ser calculado com todas
/// as entradas assinadas; a exceção é a coinbase, cujo slot de assinatura
/// carrega a altura do bloco para distinguir TXIDs de blocos vazios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
}

impl Transaction {
    #[must_use]
    pub const fn new(inputs: Vec<TransactionInput>, outputs: Vec<TransactionOutput>) -> Self {
        Self { inputs, outputs }
    }

    /// Monta uma transação de pagamento: saída principal para o destinatário e
    /// troco de volta para o remetente quando sobrar
    ///
    /// Assume entradas com montantes anotados.
    ///
    /// # Errors
    ///
    /// Retorna [`CoreError::InsufficientFunds`] se as entradas não cobrirem
    /// `amount + fee`
    pub fn build_payment(
        inputs: Vec<TransactionInput>,
        self_pubkey: &PublicKeyBytes,
        recipient_pubkey: &PublicKeyBytes,
        amount: u64,
        fee: u64,
    ) -> Result<Self> {
        let total: u64 = inputs.iter().map(TransactionInput::amount).sum();
        let needed = amount
            .checked_add(fee)
            .ok_or_else(|| CoreError::InvalidTransaction("overflow em amount + fee".to_string()))?;

        if total < needed {
            return Err(CoreError::InsufficientFunds);
        }

        let mut outputs = vec![TransactionOutput::new(amount, *recipient_pubkey)];
        if total > needed {
            outputs.push(TransactionOutput::new(total - needed, *self_pubkey));
        }

        Ok(Self { inputs, outputs })
    }

    /// Cria a coinbase de um bloco: entrada vazia carregando a altura no slot
    /// de assinatura e uma única saída pagando o minerador
    #[must_use]
    pub fn coinbase(pubkey: &PublicKeyBytes, amount: u64, height: u32) -> Self {
        let mut input = TransactionInput::new(Hash256::zero(), COINBASE_VOUT);
        input.set_temp_sig_size(COINBASE_SIG_BYTES);
        input.set_signature(&height.to_be_bytes(), false);

        Self {
            inputs: vec![input],
            outputs: vec![TransactionOutput::new(amount, *pubkey)],
        }
    }

    #[must_use]
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase_marker()
    }

    /// Layout: `in_count u64 | inputs | out_count u64 | outputs`
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::put_u64(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.serialize_into(&mut buf);
        }
        codec::put_u64(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.serialize_into(&mut buf);
        }
        buf
    }

    /// TXID: hash da serialização canônica
    ///
    /// # Errors
    ///
    /// Retorna erro se alguma entrada ainda não estiver assinada
    pub fn txid(&self) -> Result<Hash256> {
        for input in &self.inputs {
            if !input.is_signed() {
                return Err(CoreError::InvalidTransaction(
                    "TXID requer todas as entradas assinadas".to_string(),
                ));
            }
        }
        Ok(Hash256::digest(&self.serialize()))
    }

    /// Assina todas as entradas
    ///
    /// Para cada entrada, o slot de assinatura recebe temporariamente a chave
    /// pública do dono (as demais entradas serializam como zeros de 64 bytes);
    /// a serialização resultante é a mensagem assinada. As assinaturas reais
    /// são instaladas só ao final, para que todas cubram a mesma forma.
    ///
    /// # Errors
    ///
    /// Retorna erro se alguma entrada já estiver assinada ou se a assinatura
    /// falhar
    pub fn sign(&mut self, self_pubkey: &PublicKeyBytes, keypair: &KeyPair) -> Result<()> {
        for input in &self.inputs {
            if input.is_signed() {
                return Err(CoreError::InvalidTransaction(
                    "entrada já assinada".to_string(),
                ));
            }
        }

        let mut sigs = Vec::with_capacity(self.inputs.len());
        for idx in 0..self.inputs.len() {
            self.inputs[idx].set_temp_sig_size(PUBLIC_KEY_BYTES as u32);
            self.inputs[idx].set_signature(self_pubkey, true);

            let message = self.serialize();
            sigs.push(keypair.sign(&message)?);

            self.inputs[idx].revert_sig_size();
            self.inputs[idx].clear_signature();
        }

        for (input, sig) in self.inputs.iter_mut().zip(&sigs) {
            input.set_signature(sig, false);
        }
        Ok(())
    }

    /// Taxa: montantes de entrada menos montantes de saída
    ///
    /// # Errors
    ///
    /// Retorna [`CoreError::InsufficientFunds`] se as saídas excederem as
    /// entradas
    pub fn fee(&self) -> Result<u64> {
        let in_total: u64 = self.inputs.iter().map(TransactionInput::amount).sum();
        let out_total: u64 = self.outputs.iter().map(|o| o.amount).sum();

        in_total
            .checked_sub(out_total)
            .ok_or(CoreError::InsufficientFunds)
    }

    /// Verifica montantes e assinaturas contra as chaves públicas dos UTXOs
    /// referenciados (uma por entrada, na mesma ordem)
    ///
    /// Reconstrói a forma assinada: limpa todos os slots e coloca a chave
    /// pública referenciada no slot da entrada sob verificação.
    #[must_use]
    pub fn validate(&self, pubkeys: &[PublicKeyBytes]) -> bool {
        if pubkeys.len() != self.inputs.len() {
            return false;
        }

        let mut in_total: u64 = 0;
        for input in &self.inputs {
            if !input.is_signed() {
                tracing::debug!("entrada não assinada");
                return false;
            }
            in_total += input.amount();
        }

        let out_total: u64 = self.outputs.iter().map(|o| o.amount).sum();
        if in_total < out_total {
            tracing::debug!(in_total, out_total, "fundos insuficientes");
            return false;
        }

        let mut copy = self.clone();
        for input in &mut copy.inputs {
            input.revert_sig_size();
            input.clear_signature();
        }

        for idx in 0..copy.inputs.len() {
            copy.inputs[idx].set_temp_sig_size(PUBLIC_KEY_BYTES as u32);
            copy.inputs[idx].set_signature(&pubkeys[idx], true);

            let message = copy.serialize();
            if !shared::verify(&pubkeys[idx], &message, self.inputs[idx].signature()) {
                tracing::debug!(input = idx, "assinatura inválida");
                return false;
            }

            copy.inputs[idx].revert_sig_size();
            copy.inputs[idx].clear_signature();
        }
        true
    }

    /// Decodifica uma transação do formato canônico
    ///
    /// # Errors
    ///
    /// Retorna erro em caso de dados malformados
    pub fn decode(reader: &mut Reader<'_>, is_coinbase: bool) -> Result<Self> {
        let in_count = reader.read_u64()?;
        let mut inputs = Vec::new();
        for _ in 0..in_count {
            inputs.push(TransactionInput::decode(reader, is_coinbase)?);
        }

        let out_count = reader.read_u64()?;
        let mut outputs = Vec::new();
        for _ in 0..out_count {
            outputs.push(TransactionOutput::decode(reader)?);
        }

        Ok(Self { inputs, outputs })
    }
}
