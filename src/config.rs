//! Configuração do nó em TOML

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;

use shared::{CoreError, Hash256, PublicKeyBytes, Result};
use veil_core::{ChainParams, GenesisParams};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub chain: ChainSection,
    pub net: NetSection,
    pub wallet: Option<WalletSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainSection {
    pub blocks_per_epoch: u32,
    pub seconds_per_block: u64,
    pub default_tx_per_block: u64,
    pub genesis: GenesisSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenesisSection {
    /// Chave pública (base64) que recebe a recompensa da gênese
    pub public_key: String,
    pub reward: u64,
    pub difficulty: u32,
    pub timestamp: i64,
    /// Hash esperado da gênese (base64); conferido na partida
    pub hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetSection {
    pub address: String,
    pub port: u16,
    pub rpc_address: String,
    pub rpc_port: u16,
    pub inbound_peers_limit: usize,
    pub outbound_peers_limit: usize,
    #[serde(default)]
    pub bootstrap: Vec<BootstrapPeer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapPeer {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletSection {
    pub public_key: String,
    pub secret_key: String,
}

impl Config {
    /// Carrega e interpreta o arquivo TOML
    ///
    /// # Errors
    ///
    /// Retorna erro de I/O ou de sintaxe do arquivo
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::IoError(format!("lendo {path}: {e}")))?;
        toml::from_str(&raw).map_err(|e| CoreError::ConfigError(e.to_string()))
    }

    /// Converte a seção de cadeia nos parâmetros de consenso
    ///
    /// # Errors
    ///
    /// Retorna erro para campos base64 inválidos
    pub fn chain_params(&self) -> Result<ChainParams> {
        let genesis = &self.chain.genesis;
        Ok(ChainParams {
            genesis: GenesisParams {
                public_key: decode_pubkey(&genesis.public_key)?,
                reward: genesis.reward,
                difficulty: genesis.difficulty,
                timestamp: genesis.timestamp as u64,
                hash: decode_hash(&genesis.hash)?,
            },
            blocks_per_epoch: self.chain.blocks_per_epoch,
            seconds_per_block: self.chain.seconds_per_block,
            default_tx_per_block: self.chain.default_tx_per_block,
        })
    }
}

/// # Errors
///
/// Retorna erro se o campo não for base64 válido
pub fn decode_b64(value: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| CoreError::ConfigError(format!("base64 inválido: {e}")))
}

#[must_use]
pub fn encode_b64(value: &[u8]) -> String {
    BASE64.encode(value)
}

/// # Errors
///
/// Retorna erro se o campo não decodificar para 32 bytes
pub fn decode_pubkey(value: &str) -> Result<PublicKeyBytes> {
    let bytes = decode_b64(value)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CoreError::ConfigError(format!("chave pública com {} bytes", bytes.len())))
}

/// # Errors
///
/// Retorna erro se o campo não decodificar para 32 bytes
pub fn decode_hash(value: &str) -> Result<Hash256> {
    Hash256::from_slice(&decode_b64(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[chain]
blocks_per_epoch = 32
seconds_per_block = 60
default_tx_per_block = 16

[chain.genesis]
public_key = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="
reward = 100
difficulty = 3
timestamp = 1700000000
hash = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="

[net]
address = "127.0.0.1"
port = 5000
rpc_address = "127.0.0.1"
rpc_port = 5500
inbound_peers_limit = 8
outbound_peers_limit = 8

[[net.bootstrap]]
address = "127.0.0.1"
port = 5001
"#;

    #[test]
    fn test_parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.chain.blocks_per_epoch, 32);
        assert_eq!(config.net.bootstrap.len(), 1);
        assert_eq!(config.net.bootstrap[0].port, 5001);
        assert!(config.wallet.is_none());

        let params = config.chain_params().unwrap();
        assert_eq!(params.genesis.reward, 100);
        assert_eq!(params.genesis.public_key, [0u8; 32]);
    }

    #[test]
    fn test_b64_roundtrip() {
        let bytes = [7u8; 32];
        assert_eq!(decode_b64(&encode_b64(&bytes)).unwrap(), bytes);
    }

    #[test]
    fn test_rejects_bad_pubkey() {
        assert!(decode_pubkey("AAAA").is_err());
    }
}
