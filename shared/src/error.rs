use thiserror::Error;

/// Erros distinguidos pelo núcleo de consenso
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Bloco não encaixa em nenhuma ponta conhecida")]
    CannotAttach,

    #[error("Transação inválida: {0}")]
    InvalidTransaction(String),

    #[error("Bloco inválido: {0}")]
    InvalidBlock(String),

    #[error("Assinatura inválida")]
    InvalidSignature,

    #[error("UTXO não encontrado")]
    UtxoNotFound,

    #[error("Objeto não encontrado: {0}")]
    NotFound(String),

    #[error("Fundos insuficientes")]
    InsufficientFunds,

    #[error("Mineração cancelada pelo stop flag")]
    Cancelled,

    #[error("Dados malformados: {0}")]
    Malformed(String),

    #[error("Expressão inválida: {0}")]
    InvalidExpression(String),

    #[error("Erro criptográfico: {0}")]
    CryptographicError(String),

    #[error("Erro de serialização: {0}")]
    SerializationError(String),

    #[error("Erro de configuração: {0}")]
    ConfigError(String),

    #[error("Erro de I/O: {0}")]
    IoError(String),

    #[error("Erro de rede: {0}")]
    NetworkError(String),
}
