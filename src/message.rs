//! Mensagens do protocolo de wire
//!
//! Todo quadro é `u32_be tamanho | u32_be tipo | payload`. Os payloads usam o
//! mesmo codec canônico big-endian do núcleo; campos variáveis são prefixados
//! pelo tamanho.

use shared::codec::{self, Reader};
use shared::{CoreError, Hash256, Result};
use veil_core::computation::encode_wire;
use veil_core::{Block, ComputationRegistry, SharedComputation, Transaction};

/// Limite de quadro aceito de um peer; acima disso a conexão é encerrada
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Cabeçalho de quadro: tamanho + tipo
pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Hello = 0,
    GetAddr = 1,
    Addr = 2,
    Invalid = 3,
    InvBlock = 4,
    GetBlock = 5,
    InfoBlock = 6,
    InvTransaction = 7,
    GetTransaction = 8,
    InfoTransaction = 9,
    InvComputation = 10,
    GetComputation = 11,
    InfoComputation = 12,
    SyncBlock = 13,
    SyncTransactions = 14,
    ListTransactions = 15,
}

impl MessageType {
    /// # Errors
    ///
    /// Retorna [`CoreError::Malformed`] para códigos desconhecidos; o peer
    /// que os envia tem a conexão encerrada
    pub fn from_wire(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::Hello,
            1 => Self::GetAddr,
            2 => Self::Addr,
            3 => Self::Invalid,
            4 => Self::InvBlock,
            5 => Self::GetBlock,
            6 => Self::InfoBlock,
            7 => Self::InvTransaction,
            8 => Self::GetTransaction,
            9 => Self::InfoTransaction,
            10 => Self::InvComputation,
            11 => Self::GetComputation,
            12 => Self::InfoComputation,
            13 => Self::SyncBlock,
            14 => Self::SyncTransactions,
            15 => Self::ListTransactions,
            other => {
                return Err(CoreError::Malformed(format!(
                    "tipo de mensagem desconhecido: {other}"
                )))
            }
        })
    }
}

pub enum Message {
    Hello { greet: String, id: u32 },
    GetAddr { address: String, port: u16 },
    Addr { peers: Vec<(String, u16)> },
    Invalid,
    InvBlock { block_hash: Hash256 },
    GetBlock { block_hash: Hash256 },
    InfoBlock { out_of_range: bool, block: Option<Block> },
    InvTransaction { txid: Hash256 },
    GetTransaction { txid: Hash256 },
    InfoTransaction { is_coinbase: bool, tx: Transaction },
    InvComputation { comp_hash: Hash256 },
    GetComputation { comp_hash: Hash256 },
    InfoComputation { comp: SharedComputation },
    SyncBlock { height: u32 },
    SyncTransactions,
    ListTransactions { txids: Vec<Hash256> },
}

impl Message {
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Hello { .. } => MessageType::Hello,
            Self::GetAddr { .. } => MessageType::GetAddr,
            Self::Addr { .. } => MessageType::Addr,
            Self::Invalid => MessageType::Invalid,
            Self::InvBlock { .. } => MessageType::InvBlock,
            Self::GetBlock { .. } => MessageType::GetBlock,
            Self::InfoBlock { .. } => MessageType::InfoBlock,
            Self::InvTransaction { .. } => MessageType::InvTransaction,
            Self::GetTransaction { .. } => MessageType::GetTransaction,
            Self::InfoTransaction { .. } => MessageType::InfoTransaction,
            Self::InvComputation { .. } => MessageType::InvComputation,
            Self::GetComputation { .. } => MessageType::GetComputation,
            Self::InfoComputation { .. } => MessageType::InfoComputation,
            Self::SyncBlock { .. } => MessageType::SyncBlock,
            Self::SyncTransactions => MessageType::SyncTransactions,
            Self::ListTransactions { .. } => MessageType::ListTransactions,
        }
    }

    /// Codifica a mensagem já com o cabeçalho de quadro
    ///
    /// # Errors
    ///
    /// Propaga falhas de serialização de blocos/computações
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = self.encode_payload()?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        codec::put_u32(&mut frame, payload.len() as u32);
        codec::put_u32(&mut frame, self.message_type() as u32);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::Hello { greet, id } => {
                codec::put_bytes(&mut buf, greet.as_bytes());
                codec::put_u32(&mut buf, *id);
            }
            Self::GetAddr { address, port } => {
                codec::put_bytes(&mut buf, address.as_bytes());
                codec::put_u16(&mut buf, *port);
            }
            Self::Addr { peers } => {
                codec::put_u64(&mut buf, peers.len() as u64);
                for (address, port) in peers {
                    codec::put_bytes(&mut buf, address.as_bytes());
                    codec::put_u16(&mut buf, *port);
                }
            }
            Self::Invalid | Self::SyncTransactions => {}
            Self::InvBlock { block_hash } | Self::GetBlock { block_hash } => {
                buf.extend_from_slice(block_hash.as_bytes());
            }
            Self::InfoBlock {
                out_of_range,
                block,
            } => {
                buf.push(u8::from(*out_of_range));
                if let Some(block) = block {
                    buf.extend_from_slice(&block.encode_wire()?);
                }
            }
            Self::InvTransaction { txid } | Self::GetTransaction { txid } => {
                buf.extend_from_slice(txid.as_bytes());
            }
            Self::InfoTransaction { is_coinbase, tx } => {
                buf.push(u8::from(*is_coinbase));
                buf.extend_from_slice(&tx.serialize());
            }
            Self::InvComputation { comp_hash } | Self::GetComputation { comp_hash } => {
                buf.extend_from_slice(comp_hash.as_bytes());
            }
            Self::InfoComputation { comp } => {
                let mut guard = comp.lock().unwrap();
                buf = encode_wire(&mut *guard)?;
            }
            Self::SyncBlock { height } => {
                codec::put_u32(&mut buf, *height);
            }
            Self::ListTransactions { txids } => {
                codec::put_u64(&mut buf, txids.len() as u64);
                for txid in txids {
                    buf.extend_from_slice(txid.as_bytes());
                }
            }
        }
        Ok(buf)
    }

    /// Decodifica o payload de um quadro recebido
    ///
    /// # Errors
    ///
    /// Retorna [`CoreError::Malformed`] para payloads inválidos
    pub fn decode(
        msg_type: MessageType,
        payload: &[u8],
        registry: &ComputationRegistry,
    ) -> Result<Self> {
        let mut reader = Reader::new(payload);

        let msg = match msg_type {
            MessageType::Hello => {
                let greet = read_string(&mut reader)?;
                let id = reader.read_u32()?;
                Self::Hello { greet, id }
            }
            MessageType::GetAddr => {
                let address = read_string(&mut reader)?;
                let port = reader.read_u16()?;
                Self::GetAddr { address, port }
            }
            MessageType::Addr => {
                let count = reader.read_u64()?;
                let mut peers = Vec::new();
                for _ in 0..count {
                    let address = read_string(&mut reader)?;
                    let port = reader.read_u16()?;
                    peers.push((address, port));
                }
                Self::Addr { peers }
            }
            MessageType::Invalid => Self::Invalid,
            MessageType::InvBlock => Self::InvBlock {
                block_hash: reader.read_hash()?,
            },
            MessageType::GetBlock => Self::GetBlock {
                block_hash: reader.read_hash()?,
            },
            MessageType::InfoBlock => {
                let out_of_range = reader.read_bytes(1)?[0] != 0;
                let block = if out_of_range {
                    None
                } else {
                    Some(Block::decode_wire(&mut reader, registry)?)
                };
                Self::InfoBlock {
                    out_of_range,
                    block,
                }
            }
            MessageType::InvTransaction => Self::InvTransaction {
                txid: reader.read_hash()?,
            },
            MessageType::GetTransaction => Self::GetTransaction {
                txid: reader.read_hash()?,
            },
            MessageType::InfoTransaction => {
                let is_coinbase = reader.read_bytes(1)?[0] != 0;
                let tx = Transaction::decode(&mut reader, is_coinbase)?;
                Self::InfoTransaction { is_coinbase, tx }
            }
            MessageType::InvComputation => Self::InvComputation {
                comp_hash: reader.read_hash()?,
            },
            MessageType::GetComputation => Self::GetComputation {
                comp_hash: reader.read_hash()?,
            },
            MessageType::InfoComputation => {
                let tag = reader.read_u32()?;
                let comp_bytes = reader.read_var_bytes()?;
                let proof = reader.read_var_bytes()?;
                Self::InfoComputation {
                    comp: registry.decode(tag, comp_bytes, proof)?,
                }
            }
            MessageType::SyncBlock => Self::SyncBlock {
                height: reader.read_u32()?,
            },
            MessageType::SyncTransactions => Self::SyncTransactions,
            MessageType::ListTransactions => {
                let count = reader.read_u64()?;
                let mut txids = Vec::new();
                for _ in 0..count {
                    txids.push(reader.read_hash()?);
                }
                Self::ListTransactions { txids }
            }
        };

        reader.expect_end()?;
        Ok(msg)
    }
}

fn read_string(reader: &mut Reader<'_>) -> Result<String> {
    String::from_utf8(reader.read_var_bytes()?.to_vec())
        .map_err(|_| CoreError::Malformed("string não é UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::KeyPair;
    use std::sync::{Arc, Mutex};
    use veil_core::{Computation, DevBackend, FheComputation, FheFactory};

    fn registry() -> ComputationRegistry {
        let mut reg = ComputationRegistry::new();
        reg.register(Arc::new(FheFactory::new(Arc::new(DevBackend))));
        reg
    }

    fn roundtrip(msg: &Message) -> Message {
        let frame = msg.encode().unwrap();
        let mut header = Reader::new(&frame[..FRAME_HEADER_LEN]);
        let len = header.read_u32().unwrap() as usize;
        let msg_type = MessageType::from_wire(header.read_u32().unwrap()).unwrap();
        assert_eq!(len, frame.len() - FRAME_HEADER_LEN);
        Message::decode(msg_type, &frame[FRAME_HEADER_LEN..], &registry()).unwrap()
    }

    #[test]
    fn test_simple_messages_roundtrip() {
        match roundtrip(&Message::Hello {
            greet: "Hello".to_string(),
            id: 1312,
        }) {
            Message::Hello { greet, id } => {
                assert_eq!(greet, "Hello");
                assert_eq!(id, 1312);
            }
            _ => panic!("tipo errado"),
        }

        match roundtrip(&Message::GetAddr {
            address: "127.0.0.1".to_string(),
            port: 5000,
        }) {
            Message::GetAddr { address, port } => {
                assert_eq!(address, "127.0.0.1");
                assert_eq!(port, 5000);
            }
            _ => panic!("tipo errado"),
        }

        match roundtrip(&Message::Addr {
            peers: vec![("10.0.0.1".to_string(), 1), ("10.0.0.2".to_string(), 2)],
        }) {
            Message::Addr { peers } => assert_eq!(peers.len(), 2),
            _ => panic!("tipo errado"),
        }

        assert!(matches!(roundtrip(&Message::Invalid), Message::Invalid));
        assert!(matches!(
            roundtrip(&Message::SyncTransactions),
            Message::SyncTransactions
        ));

        match roundtrip(&Message::SyncBlock { height: 7 }) {
            Message::SyncBlock { height } => assert_eq!(height, 7),
            _ => panic!("tipo errado"),
        }
    }

    #[test]
    fn test_hash_messages_roundtrip() {
        let hash = Hash256::digest(b"objeto");
        match roundtrip(&Message::InvBlock { block_hash: hash }) {
            Message::InvBlock { block_hash } => assert_eq!(block_hash, hash),
            _ => panic!("tipo errado"),
        }

        match roundtrip(&Message::ListTransactions {
            txids: vec![Hash256::digest(b"a"), Hash256::digest(b"b")],
        }) {
            Message::ListTransactions { txids } => assert_eq!(txids.len(), 2),
            _ => panic!("tipo errado"),
        }
    }

    #[test]
    fn test_info_transaction_roundtrip() {
        let kp = KeyPair::generate();
        let mut input = veil_core::TransactionInput::new(Hash256::digest(b"coin"), 0);
        input.set_utxo_info(100, kp.public_key);
        let mut tx = Transaction::build_payment(vec![input], &kp.public_key, &[3u8; 32], 40, 10)
            .unwrap();
        tx.sign(&kp.public_key, &kp).unwrap();

        match roundtrip(&Message::InfoTransaction {
            is_coinbase: false,
            tx: tx.clone(),
        }) {
            Message::InfoTransaction { is_coinbase, tx: decoded } => {
                assert!(!is_coinbase);
                assert_eq!(decoded.txid().unwrap(), tx.txid().unwrap());
            }
            _ => panic!("tipo errado"),
        }
    }

    #[test]
    fn test_info_computation_roundtrip() {
        let comp = FheComputation::new(
            Arc::new(DevBackend),
            "0*1".to_string(),
            vec![vec![1u8; 4], vec![2u8; 4]],
            b"pk".to_vec(),
            b"emk".to_vec(),
            1_700_000_000,
        )
        .unwrap();
        let comp: SharedComputation = Arc::new(Mutex::new(comp));
        let hash = comp.lock().unwrap().hash();

        match roundtrip(&Message::InfoComputation { comp }) {
            Message::InfoComputation { comp } => {
                assert_eq!(comp.lock().unwrap().hash(), hash);
            }
            _ => panic!("tipo errado"),
        }
    }

    #[test]
    fn test_info_block_roundtrip() {
        match roundtrip(&Message::InfoBlock {
            out_of_range: true,
            block: None,
        }) {
            Message::InfoBlock { out_of_range, block } => {
                assert!(out_of_range);
                assert!(block.is_none());
            }
            _ => panic!("tipo errado"),
        }

        let kp = KeyPair::generate();
        let block = Block::genesis(&kp.public_key, 100, 3, 1_700_000_000).unwrap();
        let hash = block.hash().unwrap();
        match roundtrip(&Message::InfoBlock {
            out_of_range: false,
            block: Some(block),
        }) {
            Message::InfoBlock { out_of_range, block } => {
                assert!(!out_of_range);
                assert_eq!(block.unwrap().hash().unwrap(), hash);
            }
            _ => panic!("tipo errado"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(MessageType::from_wire(99).is_err());
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let mut frame = Message::SyncBlock { height: 1 }.encode().unwrap();
        frame.push(0);
        let res = Message::decode(MessageType::SyncBlock, &frame[FRAME_HEADER_LEN..], &registry());
        assert!(res.is_err());
    }
}
