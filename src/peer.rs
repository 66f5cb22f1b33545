//! Conexão com um peer: metade de escrita compartilhada e laço de leitura
//!
//! Cada peer tem um único laço de leitura; as mensagens de uma mesma conexão
//! são tratadas uma por vez, na ordem de chegada.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use shared::{CoreError, Result};

use crate::message::{Message, MessageType, FRAME_HEADER_LEN, MAX_FRAME_LEN};
use crate::node::Node;
use crate::router;

pub struct Peer {
    id: Mutex<String>,
    remote: (String, u16),
    listen_info: Mutex<Option<(String, u16)>>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

#[must_use]
pub fn addr_to_id(address: &str, port: u16) -> String {
    format!("{address}:{port}")
}

impl Peer {
    /// Envelopa um socket aceito/conectado; devolve a metade de leitura para
    /// o laço do chamador
    ///
    /// # Errors
    ///
    /// Retorna erro se o endereço remoto não puder ser resolvido
    pub fn new(stream: TcpStream) -> Result<(Arc<Self>, OwnedReadHalf)> {
        let remote = stream
            .peer_addr()
            .map_err(|e| CoreError::NetworkError(e.to_string()))?;
        let remote = (remote.ip().to_string(), remote.port());

        let (read_half, write_half) = stream.into_split();
        let peer = Arc::new(Self {
            id: Mutex::new(addr_to_id(&remote.0, remote.1)),
            remote,
            listen_info: Mutex::new(None),
            writer: tokio::sync::Mutex::new(write_half),
        });
        Ok((peer, read_half))
    }

    #[must_use]
    pub fn id(&self) -> String {
        self.id.lock().unwrap().clone()
    }

    /// Substitui o endereço divulgável pelo de escuta anunciado no GetAddr;
    /// o socket não muda, apenas a identidade compartilhável
    pub fn update_addr_info(&self, address: &str, port: u16) {
        *self.id.lock().unwrap() = addr_to_id(address, port);
        *self.listen_info.lock().unwrap() = Some((address.to_string(), port));
    }

    /// Endereço de escuta anunciado, ou o remoto quando nada foi anunciado
    #[must_use]
    pub fn listening_addr(&self) -> (String, u16) {
        self.listen_info
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.remote.clone())
    }

    /// Escreve um quadro completo no socket
    ///
    /// # Errors
    ///
    /// Retorna erro de escrita no socket
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(frame)
            .await
            .map_err(|e| CoreError::NetworkError(e.to_string()))
    }
}

/// Laço de leitura do peer: lê quadros, roteia e devolve respostas
///
/// Quadros malformados são descartados e a leitura segue no próximo; tipo de
/// mensagem desconhecido ou tamanho excessivo encerram a conexão.
///
/// # Errors
///
/// Retorna erro quando a conexão fecha ou viola o protocolo
pub async fn read_loop(
    peer: Arc<Peer>,
    mut read_half: OwnedReadHalf,
    node: Arc<Node>,
) -> Result<()> {
    let mut header = [0u8; FRAME_HEADER_LEN];

    loop {
        read_half
            .read_exact(&mut header)
            .await
            .map_err(|e| CoreError::NetworkError(e.to_string()))?;

        let len = u32::from_be_bytes(header[..4].try_into().expect("4 bytes"));
        let raw_type = u32::from_be_bytes(header[4..].try_into().expect("4 bytes"));

        if len > MAX_FRAME_LEN {
            return Err(CoreError::Malformed(format!("quadro de {len} bytes")));
        }
        // tipos inválidos encerram a conexão
        let msg_type = MessageType::from_wire(raw_type)?;

        let mut payload = vec![0u8; len as usize];
        read_half
            .read_exact(&mut payload)
            .await
            .map_err(|e| CoreError::NetworkError(e.to_string()))?;

        let msg = match Message::decode(msg_type, &payload, &node.registry) {
            Ok(msg) => msg,
            Err(e) => {
                // payload malformado: descarta e lê o próximo quadro
                warn!(peer = %peer.id(), error = %e, "quadro malformado descartado");
                continue;
            }
        };

        match router::route(&node, msg, &peer).await {
            Ok(Some(resp)) => peer.send(&resp.encode()?).await?,
            Ok(None) => {}
            Err(e) => {
                debug!(peer = %peer.id(), error = %e, "falha ao tratar mensagem");
            }
        }
    }
}
