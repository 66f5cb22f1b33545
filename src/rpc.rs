//! Servidor JSON-RPC: requisições one-shot `u32_be tamanho | json`
//!
//! A resposta é o objeto JSON cru; o socket fecha após a escrita.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use shared::{CoreError, Result};

use crate::node::Node;

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_PAYMENT_REQUIRED: u16 = 402;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_INTERNAL: u16 = 500;

/// Tipos de pedido RPC
const RPC_TEST: u64 = 0;
const RPC_TRANSACTION: u64 = 1;
const RPC_COMPUTATION: u64 = 2;
const RPC_OUTPUT: u64 = 3;

/// Tamanho máximo aceito para o corpo JSON
const MAX_RPC_LEN: u32 = 16 * 1024 * 1024;

/// Aceita conexões RPC e trata cada uma em sua própria tarefa
///
/// # Errors
///
/// Retorna erro se o socket de escuta não puder ser aberto
pub async fn serve(node: Arc<Node>, address: String, port: u16) -> Result<()> {
    let listener = TcpListener::bind((address.as_str(), port))
        .await
        .map_err(|e| CoreError::NetworkError(e.to_string()))?;
    info!(%address, port, "servidor RPC escutando");

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| CoreError::NetworkError(e.to_string()))?;

        let node = Arc::clone(&node);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(node, stream).await {
                debug!(error = %e, "conexão RPC encerrada com falha");
            }
        });
    }
}

async fn handle_connection(node: Arc<Node>, mut stream: TcpStream) -> Result<()> {
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| CoreError::NetworkError(e.to_string()))?;

    let len = u32::from_be_bytes(header);
    if len > MAX_RPC_LEN {
        return Err(CoreError::Malformed(format!("pedido RPC de {len} bytes")));
    }

    let mut body = vec![0u8; len as usize];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| CoreError::NetworkError(e.to_string()))?;

    let response = match serde_json::from_slice::<Value>(&body) {
        Ok(request) => route(&node, &request).await,
        Err(e) => {
            warn!(error = %e, "pedido RPC não é JSON válido");
            json!({ "status": STATUS_BAD_REQUEST })
        }
    };

    let bytes = response.to_string();
    stream
        .write_all(bytes.as_bytes())
        .await
        .map_err(|e| CoreError::NetworkError(e.to_string()))
}

async fn route(node: &Arc<Node>, request: &Value) -> Value {
    let Some(rpc_type) = request.get("type").and_then(Value::as_u64) else {
        return json!({ "status": STATUS_BAD_REQUEST });
    };

    match rpc_type {
        RPC_TEST => {
            debug!("RPC de teste recebido");
            node.rpc_say_hello().await
        }
        RPC_TRANSACTION => node.rpc_transaction(request).await,
        RPC_COMPUTATION => node.rpc_computation(request).await,
        RPC_OUTPUT => node.rpc_output(request),
        other => {
            warn!(rpc_type = other, "tipo de RPC desconhecido");
            json!({ "status": STATUS_BAD_REQUEST })
        }
    }
}
