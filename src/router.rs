//! Despacho tipado das mensagens de peers para os manipuladores do nó

use std::sync::Arc;

use shared::Result;

use crate::message::Message;
use crate::node::Node;
use crate::peer::Peer;

/// Roteia uma mensagem recebida; a resposta, quando houver, volta pelo mesmo
/// socket
///
/// `InfoBlock` é despachado para o caminho de sincronização enquanto o nó não
/// estiver sincronizado.
///
/// # Errors
///
/// Propaga falhas dos manipuladores
pub async fn route(node: &Arc<Node>, msg: Message, peer: &Arc<Peer>) -> Result<Option<Message>> {
    match msg {
        Message::Hello { greet, id } => Ok(node.handle_hello(&greet, id)),
        Message::GetAddr { address, port } => {
            Ok(node.handle_get_peer_addrs(&address, port, &peer.id()))
        }
        Message::Addr { peers } => {
            Arc::clone(node).handle_addr(peers).await;
            Ok(None)
        }
        Message::Invalid => Ok(None),
        Message::InvBlock { block_hash } => Ok(node.handle_inv_block(block_hash)),
        Message::GetBlock { block_hash } => Ok(node.handle_get_block(block_hash)),
        Message::InfoBlock {
            out_of_range,
            block,
        } => {
            if node.is_synced() {
                if let Some(block) = block {
                    node.handle_info_block(block).await?;
                }
            } else {
                node.handle_info_block_sync(out_of_range, block).await?;
            }
            Ok(None)
        }
        Message::SyncBlock { height } => node.handle_sync_block(height),
        Message::InvTransaction { txid } => Ok(node.handle_inv_tx(txid)),
        Message::GetTransaction { txid } => Ok(node.handle_get_tx(txid)),
        Message::InfoTransaction { tx, .. } => {
            node.handle_info_tx(tx).await?;
            Ok(None)
        }
        Message::InvComputation { comp_hash } => Ok(node.handle_inv_computation(comp_hash)),
        Message::GetComputation { comp_hash } => Ok(node.handle_get_computation(comp_hash)),
        Message::InfoComputation { comp } => {
            node.handle_info_computation(comp).await?;
            Ok(None)
        }
        Message::SyncTransactions => Ok(node.handle_sync_transactions()),
        Message::ListTransactions { txids } => {
            node.handle_list_transactions(txids).await?;
            Ok(None)
        }
    }
}
