use serde::{Deserialize, Serialize};

use crate::store::QueryExtras;

/// Write operations accepted by the async store's single-writer mailbox.
///
/// Messages are processed strictly in order. Non-writer instances serialize
/// these over a transport; the writer is the only party touching the
/// backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WriterMessage {
    #[serde(rename_all = "camelCase")]
    SaveQuery {
        query_def_id: String,
        query_key: u32,
        value: serde_json::Value,
        updated_at: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ref_ids: Option<Vec<u32>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<QueryExtras>,
    },
    #[serde(rename_all = "camelCase")]
    SaveEntity {
        entity_key: u32,
        value: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ref_ids: Option<Vec<u32>>,
    },
    #[serde(rename_all = "camelCase")]
    ActivateQuery {
        query_def_id: String,
        query_key: u32,
    },
    #[serde(rename_all = "camelCase")]
    DeleteQuery { query_key: u32 },
}

/// Sender half of a reader→writer connection.
pub trait MessageSender {
    fn send_message(&self, message: WriterMessage);
}

/// Cross-process transport shape: the writer connects with a handler that
/// receives every reader message; each connect yields the reader's sender.
pub trait MessageTransport {
    type Sender: MessageSender;

    fn connect(&self, handler: Box<dyn FnMut(WriterMessage)>) -> Self::Sender;
}
