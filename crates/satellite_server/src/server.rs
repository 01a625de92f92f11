//! Replication peer.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{error_message, HandlerContext, RequestHandler};
use satellite_protocol::{Lsn, Row, SatelliteMessage, Transaction};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Accepted connections, each a pair of frame channels as seen from the
/// server: frames to the client and frames from it.
pub type Incoming = mpsc::UnboundedReceiver<(mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>)>;

/// The replication peer.
///
/// The server keeps one transaction log and the merged table state built
/// from it. Each accepted connection authenticates, starts replication at
/// a log position, subscribes to shapes and exchanges transactions.
///
/// # Example
///
/// ```
/// use satellite_server::{SatelliteServer, ServerConfig};
///
/// let server = SatelliteServer::new(ServerConfig::default());
/// assert_eq!(server.head(), satellite_protocol::Lsn::from_u64(0));
/// assert_eq!(server.connection_count(), 0);
/// ```
pub struct SatelliteServer {
    context: Arc<HandlerContext>,
}

impl SatelliteServer {
    /// Creates a server with an empty log.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            context: Arc::new(HandlerContext::new(config)),
        }
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Serves every connection arriving on `incoming` until it closes.
    pub fn listen(&self, mut incoming: Incoming) -> JoinHandle<()> {
        let context = Arc::clone(&self.context);
        tokio::spawn(async move {
            while let Some((to_client, from_client)) = incoming.recv().await {
                tokio::spawn(serve_connection(
                    Arc::clone(&context),
                    to_client,
                    from_client,
                ));
            }
            debug!("listener closed");
        })
    }

    /// Commits a transaction on behalf of a peer that is not connected,
    /// forwarding it to subscribed clients. Returns its LSN.
    pub fn insert_remote(&self, transaction: Transaction) -> ServerResult<Lsn> {
        let stamped = self.context.publish(transaction, None)?;
        stamped
            .lsn
            .ok_or_else(|| ServerError::Internal("log did not stamp the transaction".into()))
    }

    /// Closes every open connection. Returns how many were open.
    pub fn drop_connections(&self) -> usize {
        self.context.drop_connections()
    }

    /// Discards log entries below `lsn`; clients positioned before it
    /// can no longer resume.
    pub fn compact_before(&self, lsn: u64) {
        self.context.compact_before(lsn);
    }

    /// Highest issued LSN.
    pub fn head(&self) -> Lsn {
        Lsn::from_u64(self.context.head())
    }

    /// Retained log entries in commit order.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.context.transactions()
    }

    /// Visible rows of `table`, merged from every committed transaction.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.context.rows(table)
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.context.connection_count()
    }

    /// Number of subscriptions known to the server.
    pub fn subscription_count(&self) -> usize {
        self.context.subscription_count()
    }
}

async fn serve_connection(
    context: Arc<HandlerContext>,
    to_client: mpsc::Sender<Vec<u8>>,
    mut from_client: mpsc::Receiver<Vec<u8>>,
) {
    let (outbox, mut queued) = mpsc::unbounded_channel::<SatelliteMessage>();
    let (close, mut closed) = oneshot::channel();
    let connection = context.attach(outbox, close);

    let writer = tokio::spawn(async move {
        while let Some(message) = queued.recv().await {
            let frame = match message.encode() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(connection, error = %err, "failed to encode frame");
                    break;
                }
            };
            if to_client.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut handler = RequestHandler::new(Arc::clone(&context), connection);
    loop {
        let frame = tokio::select! {
            frame = from_client.recv() => frame,
            _ = &mut closed => None,
        };
        let Some(frame) = frame else {
            break;
        };
        let result = SatelliteMessage::decode(&frame)
            .map_err(ServerError::from)
            .and_then(|message| handler.handle(message));
        if let Err(err) = result {
            warn!(connection, client_id = ?handler.client_id(), error = %err, "closing connection");
            context.reply(connection, error_message(&err));
            break;
        }
    }

    // Detaching closes the outbox; the writer flushes what is queued.
    context.detach(connection);
    let _ = writer.await;
    info!(connection, client_id = ?handler.client_id(), "connection closed");
}
