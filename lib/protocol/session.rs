use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Request, Response};
use crate::source::{BlockLog, BlockLogError, PolledBlock, SourceClaim, SourceKey};

/// How long a poll waits for a block before answering `NoData`.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Connected,
}

/// One consumer connection: `Closed -> Connected -> Closed`.
///
/// The first poll of a source claims it for the session until close, so a source
/// has one consumer at a time. Blocks handed to the consumer stay owned by the
/// session until acked. A session dropped with blocks outstanding requeues them.
pub struct ProtocolSession {
    log: Arc<dyn BlockLog>,
    members: Vec<String>,
    holder: String,
    poll_timeout: Duration,
    state: SessionState,
    outstanding: BTreeMap<SourceKey, PolledBlock>,
    // Dropped after `outstanding`.
    claims: BTreeMap<SourceKey, SourceClaim>,
}

impl ProtocolSession {
    pub fn new(log: Arc<dyn BlockLog>, members: Vec<String>) -> Self {
        Self {
            log,
            members,
            holder: "protocol session".to_string(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            state: SessionState::Closed,
            outstanding: BTreeMap::new(),
            claims: BTreeMap::new(),
        }
    }

    /// Name reported to other consumers that find a source claimed by this session.
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub async fn handle(&mut self, request: Request) -> Response {
        match (self.state, request) {
            (SessionState::Closed, Request::Open) => {
                self.state = SessionState::Connected;
                let sources = self.log.sources();
                debug!(event = "protocol_session_opened", sources = sources.len(), "protocol session opened");
                Response::Opened {
                    sources,
                    members: self.members.clone(),
                }
            }
            (SessionState::Connected, Request::Poll { source }) => self.poll(source).await,
            (SessionState::Connected, Request::Ack { source, seq }) => self.ack(source, seq),
            (SessionState::Connected, Request::Close) => {
                self.close();
                Response::Closed
            }
            (state, request) => self.violation(format!(
                "{} is not allowed while {}",
                request.name(),
                match state {
                    SessionState::Closed => "closed",
                    SessionState::Connected => "connected",
                }
            )),
        }
    }

    async fn poll(&mut self, source: SourceKey) -> Response {
        // A consumer that lost a response may poll again before acking.
        if let Some(polled) = self.outstanding.get(&source) {
            return block_response(polled);
        }
        if !self.claims.contains_key(&source) {
            match SourceClaim::acquire(self.log.clone(), source.clone(), self.holder.clone()) {
                Ok(claim) => {
                    self.claims.insert(source.clone(), claim);
                }
                Err(
                    err @ (BlockLogError::Claimed { .. }
                    | BlockLogError::Fenced(_)
                    | BlockLogError::UnknownSource(_)),
                ) => {
                    return Response::SourceUnavailable {
                        source,
                        reason: err.to_string(),
                    };
                }
                Err(BlockLogError::Other(reason)) => {
                    warn!(event = "protocol_claim_failed", source = %source, reason = %reason, "source claim failed");
                    return Response::NoData { source };
                }
            }
        }

        let polled = tokio::time::timeout(self.poll_timeout, self.log.poll(&source)).await;
        match polled {
            Err(_) => Response::NoData { source },
            Ok(Ok(Some(block))) => {
                let polled = PolledBlock::new(self.log.clone(), source.clone(), block);
                let response = block_response(&polled);
                self.outstanding.insert(source, polled);
                response
            }
            Ok(Ok(None)) => Response::EndOfStream { source },
            Ok(Err(
                err @ (BlockLogError::Fenced(_)
                | BlockLogError::UnknownSource(_)
                | BlockLogError::Claimed { .. }),
            )) => {
                Response::SourceUnavailable {
                    source,
                    reason: err.to_string(),
                }
            }
            Ok(Err(BlockLogError::Other(reason))) => {
                warn!(event = "protocol_poll_failed", source = %source, reason = %reason, "block poll failed");
                Response::NoData { source }
            }
        }
    }

    fn ack(&mut self, source: SourceKey, seq: i64) -> Response {
        let polled = match self.outstanding.remove(&source) {
            Some(polled) if polled.block().seq() == seq => polled,
            other => {
                if let Some(polled) = other {
                    self.outstanding.insert(source.clone(), polled);
                }
                return self.violation(format!("ack for {source} seq {seq} without a matching block"));
            }
        };

        match polled.ack(None) {
            Ok(()) => Response::Acked { source, seq },
            Err(err) => Response::SourceUnavailable {
                source,
                reason: err.to_string(),
            },
        }
    }

    /// Returns to `Closed`, discarding every outstanding block.
    pub fn close(&mut self) {
        let outstanding = std::mem::take(&mut self.outstanding);
        let discarded = outstanding.len();
        for (source, polled) in outstanding {
            let seq = polled.block().seq();
            if let Err(err) = polled.ack(None) {
                warn!(
                    event = "protocol_discard_failed",
                    source = %source,
                    seq,
                    error = %err,
                    "failed to discard outstanding block"
                );
            }
        }
        self.claims.clear();
        if self.state == SessionState::Connected {
            debug!(event = "protocol_session_closed", discarded, "protocol session closed");
        }
        self.state = SessionState::Closed;
    }

    fn violation(&mut self, message: String) -> Response {
        info!(event = "protocol_violation", message = %message, "protocol violation; closing session");
        self.close();
        Response::ProtocolError { message }
    }
}

fn block_response(polled: &PolledBlock) -> Response {
    let block = polled.block();
    Response::Block {
        source: polled.source().clone(),
        seq: block.seq(),
        committed_seq: block.committed_seq(),
        generation: block.generation(),
        row_count: block.row_count(),
        payload: block.payload().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::{ProtocolSession, SessionState};
    use crate::protocol::{Request, Response};
    use crate::pump::test_support::{block_of, schema, PARTITION, TABLE};
    use crate::source::{BlockEvent, BlockLog, MemoryBlockLog, SourceDescriptor, SourceKey};
    use std::sync::Arc;
    use std::time::Duration;

    fn log_with_blocks(sequences: &[&[i64]]) -> (Arc<MemoryBlockLog>, SourceKey) {
        let log = Arc::new(MemoryBlockLog::new());
        let descriptor = SourceDescriptor::new(TABLE, PARTITION, 1);
        let key = descriptor.key();
        log.add_source(descriptor);
        for rows in sequences {
            log.push_block(&key, block_of(&schema(1), rows, None))
                .expect("push block");
        }
        (log, key)
    }

    fn session(log: &Arc<MemoryBlockLog>) -> ProtocolSession {
        ProtocolSession::new(log.clone(), vec!["host-a".to_string()])
            .with_poll_timeout(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn open_advertises_sources_and_members() {
        let (log, key) = log_with_blocks(&[]);
        let mut session = session(&log);

        match session.handle(Request::Open).await {
            Response::Opened { sources, members } => {
                assert_eq!(sources.len(), 1);
                assert_eq!(sources[0].key(), key);
                assert_eq!(members, vec!["host-a".to_string()]);
            }
            other => panic!("unexpected response: {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn poll_before_open_is_a_violation() {
        let (log, key) = log_with_blocks(&[&[1]]);
        let mut session = session(&log);

        let response = session.handle(Request::Poll { source: key.clone() }).await;
        assert!(matches!(response, Response::ProtocolError { .. }));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(log.queued_len(&key), 1);
    }

    #[tokio::test]
    async fn second_open_closes_the_session() {
        let (log, _key) = log_with_blocks(&[]);
        let mut session = session(&log);
        session.handle(Request::Open).await;

        let response = session.handle(Request::Open).await;
        assert!(matches!(response, Response::ProtocolError { .. }));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn polled_block_is_acked_by_sequence() {
        let (log, key) = log_with_blocks(&[&[1, 2], &[3]]);
        let mut session = session(&log);
        session.handle(Request::Open).await;

        match session.handle(Request::Poll { source: key.clone() }).await {
            Response::Block { seq, row_count, .. } => {
                assert_eq!(seq, 2);
                assert_eq!(row_count, 2);
            }
            other => panic!("unexpected response: {other:?}"),
        }
        let repeated = session.handle(Request::Poll { source: key.clone() }).await;
        assert!(matches!(repeated, Response::Block { seq: 2, .. }));

        let acked = session
            .handle(Request::Ack {
                source: key.clone(),
                seq: 2,
            })
            .await;
        assert_eq!(
            acked,
            Response::Acked {
                source: key.clone(),
                seq: 2
            }
        );
        assert_eq!(log.acked_through(&key), Some(2));
        assert_eq!(session.outstanding(), 0);
    }

    #[tokio::test]
    async fn ack_of_unknown_sequence_closes_and_discards() {
        let (log, key) = log_with_blocks(&[&[1]]);
        let mut session = session(&log);
        session.handle(Request::Open).await;
        session.handle(Request::Poll { source: key.clone() }).await;

        let response = session
            .handle(Request::Ack {
                source: key.clone(),
                seq: 99,
            })
            .await;
        assert!(matches!(response, Response::ProtocolError { .. }));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(log.acked_through(&key), Some(1));
    }

    #[tokio::test]
    async fn empty_and_ended_sources() {
        let (log, key) = log_with_blocks(&[]);
        let mut session = session(&log);
        session.handle(Request::Open).await;

        let response = session.handle(Request::Poll { source: key.clone() }).await;
        assert_eq!(response, Response::NoData { source: key.clone() });

        log.close_source(&key);
        let response = session.handle(Request::Poll { source: key.clone() }).await;
        assert_eq!(response, Response::EndOfStream { source: key.clone() });

        let missing = SourceKey::new("MISSING", 0);
        let response = session.handle(Request::Poll { source: missing }).await;
        assert!(matches!(response, Response::SourceUnavailable { .. }));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn dropped_session_requeues_outstanding_blocks() {
        let (log, key) = log_with_blocks(&[&[1]]);
        {
            let mut session = session(&log);
            session.handle(Request::Open).await;
            session.handle(Request::Poll { source: key.clone() }).await;
            assert_eq!(session.outstanding(), 1);
        }

        assert_eq!(log.pending_seq(&key), Some(1));
        assert_eq!(
            log.events(),
            vec![BlockEvent::Requeued {
                source: key.clone(),
                seq: 1
            }]
        );
    }

    #[tokio::test]
    async fn second_session_cannot_take_a_claimed_source() {
        let (log, key) = log_with_blocks(&[&[1], &[2], &[3]]);
        let mut first = session(&log).with_holder("consumer a");
        let mut second = session(&log).with_holder("consumer b");
        first.handle(Request::Open).await;
        second.handle(Request::Open).await;

        let polled = first.handle(Request::Poll { source: key.clone() }).await;
        assert!(matches!(polled, Response::Block { seq: 1, .. }));
        match second.handle(Request::Poll { source: key.clone() }).await {
            Response::SourceUnavailable { reason, .. } => {
                assert!(reason.contains("consumer a"), "{reason}")
            }
            other => panic!("unexpected response: {other:?}"),
        }
        assert_eq!(second.state(), SessionState::Connected);

        drop(first);
        drop(second);
        assert_eq!(log.claim_holder(&key), None);

        log.close_source(&key);
        let mut redelivered = Vec::new();
        while let Some(block) = log.poll(&key).await.expect("poll") {
            redelivered.push(block.seq());
        }
        assert_eq!(redelivered, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn close_releases_the_claim_for_the_next_session() {
        let (log, key) = log_with_blocks(&[&[1], &[2]]);
        let mut first = session(&log);
        first.handle(Request::Open).await;
        first.handle(Request::Poll { source: key.clone() }).await;
        assert_eq!(first.handle(Request::Close).await, Response::Closed);
        assert_eq!(log.claim_holder(&key), None);

        let mut second = session(&log);
        second.handle(Request::Open).await;
        let polled = second.handle(Request::Poll { source: key.clone() }).await;
        assert!(matches!(polled, Response::Block { seq: 2, .. }));
    }
}
