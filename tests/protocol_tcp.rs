use export_streamer_lib::codec::{
    frame_rows, ColumnInfo, ColumnType, ColumnValue, RowEncoder, RowHeader, RowOperation, Schema,
};
use export_streamer_lib::protocol::{read_frame, serve, write_frame, Request, Response};
use export_streamer_lib::source::{Block, MemoryBlockLog, SourceDescriptor, SourceKey};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn block(seq: i64) -> Block {
    let schema = Arc::new(Schema::new(
        "EVENTS",
        1,
        vec![ColumnInfo::new("ID", ColumnType::BigInt)],
    ));
    let header = RowHeader {
        txn_id: seq,
        timestamp: 0,
        sequence: seq,
        partition_column: 0,
        site_id: 0,
        operation: RowOperation::Insert,
    };
    let row = RowEncoder::new(&schema).encode(&header, &[ColumnValue::BigInt(seq)]);
    Block::new(seq, schema, frame_rows(&[row]), 1, None)
}

struct Server {
    addr: SocketAddr,
    log: Arc<MemoryBlockLog>,
    key: SourceKey,
    shutdown: CancellationToken,
    handle: JoinHandle<std::io::Result<()>>,
}

async fn start_server(blocks: &[i64]) -> Server {
    let log = Arc::new(MemoryBlockLog::new());
    let key = SourceKey::new("EVENTS", 4);
    log.add_source(SourceDescriptor::new("EVENTS", 4, 1));
    for seq in blocks {
        log.push_block(&key, block(*seq)).expect("push block");
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(serve(
        listener,
        log.clone(),
        vec!["node-1:21212".to_string()],
        shutdown.clone(),
    ));

    Server {
        addr,
        log,
        key,
        shutdown,
        handle,
    }
}

async fn call(stream: &mut TcpStream, request: Request) -> Response {
    write_frame(stream, &request).await.expect("write request");
    let frame = read_frame(stream)
        .await
        .expect("read response")
        .expect("server closed the connection");
    serde_json::from_slice(&frame).expect("parse response")
}

#[tokio::test]
async fn consumer_polls_and_acks_over_tcp() {
    let server = start_server(&[10, 11]).await;
    let mut stream = TcpStream::connect(server.addr).await.expect("connect");

    match call(&mut stream, Request::Open).await {
        Response::Opened { sources, members } => {
            assert_eq!(sources.len(), 1);
            assert_eq!(sources[0].key(), server.key);
            assert_eq!(members, vec!["node-1:21212".to_string()]);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    for seq in [10, 11] {
        match call(&mut stream, Request::Poll { source: server.key.clone() }).await {
            Response::Block {
                seq: polled,
                row_count,
                payload,
                ..
            } => {
                assert_eq!(polled, seq);
                assert_eq!(row_count, 1);
                assert!(!payload.is_empty());
            }
            other => panic!("unexpected response: {other:?}"),
        }
        let acked = call(
            &mut stream,
            Request::Ack {
                source: server.key.clone(),
                seq,
            },
        )
        .await;
        assert_eq!(
            acked,
            Response::Acked {
                source: server.key.clone(),
                seq
            }
        );
    }
    assert_eq!(server.log.acked_through(&server.key), Some(11));
    assert_eq!(call(&mut stream, Request::Close).await, Response::Closed);

    server.shutdown.cancel();
    server
        .handle
        .await
        .expect("server task")
        .expect("server result");
}

#[tokio::test]
async fn disconnect_requeues_the_outstanding_block() {
    let server = start_server(&[20]).await;
    {
        let mut stream = TcpStream::connect(server.addr).await.expect("connect");
        call(&mut stream, Request::Open).await;
        let polled = call(&mut stream, Request::Poll { source: server.key.clone() }).await;
        assert!(matches!(polled, Response::Block { seq: 20, .. }));
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while server.log.pending_seq(&server.key) != Some(20) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("block was not requeued after disconnect");
    assert_eq!(server.log.acked_through(&server.key), None);
    server.shutdown.cancel();
}

#[tokio::test]
async fn malformed_and_out_of_order_requests_get_protocol_errors() {
    let server = start_server(&[30]).await;
    let mut stream = TcpStream::connect(server.addr).await.expect("connect");

    let early = call(&mut stream, Request::Poll { source: server.key.clone() }).await;
    assert!(matches!(early, Response::ProtocolError { .. }));

    let mut garbage = Vec::new();
    garbage.extend_from_slice(&5u32.to_be_bytes());
    garbage.extend_from_slice(b"nope!");
    tokio::io::AsyncWriteExt::write_all(&mut stream, &garbage)
        .await
        .expect("write garbage");
    let frame = read_frame(&mut stream)
        .await
        .expect("read response")
        .expect("response frame");
    let response: Response = serde_json::from_slice(&frame).expect("parse response");
    assert!(matches!(response, Response::ProtocolError { .. }));

    assert!(matches!(
        call(&mut stream, Request::Open).await,
        Response::Opened { .. }
    ));
    assert_eq!(server.log.queued_len(&server.key), 1);
    server.shutdown.cancel();
}
