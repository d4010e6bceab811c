use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use sfdb_common::schema::test_support::example_schema;
use sfdb_common::{config::RootConfig, Config, Key, Request};
use sfdb_remote::messages::{
    decode_payload, encode_payload, ClientStartup, DataStartup, MessageKind, ServerStartup,
    SessionId,
};
use sfdb_remote::{ClientConnectionRouter, Frame, FrameCodec, RemoteFdb, RunningServer, Server};
use std::path::Path;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

fn config_for(root: &Path) -> Config {
    Config {
        roots: vec![RootConfig {
            path: root.to_path_buf(),
            endpoint: None,
            bucket: None,
        }],
        // An ephemeral port per test server.
        server_port: 0,
        ..Config::default()
    }
}

async fn start_server(root: &Path) -> RunningServer {
    let config = config_for(root);
    Server::new(config, example_schema())
        .bind()
        .await
        .expect("server binds")
}

fn full_key(step: &str) -> Key {
    Key::from_pairs([
        ("class", "od"),
        ("stream", "oper"),
        ("date", "20260801"),
        ("type", "fc"),
        ("levtype", "sfc"),
        ("step", step),
        ("param", "130"),
    ])
}

#[tokio::test]
async fn remote_archive_flush_and_retrieve() {
    let root = tempfile::tempdir().expect("tempdir");
    let server = start_server(root.path()).await;

    let router = ClientConnectionRouter::new();
    let client_config = config_for(root.path());
    let mut fdb = RemoteFdb::connect(&router, &server.endpoint(), &client_config)
        .await
        .expect("connect");

    // Archive a hundred 1 KiB fields, then flush.
    for step in 0..100 {
        let payload = vec![step as u8; 1024];
        fdb.archive(&full_key(&step.to_string()), Bytes::from(payload))
            .await
            .expect("archive");
    }
    fdb.flush().await.expect("flush");

    // Every field comes back byte-identical, on the same connection.
    for step in 0..100_u32 {
        let bytes = fdb
            .retrieve(&full_key(&step.to_string()))
            .await
            .expect("retrieve")
            .read_all()
            .await
            .expect("read");
        assert_eq!(bytes.len(), 1024);
        assert!(bytes.iter().all(|b| *b == step as u8));
    }

    // The control connection is still usable after the transfers.
    let mut listing = Request::new("list");
    listing.set("step", ["42"]);
    let elements = fdb.list(&listing, false).await.expect("list");
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0].location.length(), 1024);

    fdb.close().await.expect("close");
    server.shutdown();
}

#[tokio::test]
async fn remote_list_streams_all_entries() {
    let root = tempfile::tempdir().expect("tempdir");
    let server = start_server(root.path()).await;

    let router = ClientConnectionRouter::new();
    let client_config = config_for(root.path());
    let mut fdb = RemoteFdb::connect(&router, &server.endpoint(), &client_config)
        .await
        .expect("connect");

    for step in ["0", "6", "12"] {
        fdb.archive(&full_key(step), Bytes::from_static(b"field"))
            .await
            .expect("archive");
    }
    fdb.flush().await.expect("flush");

    let elements = fdb
        .list(&Request::new("list"), false)
        .await
        .expect("list");
    assert_eq!(elements.len(), 3);

    fdb.close().await.expect("close");
    server.shutdown();
}

#[tokio::test]
async fn single_connection_mode_negotiates_and_works() {
    let root = tempfile::tempdir().expect("tempdir");
    let server = start_server(root.path()).await;

    let router = ClientConnectionRouter::new();
    let mut client_config = config_for(root.path());
    client_config.single_connection = true;
    let mut fdb = RemoteFdb::connect(&router, &server.endpoint(), &client_config)
        .await
        .expect("connect");

    fdb.archive(&full_key("0"), Bytes::from_static(b"\xde\xad\xbe\xef"))
        .await
        .expect("archive");
    fdb.flush().await.expect("flush");
    let bytes = fdb
        .retrieve(&full_key("0"))
        .await
        .expect("retrieve")
        .read_all()
        .await
        .expect("read");
    assert_eq!(bytes.as_ref(), b"\xde\xad\xbe\xef");

    fdb.close().await.expect("close");
    server.shutdown();
}

#[tokio::test]
async fn flush_count_mismatch_is_rejected_by_the_server() {
    let root = tempfile::tempdir().expect("tempdir");
    let server = start_server(root.path()).await;

    // Speak the protocol by hand so the count can lie.
    let control = TcpStream::connect(server.endpoint()).await.expect("connect");
    let mut control = Framed::new(control, FrameCodec);
    let session = SessionId::random();
    control
        .send(Frame::control(
            MessageKind::Startup,
            0,
            0,
            encode_payload(&ClientStartup {
                session,
                control_endpoint: server.endpoint(),
                protocol_version: sfdb_remote::PROTOCOL_VERSION,
                prefer_single_connection: true,
            }),
        ))
        .await
        .expect("send startup");
    let response = control.next().await.expect("frame").expect("decode");
    let startup: ServerStartup = decode_payload(&response.payload).expect("payload");
    assert!(startup.single_connection);

    // Register a store client, archive three fields, then flush claiming
    // only one of them.
    control
        .send(Frame::control(
            MessageKind::Store,
            1,
            1,
            encode_payload(&sfdb_remote::messages::RegisterClient {
                db_key: Key::from_pairs([
                    ("class", "od"),
                    ("stream", "oper"),
                    ("date", "20260801"),
                ]),
            }),
        ))
        .await
        .expect("register");
    let _received = control.next().await.expect("frame").expect("decode");

    for sequence in 0..3 {
        control
            .send(Frame::data(
                MessageKind::Archive,
                1,
                2,
                encode_payload(&sfdb_remote::messages::ArchiveBlob {
                    sequence,
                    index_key: Key::from_pairs([("type", "fc"), ("levtype", "sfc")]),
                    data: Bytes::from_static(b"field"),
                }),
            ))
            .await
            .expect("archive");
    }
    control
        .send(Frame::control(
            MessageKind::Flush,
            1,
            3,
            encode_payload(&sfdb_remote::messages::FlushRequest { expected: 1 }),
        ))
        .await
        .expect("flush");

    let reply = control.next().await.expect("frame").expect("decode");
    assert_eq!(reply.kind, MessageKind::Error);
    let message = String::from_utf8_lossy(&reply.payload).into_owned();
    assert!(message.contains("consistency"), "got: {message}");

    server.shutdown();
}

#[tokio::test]
async fn session_mismatch_closes_the_data_socket() {
    let root = tempfile::tempdir().expect("tempdir");
    let server = start_server(root.path()).await;

    let control = TcpStream::connect(server.endpoint()).await.expect("connect");
    let mut control = Framed::new(control, FrameCodec);
    let session = SessionId::random();
    control
        .send(Frame::control(
            MessageKind::Startup,
            0,
            0,
            encode_payload(&ClientStartup {
                session,
                control_endpoint: server.endpoint(),
                protocol_version: sfdb_remote::PROTOCOL_VERSION,
                prefer_single_connection: false,
            }),
        ))
        .await
        .expect("send startup");
    let response = control.next().await.expect("frame").expect("decode");
    let startup: ServerStartup = decode_payload(&response.payload).expect("payload");
    assert_eq!(startup.client_session, session);

    // Open the data connection but present a wrong server session.
    let data = TcpStream::connect(&startup.data_endpoint)
        .await
        .expect("data connect");
    let mut data = Framed::new(data, FrameCodec);
    data.send(Frame::data(
        MessageKind::Startup,
        0,
        0,
        encode_payload(&DataStartup {
            client_session: session,
            server_session: SessionId::random(),
        }),
    ))
    .await
    .expect("send data startup");

    // The control socket reports the consistency failure.
    let error = control.next().await.expect("frame").expect("decode");
    assert_eq!(error.kind, MessageKind::Error);
    let message = String::from_utf8_lossy(&error.payload).into_owned();
    assert!(message.contains("consistency"), "got: {message}");

    // And the data socket is dead.
    let eof = data.next().await;
    assert!(eof.is_none() || eof.is_some_and(|r| r.is_err()));

    server.shutdown();
}
