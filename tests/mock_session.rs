//! Integration tests driving the client against a scripted in-process server.
//!
//! Each test binds a localhost listener, accepts the client's connection,
//! plays the server side of the protocol by hand, and asserts on what the
//! client observed.

use std::time::Duration;

use std::sync::Arc;

use asterisk_ami_tokio::{
    filter::parse_filter, Action, AmiClient, AmiConnectOptions, AmiError, ConnectionStatus,
    DisconnectReason, EventRegistry, EventSchema, FieldType,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const GREETING: &[u8] = b"Asterisk Call Manager/5.0.1\r\n";
const TERMINATOR: &[u8] = b"\r\n\r\n";

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Read one terminator-delimited frame from the client.
async fn read_frame(stream: &mut TcpStream, buffer: &mut Vec<u8>) -> String {
    loop {
        if let Some(idx) = find_subsequence(buffer, TERMINATOR) {
            let frame = buffer[..idx].to_vec();
            buffer.drain(..idx + TERMINATOR.len());
            return String::from_utf8(frame).expect("client frames are UTF-8");
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.expect("server read failed");
        assert!(n > 0, "client closed while the server expected a frame");
        buffer.extend_from_slice(&chunk[..n]);
    }
}

/// Value of a header line in a raw frame, case-insensitive.
fn frame_field(frame: &str, key: &str) -> Option<String> {
    frame.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        k.trim()
            .eq_ignore_ascii_case(key)
            .then(|| v.trim().to_string())
    })
}

async fn send(stream: &mut TcpStream, payload: &str) {
    stream
        .write_all(payload.as_bytes())
        .await
        .expect("server write failed");
}

/// Accept the client, send the greeting, answer its login action.
/// Returns the server-side stream and any bytes read past the login frame.
async fn accept_and_login(listener: &TcpListener) -> (TcpStream, Vec<u8>) {
    let (mut stream, _) = listener.accept().await.expect("accept failed");
    stream.write_all(GREETING).await.expect("greeting failed");

    let mut buffer = Vec::new();
    let login = read_frame(&mut stream, &mut buffer).await;
    assert!(login.starts_with("Action: Login\r\n"), "got: {login}");
    assert_eq!(frame_field(&login, "username").as_deref(), Some("manager"));
    assert_eq!(frame_field(&login, "secret").as_deref(), Some("s3cret"));

    let id = frame_field(&login, "actionid").expect("login carries an ActionID");
    send(
        &mut stream,
        &format!("Response: Success\r\nActionID: {id}\r\nMessage: Authentication accepted\r\n\r\n"),
    )
    .await;
    (stream, buffer)
}

async fn listener() -> TcpListener {
    TcpListener::bind("127.0.0.1:0").await.unwrap()
}

#[tokio::test]
async fn login_error_yields_authentication_error() {
    let listener = listener().await;
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(GREETING).await.unwrap();
        let mut buffer = Vec::new();
        let login = read_frame(&mut stream, &mut buffer).await;
        let id = frame_field(&login, "actionid").unwrap();
        send(
            &mut stream,
            &format!(
                "Response: Error\r\nActionID: {id}\r\nMessage: Authentication failed\r\n\r\n"
            ),
        )
        .await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let err = AmiClient::connect("127.0.0.1", port, "manager", "wrong")
        .await
        .unwrap_err();
    match err {
        AmiError::Authentication { message } => assert_eq!(message, "Authentication failed"),
        other => panic!("expected Authentication, got {other:?}"),
    }
}

#[tokio::test]
async fn oversized_greeting_fails_connect() {
    let listener = listener().await;
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let long = vec![b'x'; 300];
        stream.write_all(&long).await.unwrap();
        stream.write_all(b"\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let err = AmiClient::connect("127.0.0.1", port, "manager", "s3cret")
        .await
        .unwrap_err();
    assert!(matches!(err, AmiError::Protocol { .. }), "got {err:?}");
}

#[tokio::test]
async fn connection_refused_maps_to_connect_error() {
    // Bind then drop to get a port nothing listens on.
    let port = {
        let listener = listener().await;
        listener.local_addr().unwrap().port()
    };
    let err = AmiClient::connect("127.0.0.1", port, "manager", "s3cret")
        .await
        .unwrap_err();
    match err {
        AmiError::Connect { host, port: p, .. } => {
            assert_eq!(host, "127.0.0.1");
            assert_eq!(p, port);
        }
        // A firewalled environment can surface this as a timeout instead.
        AmiError::ConnectTimeout { .. } => {}
        other => panic!("expected Connect/ConnectTimeout, got {other:?}"),
    }
}

#[tokio::test]
async fn signature_is_recorded_on_the_client() {
    let listener = listener().await;
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = accept_and_login(&listener).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(stream);
    });

    let (client, _events) = AmiClient::connect("127.0.0.1", port, "manager", "s3cret")
        .await
        .unwrap();
    assert!(client.is_connected());
    let signature = client.server_signature();
    assert_eq!(signature.name, "Asterisk Call Manager");
    assert_eq!(signature.version.as_deref(), Some("5.0.1"));
    assert_eq!(signature.raw, "Asterisk Call Manager/5.0.1");
}

#[tokio::test]
async fn responses_resolve_out_of_order() {
    let listener = listener().await;
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, mut buffer) = accept_and_login(&listener).await;
        let first = read_frame(&mut stream, &mut buffer).await;
        let second = read_frame(&mut stream, &mut buffer).await;
        let id1 = frame_field(&first, "actionid").unwrap();
        let id2 = frame_field(&second, "actionid").unwrap();
        // Answer in reverse order of arrival
        send(
            &mut stream,
            &format!("Response: Success\r\nActionID: {id2}\r\nMessage: for second\r\n\r\n"),
        )
        .await;
        send(
            &mut stream,
            &format!("Response: Success\r\nActionID: {id1}\r\nMessage: for first\r\n\r\n"),
        )
        .await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (client, _events) = AmiClient::connect("127.0.0.1", port, "manager", "s3cret")
        .await
        .unwrap();

    let first = client
        .send_action(Action::new("Ping", [("marker", "1")]).unwrap())
        .await
        .unwrap();
    let second = client
        .send_action(Action::new("Ping", [("marker", "2")]).unwrap())
        .await
        .unwrap();

    let (done1, done2) = tokio::join!(first.wait(), second.wait());
    let (done1, done2) = (done1.unwrap(), done2.unwrap());
    assert!(done1.ok && done2.ok);
    assert_eq!(done1.response.message(), "for first");
    assert_eq!(done2.response.message(), "for second");
}

#[tokio::test]
async fn follows_response_keeps_action_open_until_terminal_response() {
    let listener = listener().await;
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, mut buffer) = accept_and_login(&listener).await;
        let frame = read_frame(&mut stream, &mut buffer).await;
        let id = frame_field(&frame, "actionid").unwrap();
        send(
            &mut stream,
            &format!("Response: Follows\r\nActionID: {id}\r\nMessage: listing\r\n\r\n"),
        )
        .await;
        for channel in ["SIP/100-1", "SIP/101-1"] {
            send(
                &mut stream,
                &format!(
                    "Event: CoreShowChannel\r\nActionID: {id}\r\nChannel: {channel}\r\n\r\n"
                ),
            )
            .await;
        }
        send(
            &mut stream,
            &format!("Response: Success\r\nActionID: {id}\r\nMessage: 2 channels\r\n\r\n"),
        )
        .await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (client, _events) = AmiClient::connect("127.0.0.1", port, "manager", "s3cret")
        .await
        .unwrap();

    let done = client
        .run_action(Action::new("CoreShowChannels", [("marker", "x")]).unwrap())
        .await
        .unwrap();
    assert!(done.ok);
    assert_eq!(done.response.message(), "2 channels");
    assert_eq!(done.events.len(), 2);
    assert_eq!(done.events[0].get("channel"), Some("SIP/100-1"));
    assert_eq!(done.events[1].get("channel"), Some("SIP/101-1"));
}

#[tokio::test]
async fn events_reach_the_pull_stream() {
    let listener = listener().await;
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = accept_and_login(&listener).await;
        send(
            &mut stream,
            "Event: FullyBooted\r\nStatus: Fully Booted\r\n\r\n",
        )
        .await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (_client, mut events) = AmiClient::connect("127.0.0.1", port, "manager", "s3cret")
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("stream closed")
        .expect("event error");
    assert_eq!(event.name(), "FullyBooted");
    assert_eq!(event.get("status"), Some("Fully Booted"));
}

#[tokio::test]
async fn byte_at_a_time_delivery_still_parses() {
    let listener = listener().await;
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = accept_and_login(&listener).await;
        let payload: &[u8] = b"Event: Hangup\r\nChannel: SIP/7-1\r\nCause: 16\r\n\r\n";
        for &byte in payload {
            stream.write_all(&[byte]).await.unwrap();
            stream.flush().await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (_client, mut events) = AmiClient::connect("127.0.0.1", port, "manager", "s3cret")
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .unwrap()
        .unwrap();
    assert_eq!(event.name(), "Hangup");
    assert_eq!(event.get("cause"), Some("16"));
}

#[tokio::test]
async fn handlers_run_with_their_filters() {
    let listener = listener().await;
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, mut buffer) = accept_and_login(&listener).await;
        // Hold events until the client signals its handlers are in place.
        let _ = read_frame(&mut stream, &mut buffer).await;
        // Only the first of these should match the filter below.
        send(
            &mut stream,
            "Event: DialBegin\r\nChannel: SIP/100-1\r\n\r\n",
        )
        .await;
        send(&mut stream, "Event: DialBegin\r\nContext: internal\r\n\r\n").await;
        send(&mut stream, "Event: DialEnd\r\nChannel: SIP/100-1\r\n\r\n").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (client, mut events) = AmiClient::connect("127.0.0.1", port, "manager", "s3cret")
        .await
        .unwrap();

    let filter = parse_filter("event.Event == \"DialBegin\" and exists event.Channel").unwrap();
    let (matched_tx, mut matched_rx) = mpsc::channel::<String>(8);
    client.on_event(Some(filter), move |event| {
        let matched_tx = matched_tx.clone();
        async move {
            let channel = event.get("channel").unwrap_or("?").to_string();
            let _ = matched_tx.send(channel).await;
        }
    });
    let _go = client
        .send_action(Action::new("Events", [("EventMask", "on")]).unwrap())
        .await
        .unwrap();

    // Drain the three events from the pull stream so we know the reader has
    // processed them all before asserting on handler calls.
    for _ in 0..3 {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .unwrap()
            .unwrap();
    }

    let channel = timeout(Duration::from_secs(2), matched_rx.recv())
        .await
        .expect("timed out waiting for the handler")
        .unwrap();
    assert_eq!(channel, "SIP/100-1");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        matched_rx.try_recv().is_err(),
        "filter must reject the non-matching events"
    );
}

#[tokio::test]
async fn unfiltered_handler_sees_every_event() {
    let listener = listener().await;
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, mut buffer) = accept_and_login(&listener).await;
        // Hold events until the client signals its handlers are in place.
        let _ = read_frame(&mut stream, &mut buffer).await;
        send(&mut stream, "Event: DialBegin\r\nChannel: SIP/1-1\r\n\r\n").await;
        send(&mut stream, "Event: Hangup\r\nChannel: SIP/1-1\r\n\r\n").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (client, mut events) = AmiClient::connect("127.0.0.1", port, "manager", "s3cret")
        .await
        .unwrap();

    let (seen_tx, mut seen_rx) = mpsc::channel::<String>(8);
    client.on_event(None, move |event| {
        let seen_tx = seen_tx.clone();
        async move {
            let _ = seen_tx.send(event.name().to_string()).await;
        }
    });
    let _go = client
        .send_action(Action::new("Events", [("EventMask", "on")]).unwrap())
        .await
        .unwrap();

    for _ in 0..2 {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .unwrap()
            .unwrap();
    }

    let mut names = Vec::new();
    for _ in 0..2 {
        names.push(
            timeout(Duration::from_secs(2), seen_rx.recv())
                .await
                .expect("timed out waiting for the handler")
                .unwrap(),
        );
    }
    names.sort();
    assert_eq!(names, vec!["DialBegin".to_string(), "Hangup".to_string()]);
}

#[tokio::test]
async fn duplicate_action_id_is_a_programming_error() {
    let listener = listener().await;
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, mut buffer) = accept_and_login(&listener).await;
        let _ = read_frame(&mut stream, &mut buffer).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (client, _events) = AmiClient::connect("127.0.0.1", port, "manager", "s3cret")
        .await
        .unwrap();

    let _first = client
        .send_action(Action::new("Ping", [("ActionID", "fixed-id")]).unwrap())
        .await
        .unwrap();
    let err = client
        .send_action(Action::new("Ping", [("ActionID", "fixed-id")]).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, AmiError::Programming { .. }), "got {err:?}");
}

#[tokio::test]
async fn peer_disconnect_fails_pending_actions_and_closes_stream() {
    let listener = listener().await;
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, mut buffer) = accept_and_login(&listener).await;
        // Read the action, then hang up without answering.
        let _ = read_frame(&mut stream, &mut buffer).await;
        drop(stream);
    });

    let (client, mut events) = AmiClient::connect("127.0.0.1", port, "manager", "s3cret")
        .await
        .unwrap();

    let handle = client
        .send_action(Action::new("Ping", [("marker", "1")]).unwrap())
        .await
        .unwrap();

    match timeout(Duration::from_secs(2), handle.wait()).await {
        Ok(Err(AmiError::ConnectionLost)) => {}
        other => panic!("expected ConnectionLost, got {other:?}"),
    }

    let next = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for stream close");
    assert!(next.is_none(), "stream must end on disconnect");
    assert!(!events.is_connected());
    assert_eq!(
        events.status(),
        ConnectionStatus::Disconnected(DisconnectReason::ServerClosed)
    );
    assert!(!client.is_connected());

    // A send after teardown is refused outright.
    let err = client
        .send_action(Action::new("Ping", [("marker", "2")]).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, AmiError::NotConnected), "got {err:?}");
}

#[tokio::test]
async fn client_disconnect_reports_client_requested() {
    let listener = listener().await;
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = accept_and_login(&listener).await;
        // Echo EOF back once the client shuts down its write half.
        let mut sink = [0u8; 256];
        while stream.read(&mut sink).await.unwrap_or(0) > 0 {}
        drop(stream);
    });

    let (client, events) = AmiClient::connect("127.0.0.1", port, "manager", "s3cret")
        .await
        .unwrap();

    client.disconnect().await.unwrap();
    let reason = timeout(Duration::from_secs(2), events.run_dispatch_loop())
        .await
        .expect("dispatch loop did not end");
    assert_eq!(reason, DisconnectReason::ClientRequested);
}

#[tokio::test]
async fn pull_stream_skips_command_responses() {
    let listener = listener().await;
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = accept_and_login(&listener).await;
        // A stray response (no pending action) followed by an event: only the
        // event may surface on the pull stream.
        send(
            &mut stream,
            "Response: Success\r\nActionID: stray\r\nMessage: nobody asked\r\n\r\n",
        )
        .await;
        send(&mut stream, "Event: Hangup\r\nChannel: SIP/7-1\r\n\r\n").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (_client, mut events) = AmiClient::connect("127.0.0.1", port, "manager", "s3cret")
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out")
        .unwrap()
        .unwrap();
    assert_eq!(event.name(), "Hangup");
}

#[tokio::test]
async fn registered_schema_coerces_events_on_the_wire() {
    let listener = listener().await;
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = accept_and_login(&listener).await;
        send(
            &mut stream,
            "Event: Hangup\r\nChannel: SIP/7-1\r\nCause: 16\r\n\r\n",
        )
        .await;
        // Missing the required Cause field: the frame is rejected, the
        // connection survives.
        send(&mut stream, "Event: Hangup\r\nChannel: SIP/8-1\r\n\r\n").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let mut registry = EventRegistry::new();
    registry.register(
        EventSchema::new("Hangup")
            .required("channel", FieldType::Str)
            .required("cause", FieldType::Int),
    );
    let options = AmiConnectOptions {
        registry: Arc::new(registry),
        ..Default::default()
    };

    let (client, mut events) =
        AmiClient::connect_with_options("127.0.0.1", port, "manager", "s3cret", options)
            .await
            .unwrap();

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out")
        .unwrap()
        .unwrap();
    assert_eq!(event.schema_name(), Some("Hangup"));
    assert_eq!(event.int_field("cause"), Some(16));

    let rejected = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out")
        .unwrap();
    assert!(matches!(
        rejected,
        Err(AmiError::MissingEventField { .. })
    ));
    assert!(client.is_connected());
}

#[tokio::test]
async fn rejected_frame_surfaces_as_stream_error_without_teardown() {
    let listener = listener().await;
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = accept_and_login(&listener).await;
        send(&mut stream, "Bogus: Value\r\nOther: x\r\n\r\n").await;
        send(&mut stream, "Event: Hangup\r\nChannel: SIP/7-1\r\n\r\n").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (client, mut events) = AmiClient::connect("127.0.0.1", port, "manager", "s3cret")
        .await
        .unwrap();

    let first = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out")
        .unwrap();
    assert!(matches!(
        first,
        Err(AmiError::UnsupportedPacketType { .. })
    ));

    let second = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out")
        .unwrap()
        .unwrap();
    assert_eq!(second.name(), "Hangup");
    assert!(client.is_connected(), "a bad frame must not kill the session");
}
