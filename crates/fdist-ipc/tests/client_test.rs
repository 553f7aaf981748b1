//! FileClient against a scripted TCP peer.

use std::time::Duration;

use fdist_cas::{FileReference, FileReferenceData, PayloadKind};
use fdist_ipc::client::FileClient;
use fdist_ipc::{read_frame, write_frame, FileReply, FileRequest, FileResponse, IpcError};
use tokio::net::TcpListener;

fn reference(value: &str) -> FileReference {
    FileReference::parse(value).unwrap()
}

/// Answer every request on one connection with `respond`.
async fn serve_once<F>(respond: F) -> u16
where
    F: Fn(FileRequest) -> FileResponse + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        while let Ok(Some(request)) = read_frame::<_, FileRequest>(&mut stream, 1 << 20).await {
            write_frame(&mut stream, &respond(request)).await.unwrap();
        }
    });
    port
}

#[tokio::test]
async fn test_ping_and_has_file() {
    let present = reference("1a");
    let port = serve_once(move |req| match req {
        FileRequest::Ping => FileResponse::Pong {
            server_version: "test".to_string(),
        },
        FileRequest::HasFile { reference } => FileResponse::HasFileAck {
            present: reference == present,
        },
        _ => FileResponse::Error("unsupported".to_string()),
    })
    .await;

    let mut client = FileClient::connect("127.0.0.1", port, Duration::from_secs(5)).await.unwrap();
    assert_eq!(client.ping().await.unwrap(), "test");
    assert!(client.has_file(&reference("1a")).await.unwrap());
    assert!(!client.has_file(&reference("2b")).await.unwrap());
    assert!(matches!(
        client.start_download(vec![reference("1a")]).await,
        Err(IpcError::Remote(_))
    ));
}

#[tokio::test]
async fn test_receive_file() {
    let port = serve_once(|req| match req {
        FileRequest::ReceiveFile { reference } => {
            let payload = b"hello".to_vec();
            FileResponse::File(FileReply::ok(FileReferenceData {
                reference,
                filename: "b.txt".to_string(),
                kind: PayloadKind::File,
                checksum: fdist_cas::hash::checksum(&payload),
                payload,
            }))
        }
        _ => FileResponse::Error("unsupported".to_string()),
    })
    .await;

    let mut client = FileClient::connect("127.0.0.1", port, Duration::from_secs(5)).await.unwrap();
    let data = client.receive_file(&reference("1a")).await.unwrap();
    assert_eq!(data.filename, "b.txt");
    assert_eq!(data.payload, b"hello");
}

#[tokio::test]
async fn test_reply_for_wrong_reference_rejected() {
    let port = serve_once(|req| match req {
        FileRequest::ReceiveFile { .. } => FileResponse::File(FileReply::ok(FileReferenceData {
            reference: FileReference::parse("ff").unwrap(),
            filename: "x".to_string(),
            kind: PayloadKind::File,
            checksum: fdist_cas::hash::checksum(b""),
            payload: Vec::new(),
        })),
        _ => FileResponse::Error("unsupported".to_string()),
    })
    .await;

    let mut client = FileClient::connect("127.0.0.1", port, Duration::from_secs(5)).await.unwrap();
    assert!(matches!(
        client.receive_file(&reference("1a")).await,
        Err(IpcError::UnexpectedResponse(_))
    ));
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let _holder = tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let mut client = FileClient::connect("127.0.0.1", port, Duration::from_millis(200)).await.unwrap();
    let err = client.ping().await.unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {:?}", err);
}

#[tokio::test]
async fn test_connection_refused_is_transport_failure() {
    // Bind then drop to get a port nobody listens on
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let err = FileClient::connect("127.0.0.1", port, Duration::from_secs(2)).await.unwrap_err();
    assert!(matches!(err, IpcError::Transport { .. }), "unexpected error: {:?}", err);
}

#[tokio::test]
async fn test_oversized_reply_leaves_client_unusable() {
    let port = serve_once(|req| match req {
        FileRequest::ReceiveFile { reference } => {
            let payload = vec![7u8; 4096];
            FileResponse::File(FileReply::ok(FileReferenceData {
                reference,
                filename: "big.bin".to_string(),
                kind: PayloadKind::File,
                checksum: fdist_cas::hash::checksum(&payload),
                payload,
            }))
        }
        FileRequest::Ping => FileResponse::Pong {
            server_version: "test".to_string(),
        },
        _ => FileResponse::Error("unsupported".to_string()),
    })
    .await;

    let mut client = FileClient::connect("127.0.0.1", port, Duration::from_secs(5))
        .await
        .unwrap()
        .with_max_frame_bytes(1024);
    assert!(matches!(
        client.receive_file(&reference("1a")).await,
        Err(IpcError::FrameTooLarge { max: 1024, .. })
    ));
    assert!(!client.is_usable());
    // The unread body is still on the socket; no further request is attempted
    assert!(matches!(client.ping().await, Err(IpcError::Transport { .. })));
}
