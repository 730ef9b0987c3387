use std::time::Duration;
use tokio::net::TcpListener;
use warden_core::PortResolver;

fn resolver() -> PortResolver {
    PortResolver::new(Duration::from_secs(1), Duration::from_secs(5))
}

#[tokio::test]
async fn test_probe_sees_listening_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let probe = resolver().probe(port).await;
    assert!(probe.in_use);
    assert!(!probe.inconclusive);
    assert_eq!(probe.port, port);
    assert_eq!(probe.detected_by.as_deref(), Some("tcp-connect"));
}

#[tokio::test]
async fn test_probe_free_port() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let probe = resolver().resolve(port).await;
    assert!(!probe.in_use);
    assert_eq!(probe.owner_pid, None);
}

#[tokio::test]
async fn test_probe_serializes_for_clients() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let probe = resolver().probe(port).await;
    let json = serde_json::to_value(&probe).unwrap();
    assert_eq!(json["in_use"], true);
    assert_eq!(json["port"], port);
}
