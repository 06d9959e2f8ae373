//! Transport security over real TCP sockets.

use skua::{
    CallOptions, Channel, ClientTlsConfig, ConfigError, Dispatcher, RpcError, Security, Server,
    ServerTlsConfig, TransportError,
};

fn echo_service() -> Dispatcher {
    Dispatcher::builder()
        .unary("echo", |text: String, _env| async move { Ok(text) })
        .unwrap()
        .build()
}

struct TestCert {
    cert_pem: String,
    key_pem: String,
}

fn self_signed() -> TestCert {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])
        .expect("certificate generation");
    TestCert {
        cert_pem: certified.cert.pem(),
        key_pem: certified.key_pair.serialize_pem(),
    }
}

async fn spawn_server(tls: Option<ServerTlsConfig>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let mut server = Server::new(echo_service());
    if let Some(tls) = tls {
        server = server.with_tls(tls);
    }
    tokio::spawn(server.serve_listener(listener));
    addr
}

#[tokio::test]
async fn calls_flow_over_tls() {
    let cert = self_signed();
    let server_tls = ServerTlsConfig::from_pem(cert.cert_pem.as_bytes(), cert.key_pem.as_bytes())
        .unwrap();
    let addr = spawn_server(Some(server_tls)).await;

    let client_tls = ClientTlsConfig::from_ca_pem(cert.cert_pem.as_bytes(), "localhost").unwrap();
    let channel = Channel::connect(&addr, Security::Tls(client_tls))
        .await
        .unwrap();
    let reply: String = channel
        .unary("echo", &"over tls".to_owned(), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(reply, "over tls");
}

#[tokio::test]
async fn tls_client_against_plaintext_server_is_unavailable() {
    let cert = self_signed();
    let addr = spawn_server(None).await;

    let client_tls = ClientTlsConfig::from_ca_pem(cert.cert_pem.as_bytes(), "localhost").unwrap();
    let err = Channel::connect(&addr, Security::Tls(client_tls))
        .await
        .unwrap_err();
    assert!(
        matches!(err, TransportError::Unavailable(_)),
        "expected unavailable, got {err:?}"
    );
}

#[tokio::test]
async fn plaintext_client_against_tls_server_fails_at_transport_level() {
    let cert = self_signed();
    let server_tls = ServerTlsConfig::from_pem(cert.cert_pem.as_bytes(), cert.key_pem.as_bytes())
        .unwrap();
    let addr = spawn_server(Some(server_tls)).await;

    // TCP itself connects; the mismatch surfaces on the first call.
    let channel = Channel::connect(&addr, Security::Insecure).await.unwrap();
    let err = channel
        .unary::<String, String>("echo", &"hello".to_owned(), CallOptions::new())
        .await
        .unwrap_err();
    assert!(
        matches!(err, RpcError::Transport(_)),
        "expected transport error, got {err:?}"
    );
}

#[tokio::test]
async fn refused_connection_is_unavailable() {
    // Bind and immediately drop to get a port that refuses connections.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let err = Channel::connect(&addr, Security::Insecure).await.unwrap_err();
    assert!(matches!(err, TransportError::Unavailable(_)));
}

#[test]
fn key_material_is_validated_at_startup() {
    let cert = self_signed();
    // A certificate where the private key should be fails before serving.
    let result = ServerTlsConfig::from_pem(cert.cert_pem.as_bytes(), cert.cert_pem.as_bytes());
    assert!(matches!(result, Err(ConfigError::InvalidPem(_))));
}
