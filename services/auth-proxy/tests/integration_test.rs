use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cluster_gate_auth_proxy::audit::{AuditRecord, Outcome, Stage};
use cluster_gate_auth_proxy::config::{
    AuditConfig, ConfigError, OidcConfig, ProxyConfig, ServingConfig, UpstreamConfig,
};
use cluster_gate_auth_proxy::kube::{SUBJECT_ACCESS_REVIEW_PATH, TOKEN_REVIEW_PATH};
use cluster_gate_auth_proxy::proxy::{Proxy, Reviewers, AUDIT_ID_HEADER};
use cluster_gate_auth_proxy::server::ProxyServer;
use cluster_gate_auth_proxy::shutdown::ShutdownHooks;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SIGNING_KEY: &str = include_str!("fixtures/oidc_signing_key.pem");
const JWKS: &str = include_str!("fixtures/jwks.json");
const CLIENT_ID: &str = "cluster-gate";
const PROXY_TOKEN: &str = "proxy-token";

fn unused_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("failed to bind ephemeral port")
        .local_addr()
        .expect("listener has no local addr")
        .port()
}

fn base_config(issuer_url: &str, upstream_url: String, port: u16) -> ProxyConfig {
    ProxyConfig {
        serving: ServingConfig {
            host: "127.0.0.1".to_string(),
            port,
            tls_cert_path: None,
            tls_key_path: None,
        },
        upstream: UpstreamConfig {
            url: upstream_url,
            ca_path: None,
            token: Some(PROXY_TOKEN.to_string()),
            token_path: None,
            insecure_skip_verify: false,
        },
        oidc: Some(OidcConfig {
            issuer_url: issuer_url.to_string(),
            client_id: CLIENT_ID.to_string(),
            ..Default::default()
        }),
        token_review_audiences: Vec::new(),
        audit: AuditConfig::default(),
        trusted_subnets: Vec::new(),
        impersonate_caller: false,
        request_timeout_secs: 5,
        max_body_size_bytes: 1024 * 1024,
        flush_interval_ms: 50,
        log_level: "warn".to_string(),
    }
}

async fn oidc_issuer() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": server.uri(),
            "jwks_uri": format!("{}/keys", server.uri()),
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/keys"))
        .respond_with(ResponseTemplate::new(200).set_body_string(JWKS))
        .mount(&server)
        .await;
    server
}

fn mint_token(issuer: &str, subject: &str) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some("test-key".to_string());
    let claims = json!({
        "iss": issuer,
        "aud": CLIENT_ID,
        "sub": subject,
        "groups": ["dev"],
        "exp": chrono::Utc::now().timestamp() + 3600,
    });
    let key = EncodingKey::from_rsa_pem(SIGNING_KEY.as_bytes()).expect("fixture key");
    encode(&header, &claims, &key).expect("token signs")
}

fn token_review(status: Value) -> ResponseTemplate {
    ResponseTemplate::new(201).set_body_json(json!({
        "apiVersion": "authentication.k8s.io/v1",
        "kind": "TokenReview",
        "spec": {},
        "status": status,
    }))
}

fn access_review(allowed: bool) -> ResponseTemplate {
    ResponseTemplate::new(201).set_body_json(json!({
        "apiVersion": "authorization.k8s.io/v1",
        "kind": "SubjectAccessReview",
        "spec": {},
        "status": {"allowed": allowed},
    }))
}

async fn start_proxy(config: ProxyConfig) -> Result<(JoinHandle<Result<()>>, String)> {
    config.validate()?;
    let addr = config.listen_addr();
    let config = Arc::new(config);
    let hooks = ShutdownHooks::new();
    let proxy = Proxy::new(Arc::clone(&config), Reviewers::default(), &hooks).await?;
    let server = ProxyServer::new(config, Arc::new(proxy))?;
    let handle = tokio::spawn(server.run(std::future::pending()));
    wait_for_port(&addr).await;
    Ok((handle, format!("http://{}", addr)))
}

async fn wait_for_port(addr: &str) {
    for _ in 0..20 {
        match tokio::net::TcpStream::connect(addr).await {
            Ok(_) => return,
            Err(_) => sleep(Duration::from_millis(50)).await,
        }
    }
    panic!("proxy [{}] did not become ready in time", addr);
}

async fn teardown(handle: JoinHandle<Result<()>>) {
    handle.abort();
    let _ = handle.await;
}

fn client() -> Result<Client> {
    Ok(Client::builder().timeout(Duration::from_secs(5)).build()?)
}

async fn read_audit_log(path: &Path, expected: usize) -> Vec<AuditRecord> {
    for _ in 0..50 {
        let records: Vec<AuditRecord> = std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        if records.len() >= expected {
            return records;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("audit log did not reach {} records", expected);
}

/// Raw upstream sending one chunked event. With `hang_up` it then closes
/// the socket without finishing the chunked body.
async fn streaming_upstream(hang_up: bool) -> (String, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind streaming upstream");
    let addr = listener.local_addr().expect("local addr");

    let handle = tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut request = vec![0u8; 8192];
        let _ = socket.read(&mut request).await;

        let event = br#"{"type":"ADDED","object":{"kind":"Pod"}}"#;
        let mut response = b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ntransfer-encoding: chunked\r\n\r\n".to_vec();
        response.extend_from_slice(format!("{:x}\r\n", event.len()).as_bytes());
        response.extend_from_slice(event);
        response.extend_from_slice(b"\r\n");
        let _ = socket.write_all(&response).await;

        if hang_up {
            let _ = socket.shutdown().await;
            return;
        }
        sleep(Duration::from_secs(30)).await;
    });

    (format!("http://{}", addr), handle)
}

#[tokio::test(flavor = "multi_thread")]
async fn unauthenticated_requests_do_not_hit_upstream() -> Result<()> {
    let issuer = oidc_issuer().await;
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_REVIEW_PATH))
        .respond_with(token_review(json!({"authenticated": false})))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/pods"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let port = unused_port();
    let (handle, base_url) = start_proxy(base_config(&issuer.uri(), upstream.uri(), port)).await?;

    let response = client()?
        .get(format!("{}/api/v1/pods", base_url))
        .bearer_auth("not-a-valid-token")
        .send()
        .await?;
    assert_eq!(response.status(), 401);
    assert!(response.headers().contains_key(AUDIT_ID_HEADER));
    let body: Value = response.json().await?;
    assert_eq!(body["kind"], "Status");
    assert_eq!(body["code"], 401);

    let anonymous = client()?
        .get(format!("{}/api/v1/pods", base_url))
        .send()
        .await?;
    assert_eq!(anonymous.status(), 401);

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn oidc_token_is_forwarded_to_upstream() -> Result<()> {
    let issuer = oidc_issuer().await;
    let token = mint_token(&issuer.uri(), "alice");

    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_REVIEW_PATH))
        .respond_with(token_review(json!({"authenticated": true})))
        .expect(0)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/default/pods"))
        .and(header("authorization", format!("Bearer {}", token).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"kind": "PodList", "items": []})))
        .expect(1)
        .mount(&upstream)
        .await;

    let port = unused_port();
    let (handle, base_url) = start_proxy(base_config(&issuer.uri(), upstream.uri(), port)).await?;

    let response = client()?
        .get(format!("{}/api/v1/namespaces/default/pods", base_url))
        .bearer_auth(&token)
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await?;
    assert_eq!(body["kind"], "PodList");

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn opaque_tokens_fall_back_to_token_review() -> Result<()> {
    let issuer = oidc_issuer().await;
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_REVIEW_PATH))
        .and(body_partial_json(json!({"spec": {"token": "sa-token"}})))
        .respond_with(token_review(json!({
            "authenticated": true,
            "user": {
                "username": "system:serviceaccount:ci:builder",
                "groups": ["system:serviceaccounts"]
            }
        })))
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/namespaces/ci/configmaps"))
        .and(header("authorization", "Bearer sa-token"))
        .and(body_partial_json(json!({"kind": "ConfigMap"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"kind": "ConfigMap"})))
        .expect(1)
        .mount(&upstream)
        .await;

    let port = unused_port();
    let (handle, base_url) = start_proxy(base_config(&issuer.uri(), upstream.uri(), port)).await?;

    let response = client()?
        .post(format!("{}/api/v1/namespaces/ci/configmaps", base_url))
        .bearer_auth("sa-token")
        .json(&json!({"kind": "ConfigMap", "metadata": {"name": "settings"}}))
        .send()
        .await?;
    assert_eq!(response.status(), 201);

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn authorized_impersonation_reaches_upstream_with_verified_headers() -> Result<()> {
    let issuer = oidc_issuer().await;
    let token = mint_token(&issuer.uri(), "alice");

    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SUBJECT_ACCESS_REVIEW_PATH))
        .respond_with(access_review(true))
        .expect(2)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/secrets"))
        .and(header("authorization", format!("Bearer {}", PROXY_TOKEN).as_str()))
        .and(header("impersonate-user", "jane"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"kind": "SecretList"})))
        .expect(1)
        .mount(&upstream)
        .await;

    let port = unused_port();
    let (handle, base_url) = start_proxy(base_config(&issuer.uri(), upstream.uri(), port)).await?;

    let response = client()?
        .get(format!("{}/api/v1/secrets", base_url))
        .bearer_auth(&token)
        .header("Impersonate-User", "jane")
        .header("Impersonate-Group", "ops")
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    let forwarded = upstream
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .find(|r| r.url.path() == "/api/v1/secrets")
        .expect("request reached upstream");
    let groups: Vec<_> = forwarded
        .headers
        .get_all("impersonate-group")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    assert!(groups.contains(&"ops"));
    assert!(groups.contains(&"system:authenticated"));
    assert!(!forwarded.headers.contains_key("impersonate-uid"));

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn denied_impersonation_is_forbidden() -> Result<()> {
    let issuer = oidc_issuer().await;
    let token = mint_token(&issuer.uri(), "alice");

    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SUBJECT_ACCESS_REVIEW_PATH))
        .and(body_partial_json(json!({
            "spec": {"resourceAttributes": {"resource": "groups", "name": "system:masters"}}
        })))
        .respond_with(access_review(false))
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path(SUBJECT_ACCESS_REVIEW_PATH))
        .respond_with(access_review(true))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/secrets"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let port = unused_port();
    let (handle, base_url) = start_proxy(base_config(&issuer.uri(), upstream.uri(), port)).await?;

    let response = client()?
        .get(format!("{}/api/v1/secrets", base_url))
        .bearer_auth(&token)
        .header("Impersonate-User", "jane")
        .header("Impersonate-Group", "system:masters")
        .send()
        .await?;
    assert_eq!(response.status(), 403);
    let body: Value = response.json().await?;
    assert_eq!(body["reason"], "Forbidden");
    assert!(body["message"].as_str().unwrap_or_default().contains("system:masters"));

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_events_are_flushed_while_stream_is_open() -> Result<()> {
    let issuer = oidc_issuer().await;
    let token = mint_token(&issuer.uri(), "alice");
    let (upstream_url, upstream) = streaming_upstream(false).await;

    let port = unused_port();
    let (handle, base_url) = start_proxy(base_config(&issuer.uri(), upstream_url, port)).await?;

    let mut response = Client::new()
        .get(format!("{}/api/v1/pods?watch=true", base_url))
        .bearer_auth(&token)
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    let chunk = tokio::time::timeout(Duration::from_secs(2), response.chunk())
        .await
        .expect("first event arrives before the stream ends")?
        .expect("stream still open");
    assert!(String::from_utf8_lossy(&chunk).contains("ADDED"));

    drop(response);
    upstream.abort();
    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn truncated_upstream_body_fails_the_client_response() -> Result<()> {
    let issuer = oidc_issuer().await;
    let token = mint_token(&issuer.uri(), "alice");
    let (upstream_url, upstream) = streaming_upstream(true).await;

    let port = unused_port();
    let (handle, base_url) = start_proxy(base_config(&issuer.uri(), upstream_url, port)).await?;

    let response = Client::new()
        .get(format!("{}/api/v1/pods", base_url))
        .bearer_auth(&token)
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    let body = tokio::time::timeout(Duration::from_secs(5), response.bytes())
        .await
        .expect("response body settles");
    assert!(body.is_err(), "a cut-off upstream body must not look complete");

    upstream.abort();
    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stalled_body_is_bounded_by_request_deadline() -> Result<()> {
    let issuer = oidc_issuer().await;
    let token = mint_token(&issuer.uri(), "alice");

    let (list_url, list_upstream) = streaming_upstream(false).await;
    let mut config = base_config(&issuer.uri(), list_url, unused_port());
    config.request_timeout_secs = 1;
    let (list_proxy, base_url) = start_proxy(config).await?;

    let started = std::time::Instant::now();
    let response = Client::new()
        .get(format!("{}/api/v1/pods", base_url))
        .bearer_auth(&token)
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let body = tokio::time::timeout(Duration::from_secs(4), response.bytes())
        .await
        .expect("stalled list body settles at the deadline");
    assert!(body.is_err(), "a body cut at the deadline must not look complete");
    assert!(started.elapsed() < Duration::from_secs(4));

    list_upstream.abort();
    teardown(list_proxy).await;

    let (watch_url, watch_upstream) = streaming_upstream(false).await;
    let mut config = base_config(&issuer.uri(), watch_url, unused_port());
    config.request_timeout_secs = 1;
    let (watch_proxy, base_url) = start_proxy(config).await?;

    let mut response = Client::new()
        .get(format!("{}/api/v1/pods?watch=true", base_url))
        .bearer_auth(&token)
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let first = response.chunk().await?.expect("first event");
    assert!(String::from_utf8_lossy(&first).contains("ADDED"));
    assert!(
        tokio::time::timeout(Duration::from_secs(2), response.chunk())
            .await
            .is_err(),
        "watch stream stays open past the request deadline"
    );

    drop(response);
    watch_upstream.abort();
    teardown(watch_proxy).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn every_request_produces_one_audit_record() -> Result<()> {
    let issuer = oidc_issuer().await;
    let token = mint_token(&issuer.uri(), "alice");

    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_REVIEW_PATH))
        .respond_with(token_review(json!({"authenticated": false})))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"kind": "NamespaceList"})))
        .mount(&upstream)
        .await;

    let dir = tempfile::tempdir()?;
    let log_path: PathBuf = dir.path().join("audit.log");

    let mut config = base_config(&issuer.uri(), upstream.uri(), unused_port());
    config.audit.log_path = Some(log_path.clone());
    let (handle, base_url) = start_proxy(config).await?;
    let client = client()?;

    let allowed = client
        .get(format!("{}/api/v1/namespaces", base_url))
        .bearer_auth(&token)
        .header("x-forwarded-for", "203.0.113.50")
        .send()
        .await?;
    let allowed_id = allowed.headers()[AUDIT_ID_HEADER].to_str()?.to_string();
    assert_eq!(allowed.status(), 200);
    allowed.bytes().await?;

    let rejected = client
        .get(format!("{}/api/v1/namespaces", base_url))
        .bearer_auth("bogus")
        .send()
        .await?;
    let rejected_id = rejected.headers()[AUDIT_ID_HEADER].to_str()?.to_string();
    assert_eq!(rejected.status(), 401);

    let health = client.get(format!("{}/healthz", base_url)).send().await?;
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await?, "ok");

    let records = read_audit_log(&log_path, 2).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(read_audit_log(&log_path, 2).await.len(), 2);

    let forwarded = records
        .iter()
        .find(|r| r.audit_id == allowed_id)
        .expect("record for forwarded request");
    assert_eq!(forwarded.outcome, Outcome::Forwarded);
    assert_eq!(forwarded.stage, Stage::ResponseComplete);
    assert_eq!(forwarded.source_ips.first().map(String::as_str), Some("203.0.113.50"));
    assert!(forwarded.user.as_ref().is_some_and(|u| u.name.ends_with("#alice")));

    let denied = records
        .iter()
        .find(|r| r.audit_id == rejected_id)
        .expect("record for rejected request");
    assert_eq!(denied.outcome, Outcome::Unauthenticated);
    assert_eq!(denied.response_status.as_ref().map(|s| s.code), Some(401));

    teardown(handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_shutdown_stops_the_server() -> Result<()> {
    let issuer = oidc_issuer().await;
    let upstream = MockServer::start().await;

    let config = Arc::new(base_config(&issuer.uri(), upstream.uri(), unused_port()));
    let addr = config.listen_addr();
    let hooks = ShutdownHooks::new();
    let proxy = Proxy::new(Arc::clone(&config), Reviewers::default(), &hooks).await?;
    let server = ProxyServer::new(config, Arc::new(proxy))?;

    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run(async move {
        let _ = stopped.await;
    }));
    wait_for_port(&addr).await;

    let _ = stop.send(());
    tokio::time::timeout(Duration::from_secs(5), handle).await???;

    assert!(tokio::net::TcpStream::connect(&addr).await.is_err());
    hooks.run_pre_shutdown_hooks().await?;
    Ok(())
}

#[tokio::test]
async fn proxy_construction_requires_oidc() {
    let upstream = MockServer::start().await;
    let mut config = base_config("https://unused.example.com", upstream.uri(), 0);
    config.oidc = None;

    let result = Proxy::new(Arc::new(config), Reviewers::default(), &ShutdownHooks::new()).await;
    assert!(matches!(result, Err(ConfigError::OidcNotConfigured)));
}

#[tokio::test]
async fn proxy_construction_rejects_missing_ca_file() {
    let issuer = oidc_issuer().await;
    let mut config = base_config(&issuer.uri(), "http://127.0.0.1:6443".to_string(), 0);
    if let Some(ref mut oidc) = config.oidc {
        oidc.ca_path = Some(PathBuf::from("/nonexistent/oidc-ca.crt"));
    }

    let result = Proxy::new(Arc::new(config), Reviewers::default(), &ShutdownHooks::new()).await;
    assert!(matches!(
        result,
        Err(ConfigError::UnreadableFile { name: "OIDC_CA_PATH", .. })
    ));
}

#[tokio::test]
async fn proxy_construction_rejects_bad_issuer() {
    for issuer in ["", "ftp://issuer.example.com", "not a url"] {
        let config = base_config(issuer, "http://127.0.0.1:6443".to_string(), 0);
        let result = Proxy::new(Arc::new(config), Reviewers::default(), &ShutdownHooks::new()).await;
        assert!(
            matches!(result, Err(ConfigError::InvalidIssuer { .. })),
            "issuer {:?} should be rejected",
            issuer
        );
    }
}

#[tokio::test]
async fn proxy_construction_registers_audit_hook() -> Result<()> {
    let issuer = oidc_issuer().await;
    let dir = tempfile::tempdir()?;
    let mut config = base_config(&issuer.uri(), "http://127.0.0.1:6443".to_string(), 0);
    config.audit.log_path = Some(dir.path().join("audit.log"));

    let hooks = ShutdownHooks::new();
    let proxy = Proxy::new(Arc::new(config), Reviewers::default(), &hooks).await?;

    assert!(proxy.audit().is_enabled());
    assert_eq!(hooks.len().await, 1);
    hooks.run_pre_shutdown_hooks().await?;
    Ok(())
}
