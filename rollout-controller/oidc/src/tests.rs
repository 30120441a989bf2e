use super::*;
use crate::keys::KeyCache;
use bytes::Bytes;
use http_body_util::Full;
use jsonwebtoken::{EncodingKey, Header};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const AUDIENCE: &str = "test-audience";
const OWNER: &str = "acme";

struct TestKey {
    encoding: EncodingKey,
    n: String,
    e: String,
}

fn generate_key() -> TestKey {
    let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("generate RSA key");
    let public = RsaPublicKey::from(&private);
    let pem = private.to_pkcs8_pem(LineEnding::LF).expect("encode PKCS#8");
    TestKey {
        encoding: EncodingKey::from_rsa_pem(pem.as_bytes()).expect("usable RSA PEM"),
        n: URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
        e: URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
    }
}

fn test_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(generate_key)
}

fn other_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(generate_key)
}

fn jwks_document(entries: &[(&str, &TestKey)]) -> String {
    let keys: Vec<serde_json::Value> = entries
        .iter()
        .map(|(kid, key)| {
            serde_json::json!({ "kty": "RSA", "kid": kid, "n": key.n, "e": key.e })
        })
        .collect();
    serde_json::json!({ "keys": keys }).to_string()
}

struct JwksServer {
    url: String,
    response: Arc<parking_lot::RwLock<(u16, String)>>,
    requests: Arc<AtomicUsize>,
}

impl JwksServer {
    fn set_body(&self, body: String) {
        *self.response.write() = (200, body);
    }

    fn set_status(&self, status: u16) {
        self.response.write().0 = status;
    }

    fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

async fn serve_jwks(body: String) -> JwksServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub listener");
    let addr: SocketAddr = listener.local_addr().expect("local addr");
    let response = Arc::new(parking_lot::RwLock::new((200u16, body)));
    let requests = Arc::new(AtomicUsize::new(0));

    let server_response = response.clone();
    let server_requests = requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let response = server_response.clone();
            let requests = server_requests.clone();
            tokio::spawn(async move {
                let service = hyper::service::service_fn(move |_req| {
                    requests.fetch_add(1, Ordering::SeqCst);
                    let (status, body) = response.read().clone();
                    async move {
                        Ok::<_, std::convert::Infallible>(
                            hyper::Response::builder()
                                .status(status)
                                .header(hyper::header::CONTENT_TYPE, "application/json")
                                .body(Full::new(Bytes::from(body)))
                                .expect("stub response must be valid"),
                        )
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(hyper_util::rt::TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    JwksServer {
        url: format!("http://{addr}/.well-known/jwks"),
        response,
        requests,
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock is past the epoch")
        .as_secs()
}

fn base_claims(owner: &str) -> serde_json::Value {
    serde_json::json!({
        "iss": GITHUB_OIDC_ISSUER,
        "aud": AUDIENCE,
        "exp": now_secs() + 3600,
        "iat": now_secs(),
        "repository_owner": owner,
        "repository": format!("{owner}/widgets"),
    })
}

fn sign_token(key: &TestKey, kid: &str, claims: &serde_json::Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    jsonwebtoken::encode(&header, claims, &key.encoding).expect("sign token")
}

fn validator(url: &str) -> Validator {
    Validator::new(AUDIENCE.to_string(), OWNER.to_string(), false).with_jwks_url(url.to_string())
}

#[tokio::test]
async fn accepts_valid_token() {
    let server = serve_jwks(jwks_document(&[("kid-1", test_key())])).await;
    let v = validator(&server.url);

    let token = sign_token(test_key(), "kid-1", &base_claims(OWNER));
    let claims = v.validate(&token).await.expect("token is valid");
    assert_eq!(claims.repository_owner, OWNER);
    assert_eq!(claims.repository, "acme/widgets");
}

#[tokio::test]
async fn owner_comparison_is_case_insensitive() {
    let server = serve_jwks(jwks_document(&[("kid-1", test_key())])).await;
    let v = validator(&server.url);

    let token = sign_token(test_key(), "kid-1", &base_claims("ACME"));
    v.validate(&token).await.expect("owner case must not matter");
}

#[tokio::test]
async fn rejects_expired_token() {
    let server = serve_jwks(jwks_document(&[("kid-1", test_key())])).await;
    let v = validator(&server.url);

    let mut claims = base_claims(OWNER);
    claims["exp"] = serde_json::json!(now_secs() - 7200);
    let token = sign_token(test_key(), "kid-1", &claims);
    assert!(matches!(
        v.validate(&token).await,
        Err(TokenError::BadClaim("exp"))
    ));
}

#[tokio::test]
async fn rejects_token_without_expiry() {
    let server = serve_jwks(jwks_document(&[("kid-1", test_key())])).await;
    let v = validator(&server.url);

    let mut claims = base_claims(OWNER);
    claims.as_object_mut().expect("claims object").remove("exp");
    let token = sign_token(test_key(), "kid-1", &claims);
    assert!(matches!(
        v.validate(&token).await,
        Err(TokenError::BadClaim("exp"))
    ));
}

#[tokio::test]
async fn rejects_future_not_before() {
    let server = serve_jwks(jwks_document(&[("kid-1", test_key())])).await;
    let v = validator(&server.url);

    let mut claims = base_claims(OWNER);
    claims["nbf"] = serde_json::json!(now_secs() + 3600);
    let token = sign_token(test_key(), "kid-1", &claims);
    assert!(matches!(
        v.validate(&token).await,
        Err(TokenError::BadClaim("nbf"))
    ));
}

#[tokio::test]
async fn rejects_wrong_audience() {
    let server = serve_jwks(jwks_document(&[("kid-1", test_key())])).await;
    let v = validator(&server.url);

    let mut claims = base_claims(OWNER);
    claims["aud"] = serde_json::json!("other-audience");
    let token = sign_token(test_key(), "kid-1", &claims);
    assert!(matches!(
        v.validate(&token).await,
        Err(TokenError::BadClaim("aud"))
    ));
}

#[tokio::test]
async fn rejects_wrong_issuer() {
    let server = serve_jwks(jwks_document(&[("kid-1", test_key())])).await;
    let v = validator(&server.url);

    let mut claims = base_claims(OWNER);
    claims["iss"] = serde_json::json!("https://issuer.example.com");
    let token = sign_token(test_key(), "kid-1", &claims);
    assert!(matches!(
        v.validate(&token).await,
        Err(TokenError::BadClaim("iss"))
    ));
}

#[tokio::test]
async fn rejects_wrong_owner() {
    let server = serve_jwks(jwks_document(&[("kid-1", test_key())])).await;
    let v = validator(&server.url);

    let token = sign_token(test_key(), "kid-1", &base_claims("other-org"));
    match v.validate(&token).await {
        Err(TokenError::ForbiddenOwner { owner, allowed }) => {
            assert_eq!(owner, "other-org");
            assert_eq!(allowed, OWNER);
        }
        other => panic!("expected forbidden owner, got {other:?}"),
    }
}

#[tokio::test]
async fn rejects_tampered_signature() {
    // The advertised key does not match the key the token was signed with.
    let server = serve_jwks(jwks_document(&[("kid-1", test_key())])).await;
    let v = validator(&server.url);

    let token = sign_token(other_key(), "kid-1", &base_claims(OWNER));
    assert!(matches!(
        v.validate(&token).await,
        Err(TokenError::BadSignature)
    ));
}

#[tokio::test]
async fn rejects_symmetric_algorithm() {
    let server = serve_jwks(jwks_document(&[("kid-1", test_key())])).await;
    let v = validator(&server.url);

    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some("kid-1".to_string());
    let token = jsonwebtoken::encode(
        &header,
        &base_claims(OWNER),
        &EncodingKey::from_secret(b"shared-secret"),
    )
    .expect("sign token");
    assert!(matches!(
        v.validate(&token).await,
        Err(TokenError::UnsupportedAlgorithm(Algorithm::HS256))
    ));
}

#[tokio::test]
async fn rejects_missing_kid() {
    let server = serve_jwks(jwks_document(&[("kid-1", test_key())])).await;
    let v = validator(&server.url);

    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::RS256),
        &base_claims(OWNER),
        &test_key().encoding,
    )
    .expect("sign token");
    assert!(matches!(
        v.validate(&token).await,
        Err(TokenError::MissingKid)
    ));
}

#[tokio::test]
async fn rejects_malformed_token() {
    let server = serve_jwks(jwks_document(&[("kid-1", test_key())])).await;
    let v = validator(&server.url);

    assert!(matches!(
        v.validate("not-a-token").await,
        Err(TokenError::Malformed(_))
    ));
}

#[tokio::test]
async fn unknown_kid_triggers_one_refresh() {
    let server = serve_jwks(jwks_document(&[("kid-1", test_key())])).await;
    let v = validator(&server.url);

    // Prime the cache with the old key set.
    let token = sign_token(test_key(), "kid-1", &base_claims(OWNER));
    v.validate(&token).await.expect("token is valid");

    // The provider rotates to a new kid; the cache is still fresh, so the
    // lookup misses once, forces a refetch, and then succeeds.
    server.set_body(jwks_document(&[("kid-2", other_key())]));
    let token = sign_token(other_key(), "kid-2", &base_claims(OWNER));
    v.validate(&token).await.expect("rotated key is found after refresh");
}

#[tokio::test]
async fn unknown_kid_after_refresh_is_rejected() {
    let server = serve_jwks(jwks_document(&[("kid-1", test_key())])).await;
    let v = validator(&server.url);

    let token = sign_token(test_key(), "kid-ghost", &base_claims(OWNER));
    match v.validate(&token).await {
        Err(TokenError::UnknownKid(kid)) => assert_eq!(kid, "kid-ghost"),
        other => panic!("expected unknown kid, got {other:?}"),
    }
    // Initial fetch plus the forced refresh.
    assert_eq!(server.request_count(), 2);
}

#[tokio::test]
async fn expired_cache_is_refetched() {
    let server = serve_jwks(jwks_document(&[("kid-1", test_key())])).await;
    let cache = KeyCache::with_ttl(server.url.clone(), Duration::from_millis(50));
    let v = Validator::new(AUDIENCE.to_string(), OWNER.to_string(), false).with_key_cache(cache);

    let token = sign_token(test_key(), "kid-1", &base_claims(OWNER));
    v.validate(&token).await.expect("token is valid");
    assert_eq!(server.request_count(), 1);

    // Within the TTL the cached snapshot is served.
    v.validate(&token).await.expect("token is valid");
    assert_eq!(server.request_count(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    v.validate(&token).await.expect("token is valid");
    assert_eq!(server.request_count(), 2);
}

#[tokio::test]
async fn key_set_fetch_failure_is_surfaced() {
    let server = serve_jwks(jwks_document(&[("kid-1", test_key())])).await;
    server.set_status(500);
    let v = validator(&server.url);

    let token = sign_token(test_key(), "kid-1", &base_claims(OWNER));
    assert!(matches!(
        v.validate(&token).await,
        Err(TokenError::Keys(KeysError::Status(_)))
    ));
}

#[tokio::test]
async fn empty_key_set_is_an_error() {
    let server = serve_jwks(r#"{"keys":[]}"#.to_string()).await;
    let v = validator(&server.url);

    let token = sign_token(test_key(), "kid-1", &base_claims(OWNER));
    assert!(matches!(
        v.validate(&token).await,
        Err(TokenError::Keys(KeysError::Empty))
    ));
}

#[tokio::test]
async fn malformed_key_set_entries_are_skipped() {
    let body = serde_json::json!({
        "keys": [
            { "kty": "EC", "kid": "ec-key", "n": "", "e": "" },
            { "kty": "RSA", "kid": "kid-bad", "n": "!!!", "e": "!!!" },
            { "kty": "RSA", "kid": "kid-1", "n": test_key().n, "e": test_key().e },
        ]
    })
    .to_string();
    let server = serve_jwks(body).await;
    let v = validator(&server.url);

    let token = sign_token(test_key(), "kid-1", &base_claims(OWNER));
    v.validate(&token).await.expect("good entry is still usable");
}

#[tokio::test]
async fn dev_mode_skips_signature_but_not_owner() {
    // No key set server at all: nothing may be fetched in dev mode.
    let v = Validator::new(AUDIENCE.to_string(), OWNER.to_string(), true);

    let mut claims = base_claims(OWNER);
    claims["exp"] = serde_json::json!(now_secs() - 7200);
    claims["aud"] = serde_json::json!("other-audience");
    let token = sign_token(other_key(), "kid-ghost", &claims);
    v.validate(&token)
        .await
        .expect("dev mode skips signature and claim checks");

    let token = sign_token(other_key(), "kid-ghost", &base_claims("other-org"));
    assert!(matches!(
        v.validate(&token).await,
        Err(TokenError::ForbiddenOwner { .. })
    ));
}

#[test]
fn inspect_reports_header_and_claims() {
    let token = sign_token(test_key(), "kid-1", &base_claims(OWNER));
    let inspection = inspect(&token);
    assert_eq!(inspection.header_alg.as_deref(), Some("RS256"));
    assert_eq!(inspection.header_kid.as_deref(), Some("kid-1"));
    assert_eq!(inspection.issuer.as_deref(), Some(GITHUB_OIDC_ISSUER));
    assert_eq!(inspection.audience, vec![AUDIENCE.to_string()]);
    assert_eq!(inspection.repository_owner.as_deref(), Some(OWNER));
    assert_eq!(inspection.repository.as_deref(), Some("acme/widgets"));
    assert!(inspection.parse_error.is_none());
}

#[test]
fn inspect_reports_parse_errors() {
    let inspection = inspect("garbage");
    assert!(inspection.parse_error.is_some());
    assert!(inspection.header_alg.is_none());
}
