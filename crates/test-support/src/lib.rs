//! Integration-test helpers shared across the workspace: ephemeral mock HTTP
//! servers and RS256 test keys for minting JWKS documents and signed tokens.

use anyhow::Context as _;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::pkcs1::EncodeRsaPrivateKey as _;
use rsa::traits::PublicKeyParts as _;
use serde_json::{Value, json};
use std::net::SocketAddr;
use tokio::task::JoinHandle;

/// A mock HTTP server bound to an ephemeral localhost port. The server task
/// is aborted on drop.
pub struct MockServer {
    pub addr: SocketAddr,
    pub base_url: String,
    handle: JoinHandle<()>,
}

impl MockServer {
    /// Serve `router` on `127.0.0.1:0`.
    ///
    /// # Errors
    ///
    /// Returns an error if binding the listener fails.
    pub async fn spawn(router: axum::Router) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind ephemeral port")?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(Self {
            addr,
            base_url: format!("http://{addr}"),
            handle,
        })
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// An RSA keypair for RS256 test tokens, with the matching JWK material.
pub struct TestRsaKey {
    pub kid: String,
    encoding_key: EncodingKey,
    n_b64: String,
    e_b64: String,
}

impl TestRsaKey {
    /// Generate a fresh 2048-bit keypair.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or PEM encoding fails.
    pub fn generate(kid: &str) -> anyhow::Result<Self> {
        let mut rng = rand::thread_rng();
        let private = rsa::RsaPrivateKey::new(&mut rng, 2048).context("generate rsa key")?;
        let pem = private
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .context("encode rsa key as pem")?;
        let encoding_key =
            EncodingKey::from_rsa_pem(pem.as_bytes()).context("build jwt encoding key")?;

        let public = private.to_public_key();
        let n_b64 = URL_SAFE_NO_PAD.encode(public.n().to_bytes_be());
        let e_b64 = URL_SAFE_NO_PAD.encode(public.e().to_bytes_be());

        Ok(Self {
            kid: kid.to_string(),
            encoding_key,
            n_b64,
            e_b64,
        })
    }

    /// The public half as a JWK.
    #[must_use]
    pub fn jwk(&self) -> Value {
        json!({
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": self.kid,
            "n": self.n_b64,
            "e": self.e_b64,
        })
    }

    /// A single-key JWKS document.
    #[must_use]
    pub fn jwks(&self) -> Value {
        json!({ "keys": [self.jwk()] })
    }

    /// Sign `claims` as an RS256 JWT with this key's `kid` in the header.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn sign(&self, claims: &Value) -> anyhow::Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding_key).context("sign test jwt")
    }
}
