//! 设备侧认证：HTTP 设备的 Basic、Bearer、Token Header 与 Digest 凭据。

mod digest;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

pub use digest::DigestChallenge;

/// 认证相关错误。
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unsupported challenge: {0}")]
    UnsupportedChallenge(String),
    #[error("malformed challenge: {0}")]
    MalformedChallenge(String),
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),
}

/// 每设备的 HTTP 认证方式。
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum HttpAuth {
    #[default]
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
    /// 自定义头携带的 token（如 `X-Auth-Token`）。
    Header { name: String, value: String },
    Digest { username: String, password: String },
}

impl HttpAuth {
    /// 按参数名构造：`none|basic|bearer|header|digest`。
    pub fn from_parts(
        scheme: &str,
        username: Option<String>,
        password: Option<String>,
        token: Option<String>,
        token_header: Option<String>,
    ) -> Result<Self, AuthError> {
        match scheme.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "basic" => Ok(Self::Basic {
                username: username.ok_or(AuthError::MissingCredential("username"))?,
                password: password.unwrap_or_default(),
            }),
            "digest" => Ok(Self::Digest {
                username: username.ok_or(AuthError::MissingCredential("username"))?,
                password: password.unwrap_or_default(),
            }),
            "bearer" => Ok(Self::Bearer {
                token: token.ok_or(AuthError::MissingCredential("token"))?,
            }),
            "header" => Ok(Self::Header {
                name: token_header.unwrap_or_else(|| "X-Auth-Token".to_string()),
                value: token.ok_or(AuthError::MissingCredential("token"))?,
            }),
            other => Err(AuthError::UnsupportedChallenge(other.to_string())),
        }
    }
}

/// 运行期凭据：在 HttpAuth 之上缓存 Digest 质询与 nonce 计数。
#[derive(Debug, Default)]
pub struct Credentials {
    auth: HttpAuth,
    challenge: Mutex<Option<DigestChallenge>>,
    nonce_count: AtomicU32,
}

impl Credentials {
    pub fn new(auth: HttpAuth) -> Self {
        Self {
            auth,
            challenge: Mutex::new(None),
            nonce_count: AtomicU32::new(0),
        }
    }

    pub fn auth(&self) -> &HttpAuth {
        &self.auth
    }

    pub fn is_digest(&self) -> bool {
        matches!(self.auth, HttpAuth::Digest { .. })
    }

    /// 为一次请求生成认证头 `(name, value)`；Digest 尚无质询时返回 None。
    pub fn authorization(&self, method: &str, uri: &str) -> Option<(String, String)> {
        match &self.auth {
            HttpAuth::None => None,
            HttpAuth::Basic { username, password } => Some((
                "Authorization".to_string(),
                basic_header(username, password),
            )),
            HttpAuth::Bearer { token } => {
                Some(("Authorization".to_string(), format!("Bearer {}", token)))
            }
            HttpAuth::Header { name, value } => Some((name.clone(), value.clone())),
            HttpAuth::Digest { username, password } => {
                let guard = self.challenge.lock().ok()?;
                let challenge = guard.as_ref()?;
                let nc = self.nonce_count.fetch_add(1, Ordering::Relaxed) + 1;
                let cnonce = new_cnonce();
                Some((
                    "Authorization".to_string(),
                    challenge.authorization(method, uri, username, password, nc, &cnonce),
                ))
            }
        }
    }

    /// 收到 401 时处理 `WWW-Authenticate`；返回是否值得带新凭据重试。
    pub fn accept_challenge(&self, header: &str) -> Result<bool, AuthError> {
        if !self.is_digest() {
            return Ok(false);
        }
        let challenge = DigestChallenge::parse(header)?;
        let mut guard = self
            .challenge
            .lock()
            .map_err(|_| AuthError::MalformedChallenge("challenge cache poisoned".to_string()))?;
        let fresh = guard
            .as_ref()
            .is_none_or(|current| current.nonce != challenge.nonce || challenge.stale);
        if fresh {
            self.nonce_count.store(0, Ordering::Relaxed);
        }
        *guard = Some(challenge);
        Ok(fresh)
    }
}

pub fn basic_header(username: &str, password: &str) -> String {
    let raw = format!("{}:{}", username, password);
    format!("Basic {}", STANDARD.encode(raw.as_bytes()))
}

fn new_cnonce() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_header_encodes() {
        assert_eq!(
            basic_header("Aladdin", "open sesame"),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }

    #[test]
    fn header_scheme_defaults_name() {
        let auth = HttpAuth::from_parts("header", None, None, Some("abc".to_string()), None)
            .expect("auth");
        let credentials = Credentials::new(auth);
        assert_eq!(
            credentials.authorization("GET", "/"),
            Some(("X-Auth-Token".to_string(), "abc".to_string()))
        );
    }

    #[test]
    fn bearer_requires_token() {
        assert!(HttpAuth::from_parts("bearer", None, None, None, None).is_err());
    }

    #[test]
    fn digest_waits_for_challenge() {
        let credentials = Credentials::new(HttpAuth::Digest {
            username: "admin".to_string(),
            password: "secret".to_string(),
        });
        assert!(credentials.authorization("GET", "/status").is_none());

        let retry = credentials
            .accept_challenge(r#"Digest realm="device", nonce="abc123", qop="auth""#)
            .expect("challenge");
        assert!(retry);

        let (name, value) = credentials
            .authorization("GET", "/status")
            .expect("authorization");
        assert_eq!(name, "Authorization");
        assert!(value.starts_with("Digest username=\"admin\""));
        assert!(value.contains("nc=00000001"));

        let retry = credentials
            .accept_challenge(r#"Digest realm="device", nonce="abc123", qop="auth""#)
            .expect("same nonce");
        assert!(!retry);
    }
}
