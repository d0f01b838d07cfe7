use crate::AuthError;
use md5::{Digest, Md5};

/// 解析后的 Digest 质询（`WWW-Authenticate: Digest ...`）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    /// 服务端支持 `auth` 时为 true。
    pub qop_auth: bool,
    pub stale: bool,
}

impl DigestChallenge {
    pub fn parse(header: &str) -> Result<Self, AuthError> {
        let header = header.trim();
        let Some(params) = header
            .get(..6)
            .filter(|scheme| scheme.eq_ignore_ascii_case("digest"))
            .map(|_| &header[6..])
        else {
            return Err(AuthError::UnsupportedChallenge(header.to_string()));
        };

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut algorithm = None;
        let mut qop_auth = false;
        let mut stale = false;
        for (key, value) in split_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "algorithm" => algorithm = Some(value),
                "qop" => {
                    qop_auth = value
                        .split(',')
                        .any(|option| option.trim().eq_ignore_ascii_case("auth"))
                }
                "stale" => stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        if let Some(algorithm) = &algorithm {
            let upper = algorithm.to_ascii_uppercase();
            if upper != "MD5" && upper != "MD5-SESS" {
                return Err(AuthError::UnsupportedChallenge(algorithm.clone()));
            }
        }

        Ok(Self {
            realm: realm.ok_or_else(|| AuthError::MalformedChallenge("missing realm".to_string()))?,
            nonce: nonce.ok_or_else(|| AuthError::MalformedChallenge("missing nonce".to_string()))?,
            opaque,
            algorithm,
            qop_auth,
            stale,
        })
    }

    /// 计算 response 摘要（RFC 2617）。
    pub fn response(
        &self,
        method: &str,
        uri: &str,
        username: &str,
        password: &str,
        nc: u32,
        cnonce: &str,
    ) -> String {
        let mut ha1 = md5_hex(&format!("{}:{}:{}", username, self.realm, password));
        if self
            .algorithm
            .as_deref()
            .is_some_and(|algorithm| algorithm.eq_ignore_ascii_case("MD5-sess"))
        {
            ha1 = md5_hex(&format!("{}:{}:{}", ha1, self.nonce, cnonce));
        }
        let ha2 = md5_hex(&format!("{}:{}", method, uri));
        if self.qop_auth {
            md5_hex(&format!(
                "{}:{}:{:08x}:{}:auth:{}",
                ha1, self.nonce, nc, cnonce, ha2
            ))
        } else {
            md5_hex(&format!("{}:{}:{}", ha1, self.nonce, ha2))
        }
    }

    /// 生成 `Authorization` 头的值。
    pub fn authorization(
        &self,
        method: &str,
        uri: &str,
        username: &str,
        password: &str,
        nc: u32,
        cnonce: &str,
    ) -> String {
        let response = self.response(method, uri, username, password, nc, cnonce);
        let mut value = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            username, self.realm, self.nonce, uri, response
        );
        if let Some(algorithm) = &self.algorithm {
            value.push_str(&format!(", algorithm={}", algorithm));
        }
        if self.qop_auth {
            value.push_str(&format!(", qop=auth, nc={:08x}, cnonce=\"{}\"", nc, cnonce));
        }
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        value
    }
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

/// 拆分 `key=value, key="quoted, value"` 列表。
fn split_params(params: &str) -> Vec<(String, String)> {
    let mut result = Vec::new();
    let mut chars = params.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let mut key = String::new();
        while let Some(c) = chars.peek() {
            if *c == '=' {
                break;
            }
            key.push(*c);
            chars.next();
        }
        if chars.next().is_none() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    other => value.push(other),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        result.push((key.trim().to_string(), value.trim().to_string()));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc2617_example() {
        let challenge = DigestChallenge::parse(
            r#"Digest realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#,
        )
        .expect("challenge");

        assert_eq!(challenge.realm, "testrealm@host.com");
        assert!(challenge.qop_auth);
        assert_eq!(
            challenge.opaque.as_deref(),
            Some("5ccc069c403ebaf9f0171e9517f40e41")
        );
        assert_eq!(
            challenge.response("GET", "/dir/index.html", "Mufasa", "Circle Of Life", 1, "0a4f113b"),
            "6629fae49393a05397450978507c4ef1"
        );
    }

    #[test]
    fn basic_challenge_rejected() {
        assert!(DigestChallenge::parse(r#"Basic realm="x""#).is_err());
    }

    #[test]
    fn missing_nonce_rejected() {
        assert!(DigestChallenge::parse(r#"Digest realm="x""#).is_err());
    }
}
