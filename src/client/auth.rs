// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Auth engine: Basic and Digest (RFC 2617) authentication against the
//! challenge in a `WWW-Authenticate` header.
//!
//! Digests are computed directly via the `md5` crate rather than a
//! higher-level digest-auth library, since the nonce-count/cnonce state
//! needs to reset explicitly on nonce change and stay inspectable in tests.
//! See `DESIGN.md` for the dependency rationale.

use rand::RngCore;

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone)]
pub enum Challenge {
    Basic { realm: String },
    Digest(DigestChallenge),
}

#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// RFC 2617 optional field; echoed back in the response only when the
    /// challenge actually specified one.
    pub algorithm: Option<String>,
    pub qop: Vec<String>,
    pub stale: bool,
}

/// Splits a comma-separated `key=value` list, treating commas inside
/// double-quoted values as literal.
fn split_params(s: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b',') {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let key = s[key_start..i].trim().to_string();
        i += 1; // skip '='
        let value;
        if i < bytes.len() && bytes[i] == b'"' {
            i += 1;
            let val_start = i;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            value = s[val_start..i].to_string();
            i += 1; // skip closing quote
        } else {
            let val_start = i;
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
            value = s[val_start..i].trim().to_string();
        }
        out.push((key.to_ascii_lowercase(), value));
    }
    out
}

/// Parses the value of a `WWW-Authenticate` header (without the header
/// name), eg `Digest realm="R", nonce="N", qop="auth"`.
pub fn parse_challenge(header_value: &str) -> Result<Challenge, String> {
    let header_value = header_value.trim();
    let (scheme, rest) = header_value
        .split_once(' ')
        .ok_or_else(|| "malformed WWW-Authenticate: no scheme".to_string())?;
    match scheme {
        s if s.eq_ignore_ascii_case("basic") => {
            let params = split_params(rest);
            let realm = params
                .into_iter()
                .find(|(k, _)| k == "realm")
                .map(|(_, v)| v)
                .unwrap_or_default();
            Ok(Challenge::Basic { realm })
        }
        s if s.eq_ignore_ascii_case("digest") => {
            let params = split_params(rest);
            let mut realm = None;
            let mut nonce = None;
            let mut opaque = None;
            let mut algorithm = None;
            let mut qop = Vec::new();
            let mut stale = false;
            for (k, v) in params {
                match k.as_str() {
                    "realm" => realm = Some(v),
                    "nonce" => nonce = Some(v),
                    "opaque" => opaque = Some(v),
                    "algorithm" => algorithm = Some(v),
                    "qop" => qop = v.split(',').map(|s| s.trim().to_string()).collect(),
                    "stale" => stale = v.eq_ignore_ascii_case("true"),
                    _ => {}
                }
            }
            let realm = realm.ok_or_else(|| "Digest challenge missing realm".to_string())?;
            let nonce = nonce.ok_or_else(|| "Digest challenge missing nonce".to_string())?;
            Ok(Challenge::Digest(DigestChallenge {
                realm,
                nonce,
                opaque,
                algorithm,
                qop,
                stale,
            }))
        }
        other => Err(format!("unsupported auth scheme {:?}", other)),
    }
}

/// Finds and parses the `WWW-Authenticate` header in a set of response
/// headers (case-insensitive key lookup).
pub fn find_challenge<'a>(headers: impl IntoIterator<Item = (&'a str, &'a str)>) -> Option<Challenge> {
    headers
        .into_iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("www-authenticate"))
        .and_then(|(_, v)| parse_challenge(v).ok())
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

fn md5_hex(parts: &[&[u8]]) -> String {
    let mut ctx = md5::Context::new();
    for (i, p) in parts.iter().enumerate() {
        if i > 0 {
            ctx.consume(b":");
        }
        ctx.consume(p);
    }
    format!("{:x}", ctx.compute())
}

/// Generates a 16-hex-digit cnonce using a CSPRNG, falling back to a
/// time-derived value if cryptographic randomness is unavailable.
fn gen_cnonce() -> String {
    let mut bytes = [0u8; 8];
    match rand::rngs::OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => {}
        Err(_) => {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            bytes.copy_from_slice(&(nanos as u64).to_be_bytes());
        }
    }
    hex::encode(bytes)
}

/// Per-session cached auth state: the last challenge seen, the digest
/// nonce-count, and the cnonce. A nonce change resets `nc` to zero and
/// drops the cnonce so the next request generates a fresh one.
#[derive(Default)]
pub struct AuthState {
    challenge: Option<Challenge>,
    nc: u32,
    cnonce: Option<String>,
    last_nonce: Option<String>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_challenge(&self) -> bool {
        self.challenge.is_some()
    }

    pub fn set_challenge(&mut self, challenge: Challenge) {
        let new_nonce = match &challenge {
            Challenge::Digest(d) => Some(d.nonce.clone()),
            Challenge::Basic { .. } => None,
        };
        if new_nonce != self.last_nonce {
            self.nc = 0;
            self.cnonce = None;
            self.last_nonce = new_nonce;
        }
        self.challenge = Some(challenge);
    }

    /// Current nonce-count, for tests/inspection.
    #[cfg(test)]
    fn nc(&self) -> u32 {
        self.nc
    }

    /// Builds the `Authorization` header value for `method`/`uri` using the
    /// cached challenge and the given credentials.
    pub fn authorization_header(
        &mut self,
        method: &str,
        uri: &str,
        creds: &Credentials,
    ) -> Option<String> {
        match self.challenge.clone()? {
            Challenge::Basic { .. } => {
                let raw = format!("{}:{}", creds.username, creds.password);
                Some(format!("Basic {}", base64::encode(raw)))
            }
            Challenge::Digest(d) => {
                let ha1 = md5_hex(&[
                    creds.username.as_bytes(),
                    d.realm.as_bytes(),
                    creds.password.as_bytes(),
                ]);
                let ha2 = md5_hex(&[method.as_bytes(), uri.as_bytes()]);

                if d.qop.is_empty() {
                    let response = md5_hex(&[ha1.as_bytes(), d.nonce.as_bytes(), ha2.as_bytes()]);
                    let mut header = format!(
                        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
                        creds.username, d.realm, d.nonce, uri, response
                    );
                    if let Some(opaque) = &d.opaque {
                        header.push_str(&format!(", opaque=\"{}\"", opaque));
                    }
                    if let Some(algorithm) = &d.algorithm {
                        header.push_str(&format!(", algorithm={}", algorithm));
                    }
                    Some(header)
                } else {
                    let qop = d
                        .qop
                        .iter()
                        .find(|q| q.as_str() == "auth")
                        .cloned()
                        .unwrap_or_else(|| d.qop[0].clone());
                    self.nc += 1;
                    let cnonce = self.cnonce.get_or_insert_with(gen_cnonce).clone();
                    let nc_str = format!("{:08x}", self.nc);
                    let response = md5_hex(&[
                        ha1.as_bytes(),
                        d.nonce.as_bytes(),
                        nc_str.as_bytes(),
                        cnonce.as_bytes(),
                        qop.as_bytes(),
                        ha2.as_bytes(),
                    ]);
                    let mut header = format!(
                        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
                        creds.username, d.realm, d.nonce, uri, response
                    );
                    if let Some(opaque) = &d.opaque {
                        header.push_str(&format!(", opaque=\"{}\"", opaque));
                    }
                    if let Some(algorithm) = &d.algorithm {
                        header.push_str(&format!(", algorithm={}", algorithm));
                    }
                    header.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop, nc_str, cnonce));
                    Some(header)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_digest_with_quoted_commas() {
        let v = r#"Digest realm="Has, a comma", nonce="N", qop="auth,auth-int""#;
        let c = parse_challenge(v).unwrap();
        match c {
            Challenge::Digest(d) => {
                assert_eq!(d.realm, "Has, a comma");
                assert_eq!(d.nonce, "N");
                assert_eq!(d.qop, vec!["auth", "auth-int"]);
            }
            _ => panic!("expected digest"),
        }
    }

    #[test]
    fn algorithm_is_none_when_challenge_omits_it() {
        let v = r#"Digest realm="R", nonce="N""#;
        let c = parse_challenge(v).unwrap();
        match c {
            Challenge::Digest(d) => assert_eq!(d.algorithm, None),
            _ => panic!("expected digest"),
        }
    }

    #[test]
    fn algorithm_field_omitted_from_header_when_not_challenged() {
        let mut state = AuthState::new();
        state.set_challenge(Challenge::Digest(DigestChallenge {
            realm: "R".into(),
            nonce: "N".into(),
            opaque: None,
            algorithm: None,
            qop: vec![],
            stale: false,
        }));
        let creds = Credentials {
            username: "u".into(),
            password: "p".into(),
        };
        let h = state.authorization_header("DESCRIBE", "rtsp://host/", &creds).unwrap();
        assert!(!h.contains("algorithm"));
    }

    #[test]
    fn basic_header_is_base64_userpass() {
        let mut state = AuthState::new();
        state.set_challenge(Challenge::Basic { realm: "R".into() });
        let creds = Credentials {
            username: "u".into(),
            password: "p".into(),
        };
        let h = state.authorization_header("DESCRIBE", "rtsp://x/", &creds).unwrap();
        assert_eq!(h, format!("Basic {}", base64::encode("u:p")));
    }

    #[test]
    fn digest_no_qop_matches_rfc2069_formula() {
        let mut state = AuthState::new();
        state.set_challenge(Challenge::Digest(DigestChallenge {
            realm: "R".into(),
            nonce: "N".into(),
            opaque: None,
            algorithm: Some("MD5".into()),
            qop: vec![],
            stale: false,
        }));
        let creds = Credentials {
            username: "u".into(),
            password: "p".into(),
        };
        let h = state
            .authorization_header("DESCRIBE", "rtsp://host/stream", &creds)
            .unwrap();
        let ha1 = md5_hex(&[b"u", b"R", b"p"]);
        let ha2 = md5_hex(&[b"DESCRIBE", b"rtsp://host/stream"]);
        let expected_response = md5_hex(&[ha1.as_bytes(), b"N", ha2.as_bytes()]);
        assert!(h.contains(&format!("response=\"{}\"", expected_response)));
    }

    #[test]
    fn digest_qop_increments_nc_and_keeps_cnonce() {
        let mut state = AuthState::new();
        state.set_challenge(Challenge::Digest(DigestChallenge {
            realm: "R".into(),
            nonce: "N".into(),
            opaque: None,
            algorithm: Some("MD5".into()),
            qop: vec!["auth".into()],
            stale: false,
        }));
        let creds = Credentials {
            username: "u".into(),
            password: "p".into(),
        };
        let h1 = state.authorization_header("DESCRIBE", "rtsp://host/", &creds).unwrap();
        assert!(h1.contains("nc=00000001"));
        let cnonce1 = extract(&h1, "cnonce");
        let h2 = state.authorization_header("DESCRIBE", "rtsp://host/", &creds).unwrap();
        assert!(h2.contains("nc=00000002"));
        assert_eq!(extract(&h2, "cnonce"), cnonce1, "cnonce is stable across reuse of same nonce");
        assert_eq!(state.nc(), 2);
    }

    #[test]
    fn nonce_change_resets_nc_and_cnonce() {
        let mut state = AuthState::new();
        state.set_challenge(Challenge::Digest(DigestChallenge {
            realm: "R".into(),
            nonce: "N1".into(),
            opaque: None,
            algorithm: Some("MD5".into()),
            qop: vec!["auth".into()],
            stale: false,
        }));
        let creds = Credentials {
            username: "u".into(),
            password: "p".into(),
        };
        let h1 = state.authorization_header("DESCRIBE", "rtsp://host/", &creds).unwrap();
        let cnonce1 = extract(&h1, "cnonce");

        state.set_challenge(Challenge::Digest(DigestChallenge {
            realm: "R".into(),
            nonce: "N2".into(),
            opaque: None,
            algorithm: Some("MD5".into()),
            qop: vec!["auth".into()],
            stale: false,
        }));
        let h2 = state.authorization_header("DESCRIBE", "rtsp://host/", &creds).unwrap();
        assert!(h2.contains("nc=00000001"));
        assert_ne!(extract(&h2, "cnonce"), cnonce1);
    }

    fn extract<'a>(header: &'a str, key: &str) -> &'a str {
        let marker = format!("{}=\"", key);
        let start = header.find(&marker).unwrap() + marker.len();
        let end = header[start..].find('"').unwrap() + start;
        &header[start..end]
    }
}
