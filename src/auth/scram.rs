//! SCRAM-SHA-256 client exchange (RFC 5802 / RFC 7677).
//!
//! PostgreSQL 10+ defaults to SCRAM; the exchange rides inside
//! AuthenticationSASL / SASLResponse messages. Channel binding is not
//! offered (`n,,`), matching a non-TLS connection.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Client side of one SCRAM-SHA-256 exchange.
///
/// State accumulates across the three messages: `client_first` is available
/// immediately, `client_final` consumes the server-first message, and
/// `verify_server_final` checks the server signature afterwards.
pub struct ScramExchange {
    client_nonce: String,
    client_first_bare: String,
    auth_message: Option<String>,
    salted_password: Option<Vec<u8>>,
}

impl ScramExchange {
    pub fn start(username: &str) -> ScramExchange {
        let mut nonce = [0u8; 18];
        rand::rng().fill_bytes(&mut nonce);
        Self::start_with_nonce(username, &B64.encode(nonce))
    }

    fn start_with_nonce(username: &str, nonce: &str) -> ScramExchange {
        let user = sasl_escape_username(username);
        ScramExchange {
            client_nonce: nonce.to_string(),
            client_first_bare: format!("n={user},r={nonce}"),
            auth_message: None,
            salted_password: None,
        }
    }

    /// The client-first-message, GS2 header included.
    pub fn client_first(&self) -> String {
        format!("n,,{}", self.client_first_bare)
    }

    /// Consume the server-first-message and produce the
    /// client-final-message carrying the proof.
    pub fn client_final(&mut self, password: &str, server_first: &str) -> Result<String> {
        let fields = ServerFirst::parse(server_first)?;
        if !fields.nonce.starts_with(&self.client_nonce) {
            return Err(Error::Auth("SCRAM nonce mismatch".into()));
        }

        // base64("n,,") - the GS2 header echoed as channel binding data
        let without_proof = format!("c=biws,r={}", fields.nonce);
        let auth_message = format!("{},{server_first},{without_proof}", self.client_first_bare);

        let salted_password = hi_sha256(password.as_bytes(), &fields.salt, fields.iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(&client_key);
        let client_sig = hmac_sha256(stored_key.as_slice(), auth_message.as_bytes());

        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_sig.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let client_final = format!("{without_proof},p={}", B64.encode(proof));
        self.auth_message = Some(auth_message);
        self.salted_password = Some(salted_password);
        Ok(client_final)
    }

    /// Check the server signature from the server-final-message, proving
    /// the server also knows the password.
    pub fn verify_server_final(&self, server_final: &str) -> Result<()> {
        let (auth_message, salted_password) = match (&self.auth_message, &self.salted_password) {
            (Some(a), Some(s)) => (a, s),
            _ => return Err(Error::Auth("SCRAM verify before client-final".into())),
        };

        let v = server_final
            .split(',')
            .find_map(|p| p.strip_prefix("v="))
            .ok_or_else(|| Error::Auth("SCRAM final missing v".into()))?;
        let server_sig = B64
            .decode(v.trim().as_bytes())
            .map_err(|e| Error::Auth(format!("bad server signature b64: {e}")))?;

        let server_key = hmac_sha256(salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, auth_message.as_bytes());
        if server_sig != expected {
            return Err(Error::Auth("SCRAM server signature mismatch".into()));
        }
        Ok(())
    }
}

struct ServerFirst {
    nonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

impl ServerFirst {
    fn parse(server_first: &str) -> Result<ServerFirst> {
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(v) = part.strip_prefix("r=") {
                nonce = Some(v.to_string());
            } else if let Some(v) = part.strip_prefix("s=") {
                salt = Some(
                    B64.decode(v.as_bytes())
                        .map_err(|e| Error::Auth(format!("bad SCRAM salt b64: {e}")))?,
                );
            } else if let Some(v) = part.strip_prefix("i=") {
                iterations = v.parse::<u32>().ok();
            }
        }
        Ok(ServerFirst {
            nonce: nonce.ok_or_else(|| Error::Auth("SCRAM missing r".into()))?,
            salt: salt.ok_or_else(|| Error::Auth("SCRAM missing s".into()))?,
            iterations: iterations.ok_or_else(|| Error::Auth("SCRAM missing i".into()))?,
        })
    }
}

fn sasl_escape_username(u: &str) -> String {
    u.replace('=', "=3D").replace(',', "=2C")
}

/// RFC 5802 Hi(): iterated HMAC with XOR accumulation.
fn hi_sha256(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut block = Vec::with_capacity(salt.len() + 4);
    block.extend_from_slice(salt);
    block.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac_sha256(password, &block);
    let mut out = u.clone();
    for _ in 1..iterations {
        u = hmac_sha256(password, &u);
        for (o, ui) in out.iter_mut().zip(u.iter()) {
            *o ^= *ui;
        }
    }
    out
}

fn hmac_sha256(key: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_first_has_gs2_header_and_escaped_user() {
        let ex = ScramExchange::start("us=er,name");
        assert!(ex.client_first().starts_with("n,,n=us=3Der=2Cname,r="));
    }

    #[test]
    fn server_first_parsing() {
        let f = ServerFirst::parse("r=abc,s=Zm9v,i=4096").unwrap();
        assert_eq!(f.nonce, "abc");
        assert_eq!(f.salt, b"foo");
        assert_eq!(f.iterations, 4096);

        assert!(ServerFirst::parse("s=Zm9v,i=4096").is_err());
        assert!(ServerFirst::parse("r=abc,i=4096").is_err());
    }

    // RFC 7677 section 3 example exchange.
    #[test]
    fn rfc7677_vector() {
        let mut ex = ScramExchange::start_with_nonce("user", "rOprNGfwEbeRWgbNEkqO");
        assert_eq!(ex.client_first(), "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let server_first = "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
                            s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        let client_final = ex.client_final("pencil", server_first).unwrap();
        assert_eq!(
            client_final,
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
             p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );

        ex.verify_server_final("v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .unwrap();
        assert!(ex.verify_server_final("v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            .is_err());
    }

    #[test]
    fn nonce_mismatch_is_rejected() {
        let mut ex = ScramExchange::start_with_nonce("user", "clientnonce");
        let err = ex
            .client_final("pw", "r=othernonce,s=Zm9v,i=4096")
            .unwrap_err();
        assert!(err.to_string().contains("nonce mismatch"));
    }
}
