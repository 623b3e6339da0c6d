//! Multi-factor authentication state and backup codes.

use std::fmt;

use rand::Rng;
use rand::rngs::OsRng;
use serde::Serialize;

use crate::error::ServerError;
use crate::totp::{Totp, TotpSecret};

/// Codes handed out with every new secret.
pub const BACKUP_CODE_COUNT: usize = 10;
const BACKUP_CODE_DIGITS: usize = 8;
const SEPARATOR: char = ',';

/// Single-use recovery codes, stored as one comma-joined column.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BackupCodes(Vec<String>);

impl BackupCodes {
    /// Draw [`BACKUP_CODE_COUNT`] distinct fixed-width numeric codes.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let upper = 10u32.pow(BACKUP_CODE_DIGITS as u32);
        let mut codes = Vec::with_capacity(BACKUP_CODE_COUNT);

        while codes.len() < BACKUP_CODE_COUNT {
            let code = format!(
                "{:0>width$}",
                rng.gen_range(0..upper),
                width = BACKUP_CODE_DIGITS
            );
            // Redraw on collision so one code never unlocks twice.
            if !codes.contains(&code) {
                codes.push(code);
            }
        }

        Self(codes)
    }

    /// Read the stored column.
    pub fn parse(column: &str) -> Self {
        Self(
            column
                .split(SEPARATOR)
                .map(str::trim)
                .filter(|code| !code.is_empty())
                .map(str::to_owned)
                .collect(),
        )
    }

    /// Value to store, `None` once every code has been used.
    pub fn to_column(&self) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.join(&SEPARATOR.to_string()))
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Look for `code` and return the set without it.
    ///
    /// Nothing is persisted here; the caller stores the remainder only when
    /// a code matched.
    pub fn consume(&self, code: &str) -> (bool, BackupCodes) {
        let code = code.trim();
        let mut matched = None;

        for (index, candidate) in self.0.iter().enumerate() {
            if matched.is_none()
                && constant_time_eq::constant_time_eq(candidate.as_bytes(), code.as_bytes())
            {
                matched = Some(index);
            }
        }

        match matched {
            Some(index) => {
                let mut remaining = self.0.clone();
                remaining.remove(index);
                (true, Self(remaining))
            },
            None => (false, self.clone()),
        }
    }
}

impl fmt::Debug for BackupCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackupCodes({} remaining)", self.0.len())
    }
}

/// MFA state of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MfaState {
    /// No secret stored.
    Disabled,
    /// A secret was issued but never confirmed by a valid code.
    Pending {
        secret: TotpSecret,
        codes: BackupCodes,
    },
    /// Confirmed and required at every login.
    Enabled {
        secret: TotpSecret,
        codes: BackupCodes,
    },
}

impl MfaState {
    /// Translate the nullable storage columns.
    ///
    /// An enabled account whose secret is missing or unreadable is an error:
    /// treating it as unenrolled would let the password alone re-enroll it.
    pub fn from_columns(
        enabled: bool,
        secret: Option<&str>,
        codes: Option<&str>,
    ) -> Result<Self, ServerError> {
        let codes = codes.map(BackupCodes::parse).unwrap_or_default();
        let secret = match secret.filter(|s| !s.is_empty()).map(TotpSecret::new) {
            Some(Ok(secret)) => secret,
            Some(Err(err)) if enabled => {
                return Err(ServerError::Internal {
                    details: "stored MFA secret is unreadable".into(),
                    source: Some(Box::new(err)),
                });
            },
            None if enabled => {
                return Err(ServerError::Internal {
                    details: "MFA flagged enabled without a secret".into(),
                    source: None,
                });
            },
            Some(Err(err)) => {
                tracing::warn!(error = %err, "unconfirmed MFA secret is unreadable, re-enrolling");
                return Ok(Self::Disabled);
            },
            None => return Ok(Self::Disabled),
        };

        if enabled {
            Ok(Self::Enabled { secret, codes })
        } else {
            Ok(Self::Pending { secret, codes })
        }
    }

    /// Check a submitted code against the TOTP secret first, then against
    /// the backup codes.
    pub fn verify(&self, totp: &Totp, code: &str) -> Verification {
        let (secret, codes) = match self {
            Self::Disabled => return Verification::Rejected,
            Self::Pending { secret, codes } | Self::Enabled { secret, codes } => {
                (secret, codes)
            },
        };

        if totp.verify(secret, code) {
            return Verification::Totp;
        }

        match codes.consume(code) {
            (true, remaining) => Verification::BackupCode {
                expected: codes.clone(),
                remaining,
            },
            (false, _) => Verification::Rejected,
        }
    }
}

/// Result of [`MfaState::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Totp,
    /// A backup code matched. `remaining` must replace `expected` in storage
    /// before the login counts.
    BackupCode {
        expected: BackupCodes,
        remaining: BackupCodes,
    },
    Rejected,
}

/// Material shown once to the user when a secret is issued.
#[derive(Debug, Clone, Serialize)]
pub struct Enrollment {
    #[serde(skip)]
    pub secret: TotpSecret,
    #[serde(rename = "secret")]
    pub encoded_secret: String,
    #[serde(rename = "qr_code_url")]
    pub provisioning_uri: String,
    pub backup_codes: Vec<String>,
}

impl Enrollment {
    /// Issue a new secret and backup codes for `account`.
    pub fn issue(totp: &Totp, account: &str) -> (Self, BackupCodes) {
        let (secret, provisioning_uri) = totp.generate_secret(account);
        let codes = BackupCodes::generate();

        (
            Self {
                encoded_secret: secret.as_str().to_owned(),
                secret,
                provisioning_uri,
                backup_codes: codes.as_slice().to_vec(),
            },
            codes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_codes_shape() {
        let codes = BackupCodes::generate();

        assert_eq!(codes.len(), BACKUP_CODE_COUNT);
        for code in codes.as_slice() {
            assert_eq!(code.len(), BACKUP_CODE_DIGITS);
            assert!(code.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn test_backup_code_single_use() {
        let codes = BackupCodes::generate();
        let code = codes.as_slice()[3].clone();

        let (matched, remaining) = codes.consume(&code);
        assert!(matched);
        assert_eq!(remaining.len(), BACKUP_CODE_COUNT - 1);

        let (matched, again) = remaining.consume(&code);
        assert!(!matched);
        assert_eq!(again, remaining);
    }

    #[test]
    fn test_backup_codes_are_distinct() {
        for _ in 0..200 {
            let codes = BackupCodes::generate();
            let mut sorted = codes.as_slice().to_vec();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted.len(), BACKUP_CODE_COUNT);
        }
    }

    #[test]
    fn test_consume_trims_input() {
        let codes = BackupCodes::parse("11111111,22222222");
        let (matched, remaining) = codes.consume(" 22222222 ");

        assert!(matched);
        assert_eq!(remaining.to_column().as_deref(), Some("11111111"));
    }

    #[test]
    fn test_column_round_trip() {
        let codes = BackupCodes::parse("12345678, 87654321,,");
        assert_eq!(codes.len(), 2);
        assert_eq!(codes.to_column().as_deref(), Some("12345678,87654321"));

        let (_, empty) = BackupCodes::parse("12345678").consume("12345678");
        assert!(empty.is_empty());
        assert_eq!(empty.to_column(), None);
    }

    #[test]
    fn test_state_from_columns() {
        let secret = TotpSecret::generate();

        assert_eq!(MfaState::from_columns(false, None, None).unwrap(), MfaState::Disabled);
        assert!(matches!(
            MfaState::from_columns(false, Some(secret.as_str()), Some("12345678")),
            Ok(MfaState::Pending { .. })
        ));
        assert!(matches!(
            MfaState::from_columns(true, Some(secret.as_str()), None),
            Ok(MfaState::Enabled { .. })
        ));
    }

    #[test]
    fn test_enabled_state_fails_closed() {
        assert!(matches!(
            MfaState::from_columns(true, None, None),
            Err(ServerError::Internal { .. })
        ));
        assert!(matches!(
            MfaState::from_columns(true, Some("not base32 !!"), Some("12345678")),
            Err(ServerError::Internal { .. })
        ));

        // Never confirmed, so issuing a new secret is harmless.
        assert_eq!(
            MfaState::from_columns(false, Some("not base32 !!"), None).unwrap(),
            MfaState::Disabled
        );
    }

    #[test]
    fn test_verify_prefers_totp_then_backup() {
        let totp = Totp::default();
        let secret = TotpSecret::generate();
        let state = MfaState::Enabled {
            secret: secret.clone(),
            codes: BackupCodes::parse("12345678,87654321"),
        };

        let code = totp.generate(&secret).unwrap();
        assert_eq!(state.verify(&totp, &code), Verification::Totp);

        match state.verify(&totp, "87654321") {
            Verification::BackupCode { expected, remaining } => {
                assert_eq!(expected.len(), 2);
                assert_eq!(remaining.to_column().as_deref(), Some("12345678"));
            },
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(state.verify(&totp, "00000000"), Verification::Rejected);
        assert_eq!(MfaState::Disabled.verify(&totp, &code), Verification::Rejected);
    }

    #[test]
    fn test_enrollment_payload() {
        let (enrollment, codes) = Enrollment::issue(&Totp::default(), "bob@example.com");
        let json = serde_json::to_value(&enrollment).unwrap();

        assert_eq!(json["secret"], enrollment.secret.as_str());
        assert!(json["qr_code_url"].as_str().unwrap().starts_with("otpauth://totp/"));
        assert_eq!(json["backup_codes"].as_array().unwrap().len(), codes.len());
    }
}
