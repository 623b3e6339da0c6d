//! Password composition policy.

/// Characters accepted as "special".
pub const SPECIAL_CHARACTERS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";
/// Shortest password accepted anywhere.
pub const MIN_LENGTH: usize = 12;
/// Argon2 input bound.
pub const MAX_LENGTH: usize = 255;

/// First rule a candidate password broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("Password must contain at least {0} characters.")]
    TooShort(usize),
    #[error("Password must contain at most {0} characters.")]
    TooLong(usize),
    #[error("Password must contain at least one uppercase letter.")]
    MissingUppercase,
    #[error("Password must contain at least one lowercase letter.")]
    MissingLowercase,
    #[error("Password must contain at least one digit.")]
    MissingDigit,
    #[error("Password must contain at least one special character.")]
    MissingSpecial,
}

/// Stateless password validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordPolicy {
    min_length: usize,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: MIN_LENGTH,
        }
    }
}

impl PasswordPolicy {
    /// Create a new [`PasswordPolicy`]. The minimum never drops under
    /// [`MIN_LENGTH`].
    pub fn new(min_length: usize) -> Self {
        Self {
            min_length: min_length.clamp(MIN_LENGTH, MAX_LENGTH),
        }
    }

    pub fn min_length(&self) -> usize {
        self.min_length
    }

    /// Check every rule in order and return the first one broken.
    pub fn validate(&self, candidate: &str) -> Result<(), PolicyError> {
        let length = candidate.chars().count();

        if length < self.min_length {
            return Err(PolicyError::TooShort(self.min_length));
        }
        if length > MAX_LENGTH {
            return Err(PolicyError::TooLong(MAX_LENGTH));
        }
        if !candidate.chars().any(|c| c.is_uppercase()) {
            return Err(PolicyError::MissingUppercase);
        }
        if !candidate.chars().any(|c| c.is_lowercase()) {
            return Err(PolicyError::MissingLowercase);
        }
        if !candidate.chars().any(|c| c.is_ascii_digit()) {
            return Err(PolicyError::MissingDigit);
        }
        if !candidate.chars().any(|c| SPECIAL_CHARACTERS.contains(c)) {
            return Err(PolicyError::MissingSpecial);
        }

        Ok(())
    }
}
