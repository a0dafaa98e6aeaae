use core::fmt;
use std::io;

const FIELD_MAX_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CredentialsError {
    InvalidUserId,
    InvalidUsername,
    InvalidPassword,
}

impl std::error::Error for CredentialsError {}

impl fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialsError::InvalidUserId => write!(f, "invalid user-id"),
            CredentialsError::InvalidUsername => write!(f, "invalid username"),
            CredentialsError::InvalidPassword => write!(f, "invalid password"),
        }
    }
}

impl From<CredentialsError> for io::Error {
    fn from(e: CredentialsError) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, e)
    }
}

/// SOCKS4 user-id: ASCII, at most 255 bytes, possibly empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserId(String);

impl UserId {
    pub fn new(user_id: impl Into<String>) -> Result<Self, CredentialsError> {
        let user_id = user_id.into();

        if !user_id.is_ascii() || user_id.len() > FIELD_MAX_LEN || user_id.contains('\0') {
            return Err(CredentialsError::InvalidUserId);
        }

        Ok(Self(user_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// SOCKS5 username/password pair as defined in RFC 1929: each field is
/// ASCII and 1 to 255 bytes long.
///
/// The bounds are checked here, once, so encoding can never fail or truncate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPass {
    username: String,
    password: String,
}

impl UserPass {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Result<Self, CredentialsError> {
        let username = username.into();
        let password = password.into();

        if username.is_empty() || username.len() > FIELD_MAX_LEN || !username.is_ascii() {
            return Err(CredentialsError::InvalidUsername);
        }

        if password.is_empty() || password.len() > FIELD_MAX_LEN || !password.is_ascii() {
            return Err(CredentialsError::InvalidPassword);
        }

        Ok(Self { username, password })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    #[test]
    fn user_id_bounds() {
        UserId::new("").unwrap();
        UserId::new("alice").unwrap();
        UserId::new("x".repeat(255)).unwrap();

        assert_eq!(UserId::new("x".repeat(256)).unwrap_err(), CredentialsError::InvalidUserId);
        assert_eq!(UserId::new("héllo").unwrap_err(), CredentialsError::InvalidUserId);
        assert_eq!(UserId::new("nul\0byte").unwrap_err(), CredentialsError::InvalidUserId);
    }

    #[test]
    fn user_pass_bounds() {
        UserPass::new("user", "pass").unwrap();
        UserPass::new("x".repeat(255), "x".repeat(255)).unwrap();

        assert_eq!(
            UserPass::new("", "pass").unwrap_err(),
            CredentialsError::InvalidUsername
        );
        assert_eq!(
            UserPass::new("x".repeat(256), "pass").unwrap_err(),
            CredentialsError::InvalidUsername
        );
        assert_eq!(UserPass::new("user", "").unwrap_err(), CredentialsError::InvalidPassword);
        assert_eq!(
            UserPass::new("user", "x".repeat(256)).unwrap_err(),
            CredentialsError::InvalidPassword
        );
    }
}
