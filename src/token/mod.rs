//! Bearer-token capabilities for the proxy's Authorization header
//!
//! Token acquisition itself is external to the tunnel: anything that can
//! produce a bearer string with a type qualifier implements
//! [`TokenSource`]. A static source and a command-backed source (for
//! helpers like `gcloud auth print-access-token`) are provided.

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

/// Token source errors
#[derive(Debug, Clone, Error)]
pub enum TokenError {
    #[error("token command failed: {0}")]
    Command(String),

    #[error("token source error: {0}")]
    Source(String),
}

/// A bearer token with its type qualifier
#[derive(Debug, Clone)]
pub struct Token {
    access_token: String,
    token_type: String,
}

impl Token {
    pub fn new(access_token: impl Into<String>, token_type: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: token_type.into(),
        }
    }

    /// A token with the `Bearer` type qualifier.
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self::new(access_token, "Bearer")
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// The `Authorization` header value: `<type> <access-token>`.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

/// A capability that yields a bearer token on demand
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<Token, TokenError>;
}

/// Token source returning a fixed token
pub struct StaticTokenSource {
    token: Token,
}

impl StaticTokenSource {
    pub fn new(token: Token) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<Token, TokenError> {
        Ok(self.token.clone())
    }
}

/// Token source running an external command that prints an access token
///
/// The command line is split on whitespace; the first word is the program.
/// Trailing whitespace in the output is trimmed.
pub struct CommandTokenSource {
    program: String,
    args: Vec<String>,
    token_type: String,
}

impl CommandTokenSource {
    pub fn new(command_line: &str, token_type: impl Into<String>) -> Result<Self, TokenError> {
        let mut words = command_line.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| TokenError::Source("empty token command".to_string()))?;

        Ok(Self {
            program,
            args: words.collect(),
            token_type: token_type.into(),
        })
    }
}

#[async_trait]
impl TokenSource for CommandTokenSource {
    async fn token(&self) -> Result<Token, TokenError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .await
            .map_err(|e| TokenError::Command(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(TokenError::Command(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(TokenError::Command(format!(
                "{} produced no token",
                self.program
            )));
        }

        Ok(Token::new(token, self.token_type.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_header() {
        let token = Token::bearer("abc123");
        assert_eq!(token.authorization(), "Bearer abc123");

        let token = Token::new("xyz", "MAC");
        assert_eq!(token.authorization(), "MAC xyz");
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticTokenSource::new(Token::bearer("fixed"));
        let token = source.token().await.unwrap();
        assert_eq!(token.access_token(), "fixed");
        assert_eq!(token.token_type(), "Bearer");
    }

    #[tokio::test]
    async fn test_command_source_trims_output() {
        let source = CommandTokenSource::new("echo my-token", "Bearer").unwrap();
        let token = source.token().await.unwrap();
        assert_eq!(token.access_token(), "my-token");
    }

    #[tokio::test]
    async fn test_command_source_failure() {
        let source = CommandTokenSource::new("false", "Bearer").unwrap();
        assert!(matches!(
            source.token().await,
            Err(TokenError::Command(_))
        ));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandTokenSource::new("   ", "Bearer").is_err());
    }
}
