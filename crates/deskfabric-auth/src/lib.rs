//! Bearer token validation for client connections

pub mod jwt;

pub use jwt::{JwtClaims, JwtError, JwtValidator, TokenType};

// Re-export useful types
pub use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Validation};
