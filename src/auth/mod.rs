//! Bearer-token validation. Tokens are issued by the account service with
//! the shared HS256 secret; this crate only verifies them.

pub mod jwt;
pub mod middleware;
