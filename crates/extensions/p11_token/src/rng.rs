//! Randomness drawn from the token.
//!
//! Nothing is buffered: every request is forwarded to `C_GenerateRandom` and consumes token
//! entropy.

use crate::error::TokenError;
use crate::service::TokenSession;
use tracing::error;

/// Status returned by the RNG callback shape when the token fails to produce random bytes.
pub const TLS_ERROR_RNG: i32 = -2002;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Failed to generate random bytes")]
pub struct RngError(#[source] pub TokenError);

impl RngError {
    /// The non-zero status reported to callers expecting `(ctx, out, len) -> int`.
    pub fn status(&self) -> i32 {
        TLS_ERROR_RNG
    }
}

/// Fills `out` with random bytes from the token.
///
/// A zero-length request succeeds without calling the token.
pub fn fill_random(session: &dyn TokenSession, out: &mut [u8]) -> Result<(), RngError> {
    if out.is_empty() {
        return Ok(());
    }

    session.generate_random(out).map_err(|err| {
        error!(code = err.code, %err, "Failed to generate random bytes");
        RngError(err)
    })
}

/// A fallible cryptographic RNG backed by a token session.
pub struct TokenRng<'a> {
    session: &'a dyn TokenSession,
}

impl<'a> TokenRng<'a> {
    pub fn new(session: &'a dyn TokenSession) -> Self {
        TokenRng { session }
    }
}

impl rand::TryRngCore for TokenRng<'_> {
    type Error = RngError;

    fn try_next_u32(&mut self) -> Result<u32, Self::Error> {
        let mut buf = [0; 4];
        fill_random(self.session, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn try_next_u64(&mut self) -> Result<u64, Self::Error> {
        let mut buf = [0; 8];
        fill_random(self.session, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn try_fill_bytes(&mut self, dst: &mut [u8]) -> Result<(), Self::Error> {
        fill_random(self.session, dst)
    }
}

impl rand::TryCryptoRng for TokenRng<'_> {}
