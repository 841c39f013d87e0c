use crate::Error;

/// Minimum length accepted for the keyed-PRF secrets.
pub const SECRET_LEN: usize = 32;

/// Generate an ephemeral secret from the system CSPRNG.
///
/// Used when no secret is configured; tokens and derived connection ids then
/// do not survive a process restart.
pub fn generate_secret() -> Result<[u8; SECRET_LEN], Error> {
    let mut secret = [0u8; SECRET_LEN];
    aws_lc_rs::rand::fill(&mut secret).map_err(|_| Error::SystemError)?;
    Ok(secret)
}
