use rand::distributions::Alphanumeric;
use rand::Rng;

pub const GAME_ID_LENGTH: usize = 10;
pub const PLAYER_ID_LENGTH: usize = 8;
pub const CREDENTIAL_LENGTH: usize = 16;

// Random alphanumeric id used for games, players and credentials
pub fn random_id(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

// Constant-time comparison for game credentials
pub fn credentials_match(expected: &str, given: &str) -> bool {
    if expected.len() != given.len() {
        return false;
    }
    expected
        .bytes()
        .zip(given.bytes())
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}
