use std::process::Command;

use crypto::digest::Digest;
use crypto::sha2::Sha256;
use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

pub fn sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.input(input.as_bytes());
    hasher.result_str()
}

pub fn uuid() -> String {
    Uuid::new_v4().to_string()
}

pub fn rand_string(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .collect::<String>()
        .to_lowercase()
}

/// Session cookie value. 16 alphanumerics keeps it comfortably above
/// 64 bits of entropy while staying printable.
pub fn session_id() -> String {
    rand_string(16)
}

/// Login salt, a random 32-bit integer rendered as a decimal string.
pub fn salt() -> String {
    let n: u32 = rand::thread_rng().gen();
    n.to_string()
}

pub fn get_hostname() -> Option<String> {
    let output = match Command::new("hostname").output() {
        Ok(ok) => ok,
        Err(_) => {
            return None;
        }
    };

    let stdout = match String::from_utf8(output.stdout) {
        Ok(ok) => ok,
        Err(_) => {
            return None;
        }
    };

    Some(stdout.trim().to_string())
}
