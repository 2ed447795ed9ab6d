//! API credential lookup for the live service.
//!
//! Resolution order:
//! 1. `GEMINI_API_KEY` environment variable (a `.env` file is loaded at startup)
//! 2. OS keyring entry (libsecret / Keychain / Credential Manager)
//!
//! Security notes:
//! - Never log the key value
//! - Always use masked display

use keyring::Entry;

const ENV_VAR: &str = "GEMINI_API_KEY";
const SERVICE_NAME: &str = "live-voice";
const KEY_NAME: &str = "gemini-api-key";

/// Resolve the API key, if one is configured anywhere.
pub fn get_api_key() -> Option<String> {
    key_from_env().or_else(key_from_keyring)
}

fn key_from_env() -> Option<String> {
    non_empty(std::env::var(ENV_VAR).ok())
}

fn key_from_keyring() -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, KEY_NAME) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("Credentials: failed to create keyring entry: {}", e);
            return None;
        }
    };

    match entry.get_password() {
        Ok(key) => non_empty(Some(key)),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            log::warn!("Credentials: failed to retrieve key: {}", e);
            None
        }
    }
}

fn non_empty(key: Option<String>) -> Option<String> {
    key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty())
}

/// Store the API key in the system keyring.
/// Pass None to delete the key.
pub fn set_api_key(key: Option<&str>) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, KEY_NAME)
        .map_err(|e| format!("Failed to create keyring entry: {}", e))?;

    match key.map(str::trim) {
        Some(k) if !k.is_empty() => {
            entry
                .set_password(k)
                .map_err(|e| format!("Failed to store API key: {}", e))?;
            log::info!("Credentials: stored new API key");
        }
        _ => match entry.delete_credential() {
            Ok(()) => log::info!("Credentials: deleted API key"),
            Err(keyring::Error::NoEntry) => {}
            Err(e) => return Err(format!("Failed to delete API key: {}", e)),
        },
    }

    Ok(())
}

/// Masked form of a key for display (e.g. "AIz...abc123")
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 6..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

/// Masked form of the configured key, if any
pub fn masked_api_key() -> Option<String> {
    get_api_key().map(|key| mask_key(&key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("short"), "*****");
        assert_eq!(mask_key("AIzaSyExample123456"), "AIz...123456");
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(None), None);
        assert_eq!(non_empty(Some("   ".to_string())), None);
        assert_eq!(non_empty(Some(" key ".to_string())), Some("key".to_string()));
    }
}
