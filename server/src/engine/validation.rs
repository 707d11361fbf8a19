/// Maximum text message length (bytes).
pub const MAX_MESSAGE_LENGTH: usize = 4000;

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 50;

/// Maximum channel description length.
pub const MAX_DESCRIPTION_LENGTH: usize = 500;

/// Maximum username length.
pub const MAX_USERNAME_LENGTH: usize = 32;

/// Maximum image URL / storage path length.
pub const MAX_URL_LENGTH: usize = 2048;

/// Maximum password length accepted before hashing.
pub const MAX_PASSWORD_LENGTH: usize = 128;

/// Pub/sub topics starting with this prefix are reserved for the server.
pub const RESERVED_PREFIX: &str = "__";

/// Validate a username. Must be 1-32 chars, alphanumeric + underscore/hyphen.
pub fn validate_username(username: &str) -> Result<(), String> {
    if username.is_empty() {
        return Err("Username cannot be empty".into());
    }
    if username.len() > MAX_USERNAME_LENGTH {
        return Err(format!(
            "Username too long (max {} characters)",
            MAX_USERNAME_LENGTH
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err("Username can only contain letters, numbers, underscores, and hyphens".into());
    }
    Ok(())
}

/// Validate a channel name. Must be 1-50 chars, no whitespace, not reserved.
pub fn validate_channel_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("Channel name cannot be empty".into());
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err(format!(
            "Channel name too long (max {} characters)",
            MAX_CHANNEL_NAME_LENGTH
        ));
    }
    if name.chars().any(char::is_whitespace) {
        return Err("Channel name cannot contain spaces".into());
    }
    if name.starts_with(RESERVED_PREFIX) {
        return Err("Channel name is reserved".into());
    }
    Ok(())
}

/// Validate a channel description. May be empty.
pub fn validate_description(description: &str) -> Result<(), String> {
    if description.len() > MAX_DESCRIPTION_LENGTH {
        return Err(format!(
            "Description too long (max {} characters)",
            MAX_DESCRIPTION_LENGTH
        ));
    }
    Ok(())
}

/// Validate a password (account or channel).
pub fn validate_password(password: &str) -> Result<(), String> {
    if password.is_empty() {
        return Err("Password cannot be empty".into());
    }
    if password.len() > MAX_PASSWORD_LENGTH {
        return Err(format!(
            "Password too long (max {} characters)",
            MAX_PASSWORD_LENGTH
        ));
    }
    Ok(())
}

/// Validate text content. Must be non-empty and under the length limit.
pub fn validate_text(text: &str) -> Result<(), String> {
    if text.trim().is_empty() {
        return Err("Message cannot be empty".into());
    }
    if text.len() > MAX_MESSAGE_LENGTH {
        return Err(format!(
            "Message too long (max {} characters)",
            MAX_MESSAGE_LENGTH
        ));
    }
    Ok(())
}

/// Validate an image reference produced by the uploader.
pub fn validate_image_url(url: &str) -> Result<(), String> {
    if url.trim().is_empty() {
        return Err("Image URL cannot be empty".into());
    }
    if url.len() > MAX_URL_LENGTH {
        return Err(format!("Image URL too long (max {} characters)", MAX_URL_LENGTH));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_usernames() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("bob_99").is_ok());
        assert!(validate_username("c-d").is_ok());
    }

    #[test]
    fn test_invalid_usernames() {
        assert!(validate_username("").is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username("semi;colon").is_err());
        assert!(validate_username(&"a".repeat(33)).is_err());
    }

    #[test]
    fn test_valid_channel_names() {
        assert!(validate_channel_name("general").is_ok());
        assert!(validate_channel_name("v").is_ok());
        assert!(validate_channel_name("dev-talk").is_ok());
    }

    #[test]
    fn test_invalid_channel_names() {
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("   ").is_err());
        assert!(validate_channel_name("two words").is_err());
        assert!(validate_channel_name("__system__").is_err());
        assert!(validate_channel_name(&"c".repeat(51)).is_err());
    }

    #[test]
    fn test_text_validation() {
        assert!(validate_text("hi").is_ok());
        assert!(validate_text("").is_err());
        assert!(validate_text("  \n").is_err());
        assert!(validate_text(&"x".repeat(MAX_MESSAGE_LENGTH)).is_ok());
        assert!(validate_text(&"x".repeat(MAX_MESSAGE_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_image_and_password_validation() {
        assert!(validate_image_url("uploads/a.png").is_ok());
        assert!(validate_image_url("").is_err());
        assert!(validate_password("s3cret").is_ok());
        assert!(validate_password("").is_err());
        assert!(validate_description("").is_ok());
        assert!(validate_description(&"d".repeat(501)).is_err());
    }
}
