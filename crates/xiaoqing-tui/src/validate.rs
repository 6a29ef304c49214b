//! Local checks run before any account request is sent.

pub const PHONE_LEN: usize = 11;
pub const MIN_PASSWORD_LEN: usize = 6;

pub fn phone(input: &str) -> Result<(), String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("Please enter a phone number".to_string());
    }
    if input.chars().count() != PHONE_LEN || !input.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("A phone number has {} digits", PHONE_LEN));
    }
    Ok(())
}

pub fn password(input: &str) -> Result<(), String> {
    if input.is_empty() {
        return Err("Please enter a password".to_string());
    }
    if input.chars().count() < MIN_PASSWORD_LEN {
        return Err(format!("Passwords need at least {} characters", MIN_PASSWORD_LEN));
    }
    Ok(())
}

pub fn code(input: &str) -> Result<(), String> {
    if input.trim().is_empty() {
        return Err("Please enter the verification code".to_string());
    }
    Ok(())
}
