use crate::error::{ClientError, ClientResult};

const LOGIN_MIN_LEN: usize = 3;
const LOGIN_MAX_LEN: usize = 20;
const PASSWORD_MIN_LEN: usize = 8;
/// Sign-in caps passwords lower than registration does.
const LOGIN_PASSWORD_MAX_LEN: usize = 20;
const NEW_PASSWORD_MAX_LEN: usize = 63;
const DISPLAY_NAME_MIN_LEN: usize = 3;
const DISPLAY_NAME_MAX_LEN: usize = 20;

pub fn validate_login(login: &str) -> ClientResult<()> {
    let len = login.chars().count();
    if !(LOGIN_MIN_LEN..=LOGIN_MAX_LEN).contains(&len) {
        return Err(ClientError::Validation(format!(
            "login must be {LOGIN_MIN_LEN} to {LOGIN_MAX_LEN} characters"
        )));
    }
    let mut chars = login.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return Err(ClientError::Validation(
            "login must start with a latin letter".into(),
        ));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(ClientError::Validation(
            "login may contain only latin letters, digits, '_' and '-'".into(),
        ));
    }
    Ok(())
}

/// Password typed on the sign-in screen.
pub fn validate_password(password: &str) -> ClientResult<()> {
    check_password(password, LOGIN_PASSWORD_MAX_LEN)
}

/// Password chosen at registration or on a password change.
pub fn validate_new_password(password: &str) -> ClientResult<()> {
    check_password(password, NEW_PASSWORD_MAX_LEN)
}

fn check_password(password: &str, max_len: usize) -> ClientResult<()> {
    let len = password.chars().count();
    if !(PASSWORD_MIN_LEN..=max_len).contains(&len) {
        return Err(ClientError::Validation(format!(
            "password must be {PASSWORD_MIN_LEN} to {max_len} characters"
        )));
    }
    Ok(())
}

pub fn validate_display_name(display_name: &str) -> ClientResult<()> {
    let display_name = display_name.trim();
    if display_name.is_empty() {
        return Err(ClientError::Validation("display name must not be blank".into()));
    }
    let len = display_name.chars().count();
    if !(DISPLAY_NAME_MIN_LEN..=DISPLAY_NAME_MAX_LEN).contains(&len) {
        return Err(ClientError::Validation(format!(
            "display name must be {DISPLAY_NAME_MIN_LEN} to {DISPLAY_NAME_MAX_LEN} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/validation_tests.rs"]
mod tests;
