use super::*;

#[test]
fn minted_token_verifies_with_same_secret() {
    let token = mint_app_token("devsecret", &UserId::from("user_7"), "Bold", None, 60)
        .expect("mint");
    let claims = verify_app_token("devsecret", &token).expect("verify");
    assert_eq!(claims.user_id(), UserId::from("user_7"));
    assert_eq!(claims.name, "Bold");
}

#[test]
fn wrong_secret_is_rejected() {
    let token = mint_app_token("devsecret", &UserId::from("user_7"), "Bold", None, 60)
        .expect("mint");
    assert!(matches!(
        verify_app_token("other", &token),
        Err(AuthError::Invalid(_))
    ));
}

#[test]
fn expired_token_is_reported_as_expired() {
    // Beyond the default 60s validation leeway.
    let token = mint_app_token("devsecret", &UserId::from("user_7"), "Bold", None, -600)
        .expect("mint");
    assert!(matches!(
        verify_app_token("devsecret", &token),
        Err(AuthError::Expired)
    ));
}

#[test]
fn blank_token_is_empty_error() {
    assert!(matches!(
        verify_app_token("devsecret", "   "),
        Err(AuthError::Empty)
    ));
}
